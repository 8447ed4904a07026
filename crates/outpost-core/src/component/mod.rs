//! Component identity and recipe model.
//!
//! A component is a versioned, named bundle: a recipe describing identity,
//! dependencies, default configuration and lifecycle, plus zero or more
//! artifact files fetched into the component store.

pub mod recipe;

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

pub use recipe::{
    ArtifactDescriptor, ComponentConfiguration, ComponentRecipe, DependencyProperties,
    PlatformFilter, PlatformManifest, RecipeError, UnarchivePolicy,
};

/// Unique identity of a component: name plus exact semver version.
///
/// Equality and ordering are by the (name, version) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentIdentifier {
    /// Component name. Non-empty.
    pub name: String,

    /// Exact component version.
    pub version: Version,
}

impl ComponentIdentifier {
    /// Create a new identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// File-name stem used by the component store: `<name>-<version>`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl fmt::Display for ComponentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// What kind of service a component runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentType {
    /// External service with a user-supplied lifecycle.
    #[default]
    Generic,

    /// The supervisor itself.
    Nucleus,

    /// Runs inside the supervisor process.
    Plugin,
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "GENERIC"),
            Self::Nucleus => write!(f, "NUCLEUS"),
            Self::Plugin => write!(f, "PLUGIN"),
        }
    }
}

/// Whether a dependency gates the dependent's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// Dependent is restarted when the dependency changes state.
    #[default]
    Hard,

    /// Dependent only waits for the dependency at startup.
    Soft,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hard => write!(f, "HARD"),
            Self::Soft => write!(f, "SOFT"),
        }
    }
}

/// Serde helper: a `VersionReq` as its display text, so recipes and
/// deployment documents round-trip requirements exactly as authored.
pub(crate) mod version_req_text {
    use semver::VersionReq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(req: &VersionReq, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&req.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VersionReq, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        VersionReq::parse(&text).map_err(serde::de::Error::custom)
    }
}
