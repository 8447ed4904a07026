//! Recipe files: the declarative description of a component.
//!
//! Recipes are YAML (or JSON, which YAML subsumes) documents with
//! PascalCase keys. The default configuration is an arbitrary JSON-shaped
//! tree; the lifecycle is a map from stage name to either a script string
//! or a detailed step object.

use std::collections::BTreeMap;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ComponentIdentifier, ComponentType, DependencyType};

/// Lifecycle stage that, when present and changed, forces a deployment
/// through the bootstrap path.
pub const BOOTSTRAP_STAGE: &str = "bootstrap";

/// Lifecycle stage consulted for pre-update deferral votes.
pub const UPDATE_CHECK_STAGE: &str = "updateCheck";

/// Errors raised while parsing or validating a recipe.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    /// The recipe was not valid YAML/JSON for the recipe schema.
    #[error("malformed recipe: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// The recipe named an empty component name.
    #[error("recipe has an empty component name")]
    EmptyName,

    /// A dependency version requirement could not be parsed.
    #[error("invalid version requirement '{requirement}' for dependency '{name}'")]
    InvalidRequirement {
        /// Dependency name.
        name: String,
        /// Offending requirement text.
        requirement: String,
    },
}

/// Declared default configuration of a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ComponentConfiguration {
    /// Arbitrary JSON-shaped default configuration tree. May contain
    /// nulls and empty containers.
    #[serde(default)]
    pub default_configuration: Value,
}

/// A single dependency declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DependencyProperties {
    /// Version requirement the resolved dependency must satisfy.
    #[serde(with = "crate::component::version_req_text")]
    pub version_requirement: VersionReq,

    /// Dependency kind. Defaults to HARD.
    #[serde(default)]
    pub dependency_type: DependencyType,
}

/// How an artifact is unpacked after download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnarchivePolicy {
    /// Store the file as-is.
    #[default]
    None,

    /// Unpack a tar archive into the decompressed directory.
    Tar,

    /// Unpack a gzip-compressed tar archive.
    TarGz,
}

/// A declared artifact: where it comes from and how to verify it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactDescriptor {
    /// Source URI. The scheme is interpreted by the artifact collaborator.
    pub uri: String,

    /// Expected hex-encoded SHA-256 digest of the raw file, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Unpacking policy applied on install.
    #[serde(default)]
    pub unarchive: UnarchivePolicy,
}

impl ArtifactDescriptor {
    /// File name under the component's artifact directory, derived from
    /// the last URI segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// Platform filter on a manifest. Empty fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PlatformFilter {
    /// Operating system name (`linux`, `macos`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// Machine architecture (`x86_64`, `aarch64`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl PlatformFilter {
    /// Whether this filter accepts the host platform.
    #[must_use]
    pub fn matches_host(&self) -> bool {
        let os_ok = self
            .os
            .as_deref()
            .map_or(true, |os| os == "*" || os == std::env::consts::OS);
        let arch_ok = self
            .architecture
            .as_deref()
            .map_or(true, |arch| arch == "*" || arch == std::env::consts::ARCH);
        os_ok && arch_ok
    }
}

/// Per-platform artifact manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PlatformManifest {
    /// Platform filter. Absent means match-all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformFilter>,

    /// Artifacts installed for this platform.
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
}

/// The declarative description of a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ComponentRecipe {
    /// Component name.
    pub component_name: String,

    /// Exact component version.
    pub component_version: Version,

    /// Service kind. Defaults to GENERIC.
    #[serde(default)]
    pub component_type: ComponentType,

    /// Default configuration block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_configuration: Option<ComponentConfiguration>,

    /// Dependencies: name to version requirement and kind.
    #[serde(default)]
    pub component_dependencies: BTreeMap<String, DependencyProperties>,

    /// Per-platform artifact manifests.
    #[serde(default)]
    pub manifests: Vec<PlatformManifest>,

    /// Lifecycle stage map. Values are script strings or step objects
    /// (`Script`, `SkipIf`, `Timeout`); nested maps are allowed, lists are
    /// not.
    #[serde(default)]
    pub lifecycle: Value,
}

impl ComponentRecipe {
    /// Parse a recipe from YAML or JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError`] if the document is malformed or names an
    /// empty component.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecipeError> {
        let recipe: Self = serde_yaml::from_slice(bytes)?;
        if recipe.component_name.is_empty() {
            return Err(RecipeError::EmptyName);
        }
        Ok(recipe)
    }

    /// Identity declared by this recipe.
    #[must_use]
    pub fn identifier(&self) -> ComponentIdentifier {
        ComponentIdentifier::new(self.component_name.clone(), self.component_version.clone())
    }

    /// Default configuration tree, or an empty object when the recipe
    /// declares none.
    #[must_use]
    pub fn default_configuration(&self) -> Value {
        self.component_configuration
            .as_ref()
            .map(|c| c.default_configuration.clone())
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    /// Artifacts declared for the host platform: the first matching
    /// manifest wins, matching the most-specific-first ordering authors
    /// use in recipe files.
    #[must_use]
    pub fn artifacts_for_host(&self) -> &[ArtifactDescriptor] {
        self.manifests
            .iter()
            .find(|m| m.platform.as_ref().map_or(true, PlatformFilter::matches_host))
            .map_or(&[], |m| m.artifacts.as_slice())
    }

    /// The text of a top-level lifecycle stage, if the stage is present
    /// and is a plain script string or a step object with a `Script` key.
    #[must_use]
    pub fn lifecycle_stage_text(&self, stage: &str) -> Option<&str> {
        let entry = self.lifecycle.get(stage)?;
        match entry {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("Script").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Whether the recipe declares a bootstrap stage.
    #[must_use]
    pub fn has_bootstrap(&self) -> bool {
        self.lifecycle_stage_text(BOOTSTRAP_STAGE).is_some()
    }
}
