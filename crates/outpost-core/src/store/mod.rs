//! Durable, content-addressed cache of recipes and artifacts.
//!
//! Layout under the supervisor root:
//!
//! ```text
//! <root>/packages/
//!   recipes/<name>-<version>.yaml
//!   artifacts/<name>/<version>/...
//!   artifacts-decompressed/<name>/<version>/...
//! ```
//!
//! Installed recipes and artifacts are immutable; installs write through a
//! temporary path and an atomic rename. Missing components are fetched
//! through the [`ArtifactSource`] collaborator with at-most-one fetch in
//! flight per identity.

pub mod fetch;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::component::{
    ArtifactDescriptor, ComponentIdentifier, ComponentRecipe, RecipeError, UnarchivePolicy,
};
use crate::fs_safe::{atomic_write, FsSafeError};

pub use fetch::{ArtifactSource, FetchError, RetryPolicy};

const RECIPES_DIR: &str = "recipes";
const ARTIFACTS_DIR: &str = "artifacts";
const DECOMPRESSED_DIR: &str = "artifacts-decompressed";
const RECIPE_EXT: &str = "yaml";

/// Errors from component store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No recipe on disk for the identity.
    #[error("recipe not found for {0}")]
    RecipeNotFound(ComponentIdentifier),

    /// A recipe on disk failed to parse.
    #[error("stored recipe for {id} is invalid: {source}")]
    InvalidRecipe {
        /// The component whose recipe is bad.
        id: ComponentIdentifier,
        /// Parse failure.
        #[source]
        source: RecipeError,
    },

    /// A recipe declared a different identity than the one requested.
    #[error("recipe for {requested} declares identity {declared}")]
    IdentityMismatch {
        /// Identity the caller asked to install.
        requested: ComponentIdentifier,
        /// Identity the recipe itself declares.
        declared: ComponentIdentifier,
    },

    /// Downloaded artifact bytes did not match the declared digest.
    #[error("digest mismatch for {file} of {id}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Component being installed.
        id: ComponentIdentifier,
        /// Artifact file name.
        file: String,
        /// Declared digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Fetch through the artifact collaborator failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Atomic write failed.
    #[error(transparent)]
    FsSafe(#[from] FsSafeError),

    /// Plain I/O failure.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// On-disk component store.
pub struct ComponentStore {
    packages_root: PathBuf,
    retry: RetryPolicy,
    inflight: Mutex<HashMap<ComponentIdentifier, Arc<Mutex<()>>>>,
}

impl ComponentStore {
    /// Open (creating if needed) the store under `<root>/packages`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory tree cannot be created.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let packages_root = root.join("packages");
        for sub in [RECIPES_DIR, ARTIFACTS_DIR, DECOMPRESSED_DIR] {
            let dir = packages_root.join(sub);
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(Self {
            packages_root,
            retry: RetryPolicy::default(),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Override the download retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Path of the recipe file for `id`. Pure.
    #[must_use]
    pub fn recipe_path(&self, id: &ComponentIdentifier) -> PathBuf {
        self.packages_root
            .join(RECIPES_DIR)
            .join(format!("{}.{RECIPE_EXT}", id.file_stem()))
    }

    /// Directory holding raw artifacts for `id`. Pure.
    #[must_use]
    pub fn artifact_dir(&self, id: &ComponentIdentifier) -> PathBuf {
        self.packages_root
            .join(ARTIFACTS_DIR)
            .join(&id.name)
            .join(id.version.to_string())
    }

    /// Directory holding unpacked artifacts for `id`. Pure.
    #[must_use]
    pub fn decompressed_dir(&self, id: &ComponentIdentifier) -> PathBuf {
        self.packages_root
            .join(DECOMPRESSED_DIR)
            .join(&id.name)
            .join(id.version.to_string())
    }

    /// Load and parse the stored recipe for `id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecipeNotFound`] if absent, [`StoreError::InvalidRecipe`]
    /// if unparseable.
    pub fn load_recipe(&self, id: &ComponentIdentifier) -> Result<ComponentRecipe, StoreError> {
        let path = self.recipe_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RecipeNotFound(id.clone()));
            },
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };
        ComponentRecipe::from_slice(&bytes).map_err(|source| StoreError::InvalidRecipe {
            id: id.clone(),
            source,
        })
    }

    /// Whether the recipe and every host-platform artifact of `id` are
    /// installed.
    #[must_use]
    pub fn has_recipe_and_artifacts(&self, id: &ComponentIdentifier) -> bool {
        let Ok(recipe) = self.load_recipe(id) else {
            return false;
        };
        let artifact_dir = self.artifact_dir(id);
        recipe
            .artifacts_for_host()
            .iter()
            .all(|artifact| artifact_dir.join(artifact.file_name()).is_file())
    }

    /// Versions of `name` with a stored recipe, sorted descending.
    #[must_use]
    pub fn list_local_versions(&self, name: &str) -> Vec<Version> {
        let recipes_dir = self.packages_root.join(RECIPES_DIR);
        let Ok(entries) = fs::read_dir(&recipes_dir) else {
            return Vec::new();
        };

        let mut versions: Vec<Version> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let stem = Path::new(&file_name).file_stem()?.to_str()?.to_string();
                parse_recipe_stem(&stem)
            })
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions
    }

    /// All identities with a stored recipe.
    #[must_use]
    pub fn list_installed(&self) -> Vec<ComponentIdentifier> {
        let recipes_dir = self.packages_root.join(RECIPES_DIR);
        let Ok(entries) = fs::read_dir(&recipes_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let stem = Path::new(&file_name).file_stem()?.to_str()?.to_string();
                parse_recipe_stem(&stem)
            })
            .map(|(name, version)| ComponentIdentifier::new(name, version))
            .collect()
    }

    /// Install a recipe from raw bytes, validating it parses and declares
    /// the expected identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on parse failure, identity mismatch (reported
    /// as [`StoreError::InvalidRecipe`] context), or I/O failure.
    pub fn install_recipe(
        &self,
        id: &ComponentIdentifier,
        bytes: &[u8],
    ) -> Result<ComponentRecipe, StoreError> {
        let recipe =
            ComponentRecipe::from_slice(bytes).map_err(|source| StoreError::InvalidRecipe {
                id: id.clone(),
                source,
            })?;
        if recipe.identifier() != *id {
            return Err(StoreError::IdentityMismatch {
                requested: id.clone(),
                declared: recipe.identifier(),
            });
        }
        atomic_write(&self.recipe_path(id), bytes)?;
        debug!(component = %id, "recipe installed");
        Ok(recipe)
    }

    /// Install one artifact: verify its digest when declared, place it in
    /// the artifact directory via temp + rename, and unpack it per policy.
    ///
    /// # Errors
    ///
    /// [`StoreError::DigestMismatch`] when verification fails, otherwise
    /// I/O errors.
    pub fn install_artifact(
        &self,
        id: &ComponentIdentifier,
        artifact: &ArtifactDescriptor,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        if let Some(expected) = &artifact.digest {
            let actual = hex::encode(Sha256::digest(bytes));
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(StoreError::DigestMismatch {
                    id: id.clone(),
                    file: artifact.file_name().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let dir = self.artifact_dir(id);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        let dest = dir.join(artifact.file_name());
        atomic_write(&dest, bytes)?;

        match artifact.unarchive {
            UnarchivePolicy::None => {},
            UnarchivePolicy::Tar | UnarchivePolicy::TarGz => {
                self.unarchive(id, artifact, &dest)?;
            },
        }

        debug!(component = %id, file = artifact.file_name(), "artifact installed");
        Ok(())
    }

    fn unarchive(
        &self,
        id: &ComponentIdentifier,
        artifact: &ArtifactDescriptor,
        archive_path: &Path,
    ) -> Result<(), StoreError> {
        let stem = Path::new(artifact.file_name())
            .file_stem()
            .map_or_else(|| "artifact".to_string(), |s| s.to_string_lossy().into_owned());
        // `app.tar.gz` stems to `app.tar`; strip the inner extension too.
        let stem = stem.strip_suffix(".tar").unwrap_or(&stem).to_string();

        let dest = self.decompressed_dir(id).join(stem);
        fs::create_dir_all(&dest)
            .map_err(|e| StoreError::io(format!("creating {}", dest.display()), e))?;

        let file = fs::File::open(archive_path)
            .map_err(|e| StoreError::io(format!("opening {}", archive_path.display()), e))?;

        let unpack_result = match artifact.unarchive {
            UnarchivePolicy::Tar => tar::Archive::new(file).unpack(&dest),
            UnarchivePolicy::TarGz => {
                tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(&dest)
            },
            UnarchivePolicy::None => Ok(()),
        };
        unpack_result.map_err(|e| StoreError::io(format!("unpacking {}", archive_path.display()), e))
    }

    /// Ensure the recipe and all host-platform artifacts of `id` are
    /// installed, fetching whatever is missing through `source`.
    ///
    /// Concurrent calls for the same identity coalesce: only one fetch is
    /// in flight, later callers observe the installed result.
    ///
    /// # Errors
    ///
    /// Propagates fetch, digest and I/O failures.
    pub async fn ensure_present(
        &self,
        id: &ComponentIdentifier,
        source: &dyn ArtifactSource,
    ) -> Result<(), StoreError> {
        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(id.clone()).or_default())
        };
        let _permit = gate.lock().await;

        if self.has_recipe_and_artifacts(id) {
            return Ok(());
        }
        info!(component = %id, "fetching component into the store");

        let recipe = match self.load_recipe(id) {
            Ok(recipe) => recipe,
            Err(StoreError::RecipeNotFound(_)) => {
                let bytes = self.retry.run(|| source.fetch_recipe(id)).await?;
                self.install_recipe(id, &bytes)?
            },
            Err(e) => return Err(e),
        };

        let artifact_dir = self.artifact_dir(id);
        for artifact in recipe.artifacts_for_host() {
            if artifact_dir.join(artifact.file_name()).is_file() {
                continue;
            }
            let bytes = self.retry.run(|| source.fetch_artifact(id, artifact)).await?;
            self.install_artifact(id, artifact, &bytes)?;
        }

        Ok(())
    }

    /// Delete every installed (name, version) not present in `retain`.
    ///
    /// Best-effort: failures are logged and retried on the next deployment.
    pub fn prune(&self, retain: &std::collections::HashSet<ComponentIdentifier>) {
        for id in self.list_installed() {
            if retain.contains(&id) {
                continue;
            }
            info!(component = %id, "pruning stale component version");

            if let Err(e) = fs::remove_file(self.recipe_path(&id)) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(component = %id, error = %e, "failed to prune recipe");
                }
            }
            for dir in [self.artifact_dir(&id), self.decompressed_dir(&id)] {
                if dir.exists() {
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!(component = %id, error = %e, "failed to prune artifacts");
                    }
                }
            }
        }
    }

    /// Preload recipes (and optionally artifacts) from local directories.
    ///
    /// Recipe files are parsed to learn their identity and installed under
    /// the store's naming scheme. Artifact directories are expected to be
    /// laid out `<dir>/<name>/<version>/<files>` and are copied verbatim
    /// with no digest verification, matching their locally-trusted origin.
    ///
    /// # Errors
    ///
    /// Returns the first I/O or parse failure.
    pub fn preload(
        &self,
        recipe_dir: &Path,
        artifact_dir: Option<&Path>,
    ) -> Result<Vec<ComponentIdentifier>, StoreError> {
        let mut loaded = Vec::new();

        let entries = fs::read_dir(recipe_dir)
            .map_err(|e| StoreError::io(format!("reading {}", recipe_dir.display()), e))?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)
                .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
            let recipe = ComponentRecipe::from_slice(&bytes).map_err(|source| {
                StoreError::InvalidRecipe {
                    id: ComponentIdentifier::new(
                        path.file_name().map_or_else(String::new, |n| {
                            n.to_string_lossy().into_owned()
                        }),
                        Version::new(0, 0, 0),
                    ),
                    source,
                }
            })?;
            let id = recipe.identifier();
            atomic_write(&self.recipe_path(&id), &bytes)?;
            loaded.push(id);
        }

        if let Some(artifact_root) = artifact_dir {
            for id in &loaded {
                let src = artifact_root.join(&id.name).join(id.version.to_string());
                if !src.is_dir() {
                    continue;
                }
                let dest = self.artifact_dir(id);
                fs::create_dir_all(&dest)
                    .map_err(|e| StoreError::io(format!("creating {}", dest.display()), e))?;
                copy_dir_files(&src, &dest)?;
            }
        }

        info!(count = loaded.len(), "preloaded components into the store");
        Ok(loaded)
    }
}

fn copy_dir_files(src: &Path, dest: &Path) -> Result<(), StoreError> {
    let entries = fs::read_dir(src)
        .map_err(|e| StoreError::io(format!("reading {}", src.display()), e))?;
    for entry in entries.filter_map(Result::ok) {
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            fs::create_dir_all(&to)
                .map_err(|e| StoreError::io(format!("creating {}", to.display()), e))?;
            copy_dir_files(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .map_err(|e| StoreError::io(format!("copying {}", from.display()), e))?;
        }
    }
    Ok(())
}

/// Parse `<name>-<version>` where the name itself may contain dashes: the
/// version is the longest valid semver suffix.
fn parse_recipe_stem(stem: &str) -> Option<(String, Version)> {
    for (idx, _) in stem.match_indices('-') {
        if let Ok(version) = Version::parse(&stem[idx + 1..]) {
            return Some((stem[..idx].to_string(), version));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn sample_recipe(name: &str, version: &str) -> String {
        format!("ComponentName: {name}\nComponentVersion: {version}\nLifecycle:\n  run: echo hi\n")
    }

    fn id(name: &str, version: &str) -> ComponentIdentifier {
        ComponentIdentifier::new(name, Version::parse(version).unwrap())
    }

    #[test]
    fn test_recipe_install_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();

        let app = id("SimpleApp", "1.0.0");
        store
            .install_recipe(&app, sample_recipe("SimpleApp", "1.0.0").as_bytes())
            .unwrap();

        let recipe = store.load_recipe(&app).unwrap();
        assert_eq!(recipe.component_name, "SimpleApp");
        assert!(store.has_recipe_and_artifacts(&app));
    }

    #[test]
    fn test_missing_recipe_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();
        let result = store.load_recipe(&id("Ghost", "1.0.0"));
        assert!(matches!(result, Err(StoreError::RecipeNotFound(_))));
    }

    #[test]
    fn test_artifact_digest_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();
        let app = id("App", "1.0.0");

        let bytes = b"artifact-bytes";
        let good = ArtifactDescriptor {
            uri: "s3://bucket/app/payload.bin".to_string(),
            digest: Some(hex::encode(Sha256::digest(bytes))),
            unarchive: UnarchivePolicy::None,
        };
        store.install_artifact(&app, &good, bytes).unwrap();
        assert!(store.artifact_dir(&app).join("payload.bin").is_file());

        let bad = ArtifactDescriptor {
            digest: Some("deadbeef".to_string()),
            ..good
        };
        let result = store.install_artifact(&app, &bad, bytes);
        assert!(matches!(result, Err(StoreError::DigestMismatch { .. })));
    }

    #[test]
    fn test_list_local_versions_sorted_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();

        for version in ["1.0.0", "3.0.0", "2.0.0"] {
            store
                .install_recipe(
                    &id("Multi-Part-Name", version),
                    sample_recipe("Multi-Part-Name", version).as_bytes(),
                )
                .unwrap();
        }

        let versions = store.list_local_versions("Multi-Part-Name");
        assert_eq!(
            versions,
            vec![
                Version::new(3, 0, 0),
                Version::new(2, 0, 0),
                Version::new(1, 0, 0)
            ]
        );
    }

    #[test]
    fn test_prune_retains_requested_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();

        for version in ["1.0.0", "2.0.0", "3.0.0"] {
            let app = id("App", version);
            store
                .install_recipe(&app, sample_recipe("App", version).as_bytes())
                .unwrap();
            let artifact = ArtifactDescriptor {
                uri: format!("s3://b/app/{version}/data.bin"),
                digest: None,
                unarchive: UnarchivePolicy::None,
            };
            store.install_artifact(&app, &artifact, b"x").unwrap();
        }

        let retain: HashSet<_> = [id("App", "2.0.0"), id("App", "3.0.0")].into();
        store.prune(&retain);

        assert!(!store.has_recipe_and_artifacts(&id("App", "1.0.0")));
        assert!(!store.artifact_dir(&id("App", "1.0.0")).exists());
        assert!(store.has_recipe_and_artifacts(&id("App", "2.0.0")));
        assert!(store.has_recipe_and_artifacts(&id("App", "3.0.0")));
    }

    #[test]
    fn test_parse_recipe_stem_with_dashed_names() {
        assert_eq!(
            parse_recipe_stem("SimpleApp-1.0.0"),
            Some(("SimpleApp".to_string(), Version::new(1, 0, 0)))
        );
        assert_eq!(
            parse_recipe_stem("my-app-2.1.3"),
            Some(("my-app".to_string(), Version::new(2, 1, 3)))
        );
        assert_eq!(parse_recipe_stem("noversion"), None);
    }

    struct MapSource {
        recipes: HashMap<ComponentIdentifier, Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl ArtifactSource for MapSource {
        async fn list_versions(&self, name: &str) -> Result<Vec<Version>, FetchError> {
            let versions: Vec<Version> = self
                .recipes
                .keys()
                .filter(|id| id.name == name)
                .map(|id| id.version.clone())
                .collect();
            if versions.is_empty() {
                return Err(FetchError::ComponentNotFound(name.to_string()));
            }
            Ok(versions)
        }

        async fn fetch_recipe(&self, id: &ComponentIdentifier) -> Result<Vec<u8>, FetchError> {
            self.recipes
                .get(id)
                .cloned()
                .ok_or_else(|| FetchError::VersionNotFound(id.clone()))
        }

        async fn fetch_artifact(
            &self,
            _id: &ComponentIdentifier,
            artifact: &ArtifactDescriptor,
        ) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Download {
                context: artifact.uri.clone(),
                message: "no artifacts in this source".to_string(),
                transient: false,
            })
        }
    }

    #[tokio::test]
    async fn test_ensure_present_fetches_missing_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(dir.path()).unwrap();
        let app = id("Fetched", "1.2.0");

        let source = MapSource {
            recipes: [(app.clone(), sample_recipe("Fetched", "1.2.0").into_bytes())].into(),
        };

        store.ensure_present(&app, &source).await.unwrap();
        assert!(store.has_recipe_and_artifacts(&app));

        // second call is a no-op against an empty source
        let empty = MapSource {
            recipes: HashMap::new(),
        };
        store.ensure_present(&app, &empty).await.unwrap();
    }
}
