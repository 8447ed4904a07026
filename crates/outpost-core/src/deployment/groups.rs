//! Persisted group-to-root-components map.
//!
//! The device tracks one pinned root map per deployment group; the union
//! across groups defines the device-wide root set. The map is rewritten
//! transactionally (temp + rename) and loaded strictly at startup: a
//! corrupt file refuses to load rather than silently dropping groups.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::VersionReq;
use tracing::info;

use crate::fs_safe::{atomic_write_json, bounded_read_json, FsSafeError, DEFAULT_MAX_FILE_SIZE};
use crate::resolver::Requirement;

/// Errors from the group roots store.
#[derive(Debug, thiserror::Error)]
pub enum GroupsError {
    /// The persisted map exists but cannot be read or parsed. Fatal at
    /// startup: operator intervention required.
    #[error("persisted group roots at {path} are unreadable: {source}")]
    Corrupt {
        /// File path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: FsSafeError,
    },

    /// Writing the map failed.
    #[error("failed to persist group roots: {0}")]
    Persist(#[from] FsSafeError),
}

/// `group -> component name -> pinned version` map with transactional
/// persistence.
#[derive(Debug)]
pub struct GroupRootsStore {
    path: PathBuf,
    map: BTreeMap<String, BTreeMap<String, String>>,
}

impl GroupRootsStore {
    /// Load the store from `<root>/state/group-roots.json`, starting empty
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// [`GroupsError::Corrupt`] when the file exists but cannot be parsed,
    /// [`GroupsError::Persist`] when the state directory cannot be created.
    pub fn load(root: &Path) -> Result<Self, GroupsError> {
        let state_dir = root.join("state");
        std::fs::create_dir_all(&state_dir).map_err(|e| {
            GroupsError::Persist(FsSafeError::Io {
                context: format!("creating {}", state_dir.display()),
                source: e,
            })
        })?;
        let path = state_dir.join("group-roots.json");

        let map = if path.exists() {
            bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE).map_err(|source| {
                GroupsError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, map })
    }

    /// The full map.
    #[must_use]
    pub fn map(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.map
    }

    /// Pinned roots of one group.
    #[must_use]
    pub fn roots_of(&self, group: &str) -> BTreeMap<String, String> {
        self.map.get(group).cloned().unwrap_or_default()
    }

    /// Replace one group's roots and persist.
    ///
    /// # Errors
    ///
    /// [`GroupsError::Persist`] when the write fails.
    pub fn set_group(
        &mut self,
        group: &str,
        roots: BTreeMap<String, String>,
    ) -> Result<(), GroupsError> {
        if roots.is_empty() {
            self.map.remove(group);
        } else {
            self.map.insert(group.to_string(), roots);
        }
        self.persist()
    }

    /// Replace the entire map and persist. Used by rollback.
    ///
    /// # Errors
    ///
    /// [`GroupsError::Persist`] when the write fails.
    pub fn replace(
        &mut self,
        map: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), GroupsError> {
        self.map = map;
        self.persist()
    }

    fn persist(&self) -> Result<(), GroupsError> {
        atomic_write_json(&self.path, &self.map)?;
        info!(groups = self.map.len(), "group roots persisted");
        Ok(())
    }

    /// Root requirements for resolution: every group's pinned roots,
    /// requesters labeled `group:<name>`. Groups in `override_groups` are
    /// excluded (the active deployment supplies their roots itself).
    #[must_use]
    pub fn union_requirements(
        &self,
        override_groups: &[&str],
    ) -> BTreeMap<String, Vec<Requirement>> {
        let mut union: BTreeMap<String, Vec<Requirement>> = BTreeMap::new();
        for (group, roots) in &self.map {
            if override_groups.contains(&group.as_str()) {
                continue;
            }
            for (name, version) in roots {
                if let Ok(req) = VersionReq::parse(&format!("={version}")) {
                    union
                        .entry(name.clone())
                        .or_default()
                        .push(Requirement::new(format!("group:{group}"), req));
                }
            }
        }
        union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_reload() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let mut store = GroupRootsStore::load(tmp.path()).unwrap();
            store
                .set_group(
                    "edge",
                    [("SimpleApp".to_string(), "1.0.0".to_string())].into(),
                )
                .unwrap();
        }

        let store = GroupRootsStore::load(tmp.path()).unwrap();
        assert_eq!(store.roots_of("edge")["SimpleApp"], "1.0.0");
    }

    #[test]
    fn test_empty_roots_drop_the_group() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = GroupRootsStore::load(tmp.path()).unwrap();
        store
            .set_group("edge", [("App".to_string(), "1.0.0".to_string())].into())
            .unwrap();
        store.set_group("edge", BTreeMap::new()).unwrap();
        assert!(store.map().is_empty());
    }

    #[test]
    fn test_corrupt_file_refuses_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("group-roots.json"), b"{not json").unwrap();

        let result = GroupRootsStore::load(tmp.path());
        assert!(matches!(result, Err(GroupsError::Corrupt { .. })));
    }

    #[test]
    fn test_union_excludes_overridden_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = GroupRootsStore::load(tmp.path()).unwrap();
        store
            .set_group("a", [("Shared".to_string(), "1.0.0".to_string())].into())
            .unwrap();
        store
            .set_group("b", [("Other".to_string(), "2.0.0".to_string())].into())
            .unwrap();

        let union = store.union_requirements(&["a"]);
        assert!(!union.contains_key("Shared"));
        assert_eq!(union["Other"].len(), 1);
        assert_eq!(union["Other"][0].requested_by, "group:b");
    }
}
