//! Diffing the current services configuration against a deployment target.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::lifecycle::{LIFECYCLE_KEY, MAIN_SERVICE, VERSION_KEY};
use crate::component::recipe::BOOTSTRAP_STAGE;

/// The component sets a merge will act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Present in the target only.
    pub added: BTreeSet<String>,

    /// Present in the current configuration only.
    pub removed: BTreeSet<String>,

    /// Present in both with differing subtrees.
    pub updated: BTreeSet<String>,

    /// Present in both, identical.
    pub unchanged: BTreeSet<String>,

    /// Subset of `updated` whose change is bootstrap-requiring.
    pub bootstrap: BTreeSet<String>,
}

impl MergePlan {
    /// Diff two services maps (the synthetic `main` entry is excluded; its
    /// dependency list is swapped unconditionally at apply time).
    #[must_use]
    pub fn compute(current: &Value, target: &Value) -> Self {
        let empty = serde_json::Map::new();
        let current_map = current.as_object().unwrap_or(&empty);
        let target_map = target.as_object().unwrap_or(&empty);

        let mut plan = Self::default();

        for (name, target_config) in target_map {
            if name == MAIN_SERVICE {
                continue;
            }
            match current_map.get(name) {
                None => {
                    plan.added.insert(name.clone());
                },
                Some(current_config) if current_config == target_config => {
                    plan.unchanged.insert(name.clone());
                },
                Some(current_config) => {
                    plan.updated.insert(name.clone());
                    if is_bootstrap_requiring(current_config, target_config) {
                        plan.bootstrap.insert(name.clone());
                    }
                },
            }
        }

        for name in current_map.keys() {
            if name != MAIN_SERVICE && !target_map.contains_key(name) {
                plan.removed.insert(name.clone());
            }
        }

        plan
    }

    /// Components the deployment installs or reconfigures (started after
    /// the config swap).
    #[must_use]
    pub fn touched(&self) -> BTreeSet<String> {
        self.added.union(&self.updated).cloned().collect()
    }

    /// Components that will be stopped or reconfigured (the update-check
    /// vote set).
    #[must_use]
    pub fn affected(&self) -> BTreeSet<String> {
        self.removed.union(&self.updated).cloned().collect()
    }

    /// Whether any update is bootstrap-requiring.
    #[must_use]
    pub fn requires_bootstrap(&self) -> bool {
        !self.bootstrap.is_empty()
    }

    /// Whether the merge has nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// An update is bootstrap-requiring iff the target declares a bootstrap
/// stage and the version changed or the bootstrap text changed.
fn is_bootstrap_requiring(current: &Value, target: &Value) -> bool {
    let Some(target_bootstrap) = stage_text(target, BOOTSTRAP_STAGE) else {
        return false;
    };

    let version_changed = current.get(VERSION_KEY) != target.get(VERSION_KEY);
    let bootstrap_changed = stage_text(current, BOOTSTRAP_STAGE) != Some(target_bootstrap);
    version_changed || bootstrap_changed
}

fn stage_text<'v>(service: &'v Value, stage: &str) -> Option<&'v str> {
    match service.get(LIFECYCLE_KEY)?.get(stage)? {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => map.get("Script").and_then(Value::as_str),
        _ => None,
    }
}
