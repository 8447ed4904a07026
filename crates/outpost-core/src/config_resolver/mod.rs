//! Resolves the services configuration a deployment converges to.
//!
//! For every resolved component this produces the subtree the supervisor
//! runs from: `{lifecycle, componentType, dependencies, version,
//! previousVersion, configuration}`, plus the synthetic `main` entry whose
//! dependency list is the union of root components and builtin auto-start
//! services.
//!
//! Component configuration starts from the currently persisted tree (or
//! the recipe defaults for a fresh component), then applies the document's
//! RESET pointers and MERGE tree in that order. Lifecycle strings are then
//! interpolated from recognized namespaces only; unrecognized placeholders
//! are left in place and logged.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use semver::Version;
use serde_json::{Map, Value};
use tracing::error;

use crate::component::ComponentIdentifier;
use crate::deployment::{ConfigurationUpdate, DeploymentDocument};
use crate::lifecycle::{
    CONFIGURATION_KEY, DEPENDENCIES_KEY, LIFECYCLE_KEY, MAIN_SERVICE, PREV_VERSION_KEY,
    SERVICES_KEY, TYPE_KEY, VERSION_KEY,
};
use crate::resolver::ResolvedComponent;
use crate::store::ComponentStore;
use crate::tree::{deep_merge, reset_paths, value_text};

/// Namespace resolving against the component's own configuration tree.
const CONFIGURATION_NAMESPACE: &str = "configuration";

/// Namespace resolving artifact locations.
const ARTIFACTS_NAMESPACE: &str = "artifacts";

/// Namespace resolving supervisor paths.
const KERNEL_NAMESPACE: &str = "kernel";

const ARTIFACTS_PATH_KEY: &str = "path";
const ARTIFACTS_DECOMPRESSED_PATH_KEY: &str = "decompressedPath";
const KERNEL_ROOT_PATH_KEY: &str = "rootPath";

/// Computes the merged services configuration for a deployment.
pub struct ConfigResolver<'a> {
    store: &'a ComponentStore,
    root_path: PathBuf,
    same_component: Regex,
    cross_component: Regex,
}

impl<'a> ConfigResolver<'a> {
    /// Create a resolver over the component store and supervisor root.
    #[must_use]
    pub fn new(store: &'a ComponentStore, root_path: &Path) -> Self {
        Self {
            store,
            root_path: root_path.to_path_buf(),
            // {namespace:key} - the key may be any JSON pointer, so it can
            // contain anything except ':' and '}'
            same_component: Regex::new(r"\{([.\w]+):([^:}]+)}").expect("valid pattern"),
            // {componentName:namespace:key}
            cross_component: Regex::new(r"\{([.\w]+):([.\w]+):([^:}]+)}").expect("valid pattern"),
        }
    }

    /// Resolve the full services configuration.
    ///
    /// `root_names` is the device-wide root set (the union across every
    /// deployment group); `current_services` is the live services map (one
    /// entry per managed service); `builtins` are the supervisor's
    /// auto-start services, which join the roots in `main`'s dependency
    /// list.
    #[must_use]
    pub fn resolve(
        &self,
        components: &[ResolvedComponent],
        document: &DeploymentDocument,
        root_names: &BTreeSet<String>,
        current_services: &Value,
        builtins: &[String],
    ) -> Value {
        let mut services = Map::new();

        for component in components {
            services.insert(
                component.id.name.clone(),
                self.service_config(component, document, current_services),
            );
        }

        // interpolation runs against the fully built map so cross-component
        // lookups observe final configuration values
        let snapshot = Value::Object(services.clone());
        for component in components {
            let dependencies: BTreeSet<String> = component
                .recipe
                .component_dependencies
                .keys()
                .cloned()
                .collect();
            if let Some(service) = services.get_mut(&component.id.name) {
                if let Some(lifecycle) = service.get(LIFECYCLE_KEY).cloned() {
                    let interpolated =
                        self.interpolate(&lifecycle, &component.id, &dependencies, &snapshot);
                    service[LIFECYCLE_KEY] = interpolated;
                }
            }
        }

        services.insert(MAIN_SERVICE.to_string(), main_config(root_names, builtins));

        let mut top = Map::new();
        top.insert(SERVICES_KEY.to_string(), Value::Object(services));
        Value::Object(top)
    }

    fn service_config(
        &self,
        component: &ResolvedComponent,
        document: &DeploymentDocument,
        current_services: &Value,
    ) -> Value {
        let name = &component.id.name;
        let recipe = &component.recipe;

        let mut config = Map::new();
        config.insert(LIFECYCLE_KEY.to_string(), recipe.lifecycle.clone());
        config.insert(
            TYPE_KEY.to_string(),
            Value::String(recipe.component_type.to_string()),
        );

        let dependencies: Vec<Value> = recipe
            .component_dependencies
            .iter()
            .map(|(dep, props)| Value::String(format!("{dep}:{}", props.dependency_type)))
            .collect();
        config.insert(DEPENDENCIES_KEY.to_string(), Value::Array(dependencies));

        let new_version = component.id.version.to_string();
        config.insert(VERSION_KEY.to_string(), Value::String(new_version.clone()));
        if let Some(prev) = previous_version(name, &new_version, current_services) {
            config.insert(PREV_VERSION_KEY.to_string(), Value::String(prev));
        }

        // configuration updates apply to roots only; the root's version is
        // pinned by the document so no version check is needed
        let update = document
            .root_components
            .contains_key(name)
            .then(|| document.component_configuration_updates.get(name))
            .flatten();

        let current = current_services
            .get(name)
            .and_then(|service| service.get(CONFIGURATION_KEY));
        let defaults = recipe.default_configuration();

        config.insert(
            CONFIGURATION_KEY.to_string(),
            resolve_configuration(current, &defaults, update),
        );

        Value::Object(config)
    }

    fn interpolate(
        &self,
        value: &Value,
        component: &ComponentIdentifier,
        dependencies: &BTreeSet<String>,
        services: &Value,
    ) -> Value {
        match value {
            Value::String(text) => {
                Value::String(self.replace_placeholders(text, component, dependencies, services))
            },
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    out.insert(
                        key.clone(),
                        self.interpolate(child, component, dependencies, services),
                    );
                }
                Value::Object(out)
            },
            // lists are outlawed under the lifecycle key
            other => other.clone(),
        }
    }

    fn replace_placeholders(
        &self,
        text: &str,
        component: &ComponentIdentifier,
        dependencies: &BTreeSet<String>,
        services: &Value,
    ) -> String {
        // same-component pass: {configuration:/singleLevelKey}
        let pass_one = self
            .same_component
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let namespace = &caps[1];
                let key = &caps[2];

                if namespace == CONFIGURATION_NAMESPACE {
                    if let Some(replacement) =
                        lookup_configuration_value(&component.name, key, services)
                    {
                        return replacement;
                    }
                    error!(
                        placeholder = &caps[0],
                        component = %component,
                        "missing configuration value for interpolation"
                    );
                } else if is_system_namespace(namespace) {
                    if let Some(replacement) = self.lookup_system_value(component, namespace, key) {
                        return replacement;
                    }
                } else {
                    error!(
                        placeholder = &caps[0],
                        namespace = namespace,
                        "unrecognized interpolation namespace"
                    );
                }
                caps[0].to_string()
            });

        // cross-component pass: {dependencyName:configuration:/key};
        // only direct declared dependencies are visible
        let pass_two = self
            .cross_component
            .replace_all(&pass_one, |caps: &regex::Captures<'_>| {
                let target = &caps[1];
                let namespace = &caps[2];
                let key = &caps[3];

                if !dependencies.contains(target) {
                    error!(
                        placeholder = &caps[0],
                        component = %component,
                        target = target,
                        "interpolation target is not a direct dependency"
                    );
                    return caps[0].to_string();
                }

                let Some(target_service) = services.get(target) else {
                    error!(
                        placeholder = &caps[0],
                        target = target,
                        "interpolation target missing from resolved services"
                    );
                    return caps[0].to_string();
                };

                if namespace == CONFIGURATION_NAMESPACE {
                    if let Some(replacement) = lookup_configuration_value(target, key, services) {
                        return replacement;
                    }
                    error!(
                        placeholder = &caps[0],
                        target = target,
                        "missing configuration value for cross-component interpolation"
                    );
                } else if is_system_namespace(namespace) {
                    let target_id = target_service
                        .get(VERSION_KEY)
                        .and_then(Value::as_str)
                        .and_then(|v| Version::parse(v).ok())
                        .map(|version| ComponentIdentifier::new(target.to_string(), version));
                    if let Some(target_id) = target_id {
                        if let Some(replacement) =
                            self.lookup_system_value(&target_id, namespace, key)
                        {
                            return replacement;
                        }
                    }
                } else {
                    error!(
                        placeholder = &caps[0],
                        namespace = namespace,
                        "unrecognized interpolation namespace"
                    );
                }
                caps[0].to_string()
            });

        pass_two.into_owned()
    }

    fn lookup_system_value(
        &self,
        component: &ComponentIdentifier,
        namespace: &str,
        key: &str,
    ) -> Option<String> {
        match (namespace, key) {
            (ARTIFACTS_NAMESPACE, ARTIFACTS_PATH_KEY) => {
                Some(self.store.artifact_dir(component).display().to_string())
            },
            (ARTIFACTS_NAMESPACE, ARTIFACTS_DECOMPRESSED_PATH_KEY) => {
                Some(self.store.decompressed_dir(component).display().to_string())
            },
            (KERNEL_NAMESPACE, KERNEL_ROOT_PATH_KEY) => {
                Some(self.root_path.display().to_string())
            },
            _ => None,
        }
    }
}

fn is_system_namespace(namespace: &str) -> bool {
    namespace == ARTIFACTS_NAMESPACE || namespace == KERNEL_NAMESPACE
}

/// Configuration value lookup: scalars coerce to text, containers
/// serialize to JSON, missing nodes return `None`.
fn lookup_configuration_value(component: &str, pointer: &str, services: &Value) -> Option<String> {
    let configuration = services.get(component)?.get(CONFIGURATION_KEY)?;
    let target = if pointer.is_empty() {
        configuration
    } else {
        configuration.pointer(pointer)?
    };
    Some(value_text(target))
}

/// Merge rules for one component's configuration: start from the current
/// persisted tree (or defaults for a fresh component), apply RESET, then
/// MERGE. Without an update the current tree (or defaults) passes through
/// unchanged.
#[must_use]
pub fn resolve_configuration(
    current: Option<&Value>,
    defaults: &Value,
    update: Option<&ConfigurationUpdate>,
) -> Value {
    match update {
        None => current.cloned().unwrap_or_else(|| defaults.clone()),
        Some(update) => {
            let start = current.cloned().unwrap_or_else(|| defaults.clone());
            let after_reset = reset_paths(start, defaults, &update.reset);
            deep_merge(&after_reset, &update.merge)
        },
    }
}

fn previous_version(name: &str, new_version: &str, current_services: &Value) -> Option<String> {
    let service = current_services.get(name)?;
    let existing = service.get(VERSION_KEY).and_then(Value::as_str)?;
    if existing == new_version {
        // same version redeployed: preserve the recorded rotation
        service
            .get(PREV_VERSION_KEY)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    } else {
        Some(existing.to_string())
    }
}

fn main_config(root_names: &BTreeSet<String>, builtins: &[String]) -> Value {
    let mut dependencies: Vec<Value> = root_names
        .iter()
        .map(|name| Value::String(name.clone()))
        .collect();
    for builtin in builtins {
        dependencies.push(Value::String(builtin.clone()));
    }
    let mut config = Map::new();
    config.insert(DEPENDENCIES_KEY.to_string(), Value::Array(dependencies));
    Value::Object(config)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::component::ComponentRecipe;
    use crate::deployment::RootComponentSpec;

    fn resolved(recipe_yaml: &str) -> ResolvedComponent {
        let recipe = ComponentRecipe::from_slice(recipe_yaml.as_bytes()).unwrap();
        ResolvedComponent {
            id: recipe.identifier(),
            recipe,
        }
    }

    fn root_set(document: &DeploymentDocument) -> BTreeSet<String> {
        document.root_components.keys().cloned().collect()
    }

    fn document(roots: &[(&str, &str)], updates: &[(&str, ConfigurationUpdate)]) -> DeploymentDocument {
        DeploymentDocument {
            group_name: "test-group".to_string(),
            timestamp: 1,
            root_components: roots
                .iter()
                .map(|(name, version)| {
                    (
                        (*name).to_string(),
                        RootComponentSpec {
                            version: semver::VersionReq::parse(&format!("={version}")).unwrap(),
                        },
                    )
                })
                .collect(),
            component_configuration_updates: updates
                .iter()
                .map(|(name, update)| ((*name).to_string(), update.clone()))
                .collect(),
            failure_handling_policy: crate::deployment::FailureHandlingPolicy::Rollback,
            component_update_policy: crate::deployment::ComponentUpdatePolicy::default(),
            configuration_arn: None,
        }
    }

    const CONFIG_APP: &str = r"
ComponentName: ConfigApp
ComponentVersion: 1.0.0
ComponentConfiguration:
  DefaultConfiguration:
    singleLevelKey: default value of singleLevelKey
    listKey:
      - item1
      - item2
    path:
      leafKey: default value of /path/leafKey
Lifecycle:
  run: |-
    echo 'Value for /singleLevelKey: {configuration:/singleLevelKey}.'
    echo 'Value for /listKey/0: {configuration:/listKey/0}.'
";

    #[test]
    fn test_defaults_flow_through_without_update() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let components = vec![resolved(CONFIG_APP)];
        let doc = document(&[("ConfigApp", "1.0.0")], &[]);
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &json!({}), &[]);

        let config = &result[SERVICES_KEY]["ConfigApp"][CONFIGURATION_KEY];
        assert_eq!(config["singleLevelKey"], "default value of singleLevelKey");
        assert_eq!(config["listKey"], json!(["item1", "item2"]));
    }

    #[test]
    fn test_merge_then_interpolate() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let update = ConfigurationUpdate {
            reset: vec![],
            merge: json!({
                "singleLevelKey": "updated value of singleLevelKey",
                "listKey": ["item3"],
                "path": {"leafKey": "updated value of /path/leafKey"},
                "newSingleLevelKey": "value of newSingleLevelKey"
            }),
        };
        let doc = document(&[("ConfigApp", "1.0.0")], &[("ConfigApp", update)]);
        let components = vec![resolved(CONFIG_APP)];
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &json!({}), &[]);

        let service = &result[SERVICES_KEY]["ConfigApp"];
        assert_eq!(
            service[CONFIGURATION_KEY]["newSingleLevelKey"],
            "value of newSingleLevelKey"
        );

        let run = service[LIFECYCLE_KEY]["run"].as_str().unwrap();
        assert!(run.contains("Value for /singleLevelKey: updated value of singleLevelKey."));
        assert!(run.contains("Value for /listKey/0: item3."));
    }

    #[test]
    fn test_reset_removes_and_restores() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        // running config carries earlier merge results
        let current = json!({
            "ConfigApp": {
                VERSION_KEY: "1.0.0",
                CONFIGURATION_KEY: {
                    "singleLevelKey": "updated value of singleLevelKey",
                    "listKey": ["item3"],
                    "path": {"leafKey": "x", "newLeafKey": "y"},
                    "newSingleLevelKey": "value of newSingleLevelKey"
                }
            }
        });

        let update = ConfigurationUpdate {
            reset: vec!["/newSingleLevelKey".to_string(), "/path/newLeafKey".to_string()],
            merge: Value::Object(Map::new()),
        };
        let doc = document(&[("ConfigApp", "1.0.0")], &[("ConfigApp", update)]);
        let components = vec![resolved(CONFIG_APP)];
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &current, &[]);

        let config = &result[SERVICES_KEY]["ConfigApp"][CONFIGURATION_KEY];
        assert!(config.get("newSingleLevelKey").is_none());
        assert!(config["path"].get("newLeafKey").is_none());
        assert_eq!(config["path"]["leafKey"], "x");

        // whole-document reset restores defaults exactly
        let update = ConfigurationUpdate {
            reset: vec![String::new()],
            merge: Value::Object(Map::new()),
        };
        let doc = document(&[("ConfigApp", "1.0.0")], &[("ConfigApp", update)]);
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &current, &[]);
        let config = &result[SERVICES_KEY]["ConfigApp"][CONFIGURATION_KEY];
        assert_eq!(config["singleLevelKey"], "default value of singleLevelKey");
        assert_eq!(config["listKey"], json!(["item1", "item2"]));
        assert!(config.get("newSingleLevelKey").is_none());
    }

    #[test]
    fn test_cross_component_requires_direct_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let provider = resolved(
            r"
ComponentName: Provider
ComponentVersion: 1.0.0
ComponentConfiguration:
  DefaultConfiguration:
    endpoint: tcp://localhost:1883
",
        );
        let consumer = resolved(
            r"
ComponentName: Consumer
ComponentVersion: 1.0.0
ComponentDependencies:
  Provider:
    VersionRequirement: '=1.0.0'
Lifecycle:
  run: connect {Provider:configuration:/endpoint}
",
        );
        let stranger = resolved(
            r"
ComponentName: Stranger
ComponentVersion: 1.0.0
Lifecycle:
  run: connect {Provider:configuration:/endpoint}
",
        );

        let doc = document(
            &[("Consumer", "1.0.0"), ("Stranger", "1.0.0"), ("Provider", "1.0.0")],
            &[],
        );
        let components = vec![provider, consumer, stranger];
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &json!({}), &[]);

        let consumer_run = result[SERVICES_KEY]["Consumer"][LIFECYCLE_KEY]["run"]
            .as_str()
            .unwrap();
        assert_eq!(consumer_run, "connect tcp://localhost:1883");

        // not a declared dependency: placeholder stays put
        let stranger_run = result[SERVICES_KEY]["Stranger"][LIFECYCLE_KEY]["run"]
            .as_str()
            .unwrap();
        assert_eq!(stranger_run, "connect {Provider:configuration:/endpoint}");
    }

    #[test]
    fn test_system_namespaces_and_unknown_left_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let app = resolved(
            r"
ComponentName: PathApp
ComponentVersion: 2.0.0
Lifecycle:
  run: 'run {artifacts:path} from {kernel:rootPath} with {mystery:namespace}'
",
        );
        let doc = document(&[("PathApp", "2.0.0")], &[]);
        let result = resolver.resolve(&[app], &doc, &root_set(&doc), &json!({}), &[]);

        let run = result[SERVICES_KEY]["PathApp"][LIFECYCLE_KEY]["run"]
            .as_str()
            .unwrap();
        let id = ComponentIdentifier::new("PathApp", Version::new(2, 0, 0));
        assert!(run.contains(&store.artifact_dir(&id).display().to_string()));
        assert!(run.contains(&tmp.path().display().to_string()));
        assert!(run.contains("{mystery:namespace}"));
    }

    #[test]
    fn test_previous_version_rotation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let v2 = resolved("ComponentName: App\nComponentVersion: 2.0.0\n");
        let current = json!({"App": {VERSION_KEY: "1.0.0", CONFIGURATION_KEY: {}}});
        let doc = document(&[("App", "2.0.0")], &[]);
        let result = resolver.resolve(&[v2.clone()], &doc, &root_set(&doc), &current, &[]);
        assert_eq!(result[SERVICES_KEY]["App"][PREV_VERSION_KEY], "1.0.0");

        // redeploying the same version preserves the rotation
        let current = json!({"App": {
            VERSION_KEY: "2.0.0",
            PREV_VERSION_KEY: "1.0.0",
            CONFIGURATION_KEY: {}
        }});
        let result = resolver.resolve(&[v2], &doc, &root_set(&doc), &current, &[]);
        assert_eq!(result[SERVICES_KEY]["App"][PREV_VERSION_KEY], "1.0.0");
    }

    #[test]
    fn test_main_lists_roots_and_builtins() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let app = resolved("ComponentName: App\nComponentVersion: 1.0.0\n");
        let doc = document(&[("App", "1.0.0")], &[]);
        let result = resolver.resolve(
            &[app],
            &doc,
            &root_set(&doc),
            &json!({}),
            &["telemetry".to_string()],
        );

        let deps = result[SERVICES_KEY][MAIN_SERVICE][DEPENDENCIES_KEY]
            .as_array()
            .unwrap();
        let names: Vec<&str> = deps.iter().filter_map(Value::as_str).collect();
        assert_eq!(names, vec!["App", "telemetry"]);
    }

    #[test]
    fn test_prior_running_config_passes_through_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let components = vec![resolved(CONFIG_APP)];
        let current = json!({
            "ConfigApp": {
                VERSION_KEY: "1.0.0",
                CONFIGURATION_KEY: {"singleLevelKey": "carried over"}
            }
        });
        let doc = document(&[("ConfigApp", "1.0.0")], &[]);
        let result = resolver.resolve(&components, &doc, &root_set(&doc), &current, &[]);
        assert_eq!(
            result[SERVICES_KEY]["ConfigApp"][CONFIGURATION_KEY],
            json!({"singleLevelKey": "carried over"})
        );
    }

    #[test]
    fn test_round_trip_persisted_config_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let components = vec![resolved(CONFIG_APP)];
        let doc = document(&[("ConfigApp", "1.0.0")], &[]);
        let first = resolver.resolve(&components, &doc, &root_set(&doc), &json!({}), &[]);

        // persist, reload, resolve again against the reloaded tree: the
        // interpolated lifecycle must be identical
        let bytes = serde_json::to_vec(&first).unwrap();
        let reloaded: Value = serde_json::from_slice(&bytes).unwrap();
        let second = resolver.resolve(&components, &doc, &root_set(&doc), &reloaded[SERVICES_KEY], &[]);
        assert_eq!(
            first[SERVICES_KEY]["ConfigApp"][LIFECYCLE_KEY],
            second[SERVICES_KEY]["ConfigApp"][LIFECYCLE_KEY]
        );
    }

    #[test]
    fn test_resolve_configuration_primitive() {
        let defaults = json!({"a": 1, "b": {"c": 2}});

        // no update, no current: defaults
        assert_eq!(resolve_configuration(None, &defaults, None), defaults);

        // no update, current exists: unchanged
        let current = json!({"a": 9});
        assert_eq!(
            resolve_configuration(Some(&current), &defaults, None),
            current
        );

        // update on a fresh component starts from defaults
        let update = ConfigurationUpdate {
            reset: vec![],
            merge: json!({"b": {"c": 3}}),
        };
        assert_eq!(
            resolve_configuration(None, &defaults, Some(&update)),
            json!({"a": 1, "b": {"c": 3}})
        );
    }

    #[test]
    fn test_dependency_entries_render_with_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(tmp.path()).unwrap();
        let resolver = ConfigResolver::new(&store, tmp.path());

        let app = resolved(
            r"
ComponentName: App
ComponentVersion: 1.0.0
ComponentDependencies:
  Hard:
    VersionRequirement: '=1.0.0'
  Soft:
    VersionRequirement: '=1.0.0'
    DependencyType: SOFT
",
        );
        let doc = document(&[("App", "1.0.0")], &[]);
        let result = resolver.resolve(&[app], &doc, &root_set(&doc), &json!({}), &[]);
        assert_eq!(
            result[SERVICES_KEY]["App"][DEPENDENCIES_KEY],
            json!(["Hard:HARD", "Soft:SOFT"])
        );
    }
}
