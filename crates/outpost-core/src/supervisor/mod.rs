//! The running topology: one handle per service name, state transitions
//! driven through the launcher seam, and dependency-ordered start/stop.
//!
//! The supervisor owns the live services configuration tree. The
//! deployment lane is its only writer; readers observe published
//! snapshots.

pub mod launcher;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use semver::Version;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::lifecycle::{
    ServiceState, CONFIGURATION_KEY, DEPENDENCIES_KEY, LIFECYCLE_KEY, MAIN_SERVICE, VERSION_KEY,
};

pub use launcher::{ImmediateLauncher, LaunchError, ServiceLauncher, ServiceSnapshot};

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No service registered under the name.
    #[error("service '{0}' not found")]
    NotFound(String),

    /// The launcher failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Handle to one named service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    /// Service name.
    pub name: String,

    /// Deployed version, when parseable from the service config.
    pub version: Option<Version>,

    /// Current lifecycle state.
    pub state: ServiceState,

    /// The service's configuration subtree (lifecycle, dependencies,
    /// version, configuration).
    pub config: Value,

    /// Whether this is a builtin auto-start service of the supervisor.
    pub builtin: bool,

    /// Last state-change time.
    pub updated_at: DateTime<Utc>,
}

/// Supervisor over the set of named services.
pub struct Supervisor {
    root_path: PathBuf,
    launcher: Arc<dyn ServiceLauncher>,
    services: BTreeMap<String, ServiceHandle>,
    main_dependencies: Vec<String>,
}

impl Supervisor {
    /// Create a supervisor rooted at `root_path` using the given launcher.
    #[must_use]
    pub fn new(root_path: impl Into<PathBuf>, launcher: Arc<dyn ServiceLauncher>) -> Self {
        Self {
            root_path: root_path.into(),
            launcher,
            services: BTreeMap::new(),
            main_dependencies: Vec::new(),
        }
    }

    /// Supervisor root path.
    #[must_use]
    pub fn root_path(&self) -> &PathBuf {
        &self.root_path
    }

    /// Register a builtin auto-start service. Builtins are part of the
    /// supervisor itself: always running, never deployed or removed.
    pub fn register_builtin(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.services.insert(
            name.clone(),
            ServiceHandle {
                name,
                version: None,
                state: ServiceState::Running,
                config: Value::Object(serde_json::Map::new()),
                builtin: true,
                updated_at: Utc::now(),
            },
        );
    }

    /// Names of builtin auto-start services.
    #[must_use]
    pub fn builtin_names(&self) -> Vec<String> {
        self.services
            .values()
            .filter(|h| h.builtin)
            .map(|h| h.name.clone())
            .collect()
    }

    /// The current services configuration: one entry per managed
    /// (non-builtin) service.
    #[must_use]
    pub fn services_config(&self) -> Value {
        let mut map = serde_json::Map::new();
        for handle in self.services.values().filter(|h| !h.builtin) {
            map.insert(handle.name.clone(), handle.config.clone());
        }
        map.insert(
            MAIN_SERVICE.to_string(),
            serde_json::json!({ DEPENDENCIES_KEY: self.main_dependencies.clone() }),
        );
        Value::Object(map)
    }

    /// Replace the synthetic main service's dependency list.
    pub fn set_main_dependencies(&mut self, dependencies: Vec<String>) {
        self.main_dependencies = dependencies;
    }

    /// Create or reconfigure a service from its configuration subtree.
    ///
    /// A new service starts in `New`; an existing one keeps its state and
    /// swaps configuration in place (the caller stops it first when the
    /// change requires a restart).
    pub fn upsert_service(&mut self, name: &str, config: Value) {
        let version = config
            .get(VERSION_KEY)
            .and_then(Value::as_str)
            .and_then(|v| Version::parse(v).ok());

        match self.services.get_mut(name) {
            Some(handle) if !handle.builtin => {
                handle.version = version;
                handle.config = config;
                handle.updated_at = Utc::now();
            },
            Some(_) => {
                warn!(service = name, "refusing to reconfigure builtin service");
            },
            None => {
                self.services.insert(
                    name.to_string(),
                    ServiceHandle {
                        name: name.to_string(),
                        version,
                        state: ServiceState::New,
                        config,
                        builtin: false,
                        updated_at: Utc::now(),
                    },
                );
            },
        }
    }

    /// Remove a managed service from the topology.
    pub fn remove_service(&mut self, name: &str) {
        if self.services.get(name).is_some_and(|h| h.builtin) {
            warn!(service = name, "refusing to remove builtin service");
            return;
        }
        if self.services.remove(name).is_some() {
            debug!(service = name, "service removed from topology");
        }
    }

    /// Get a service handle.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceHandle> {
        self.services.get(name)
    }

    /// Current state of a service.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|h| h.state)
    }

    /// Force a service's recorded state. Used by recovery paths.
    pub fn mark_state(&mut self, name: &str, state: ServiceState) {
        if let Some(handle) = self.services.get_mut(name) {
            handle.state = state;
            handle.updated_at = Utc::now();
        }
    }

    /// Names of everything currently occupying the topology: `main`,
    /// builtins, and every managed service in an active state.
    #[must_use]
    pub fn running_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .services
            .values()
            .filter(|h| h.builtin || h.state.is_active() || h.state == ServiceState::Running)
            .map(|h| h.name.clone())
            .collect();
        names.insert(MAIN_SERVICE.to_string());
        names
    }

    /// Versions of managed services in active states, keyed by name.
    #[must_use]
    pub fn running_versions(&self) -> HashMap<String, Version> {
        self.services
            .values()
            .filter(|h| !h.builtin && h.state.is_active())
            .filter_map(|h| h.version.clone().map(|v| (h.name.clone(), v)))
            .collect()
    }

    /// All managed service names.
    #[must_use]
    pub fn managed_names(&self) -> Vec<String> {
        self.services
            .values()
            .filter(|h| !h.builtin)
            .map(|h| h.name.clone())
            .collect()
    }

    /// Direct dependencies of a service, parsed from its configured
    /// dependency list (`name` or `name:KIND` entries).
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.services
            .get(name)
            .map(|h| dependencies_from_config(&h.config))
            .unwrap_or_default()
    }

    /// Snapshot a service for the launcher.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        let handle = self.services.get(name)?;
        Some(ServiceSnapshot {
            name: handle.name.clone(),
            version: handle.version.clone(),
            lifecycle: handle
                .config
                .get(LIFECYCLE_KEY)
                .cloned()
                .unwrap_or(Value::Null),
            configuration: handle
                .config
                .get(CONFIGURATION_KEY)
                .cloned()
                .unwrap_or(Value::Null),
            root_path: self.root_path.clone(),
        })
    }

    /// Start a service and record the settled state the launcher reports.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotFound`] for unknown names; launcher failures
    /// record the service `Broken` and propagate.
    pub async fn start_service(&mut self, name: &str) -> Result<ServiceState, SupervisorError> {
        let snapshot = self
            .snapshot(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        self.mark_state(name, ServiceState::Starting);
        info!(service = name, "starting service");

        match self.launcher.start(&snapshot).await {
            Ok(state) => {
                self.mark_state(name, state);
                debug!(service = name, state = %state, "service settled");
                Ok(state)
            },
            Err(e) => {
                self.mark_state(name, ServiceState::Broken);
                Err(e.into())
            },
        }
    }

    /// Start several mutually independent services concurrently and
    /// record the settled state of each.
    ///
    /// Stage execution fans out per service through the launcher; the
    /// caller is responsible for only batching services with no
    /// dependency edges between them (see [`start_batches`]).
    ///
    /// [`start_batches`]: Self::start_batches
    pub async fn start_services(
        &mut self,
        names: &[String],
    ) -> Vec<(String, Result<ServiceState, SupervisorError>)> {
        let mut results = Vec::with_capacity(names.len());
        let mut jobs = Vec::new();
        for name in names {
            match self.snapshot(name) {
                Some(snapshot) => {
                    self.mark_state(name, ServiceState::Starting);
                    info!(service = %name, "starting service");
                    jobs.push((name.clone(), snapshot));
                },
                None => {
                    results.push((name.clone(), Err(SupervisorError::NotFound(name.clone()))));
                },
            }
        }

        let launcher = Arc::clone(&self.launcher);
        let settled = join_all(jobs.into_iter().map(|(name, snapshot)| {
            let launcher = Arc::clone(&launcher);
            async move {
                let outcome = launcher.start(&snapshot).await;
                (name, outcome)
            }
        }))
        .await;

        for (name, outcome) in settled {
            match outcome {
                Ok(state) => {
                    self.mark_state(&name, state);
                    debug!(service = %name, state = %state, "service settled");
                    results.push((name, Ok(state)));
                },
                Err(e) => {
                    self.mark_state(&name, ServiceState::Broken);
                    results.push((name, Err(e.into())));
                },
            }
        }
        results
    }

    /// Stop a service if it is active.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotFound`] for unknown names; launcher failures
    /// propagate (the state is still recorded `Finished`, matching the
    /// supervisor's view that the service no longer holds its name).
    pub async fn stop_service(&mut self, name: &str) -> Result<(), SupervisorError> {
        let snapshot = self
            .snapshot(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let state = self.state_of(name).unwrap_or(ServiceState::Finished);
        if !state.is_active() {
            return Ok(());
        }

        self.mark_state(name, ServiceState::Stopping);
        info!(service = name, "stopping service");
        let result = self.launcher.stop(&snapshot).await;
        self.mark_state(name, ServiceState::Finished);
        result.map_err(Into::into)
    }

    /// Run a single lifecycle stage (bootstrap, recover) to completion.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotFound`] or launcher failures.
    pub async fn run_stage(&mut self, name: &str, stage: &str) -> Result<(), SupervisorError> {
        let snapshot = self
            .snapshot(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        self.launcher.run_stage(&snapshot, stage).await?;
        Ok(())
    }

    /// Order `names` so every service follows its dependencies. Edges
    /// outside `names` are ignored.
    #[must_use]
    pub fn start_order(&self, names: &BTreeSet<String>) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> = names.iter().map(|n| (n.as_str(), 0)).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for name in names {
            for dep in self.dependencies_of(name) {
                if let Some(dep_key) = names.get(&dep) {
                    if let Some(degree) = indegree.get_mut(name.as_str()) {
                        *degree += 1;
                    }
                    dependents
                        .entry(dep_key.as_str())
                        .or_default()
                        .push(name.as_str());
                }
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(names.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());
            for &dependent in dependents.get(next).into_iter().flatten() {
                let degree = indegree.get_mut(dependent).expect("indegree tracked");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }

        // a cycle cannot occur in resolved topologies; append leftovers so
        // the merge still terminates if one slips in
        for name in names {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// Partition `names` into dependency levels: every service in a
    /// batch depends only on services in earlier batches (or outside
    /// `names`). Members of one batch are mutually independent and may
    /// start in parallel; batch order follows the DAG.
    #[must_use]
    pub fn start_batches(&self, names: &BTreeSet<String>) -> Vec<Vec<String>> {
        let order = self.start_order(names);
        let mut level: BTreeMap<&str, usize> = BTreeMap::new();
        let mut batches: Vec<Vec<String>> = Vec::new();

        for name in &order {
            let depth = self
                .dependencies_of(name)
                .iter()
                .filter_map(|dep| level.get(dep.as_str()))
                .max()
                .map_or(0, |deepest| deepest + 1);
            level.insert(name.as_str(), depth);
            if batches.len() <= depth {
                batches.push(Vec::new());
            }
            batches[depth].push(name.clone());
        }

        batches
    }

    /// Reverse-dependency order for stopping.
    #[must_use]
    pub fn stop_order(&self, names: &BTreeSet<String>) -> Vec<String> {
        let mut order = self.start_order(names);
        order.reverse();
        order
    }
}

fn dependencies_from_config(config: &Value) -> Vec<String> {
    config
        .get(DEPENDENCIES_KEY)
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(Value::as_str)
                .map(|entry| {
                    entry
                        .split_once(':')
                        .map_or(entry, |(name, _kind)| name)
                        .to_string()
                })
                .collect()
        })
        .unwrap_or_default()
}
