//! Dependency resolution across deployment groups.
//!
//! Given the union of root components across every known group, produce a
//! concrete acyclic assignment `name -> (version, recipe)` satisfying every
//! declared version requirement, or report the conflict that makes one
//! impossible.
//!
//! Selection backtracks over candidates ordered stability-first: the
//! currently-running version of a name is preferred when it satisfies all
//! active requirements, then the highest local version, then remote
//! candidates from the artifact collaborator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use futures::future::BoxFuture;
use futures::FutureExt;
use semver::{Version, VersionReq};
use tracing::{debug, info, warn};

use crate::component::{ComponentIdentifier, ComponentRecipe};
use crate::store::{ArtifactSource, ComponentStore, FetchError, StoreError};

/// One requirement on a component name, with the requester that imposed it
/// (a group name for roots, a component name for dependencies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Who imposed the requirement.
    pub requested_by: String,

    /// The version requirement itself.
    pub requirement: VersionReq,
}

impl Requirement {
    /// Create a requirement record.
    #[must_use]
    pub fn new(requested_by: impl Into<String>, requirement: VersionReq) -> Self {
        Self {
            requested_by: requested_by.into(),
            requirement,
        }
    }
}

/// A concrete component chosen by resolution.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    /// Chosen identity.
    pub id: ComponentIdentifier,

    /// The recipe for the chosen version.
    pub recipe: ComponentRecipe,
}

/// Resolution failures. All are terminal for the deployment; the live
/// topology is untouched.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// No candidate version of `name` satisfies every active requirement.
    #[error("unresolvable component '{name}': {}", format_requirements(.requirements))]
    Unresolved {
        /// Conflicted component name.
        name: String,
        /// Every active requirement on the name.
        requirements: Vec<Requirement>,
    },

    /// The declared dependency graph is cyclic.
    #[error("dependency cycle involving '{0}'")]
    DependencyCycle(String),

    /// The store failed while materializing a candidate recipe.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_requirements(requirements: &[Requirement]) -> String {
    let mut out = String::new();
    for (i, req) in requirements.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} requires {}", req.requested_by, req.requirement);
    }
    out
}

/// Backtracking dependency resolver.
pub struct DependencyResolver<'a> {
    store: &'a ComponentStore,
    source: &'a dyn ArtifactSource,
    running: HashMap<String, Version>,
}

struct SolveState {
    requirements: BTreeMap<String, Vec<Requirement>>,
    assigned: HashMap<String, ResolvedComponent>,
}

impl<'a> DependencyResolver<'a> {
    /// Create a resolver over the store, the artifact collaborator, and the
    /// currently-running versions (used for stability tie-breaks).
    #[must_use]
    pub fn new(
        store: &'a ComponentStore,
        source: &'a dyn ArtifactSource,
        running: HashMap<String, Version>,
    ) -> Self {
        Self {
            store,
            source,
            running,
        }
    }

    /// Resolve the union of root requirements into a concrete assignment.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::Unresolved`] when requirements conflict,
    /// [`ResolutionError::DependencyCycle`] when the declared graph is
    /// cyclic, [`ResolutionError::Store`] on store failures.
    pub async fn resolve(
        &self,
        roots: &BTreeMap<String, Vec<Requirement>>,
    ) -> Result<Vec<ResolvedComponent>, ResolutionError> {
        let mut state = SolveState {
            requirements: roots.clone(),
            assigned: HashMap::new(),
        };

        self.solve(&mut state).await?;

        let mut resolved: Vec<ResolvedComponent> = state.assigned.into_values().collect();
        resolved.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        check_acyclic(&resolved)?;

        info!(count = resolved.len(), "dependency resolution complete");
        Ok(resolved)
    }

    fn solve<'s>(&'s self, state: &'s mut SolveState) -> BoxFuture<'s, Result<(), ResolutionError>> {
        async move {
            let Some(name) = state
                .requirements
                .keys()
                .find(|name| !state.assigned.contains_key(*name))
                .cloned()
            else {
                return Ok(());
            };

            let requirements = state.requirements.get(&name).cloned().unwrap_or_default();
            let candidates = self.candidates(&name, &requirements).await?;

            for version in candidates {
                let id = ComponentIdentifier::new(name.clone(), version);
                let recipe = match self.materialize_recipe(&id).await {
                    Ok(recipe) => recipe,
                    Err(e) => {
                        warn!(component = %id, error = %e, "skipping unloadable candidate");
                        continue;
                    },
                };

                // an already-assigned dependency must satisfy this
                // candidate's requirement too
                let conflicts = recipe.component_dependencies.iter().any(|(dep, props)| {
                    state
                        .assigned
                        .get(dep)
                        .is_some_and(|chosen| !props.version_requirement.matches(&chosen.id.version))
                });
                if conflicts {
                    debug!(component = %id, "candidate conflicts with existing assignment");
                    continue;
                }

                for (dep, props) in &recipe.component_dependencies {
                    state
                        .requirements
                        .entry(dep.clone())
                        .or_default()
                        .push(Requirement::new(name.clone(), props.version_requirement.clone()));
                }
                state.assigned.insert(
                    name.clone(),
                    ResolvedComponent {
                        id: id.clone(),
                        recipe,
                    },
                );

                match self.solve(state).await {
                    Ok(()) => return Ok(()),
                    Err(e @ (ResolutionError::Store(_) | ResolutionError::DependencyCycle(_))) => {
                        return Err(e);
                    },
                    Err(ResolutionError::Unresolved { .. }) => {
                        debug!(component = %id, "backtracking from candidate");
                        let removed = state.assigned.remove(&name);
                        if let Some(removed) = removed {
                            for dep in removed.recipe.component_dependencies.keys() {
                                if let Some(reqs) = state.requirements.get_mut(dep) {
                                    reqs.retain(|r| r.requested_by != name);
                                    if reqs.is_empty() {
                                        state.requirements.remove(dep);
                                    }
                                }
                            }
                        }
                    },
                }
            }

            Err(ResolutionError::Unresolved {
                name,
                requirements,
            })
        }
        .boxed()
    }

    /// Candidate versions for `name` satisfying every requirement, in
    /// preference order: running version first, then highest-first.
    async fn candidates(
        &self,
        name: &str,
        requirements: &[Requirement],
    ) -> Result<Vec<Version>, ResolutionError> {
        let satisfies_all =
            |v: &Version| requirements.iter().all(|r| r.requirement.matches(v));

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        if let Some(running) = self.running.get(name) {
            if satisfies_all(running) && seen.insert(running.clone()) {
                candidates.push(running.clone());
            }
        }

        let mut rest: Vec<Version> = self
            .store
            .list_local_versions(name)
            .into_iter()
            .filter(&satisfies_all)
            .collect();

        match self.source.list_versions(name).await {
            Ok(remote) => rest.extend(remote.into_iter().filter(&satisfies_all)),
            Err(FetchError::ComponentNotFound(_)) => {},
            Err(e) => {
                warn!(component = name, error = %e, "remote candidate listing failed");
            },
        }

        rest.sort_unstable_by(|a, b| b.cmp(a));
        for version in rest {
            if seen.insert(version.clone()) {
                candidates.push(version);
            }
        }

        Ok(candidates)
    }

    /// Load the recipe for a candidate, fetching it through the artifact
    /// collaborator when the store misses.
    async fn materialize_recipe(
        &self,
        id: &ComponentIdentifier,
    ) -> Result<ComponentRecipe, StoreError> {
        match self.store.load_recipe(id) {
            Ok(recipe) => Ok(recipe),
            Err(StoreError::RecipeNotFound(_)) => {
                let bytes = self.source.fetch_recipe(id).await?;
                self.store.install_recipe(id, &bytes)
            },
            Err(e) => Err(e),
        }
    }
}

fn check_acyclic(resolved: &[ResolvedComponent]) -> Result<(), ResolutionError> {
    let names: HashSet<&str> = resolved.iter().map(|r| r.id.name.as_str()).collect();
    let edges: HashMap<&str, Vec<&str>> = resolved
        .iter()
        .map(|r| {
            let deps = r
                .recipe
                .component_dependencies
                .keys()
                .map(String::as_str)
                .filter(|d| names.contains(d))
                .collect();
            (r.id.name.as_str(), deps)
        })
        .collect();

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut marks: HashMap<&str, u8> = HashMap::new();
    fn visit<'n>(
        node: &'n str,
        edges: &HashMap<&'n str, Vec<&'n str>>,
        marks: &mut HashMap<&'n str, u8>,
    ) -> Result<(), ResolutionError> {
        match marks.get(node) {
            Some(1) => return Err(ResolutionError::DependencyCycle(node.to_string())),
            Some(2) => return Ok(()),
            _ => {},
        }
        marks.insert(node, 1);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                visit(dep, edges, marks)?;
            }
        }
        marks.insert(node, 2);
        Ok(())
    }

    for name in edges.keys() {
        visit(name, &edges, &mut marks)?;
    }
    Ok(())
}
