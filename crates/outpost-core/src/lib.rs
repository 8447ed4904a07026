//! # outpost-core
//!
//! Core library for outpost, an on-device component orchestrator for edge
//! fleets. A long-lived supervisor ingests declarative deployment
//! documents describing which versioned components must run on the
//! device, reconciles running state against desired state, and guarantees
//! safe transitions: atomic success, bounded rollback, or diagnosed
//! failure.
//!
//! ## Pipeline
//!
//! - **Dependency resolution** ([`resolver`]): backtracking selection
//!   over candidate versions across every deployment group.
//! - **Component store** ([`store`]): content-addressed cache of recipes
//!   and artifacts with preemptive cleanup and coalesced fetches.
//! - **Configuration resolution** ([`config_resolver`]): merged service
//!   configuration with namespace-scoped interpolation.
//! - **Lifecycle merge** ([`merge`]): atomic transition of the running
//!   topology with update-check votes, bounded rollback and cooperative
//!   cancellation.
//! - **Deployment task** ([`deployment::task`]): one document driven end
//!   to end through the stages above.
//!
//! ## Example
//!
//! ```rust,no_run
//! use outpost_core::store::ComponentStore;
//! use outpost_core::supervisor::{ImmediateLauncher, Supervisor};
//! use std::sync::Arc;
//!
//! let store = ComponentStore::open(std::path::Path::new("/var/lib/outpost")).unwrap();
//! let supervisor = Supervisor::new("/var/lib/outpost", Arc::new(ImmediateLauncher));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cancel;
pub mod component;
pub mod config_resolver;
pub mod deployment;
pub mod fs_safe;
pub mod ipc;
pub mod lifecycle;
pub mod merge;
pub mod resolver;
pub mod store;
pub mod supervisor;
pub mod tree;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cancel::CancelSignal;
    pub use crate::component::{ComponentIdentifier, ComponentRecipe};
    pub use crate::deployment::{
        DeploymentDocument, DeploymentResult, DeploymentStatus, GroupRootsStore,
    };
    pub use crate::lifecycle::{DeploymentStage, ServiceState};
    pub use crate::merge::UpdateNotifier;
    pub use crate::store::{ArtifactSource, ComponentStore};
    pub use crate::supervisor::Supervisor;
}

pub use cancel::CancelSignal;
pub use component::{ComponentIdentifier, ComponentRecipe};
pub use deployment::{DeploymentDocument, DeploymentResult, DeploymentStatus};
pub use lifecycle::ServiceState;
pub use store::ComponentStore;
pub use supervisor::Supervisor;
