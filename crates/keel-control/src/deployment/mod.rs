//! Deployment lifecycle management.
//!
//! Creation, event-driven advancement, rollback and cancellation of
//! deployments on top of the [`crate::store::DeploymentStore`] and the
//! build [`crate::queue::JobQueue`].

mod manager;

pub use manager::{DeploymentManager, DeploymentRequest};
