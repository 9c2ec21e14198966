//! Domain records
//!
//! Records are plain snapshots. Entities reference each other by id and are
//! only ever mutated through the store.

pub mod compose;
pub mod connection_log;
pub mod container;
pub mod deployment;
pub mod node;

pub use compose::{Compose, ComposeVersion};
pub use connection_log::{ConnectionLog, LogSeverity};
pub use container::{Container, ContainerState};
pub use deployment::{AppliedDeployment, Deployment, DeploymentSnapshot};
pub use node::{Node, StoredSecret};
