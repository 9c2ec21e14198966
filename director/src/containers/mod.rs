//! Container state tracking

pub mod sync;

pub use sync::{update_containers_for_deployment, ContainerDiff, ContainerStateSynchronizer};
