//! Node task supervision under distributed leases

pub mod lease;
pub mod orchestrator;
pub mod workloads;

pub use lease::{acquire_lease, Lease, LeaseOptions, LeaseProvider, LocalLeaseProvider, RedisLeaseProvider};
pub use orchestrator::{NodeWorkload, Supervisor, SupervisorOptions};
pub use workloads::{ContainerSyncWorkload, ReconcileWorkload};
