//! Lease-based dispatch of committed events to consumer groups.

pub mod log_leases;
pub mod r#trait;

pub use log_leases::LogDispatchLeaseManager;
pub use r#trait::{Batch, DispatchError, DispatchLeaseManager, LeaseRecord};
