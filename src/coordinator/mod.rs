//! Lease ownership and partition processing.
//!
//! [`LeaseOwnershipCoordinator`] decides which leases a host holds and runs a
//! partition pump for each of them. Pumps report back when their lease is
//! lost or their partition disappears; the synchronizer then replaces the
//! lease with leases for the new partitions.

mod balancer;
mod coordinator;
mod estimator;
mod pump;
mod synchronizer;

pub use balancer::*;
pub use coordinator::*;
pub use estimator::*;
pub(crate) use pump::*;
pub(crate) use synchronizer::*;

#[cfg(test)]
mod pump_test;
