//! A lease-based change feed processor.
//!
//! Several hosts read the change feed of one monitored container together.
//! Each feed partition is covered by a lease document in a shared lease
//! container; hosts compete for the leases, renew the ones they hold, and run
//! a pump per owned lease that hands changes to a user delegate and
//! checkpoints the continuation afterwards.
//!
//! The request diagnostics and request option types used by the same client
//! pipeline live in [`diagnostics`] and [`options`].

mod config;
mod coordinator;
pub mod diagnostics;
mod errors;
mod feed;
mod lease;
mod metrics;
pub mod options;
mod processor;
pub mod utils;

pub use config::*;
pub use coordinator::*;
pub use diagnostics::*;
pub use errors::*;
pub use feed::*;
pub use lease::*;
pub use metrics::*;
pub use options::*;
pub use processor::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
