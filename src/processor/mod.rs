//! The public face of the crate: build a processor, start it, stop it, and
//! watch its progress.

mod builder;
mod delegate;
mod processor;
mod state;

pub use builder::*;
pub use delegate::*;
pub use processor::*;
pub use state::*;

#[cfg(test)]
mod processor_test;
