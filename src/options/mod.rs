//! User-facing request options and their translation into the wire-level
//! [`RequestOptions`] consumed by the transport.
//!
//! Option structs share fields by embedding [`CommonRequestOptions`]; every
//! struct converts with `RequestOptions::from(&options)` or the
//! [`to_request_options`] helper.

mod bulk_options;
mod common;
mod connection;
mod feed_options;
mod item_options;
mod request_options;
pub use bulk_options::*;
pub use common::*;
pub use connection::*;
pub use feed_options::*;
pub use item_options::*;
pub use request_options::*;

use serde::Deserialize;
use serde::Serialize;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    Eventual,
    ConsistentPrefix,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexingDirective {
    Default,
    Include,
    Exclude,
}

/// Translates any user option struct into wire-level options.
pub fn to_request_options<T>(options: &T) -> RequestOptions
where
    for<'a> &'a T: Into<RequestOptions>,
{
    options.into()
}
