//! Query descriptors, configuration and identity.
//!
//! A query is the pair `{desc, config}`: what to fetch and how to cache it.
//! Its [`QueryId`] is a deterministic hash of that pair, so every call site
//! describing the same query shares one cached result.

mod id;
mod options;
mod reference;

pub use id::QueryId;
pub use options::{split_config, QueryConfig, QueryDesc, QueryOptions};
pub use reference::QueryRef;
