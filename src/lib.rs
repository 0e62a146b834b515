//! # Query Store
//!
//! A client-side normalized entity cache with live query subscriptions for
//! remote-resource APIs (CRUD, pagination, realtime events).
//!
//! ## Core Concepts
//!
//! - **Entities**: Items normalized by id, shared by every query on a service
//! - **Queries**: A `{desc, config}` pair identified by a stable hash, with a
//!   materialized result and a fetch lifecycle
//! - **Fetch policies**: `swr`, `cache-first` and `network-only` decide when a
//!   subscribe goes to the network
//! - **Realtime**: Created/updated/patched/removed events are batched and
//!   merged into matching queries without refetching
//! - **Adapter**: The transport seam; the store never inspects transport
//!   details
//!
//! ## Example
//!
//! ```ignore
//! use query_store::{QueryOptions, QueryStore, StoreConfig};
//!
//! let store = QueryStore::new(adapter, StoreConfig::default())?;
//!
//! // Live list of notes tagged "idea"
//! let ideas = store.find("notes", QueryOptions::new().query(json!({"tag": "idea"})));
//! let unsubscribe = ideas.subscribe(|state| render(state.items()));
//!
//! // Later
//! unsubscribe.unsubscribe();
//! ```

pub mod adapter;
pub mod error;
pub mod query;
pub mod store;
pub mod types;

// Re-exports
pub use adapter::{
    item_filter, matcher_factory, Adapter, ItemFilter, MatcherFactory, RealtimeSubscription,
};
pub use error::{CacheError, Result};
pub use query::{split_config, QueryConfig, QueryDesc, QueryId, QueryOptions, QueryRef};
pub use store::{
    ListenerId, QueryListener, QuerySnapshot, QueryStore, RealtimeSink, ServiceSnapshot,
    StateListener, StateSubscription, StoreConfig, StoreSnapshot, Unsubscribe, UnsubscribeOptions,
};
pub use types::*;
