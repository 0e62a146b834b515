//! Handle to one logical query.

use super::{QueryConfig, QueryDesc, QueryId};
use crate::store::{QueryStore, Unsubscribe};
use crate::types::QueryState;
use std::fmt;
use std::sync::Arc;

/// A lightweight reference to a query in a [`QueryStore`].
///
/// The id is computed once at construction. Every operation materializes the
/// query in the store first, so a reference can be used before anything has
/// been fetched.
#[derive(Clone)]
pub struct QueryRef {
    query_id: QueryId,
    desc: QueryDesc,
    config: QueryConfig,
    store: QueryStore,
}

impl QueryRef {
    pub fn new(desc: QueryDesc, config: QueryConfig, store: QueryStore) -> Self {
        let query_id = QueryId::compute(&desc, &config);
        Self {
            query_id,
            desc,
            config,
            store,
        }
    }

    /// The query id.
    pub fn hash(&self) -> &QueryId {
        &self.query_id
    }

    pub fn desc(&self) -> &QueryDesc {
        &self.desc
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Listen for state changes. The returned handle removes the listener;
    /// by default `network-only` queries are vacuumed when their last
    /// listener leaves.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<QueryState>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.store.materialize(self);
        self.store.subscribe(&self.query_id, listener)
    }

    /// Current state, without triggering a fetch.
    pub fn get_snapshot(&self) -> Arc<QueryState> {
        self.store.materialize(self);
        self.store
            .get_query_state(&self.query_id)
            .unwrap_or_else(|| Arc::new(QueryState::initial(self.config.skip)))
    }

    pub fn refetch(&self) {
        self.store.materialize(self);
        self.store.refetch(&self.query_id);
    }
}

impl fmt::Debug for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef")
            .field("query_id", &self.query_id)
            .field("desc", &self.desc)
            .field("config", &self.config)
            .finish()
    }
}
