//! Per-service normalized state and the transitions that mutate it.
//!
//! Everything here is synchronous and runs under the store's state lock.
//! Query states are replaced copy-on-write (`Arc::make_mut` / `Arc::new`) so a
//! snapshot handed to a listener is never mutated afterwards.

use crate::adapter::{Adapter, ItemFilter};
use crate::error::CacheError;
use crate::query::{QueryConfig, QueryDesc, QueryId};
use crate::types::{
    EventKind, FetchPolicy, Item, ItemId, Meta, Method, QueryData, QueryState, QueryStatus,
    RealtimeMode,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A materialized query.
pub(crate) struct Query {
    pub(crate) desc: QueryDesc,
    pub(crate) config: QueryConfig,
    /// True until the first fetch is dispatched.
    pub(crate) pending: bool,
    /// A refetch was requested while a fetch was in flight.
    pub(crate) dirty: bool,
    /// Identifies this materialization; fetch results for another epoch are
    /// discarded.
    pub(crate) epoch: u64,
    pub(crate) filter_item: ItemFilter,
    pub(crate) state: Arc<QueryState>,
}

impl Query {
    pub(crate) fn new(
        desc: QueryDesc,
        config: QueryConfig,
        filter_item: ItemFilter,
        epoch: u64,
    ) -> Self {
        let skip = config.skip;
        Self {
            desc,
            config,
            pending: !skip,
            dirty: false,
            epoch,
            filter_item,
            state: Arc::new(QueryState::initial(skip)),
        }
    }

    /// Whether realtime events are merged into the cached result.
    pub(crate) fn merges_realtime(&self) -> bool {
        self.config.realtime == RealtimeMode::Merge
            && !(self.config.fetch_policy == FetchPolicy::NetworkOnly
                && self.desc.method == Method::Find)
    }

    /// Whether a new subscriber should trigger a fetch.
    pub(crate) fn wants_fetch_on_subscribe(&self) -> bool {
        let state = &self.state;
        self.pending
            || (state.status == QueryStatus::Success
                && self.config.fetch_policy == FetchPolicy::StaleWhileRevalidate
                && !state.is_fetching)
            || (state.status == QueryStatus::Error && !state.is_fetching)
    }

    /// A fetch has been dispatched and not yet completed.
    pub(crate) fn in_flight(&self) -> bool {
        !self.pending && self.state.is_fetching
    }
}

/// Result of applying one service's realtime events.
#[derive(Debug, Default)]
pub(crate) struct AppliedEvents {
    /// Queries whose state changed, in first-touched order.
    pub(crate) touched: Vec<QueryId>,
    /// Queries in `refetch` realtime mode. Empty when nothing was applied.
    pub(crate) refetch: Vec<QueryId>,
    /// Events that survived the staleness check.
    pub(crate) applied: usize,
}

/// Entities, queries and the item→query membership index of one service.
#[derive(Default)]
pub(crate) struct ServiceState {
    pub(crate) entities: HashMap<ItemId, Item>,
    pub(crate) queries: HashMap<QueryId, Query>,
    pub(crate) item_query_index: HashMap<ItemId, HashSet<QueryId>>,
}

impl ServiceState {
    /// Mark a query as fetching. Clears a previous error.
    pub(crate) fn fetching(&mut self, query_id: &QueryId) -> bool {
        let Some(query) = self.queries.get_mut(query_id) else {
            return false;
        };
        query.pending = false;
        let state = Arc::make_mut(&mut query.state);
        state.is_fetching = true;
        if state.status == QueryStatus::Error {
            state.status = QueryStatus::Loading;
            state.error = None;
        }
        true
    }

    /// Store a successful fetch: normalize items into entities and, for
    /// merging queries, reconcile the membership index with the new result.
    pub(crate) fn fetched(
        &mut self,
        query_id: &QueryId,
        data: QueryData,
        meta: Meta,
        adapter: &dyn Adapter,
    ) {
        let Some(query) = self.queries.get_mut(query_id) else {
            return;
        };
        let indexed = query.merges_realtime();
        let previous = if indexed {
            data_ids(query.state.data.as_ref(), adapter)
        } else {
            Vec::new()
        };

        let mut current = Vec::new();
        for item in data_items(&data) {
            match adapter.get_id(item) {
                Some(id) => {
                    self.entities.insert(id.clone(), item.clone());
                    current.push(id);
                }
                None => warn!(query_id = %query_id, "fetched item has no id; not normalized"),
            }
        }

        query.state = Arc::new(QueryState {
            data: Some(data),
            meta,
            status: QueryStatus::Success,
            is_fetching: false,
            error: None,
        });

        if indexed {
            let retained: HashSet<&ItemId> = current.iter().collect();
            for id in previous.iter().filter(|id| !retained.contains(id)) {
                self.unindex(id, query_id, adapter);
            }
            for id in current {
                self.item_query_index
                    .entry(id)
                    .or_default()
                    .insert(query_id.clone());
            }
        }
    }

    /// Store a failed fetch. The result is cleared along with its index
    /// contributions.
    pub(crate) fn fetch_failed(
        &mut self,
        query_id: &QueryId,
        error: CacheError,
        adapter: &dyn Adapter,
    ) {
        let Some(query) = self.queries.get_mut(query_id) else {
            return;
        };
        let dropped = if query.merges_realtime() {
            data_ids(query.state.data.as_ref(), adapter)
        } else {
            Vec::new()
        };
        query.state = Arc::new(QueryState {
            data: None,
            meta: Meta::new(),
            status: QueryStatus::Error,
            is_fetching: false,
            error: Some(Arc::new(error)),
        });
        for id in dropped {
            self.unindex(&id, query_id, adapter);
        }
    }

    /// Apply realtime events in arrival order.
    ///
    /// Entity writes honour the adapter's staleness check for updates and
    /// patches. Every applied event is then merged into each query that
    /// merges realtime: removed when it no longer matches, replaced when it
    /// still does, appended to fetched `find` results it newly matches. An
    /// id whose last membership is dropped here is evicted from `entities`
    /// unless a non-merging query still shows it.
    pub(crate) fn apply_events(
        &mut self,
        events: Vec<(EventKind, Item)>,
        adapter: &dyn Adapter,
    ) -> AppliedEvents {
        let mut result = AppliedEvents::default();
        let mut touched = HashSet::new();

        for (kind, item) in events {
            let Some(id) = adapter.get_id(&item) else {
                warn!(event = kind.as_str(), "realtime item has no id; ignored");
                continue;
            };

            match kind {
                EventKind::Created => {
                    self.entities.insert(id.clone(), item.clone());
                }
                EventKind::Updated | EventKind::Patched => {
                    if let Some(current) = self.entities.get(&id) {
                        if adapter.is_item_stale(current, &item) {
                            trace!(id = %id, event = kind.as_str(), "discarding stale event");
                            continue;
                        }
                    }
                    self.entities.insert(id.clone(), item.clone());
                }
                EventKind::Removed => {
                    self.entities.remove(&id);
                }
            }
            result.applied += 1;

            let was_indexed = self.item_query_index.contains_key(&id);
            for (query_id, query) in self.queries.iter_mut() {
                if !query.merges_realtime() {
                    continue;
                }
                let has_item = self
                    .item_query_index
                    .get(&id)
                    .map_or(false, |ids| ids.contains(query_id));
                let matches = kind != EventKind::Removed && (query.filter_item)(&item);

                if has_item && !matches {
                    remove_from_result(query, &id, adapter);
                    if let Some(ids) = self.item_query_index.get_mut(&id) {
                        ids.remove(query_id);
                        if ids.is_empty() {
                            self.item_query_index.remove(&id);
                        }
                    }
                    trace!(query_id = %query_id, id = %id, "item left query");
                } else if has_item {
                    replace_in_result(query, &id, &item, adapter);
                    trace!(query_id = %query_id, id = %id, "item updated in query");
                } else if matches
                    && query.desc.method == Method::Find
                    && query.state.data.is_some()
                {
                    append_to_result(query, item.clone(), adapter);
                    self.item_query_index
                        .entry(id.clone())
                        .or_default()
                        .insert(query_id.clone());
                    trace!(query_id = %query_id, id = %id, "item joined query");
                } else {
                    continue;
                }

                if touched.insert(query_id.clone()) {
                    result.touched.push(query_id.clone());
                }
            }

            if was_indexed
                && !self.item_query_index.contains_key(&id)
                && !shown_by_any(&self.queries, &id, adapter)
            {
                self.entities.remove(&id);
                debug!(id = %id, "evicted unreferenced entity");
            }
        }

        if result.applied > 0 {
            result.refetch = self
                .queries
                .iter()
                .filter(|(_, query)| query.config.realtime == RealtimeMode::Refetch)
                .map(|(query_id, _)| query_id.clone())
                .collect();
        }
        result
    }

    /// Remove a query and its index contributions. Returns false if the
    /// query was unknown.
    pub(crate) fn vacuum(&mut self, query_id: &QueryId, adapter: &dyn Adapter) -> bool {
        let Some(query) = self.queries.remove(query_id) else {
            return false;
        };
        for id in data_ids(query.state.data.as_ref(), adapter) {
            self.unindex(&id, query_id, adapter);
        }
        true
    }

    /// Drop one membership. The entity is evicted with its last membership,
    /// unless some query's result still shows it.
    fn unindex(&mut self, id: &ItemId, query_id: &QueryId, adapter: &dyn Adapter) {
        let Some(ids) = self.item_query_index.get_mut(id) else {
            return;
        };
        if !(ids.remove(query_id) && ids.is_empty()) {
            return;
        }
        self.item_query_index.remove(id);
        if shown_by_any(&self.queries, id, adapter) {
            trace!(id = %id, "unindexed entity still shown; kept");
            return;
        }
        self.entities.remove(id);
        debug!(id = %id, "evicted unreferenced entity");
    }

    pub(crate) fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            entities: self.entities.clone(),
            queries: self
                .queries
                .iter()
                .map(|(query_id, query)| {
                    (
                        query_id.clone(),
                        QuerySnapshot {
                            desc: query.desc.clone(),
                            config: query.config.clone(),
                            state: Arc::clone(&query.state),
                        },
                    )
                })
                .collect(),
            item_query_index: self.item_query_index.clone(),
        }
    }
}

/// Whether any query's current result holds `id`, indexed or not.
fn shown_by_any(queries: &HashMap<QueryId, Query>, id: &ItemId, adapter: &dyn Adapter) -> bool {
    queries.values().any(|query| {
        query
            .state
            .data
            .as_ref()
            .map(data_items)
            .unwrap_or(&[])
            .iter()
            .any(|item| adapter.get_id(item).as_ref() == Some(id))
    })
}

fn data_items(data: &QueryData) -> &[Item] {
    match data {
        QueryData::Item(item) => std::slice::from_ref(item),
        QueryData::List(items) => items,
    }
}

fn data_ids(data: Option<&QueryData>, adapter: &dyn Adapter) -> Vec<ItemId> {
    data.map(data_items)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| adapter.get_id(item))
        .collect()
}

fn remove_from_result(query: &mut Query, id: &ItemId, adapter: &dyn Adapter) {
    let state = Arc::make_mut(&mut query.state);
    match query.desc.method {
        Method::Get => state.data = None,
        Method::Find => {
            if let Some(QueryData::List(items)) = state.data.as_mut() {
                items.retain(|item| adapter.get_id(item).as_ref() != Some(id));
            }
            state.meta = adapter.item_removed(&state.meta);
        }
    }
}

fn replace_in_result(query: &mut Query, id: &ItemId, item: &Item, adapter: &dyn Adapter) {
    let state = Arc::make_mut(&mut query.state);
    match query.desc.method {
        Method::Get => state.data = Some(QueryData::Item(item.clone())),
        Method::Find => {
            if let Some(QueryData::List(items)) = state.data.as_mut() {
                for slot in items.iter_mut() {
                    if adapter.get_id(slot).as_ref() == Some(id) {
                        *slot = item.clone();
                    }
                }
            }
        }
    }
}

fn append_to_result(query: &mut Query, item: Item, adapter: &dyn Adapter) {
    let state = Arc::make_mut(&mut query.state);
    if let Some(QueryData::List(items)) = state.data.as_mut() {
        items.push(item);
        state.meta = adapter.item_added(&state.meta);
    }
}

/// Owned copy of the whole store, keyed by service name.
#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    pub services: HashMap<String, ServiceSnapshot>,
}

impl StoreSnapshot {
    pub fn service(&self, service_name: &str) -> Option<&ServiceSnapshot> {
        self.services.get(service_name)
    }
}

/// Owned copy of one service's state.
#[derive(Clone, Debug, Default)]
pub struct ServiceSnapshot {
    pub entities: HashMap<ItemId, Item>,
    pub queries: HashMap<QueryId, QuerySnapshot>,
    pub item_query_index: HashMap<ItemId, HashSet<QueryId>>,
}

/// A query as seen in a snapshot.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    pub desc: QueryDesc,
    pub config: QueryConfig,
    pub state: Arc<QueryState>,
}
