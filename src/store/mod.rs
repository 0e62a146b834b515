//! The query store: normalized entities, live queries, realtime merging.
//!
//! The store owns one service state per service name. Queries are
//! materialized lazily from a [`QueryRef`], fetched through the [`Adapter`]
//! according to their fetch policy, and kept current by realtime events or
//! mutations routed through [`QueryStore::mutate`].
//!
//! All transitions run synchronously under a single lock. Fetches run as
//! tasks on the tokio runtime the store was created in, and listeners are
//! invoked after the lock is released. Each transition is numbered, and a
//! listener is never handed a state older than one it has already seen, even
//! when transitions on different worker threads dispatch concurrently.
//!
//! # Example
//!
//! ```ignore
//! let store = QueryStore::new(adapter, StoreConfig::default())?;
//!
//! let notes = store.find("notes", QueryOptions::new().query(json!({"tag": "idea"})));
//! let unsubscribe = notes.subscribe(|state| println!("{:?}", state.status));
//!
//! store.mutate(Mutation::patch("notes", 1, json!({"tag": "idea"}))).await?;
//! unsubscribe.unsubscribe();
//! ```

mod listeners;
mod realtime;
mod service;

pub use listeners::{ListenerId, QueryListener, StateListener};
pub use realtime::RealtimeSink;
pub use service::{QuerySnapshot, ServiceSnapshot, StoreSnapshot};

use crate::adapter::{Adapter, ItemFilter, RealtimeSubscription};
use crate::error::{CacheError, Result};
use crate::query::{QueryConfig, QueryDesc, QueryId, QueryOptions, QueryRef};
use crate::types::{
    EventKind, FetchPolicy, Item, ItemId, Meta, Method, Mutation, Params, QueryData, QueryState,
    RealtimeMode,
};
use listeners::{Listeners, Notifications};
use parking_lot::Mutex;
use realtime::{group_by_service, EventQueue, RealtimeEvent};
use service::{Query, ServiceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Default realtime batching window.
const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long realtime events accumulate before being applied.
    /// `Duration::ZERO` applies every event immediately.
    /// Default: 100ms
    pub batch_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL,
        }
    }
}

/// Options for [`Unsubscribe::unsubscribe_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsubscribeOptions {
    /// Garbage-collect the query once its last listener is gone.
    /// `None` vacuums `network-only` queries only.
    pub vacuum: Option<bool>,
}

/// The query store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryStore {
    shared: Arc<Shared>,
}

/// State shared between the store handle, fetch tasks and realtime sinks.
pub(crate) struct Shared {
    adapter: Arc<dyn Adapter>,
    config: StoreConfig,
    runtime: Handle,
    state: Mutex<StoreState>,
    realtime: Mutex<HashMap<String, RealtimeSubscription>>,
    queue: EventQueue,
    next_epoch: AtomicU64,
}

#[derive(Default)]
struct StoreState {
    services: HashMap<String, ServiceState>,
    query_services: HashMap<QueryId, String>,
    listeners: Listeners,
    /// Bumped once per notifying transition.
    transitions: u64,
}

impl StoreState {
    fn query(&self, query_id: &QueryId) -> Option<&Query> {
        let service_name = self.query_services.get(query_id)?;
        self.services.get(service_name)?.queries.get(query_id)
    }

    fn query_mut(&mut self, query_id: &QueryId) -> Option<&mut Query> {
        let service_name = self.query_services.get(query_id)?;
        self.services
            .get_mut(service_name)?
            .queries
            .get_mut(query_id)
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            services: self
                .services
                .iter()
                .map(|(name, service)| (name.clone(), service.snapshot()))
                .collect(),
        }
    }

    /// Collect listener calls for `touched` queries plus all state listeners,
    /// stamped with this transition's sequence number.
    fn notifications(&mut self, touched: &[QueryId]) -> Notifications {
        self.transitions += 1;
        let mut notifications = Notifications::at(self.transitions);
        for query_id in touched {
            let Some(query) = self.query(query_id) else {
                continue;
            };
            for listener in self.listeners.for_query(query_id) {
                notifications
                    .queries
                    .push((listener.clone(), Arc::clone(&query.state)));
            }
        }
        if self.listeners.has_state_listeners() {
            notifications.state = self.listeners.state_listeners();
            notifications.snapshot = Some(self.snapshot());
        }
        notifications
    }

    /// Transition a query to fetching and describe the request to run.
    /// Returns `None` if the query is unknown or a fetch is already in flight.
    fn begin_fetch(&mut self, query_id: &QueryId) -> Option<FetchRequest> {
        let service_name = self.query_services.get(query_id)?.clone();
        let service = self.services.get_mut(&service_name)?;
        let query = service.queries.get(query_id)?;
        if query.in_flight() {
            return None;
        }
        let request = FetchRequest {
            query_id: query_id.clone(),
            epoch: query.epoch,
            service_name,
            method: query.desc.method,
            resource_id: query.desc.resource_id.clone(),
            params: query.desc.params.clone(),
            all_pages: query.config.all_pages,
        };
        service.fetching(query_id);
        Some(request)
    }
}

/// Everything a fetch task needs, detached from the locked state.
#[derive(Debug)]
struct FetchRequest {
    query_id: QueryId,
    epoch: u64,
    service_name: String,
    method: Method,
    resource_id: Option<ItemId>,
    params: Option<Params>,
    all_pages: bool,
}

impl QueryStore {
    /// Create a store bound to the current tokio runtime.
    pub fn new(adapter: Arc<dyn Adapter>, config: StoreConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| CacheError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(adapter, config, runtime))
    }

    /// Create a store that spawns its fetch and flush tasks on `runtime`.
    pub fn with_runtime(adapter: Arc<dyn Adapter>, config: StoreConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                config,
                runtime,
                state: Mutex::new(StoreState::default()),
                realtime: Mutex::new(HashMap::new()),
                queue: EventQueue::new(),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.shared.adapter
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    // --- Query References ---

    /// Build a reference for an already split `{desc, config}` pair.
    pub fn query(&self, desc: QueryDesc, config: QueryConfig) -> QueryRef {
        QueryRef::new(desc, config, self.clone())
    }

    /// Reference a single item.
    pub fn get(
        &self,
        service_name: impl Into<String>,
        resource_id: impl Into<ItemId>,
        options: QueryOptions,
    ) -> QueryRef {
        let (desc, config) = options.split(service_name, Method::Get, Some(resource_id.into()));
        self.query(desc, config)
    }

    /// Reference a list of items.
    pub fn find(&self, service_name: impl Into<String>, options: QueryOptions) -> QueryRef {
        let (desc, config) = options.split(service_name, Method::Find, None);
        self.query(desc, config)
    }

    // --- Query Lifecycle ---

    /// Create the query's state if it does not exist yet. Never notifies and
    /// never fetches.
    pub fn materialize(&self, query_ref: &QueryRef) {
        self.shared
            .materialize(query_ref.hash(), query_ref.desc(), query_ref.config());
    }

    /// Register a listener for a query. Triggers a fetch when the query is
    /// pending, when it holds `swr` data, or when it failed.
    pub fn subscribe(
        &self,
        query_id: &QueryId,
        listener: impl Fn(&Arc<QueryState>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let (listener_id, request, notifications) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let listener_id = state.listeners.add_query(query_id, Arc::new(listener));
            let wants_fetch = state
                .query(query_id)
                .map_or(false, Query::wants_fetch_on_subscribe);
            let request = if wants_fetch {
                state.begin_fetch(query_id)
            } else {
                None
            };
            let notifications = if request.is_some() {
                state.notifications(std::slice::from_ref(query_id))
            } else {
                Notifications::none()
            };
            (listener_id, request, notifications)
        };

        notifications.dispatch();
        if let Some(request) = request {
            self.shared.spawn_fetch(request);
        }

        Unsubscribe {
            shared: Arc::downgrade(&self.shared),
            query_id: query_id.clone(),
            listener_id,
        }
    }

    /// Current state of a materialized query.
    pub fn get_query_state(&self, query_id: &QueryId) -> Option<Arc<QueryState>> {
        self.shared
            .state
            .lock()
            .query(query_id)
            .map(|query| Arc::clone(&query.state))
    }

    /// Fetch again now, or right after the in-flight fetch completes.
    pub fn refetch(&self, query_id: &QueryId) {
        self.shared.refetch(query_id);
    }

    /// Run a mutation and apply its result to the cache before returning.
    pub async fn mutate(&self, mutation: Mutation) -> Result<Item> {
        let Mutation {
            service_name,
            method,
            args,
        } = mutation;
        let item = self
            .shared
            .adapter
            .mutate(&service_name, method, args)
            .await?;
        debug!(service = %service_name, ?method, "applying mutation result");
        self.shared
            .apply_service_events(&service_name, vec![(method.event_kind(), item.clone())]);
        Ok(item)
    }

    /// Apply queued realtime events now instead of waiting for the window.
    pub fn flush_realtime(&self) {
        self.shared.flush_events();
    }

    // --- Whole-store Observation ---

    /// Register a listener called with a snapshot after every notifying
    /// transition.
    pub fn subscribe_to_state_changes(
        &self,
        listener: impl Fn(&StoreSnapshot) + Send + Sync + 'static,
    ) -> StateSubscription {
        let listener_id = self.shared.state.lock().listeners.add_state(Arc::new(listener));
        StateSubscription {
            shared: Arc::downgrade(&self.shared),
            listener_id,
        }
    }

    /// Owned snapshot of every service.
    pub fn get_state(&self) -> StoreSnapshot {
        self.shared.state.lock().snapshot()
    }

    /// Realtime events waiting for the current batch window to close.
    pub fn pending_realtime_events(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of listeners registered for a query.
    pub fn listener_count(&self, query_id: &QueryId) -> usize {
        self.shared.state.lock().listeners.count(query_id)
    }
}

impl Shared {
    fn materialize(self: &Arc<Self>, query_id: &QueryId, desc: &QueryDesc, config: &QueryConfig) {
        let exists = self.state.lock().query(query_id).is_some();
        if !exists {
            let filter_item = self.build_filter(desc, config);
            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

            let mut guard = self.state.lock();
            let state = &mut *guard;
            let service = state.services.entry(desc.service_name.clone()).or_default();
            if !service.queries.contains_key(query_id) {
                service.queries.insert(
                    query_id.clone(),
                    Query::new(desc.clone(), config.clone(), filter_item, epoch),
                );
                state
                    .query_services
                    .insert(query_id.clone(), desc.service_name.clone());
                debug!(query_id = %query_id, service = %desc.service_name, "materialized query");
            }
        }

        if config.realtime != RealtimeMode::Disabled {
            self.ensure_realtime(&desc.service_name);
        }
    }

    /// The query's membership predicate. `get` queries additionally require
    /// the item to carry the requested id, in either integer or string form.
    fn build_filter(&self, desc: &QueryDesc, config: &QueryConfig) -> ItemFilter {
        let base = match &config.matcher {
            Some(factory) => factory(desc.query()),
            None => self.adapter.matcher(desc.query()),
        };
        match (desc.method, desc.resource_id.clone()) {
            (Method::Get, Some(resource_id)) => {
                let adapter = Arc::clone(&self.adapter);
                Arc::new(move |item: &Item| {
                    adapter
                        .get_id(item)
                        .map_or(false, |id| id.same_resource(&resource_id))
                        && base(item)
                })
            }
            _ => base,
        }
    }

    /// Bind realtime events for a service, once.
    fn ensure_realtime(self: &Arc<Self>, service_name: &str) {
        if self.realtime.lock().contains_key(service_name) {
            return;
        }
        // The adapter may emit synchronously, so it is not called under the lock.
        let sink = RealtimeSink::new(service_name, Arc::downgrade(self));
        let subscription = self.adapter.subscribe(service_name, sink);

        let mut realtime = self.realtime.lock();
        if realtime.contains_key(service_name) {
            drop(realtime);
            drop(subscription);
            return;
        }
        realtime.insert(service_name.to_string(), subscription);
        debug!(service = service_name, "listening for realtime events");
    }

    fn refetch(self: &Arc<Self>, query_id: &QueryId) {
        let (request, notifications) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(query) = state.query_mut(query_id) else {
                return;
            };
            if query.config.skip {
                return;
            }
            if query.in_flight() {
                query.dirty = true;
                debug!(query_id = %query_id, "fetch in flight; refetch deferred");
                return;
            }
            let request = state.begin_fetch(query_id);
            (request, state.notifications(std::slice::from_ref(query_id)))
        };

        notifications.dispatch();
        if let Some(request) = request {
            self.spawn_fetch(request);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, request: FetchRequest) {
        debug!(query_id = %request.query_id, service = %request.service_name, "dispatching fetch");
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = shared.run_fetch(&request).await;
            shared.complete_fetch(request, result);
        });
    }

    async fn run_fetch(&self, request: &FetchRequest) -> Result<(QueryData, Meta)> {
        let service_name = request.service_name.as_str();
        let params = request.params.as_ref();
        match request.method {
            Method::Get => {
                let resource_id = request
                    .resource_id
                    .as_ref()
                    .ok_or_else(|| CacheError::MissingResourceId(service_name.to_string()))?;
                let page = self.adapter.get(service_name, resource_id, params).await?;
                Ok((QueryData::Item(page.data), page.meta))
            }
            Method::Find if request.all_pages => {
                let page = self.adapter.find_all(service_name, params).await?;
                Ok((QueryData::List(page.data), page.meta))
            }
            Method::Find => {
                let page = self.adapter.find(service_name, params).await?;
                Ok((QueryData::List(page.data), page.meta))
            }
        }
    }

    /// Land a fetch result. Results for a vacuumed (or re-materialized) query
    /// are dropped. A dirty query is fetched again if anyone still listens.
    fn complete_fetch(self: &Arc<Self>, request: FetchRequest, result: Result<(QueryData, Meta)>) {
        let query_id = &request.query_id;
        let (next, notifications) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(service) = state.services.get_mut(&request.service_name) else {
                return;
            };
            match service.queries.get(query_id) {
                Some(query) if query.epoch == request.epoch => {}
                _ => {
                    debug!(query_id = %query_id, "query vacuumed; discarding fetch result");
                    return;
                }
            }

            match result {
                Ok((data, meta)) => {
                    service.fetched(query_id, data, meta, self.adapter.as_ref());
                    debug!(query_id = %query_id, "fetch complete");
                }
                Err(error) => {
                    warn!(query_id = %query_id, %error, "fetch failed");
                    service.fetch_failed(query_id, error, self.adapter.as_ref());
                }
            }

            let listening = state.listeners.count(query_id) > 0;
            let dirty = state
                .query_mut(query_id)
                .map_or(false, |query| std::mem::take(&mut query.dirty));
            let next = if dirty && listening {
                state.begin_fetch(query_id)
            } else {
                None
            };
            (next, state.notifications(std::slice::from_ref(query_id)))
        };

        notifications.dispatch();
        if let Some(next) = next {
            self.spawn_fetch(next);
        }
    }

    /// Entry point for sinks: apply now, or queue for the next batch.
    fn enqueue(self: &Arc<Self>, event: RealtimeEvent) {
        if self.config.batch_interval.is_zero() {
            self.apply_service_events(&event.service_name, vec![(event.kind, event.item)]);
            return;
        }
        if let Some(window) = self.queue.push(event) {
            // The window opens with the first event, not when the task first runs.
            let deadline = tokio::time::Instant::now() + self.config.batch_interval;
            let shared = Arc::clone(self);
            self.runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let events = shared.queue.drain_window(window);
                shared.apply_batch(events);
            });
        }
    }

    fn flush_events(self: &Arc<Self>) {
        let events = self.queue.drain();
        self.apply_batch(events);
    }

    fn apply_batch(self: &Arc<Self>, events: Vec<RealtimeEvent>) {
        if events.is_empty() {
            return;
        }
        debug!(events = events.len(), "flushing realtime batch");
        for (service_name, batch) in group_by_service(events) {
            self.apply_service_events(&service_name, batch);
        }
    }

    /// One state transition for a service's events, then notify, then
    /// trigger `refetch`-mode queries that are still listened to.
    fn apply_service_events(self: &Arc<Self>, service_name: &str, events: Vec<(EventKind, Item)>) {
        let (refetch, notifications) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let service = state.services.entry(service_name.to_string()).or_default();
            let applied = service.apply_events(events, self.adapter.as_ref());
            if applied.applied == 0 {
                debug!(service = service_name, "every event was stale or unusable");
                return;
            }
            debug!(
                service = service_name,
                applied = applied.applied,
                touched = applied.touched.len(),
                "applied realtime events"
            );
            let refetch: Vec<QueryId> = applied
                .refetch
                .into_iter()
                .filter(|query_id| state.listeners.count(query_id) > 0)
                .collect();
            (refetch, state.notifications(&applied.touched))
        };

        notifications.dispatch();
        for query_id in refetch {
            self.refetch(&query_id);
        }
    }

    fn unsubscribe(&self, query_id: &QueryId, listener_id: ListenerId, vacuum: Option<bool>) {
        let notifications = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.listeners.remove_query(query_id, listener_id) > 0 {
                return;
            }
            let Some(service_name) = state.query_services.get(query_id).cloned() else {
                return;
            };
            let Some(service) = state.services.get_mut(&service_name) else {
                return;
            };
            let network_only = service
                .queries
                .get(query_id)
                .map_or(false, |query| query.config.fetch_policy == FetchPolicy::NetworkOnly);
            if !vacuum.unwrap_or(network_only) {
                return;
            }
            if !service.vacuum(query_id, self.adapter.as_ref()) {
                return;
            }
            state.query_services.remove(query_id);
            debug!(query_id = %query_id, "vacuumed query");
            state.notifications(&[])
        };
        notifications.dispatch();
    }
}

/// Removes a query listener. Returned by [`QueryStore::subscribe`].
#[must_use = "the listener stays registered until unsubscribe is called"]
pub struct Unsubscribe {
    shared: Weak<Shared>,
    query_id: QueryId,
    listener_id: ListenerId,
}

impl Unsubscribe {
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// Remove the listener, vacuuming per the query's fetch policy.
    pub fn unsubscribe(self) {
        self.unsubscribe_with(UnsubscribeOptions::default());
    }

    pub fn unsubscribe_with(self, options: UnsubscribeOptions) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(&self.query_id, self.listener_id, options.vacuum);
        }
    }
}

/// Removes a state-change listener. Returned by
/// [`QueryStore::subscribe_to_state_changes`].
#[must_use = "the listener stays registered until unsubscribe is called"]
pub struct StateSubscription {
    shared: Weak<Shared>,
    listener_id: ListenerId,
}

impl StateSubscription {
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().listeners.remove_state(self.listener_id);
        }
    }
}
