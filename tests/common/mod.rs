//! Shared fixtures: an in-memory adapter with call counters, a fetch gate
//! and captured realtime sinks.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use query_store::adapter::matcher;
use query_store::{
    Adapter, CacheError, Item, ItemId, MutationMethod, Page, Params, QueryState, RealtimeSink,
    RealtimeSubscription, Result,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Install a test-writer subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Let spawned fetch and flush tasks run to completion.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct Calls {
    pub get: AtomicUsize,
    pub find: AtomicUsize,
    pub mutate: AtomicUsize,
    pub subscribe: AtomicUsize,
}

/// In-memory remote: one ordered item list per service.
#[derive(Default)]
pub struct MockAdapter {
    services: Mutex<HashMap<String, Vec<Item>>>,
    sinks: Mutex<HashMap<String, RealtimeSink>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    failures: AtomicUsize,
    next_id: AtomicI64,
    /// Page size applied when a find carries no `$limit`.
    pub page_size: Option<usize>,
    pub calls: Calls,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_page_size(None))
    }

    pub fn with_page_size(page_size: Option<usize>) -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            page_size,
            ..Self::default()
        }
    }

    pub fn seed(&self, service_name: &str, items: Vec<Item>) {
        self.services
            .lock()
            .insert(service_name.to_string(), items);
    }

    /// Sink handed over when the store bound realtime for `service_name`.
    pub fn sink(&self, service_name: &str) -> RealtimeSink {
        self.sinks
            .lock()
            .get(service_name)
            .cloned()
            .unwrap_or_else(|| panic!("no realtime binding for {}", service_name))
    }

    pub fn has_sink(&self, service_name: &str) -> bool {
        self.sinks.lock().contains_key(service_name)
    }

    /// Block fetches until [`MockAdapter::release`] admits them.
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Admit `n` held fetches.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn find_calls(&self) -> usize {
        self.calls.find.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.calls.get.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.calls.subscribe.load(Ordering::SeqCst)
    }

    async fn before_fetch(&self) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| CacheError::Transport(e.to_string()))?
                .forget();
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CacheError::Transport("connection reset".to_string()));
        }
        Ok(())
    }

    fn items(&self, service_name: &str) -> Result<Vec<Item>> {
        self.services
            .lock()
            .get(service_name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownService(service_name.to_string()))
    }
}

fn id_of(item: &Item) -> Option<ItemId> {
    item.get("id").and_then(ItemId::from_value)
}

fn query_of(params: Option<&Params>) -> Map<String, Value> {
    params
        .and_then(|p| p.get("query"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn merge(target: &mut Item, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn get(
        &self,
        service_name: &str,
        resource_id: &ItemId,
        _params: Option<&Params>,
    ) -> Result<Page<Item>> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.before_fetch().await?;
        self.items(service_name)?
            .into_iter()
            // Path ids arrive as text, like a REST route
            .find(|item| id_of(item).map_or(false, |id| id.same_resource(resource_id)))
            .map(Page::new)
            .ok_or_else(|| CacheError::NotFound {
                service: service_name.to_string(),
                id: resource_id.clone(),
            })
    }

    async fn find(&self, service_name: &str, params: Option<&Params>) -> Result<Page<Vec<Item>>> {
        self.calls.find.fetch_add(1, Ordering::SeqCst);
        self.before_fetch().await?;

        let query = query_of(params);
        let filter = matcher(Some(&Value::Object(query.clone())));
        let matching: Vec<Item> = self
            .items(service_name)?
            .into_iter()
            .filter(|item| filter(item))
            .collect();

        let total = matching.len();
        let skip = query.get("$skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = query
            .get("$limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .or(self.page_size)
            .unwrap_or(usize::MAX);
        let data: Vec<Item> = matching.into_iter().skip(skip).take(limit).collect();

        let meta = json!({ "total": total, "skip": skip })
            .as_object()
            .cloned()
            .unwrap_or_default();
        Ok(Page::with_meta(data, meta))
    }

    async fn mutate(
        &self,
        service_name: &str,
        method: MutationMethod,
        args: Vec<Value>,
    ) -> Result<Item> {
        self.calls.mutate.fetch_add(1, Ordering::SeqCst);
        let mut services = self.services.lock();
        let items = services
            .get_mut(service_name)
            .ok_or_else(|| CacheError::UnknownService(service_name.to_string()))?;

        let position = |items: &[Item], id: &ItemId| {
            items
                .iter()
                .position(|item| id_of(item).as_ref() == Some(id))
                .ok_or_else(|| CacheError::NotFound {
                    service: service_name.to_string(),
                    id: id.clone(),
                })
        };
        let target_id = || {
            args.first()
                .and_then(ItemId::from_value)
                .ok_or(CacheError::MissingId)
        };

        match method {
            MutationMethod::Create => {
                let mut item = args.first().cloned().unwrap_or_else(|| json!({}));
                if id_of(&item).is_none() {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    merge(&mut item, &json!({ "id": id }));
                }
                items.push(item.clone());
                Ok(item)
            }
            MutationMethod::Update => {
                let id = target_id()?;
                let index = position(items.as_slice(), &id)?;
                let mut item = args.get(1).cloned().unwrap_or_else(|| json!({}));
                merge(&mut item, &json!({ "id": id.to_value() }));
                items[index] = item.clone();
                Ok(item)
            }
            MutationMethod::Patch => {
                let id = target_id()?;
                let index = position(items.as_slice(), &id)?;
                if let Some(patch) = args.get(1) {
                    merge(&mut items[index], patch);
                }
                Ok(items[index].clone())
            }
            MutationMethod::Remove => {
                let id = target_id()?;
                let index = position(items.as_slice(), &id)?;
                Ok(items.remove(index))
            }
        }
    }

    fn subscribe(&self, service_name: &str, sink: RealtimeSink) -> RealtimeSubscription {
        self.calls.subscribe.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().insert(service_name.to_string(), sink);
        RealtimeSubscription::noop()
    }
}

/// Records every state a listener receives.
#[derive(Clone, Default)]
pub struct Recorder {
    states: Arc<Mutex<Vec<Arc<QueryState>>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> impl Fn(&Arc<QueryState>) + Send + Sync + 'static {
        let states = Arc::clone(&self.states);
        move |state: &Arc<QueryState>| states.lock().push(Arc::clone(state))
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn last(&self) -> Option<Arc<QueryState>> {
        self.states.lock().last().cloned()
    }

    pub fn all(&self) -> Vec<Arc<QueryState>> {
        self.states.lock().clone()
    }
}

/// Ids of a find result, in order.
pub fn ids(state: &QueryState) -> Vec<i64> {
    state
        .items()
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_i64))
        .collect()
}
