//! The transport seam.
//!
//! The store never talks to the network itself. Everything it needs from a
//! remote-resource API goes through [`Adapter`]: fetching, mutating, binding
//! realtime events, and a few item-level helpers (id extraction, staleness,
//! filtering, meta counters). The helpers have defaults that fit a typical
//! REST/realtime backend where items carry `id` and `updatedAt` fields and
//! find results report a `total`.

mod matcher;

pub use matcher::{compare_values, get_field_value, matcher};

use crate::error::Result;
use crate::store::RealtimeSink;
use crate::types::{Item, ItemId, Meta, MutationMethod, Page, Params};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether an item belongs to a query's result set.
pub type ItemFilter = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Builds an [`ItemFilter`] from a query's `query` object.
pub type MatcherFactory = Arc<dyn Fn(Option<&Value>) -> ItemFilter + Send + Sync>;

/// Wrap a closure as an [`ItemFilter`].
pub fn item_filter(f: impl Fn(&Item) -> bool + Send + Sync + 'static) -> ItemFilter {
    Arc::new(f)
}

/// Wrap a closure as a [`MatcherFactory`].
pub fn matcher_factory(
    f: impl Fn(Option<&Value>) -> ItemFilter + Send + Sync + 'static,
) -> MatcherFactory {
    Arc::new(f)
}

/// Fields consulted by the default staleness check, in order.
const UPDATED_AT_FIELDS: [&str; 2] = ["updatedAt", "updated_at"];

/// Transport adapter consumed by the store.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Fetch a single item.
    async fn get(
        &self,
        service_name: &str,
        resource_id: &ItemId,
        params: Option<&Params>,
    ) -> Result<Page<Item>>;

    /// Fetch one page of items.
    async fn find(&self, service_name: &str, params: Option<&Params>) -> Result<Page<Vec<Item>>>;

    /// Fetch every page of items.
    ///
    /// The default pages through [`Adapter::find`] with `$skip` until the
    /// reported `total` is reached or a page comes back empty. Without a
    /// `total` only the first page is fetched.
    async fn find_all(
        &self,
        service_name: &str,
        params: Option<&Params>,
    ) -> Result<Page<Vec<Item>>> {
        let mut params = params.cloned().unwrap_or_default();
        let mut query = params
            .get("query")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut skip = query.get("$skip").and_then(Value::as_u64).unwrap_or(0);

        let mut data = Vec::new();
        let mut meta: Option<Meta> = None;
        loop {
            query.insert("$skip".to_string(), Value::from(skip));
            params.insert("query".to_string(), Value::Object(query.clone()));

            let page = self.find(service_name, Some(&params)).await?;
            let fetched = page.data.len() as u64;
            let total = page.meta.get("total").and_then(Value::as_u64);
            if meta.is_none() {
                meta = Some(page.meta);
            }
            data.extend(page.data);
            skip += fetched;

            if fetched == 0 || total.map_or(true, |total| skip >= total) {
                break;
            }
        }

        let mut meta = meta.unwrap_or_default();
        if meta.contains_key("total") {
            meta.insert("total".to_string(), Value::from(data.len() as u64));
        }
        Ok(Page::with_meta(data, meta))
    }

    /// Perform a remote mutation and return the resulting item.
    async fn mutate(
        &self,
        service_name: &str,
        method: MutationMethod,
        args: Vec<Value>,
    ) -> Result<Item>;

    /// Bind realtime events for a service to `sink`.
    ///
    /// Called at most once per service for the lifetime of the store.
    /// Dropping the returned handle must stop delivery.
    fn subscribe(&self, service_name: &str, sink: RealtimeSink) -> RealtimeSubscription;

    /// Extract an item's id.
    fn get_id(&self, item: &Item) -> Option<ItemId> {
        default_get_id(item)
    }

    /// Whether `next` is older than `current` and must be discarded.
    fn is_item_stale(&self, current: &Item, next: &Item) -> bool {
        default_is_item_stale(current, next)
    }

    /// Build the filter for a query object.
    fn matcher(&self, query: Option<&Value>) -> ItemFilter {
        matcher(query)
    }

    /// Meta after an item was merged into a find result.
    fn item_added(&self, meta: &Meta) -> Meta {
        adjust_total(meta, 1)
    }

    /// Meta after an item was dropped from a find result.
    fn item_removed(&self, meta: &Meta) -> Meta {
        adjust_total(meta, -1)
    }
}

/// Reads `id`, falling back to `_id`.
pub fn default_get_id(item: &Item) -> Option<ItemId> {
    item.get("id")
        .or_else(|| item.get("_id"))
        .and_then(ItemId::from_value)
}

/// Compares `updatedAt` / `updated_at`. Numbers compare numerically, strings
/// lexicographically (which orders ISO-8601 timestamps). Items without a
/// comparable marker are never stale.
pub fn default_is_item_stale(current: &Item, next: &Item) -> bool {
    for field in UPDATED_AT_FIELDS {
        match (current.get(field), next.get(field)) {
            (Some(curr @ Value::Number(_)), Some(nxt @ Value::Number(_)))
            | (Some(curr @ Value::String(_)), Some(nxt @ Value::String(_))) => {
                return compare_values(nxt, curr) == Ordering::Less;
            }
            _ => continue,
        }
    }
    false
}

fn adjust_total(meta: &Meta, delta: i64) -> Meta {
    let mut meta = meta.clone();
    if let Some(total) = meta.get("total").and_then(Value::as_i64) {
        meta.insert("total".to_string(), Value::from((total + delta).max(0)));
    }
    meta
}

/// Handle for a realtime binding. Unsubscribes when dropped.
pub struct RealtimeSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RealtimeSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A binding with nothing to tear down.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
