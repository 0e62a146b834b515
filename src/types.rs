//! Core types for the query store.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A domain item as delivered by the adapter.
pub type Item = Value;

/// Result metadata (totals, paging) attached to a fetch.
pub type Meta = Map<String, Value>;

/// Pass-through request parameters (`query`, transport options, ...).
pub type Params = Map<String, Value>;

/// Identifier of an entity, as extracted by the adapter.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Int(i64),
    Str(String),
}

impl ItemId {
    /// Interpret a JSON value as an id. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ItemId::Int),
            Value::String(s) => Some(ItemId::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ItemId::Int(n) => Value::from(*n),
            ItemId::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Whether both ids name the same resource. An integer id and its
    /// decimal string form compare equal.
    pub fn same_resource(&self, other: &ItemId) -> bool {
        match (self, other) {
            (ItemId::Int(n), ItemId::Str(s)) | (ItemId::Str(s), ItemId::Int(n)) => {
                n.to_string() == *s
            }
            _ => self == other,
        }
    }
}

impl From<i64> for ItemId {
    fn from(n: i64) -> Self {
        ItemId::Int(n)
    }
}

impl From<i32> for ItemId {
    fn from(n: i32) -> Self {
        ItemId::Int(i64::from(n))
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId::Str(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId::Str(s)
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Int(n) => write!(f, "ItemId({})", n),
            ItemId::Str(s) => write!(f, "ItemId({:?})", s),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Int(n) => write!(f, "{}", n),
            ItemId::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Transport method a query reads through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Find,
}

/// How a query reacts to realtime events on its service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeMode {
    /// Merge matching items into the cached result in place.
    #[default]
    Merge,
    /// Refetch the whole query when anything on the service changes.
    Refetch,
    /// Ignore realtime events.
    Disabled,
}

/// Whether a subscribe trusts the cache or goes to the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchPolicy {
    /// Serve cached data, revalidate in the background.
    #[default]
    #[serde(rename = "swr")]
    StaleWhileRevalidate,
    /// Serve cached data, only fetch when nothing is cached.
    #[serde(rename = "cache-first")]
    CacheFirst,
    /// Ignore cached data; every mount fetches.
    #[serde(rename = "network-only")]
    NetworkOnly,
}

/// Lifecycle status of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Materialized result of a query.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryData {
    /// Result of a `get` query.
    Item(Item),
    /// Result of a `find` query.
    List(Vec<Item>),
}

impl QueryData {
    pub fn as_item(&self) -> Option<&Item> {
        match self {
            QueryData::Item(item) => Some(item),
            QueryData::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            QueryData::List(items) => Some(items),
            QueryData::Item(_) => None,
        }
    }
}

/// Observable state of a query. Snapshots are handed out as `Arc<QueryState>`
/// and are never mutated once shared.
#[derive(Clone, Debug)]
pub struct QueryState {
    /// `None` until the first successful fetch (and for a `get` whose item
    /// was removed).
    pub data: Option<QueryData>,
    pub meta: Meta,
    pub status: QueryStatus,
    pub is_fetching: bool,
    pub error: Option<Arc<CacheError>>,
}

impl QueryState {
    /// Initial state of a freshly materialized query.
    pub fn initial(skip: bool) -> Self {
        Self {
            data: None,
            meta: Meta::new(),
            status: if skip {
                QueryStatus::Idle
            } else {
                QueryStatus::Loading
            },
            is_fetching: !skip,
            error: None,
        }
    }

    /// Items of a `find` result, empty when there is none.
    pub fn items(&self) -> &[Item] {
        self.data
            .as_ref()
            .and_then(QueryData::as_list)
            .unwrap_or(&[])
    }

    /// Item of a `get` result.
    pub fn item(&self) -> Option<&Item> {
        self.data.as_ref().and_then(QueryData::as_item)
    }
}

/// A page of data returned by an adapter fetch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page<T> {
    pub data: T,
    pub meta: Meta,
}

impl<T> Page<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: Meta::new(),
        }
    }

    pub fn with_meta(data: T, meta: Meta) -> Self {
        Self { data, meta }
    }
}

/// Kind of a realtime change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Patched,
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Patched => "patched",
            EventKind::Removed => "removed",
        }
    }
}

/// Remote mutation methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationMethod {
    Create,
    Update,
    Patch,
    Remove,
}

impl MutationMethod {
    /// The realtime event a successful mutation corresponds to.
    pub fn event_kind(self) -> EventKind {
        match self {
            MutationMethod::Create => EventKind::Created,
            MutationMethod::Update => EventKind::Updated,
            MutationMethod::Patch => EventKind::Patched,
            MutationMethod::Remove => EventKind::Removed,
        }
    }
}

impl FromStr for MutationMethod {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationMethod::Create),
            "update" => Ok(MutationMethod::Update),
            "patch" => Ok(MutationMethod::Patch),
            "remove" => Ok(MutationMethod::Remove),
            other => Err(CacheError::UnknownMethod(other.to_string())),
        }
    }
}

/// A mutation request routed through [`crate::QueryStore::mutate`].
#[derive(Clone, Debug)]
pub struct Mutation {
    pub service_name: String,
    pub method: MutationMethod,
    pub args: Vec<Value>,
}

impl Mutation {
    pub fn create(service_name: impl Into<String>, data: Value) -> Self {
        Self {
            service_name: service_name.into(),
            method: MutationMethod::Create,
            args: vec![data],
        }
    }

    pub fn update(service_name: impl Into<String>, id: impl Into<ItemId>, data: Value) -> Self {
        Self {
            service_name: service_name.into(),
            method: MutationMethod::Update,
            args: vec![id.into().to_value(), data],
        }
    }

    pub fn patch(service_name: impl Into<String>, id: impl Into<ItemId>, data: Value) -> Self {
        Self {
            service_name: service_name.into(),
            method: MutationMethod::Patch,
            args: vec![id.into().to_value(), data],
        }
    }

    pub fn remove(service_name: impl Into<String>, id: impl Into<ItemId>) -> Self {
        Self {
            service_name: service_name.into(),
            method: MutationMethod::Remove,
            args: vec![id.into().to_value()],
        }
    }
}
