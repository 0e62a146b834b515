//! Splitting a combined options bag into a transport descriptor and cache config.

use crate::adapter::MatcherFactory;
use crate::types::{FetchPolicy, ItemId, Method, Params, RealtimeMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Options keys consumed by the cache rather than passed to the transport.
const SKIP_KEY: &str = "skip";
const REALTIME_KEY: &str = "realtime";
const FETCH_POLICY_KEY: &str = "fetchPolicy";
const ALL_PAGES_KEY: &str = "allPages";

/// What to fetch: the transport-facing half of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDesc {
    pub service_name: String,
    pub method: Method,
    pub resource_id: Option<ItemId>,
    pub params: Option<Params>,
}

impl QueryDesc {
    /// The `query` object inside params, used to derive the item filter.
    pub fn query(&self) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get("query"))
    }
}

/// How to cache: the cache-facing half of a query.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    pub skip: bool,
    pub realtime: RealtimeMode,
    pub fetch_policy: FetchPolicy,
    pub all_pages: bool,
    /// Overrides the adapter's matcher. Not part of the query identity.
    #[serde(skip)]
    pub matcher: Option<MatcherFactory>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            skip: false,
            realtime: RealtimeMode::Merge,
            fetch_policy: FetchPolicy::StaleWhileRevalidate,
            all_pages: false,
            matcher: None,
        }
    }
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("skip", &self.skip)
            .field("realtime", &self.realtime)
            .field("fetch_policy", &self.fetch_policy)
            .field("all_pages", &self.all_pages)
            .field("matcher", &self.matcher.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A flat options bag as a caller writes it: transport params and cache
/// controls side by side.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub fields: Map<String, Value>,
    pub matcher: Option<MatcherFactory>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object. Non-object values yield empty options.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self {
                fields,
                matcher: None,
            },
            _ => Self::default(),
        }
    }

    /// Set the `query` filter object.
    pub fn query(self, query: Value) -> Self {
        self.param("query", query)
    }

    /// Set an arbitrary pass-through (or cache-control) field.
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn skip(self, skip: bool) -> Self {
        self.param(SKIP_KEY, Value::Bool(skip))
    }

    pub fn realtime(self, mode: RealtimeMode) -> Self {
        let value = serde_json::to_value(mode).unwrap_or(Value::Null);
        self.param(REALTIME_KEY, value)
    }

    pub fn fetch_policy(self, policy: FetchPolicy) -> Self {
        let value = serde_json::to_value(policy).unwrap_or(Value::Null);
        self.param(FETCH_POLICY_KEY, value)
    }

    pub fn all_pages(self, all_pages: bool) -> Self {
        self.param(ALL_PAGES_KEY, Value::Bool(all_pages))
    }

    pub fn matcher(mut self, matcher: MatcherFactory) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Separate the bag into `(desc, config)`.
    ///
    /// Every field that is not a recognized cache control is passed through
    /// as a param. Unrecognized values for cache controls fall back to the
    /// defaults.
    pub fn split(
        self,
        service_name: impl Into<String>,
        method: Method,
        resource_id: Option<ItemId>,
    ) -> (QueryDesc, QueryConfig) {
        let mut fields = self.fields;
        let defaults = QueryConfig::default();

        let skip = fields
            .remove(SKIP_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.skip);
        let realtime = fields
            .remove(REALTIME_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(defaults.realtime);
        let fetch_policy = fields
            .remove(FETCH_POLICY_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(defaults.fetch_policy);
        let all_pages = fields
            .remove(ALL_PAGES_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.all_pages);

        let desc = QueryDesc {
            service_name: service_name.into(),
            method,
            resource_id,
            params: if fields.is_empty() { None } else { Some(fields) },
        };
        let config = QueryConfig {
            skip,
            realtime,
            fetch_policy,
            all_pages,
            matcher: self.matcher,
        };
        (desc, config)
    }
}

/// Free-function form of [`QueryOptions::split`].
pub fn split_config(
    service_name: impl Into<String>,
    method: Method,
    resource_id: Option<ItemId>,
    options: QueryOptions,
) -> (QueryDesc, QueryConfig) {
    options.split(service_name, method, resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_defaults() {
        let (desc, config) = QueryOptions::new().split("notes", Method::Find, None);

        assert_eq!(desc.service_name, "notes");
        assert_eq!(desc.method, Method::Find);
        assert!(desc.params.is_none());
        assert!(!config.skip);
        assert_eq!(config.realtime, RealtimeMode::Merge);
        assert_eq!(config.fetch_policy, FetchPolicy::StaleWhileRevalidate);
        assert!(!config.all_pages);
    }

    #[test]
    fn test_split_separates_cache_controls() {
        let options = QueryOptions::from_value(json!({
            "query": {"tag": "idea"},
            "headers": {"x-trace": "1"},
            "skip": true,
            "realtime": "refetch",
            "fetchPolicy": "cache-first",
            "allPages": true,
        }));
        let (desc, config) = options.split("notes", Method::Find, None);

        let params = desc.params.unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["query"], json!({"tag": "idea"}));
        assert_eq!(params["headers"], json!({"x-trace": "1"}));
        assert!(config.skip);
        assert_eq!(config.realtime, RealtimeMode::Refetch);
        assert_eq!(config.fetch_policy, FetchPolicy::CacheFirst);
        assert!(config.all_pages);
    }

    #[test]
    fn test_split_ignores_invalid_control_values() {
        let options = QueryOptions::from_value(json!({
            "realtime": "sometimes",
            "fetchPolicy": 3,
            "skip": "yes",
        }));
        let (desc, config) = options.split("notes", Method::Get, Some(ItemId::Int(1)));

        assert!(desc.params.is_none());
        assert_eq!(desc.resource_id, Some(ItemId::Int(1)));
        assert!(!config.skip);
        assert_eq!(config.realtime, RealtimeMode::Merge);
        assert_eq!(config.fetch_policy, FetchPolicy::StaleWhileRevalidate);
    }

    #[test]
    fn test_builder_matches_flat_bag() {
        let built = QueryOptions::new()
            .query(json!({"tag": "idea"}))
            .fetch_policy(FetchPolicy::NetworkOnly)
            .realtime(RealtimeMode::Disabled);
        let (desc, config) = built.split("notes", Method::Find, None);

        assert_eq!(desc.query(), Some(&json!({"tag": "idea"})));
        assert_eq!(config.fetch_policy, FetchPolicy::NetworkOnly);
        assert_eq!(config.realtime, RealtimeMode::Disabled);
    }
}
