//! Default query matcher.
//!
//! Turns a Feathers/MongoDB-style query object into an [`ItemFilter`]:
//! plain values compare for equality, `$`-operators compare against the
//! field, `$or`/`$and` combine sub-queries, and paging or shaping keys
//! (`$limit`, `$skip`, `$sort`, `$select`) are ignored since they do not
//! affect membership.

use super::ItemFilter;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Query keys that never affect whether an item matches.
const IGNORED_KEYS: [&str; 4] = ["$limit", "$skip", "$sort", "$select"];

/// Build a filter from a query object. `None`, non-objects and empty
/// objects match everything.
pub fn matcher(query: Option<&Value>) -> ItemFilter {
    let query = match query.and_then(Value::as_object) {
        Some(q) if !q.is_empty() => q.clone(),
        _ => return Arc::new(|_: &Value| true),
    };
    Arc::new(move |item: &Value| matches_query(item, &query))
}

fn matches_query(item: &Value, query: &Map<String, Value>) -> bool {
    query.iter().all(|(key, condition)| match key.as_str() {
        "$or" => condition.as_array().map_or(false, |subs| {
            subs.iter()
                .filter_map(Value::as_object)
                .any(|sub| matches_query(item, sub))
        }),
        "$and" => condition.as_array().map_or(true, |subs| {
            subs.iter()
                .filter_map(Value::as_object)
                .all(|sub| matches_query(item, sub))
        }),
        k if IGNORED_KEYS.contains(&k) => true,
        field => matches_field(get_field_value(item, field), condition),
    })
}

fn matches_field(value: Option<&Value>, condition: &Value) -> bool {
    match condition.as_object() {
        Some(ops) if is_operator(ops) => ops
            .iter()
            .all(|(op, operand)| evaluate_operator(value, op, operand)),
        _ => value.map_or(condition.is_null(), |v| v == condition),
    }
}

fn is_operator(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| k.starts_with('$'))
}

fn evaluate_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    if op == "$exists" {
        let wanted = operand.as_bool().unwrap_or(true);
        return value.map_or(false, |v| !v.is_null()) == wanted;
    }

    let value = value.unwrap_or(&Value::Null);
    match op {
        "$eq" => value == operand,
        "$ne" => value != operand,
        "$in" => operand
            .as_array()
            .map_or(false, |candidates| in_candidates(value, candidates)),
        "$nin" => operand
            .as_array()
            .map_or(true, |candidates| !in_candidates(value, candidates)),
        "$lt" => ordered(value, operand, |o| o == Ordering::Less),
        "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
        "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(value, operand, |o| o != Ordering::Less),
        _ => false,
    }
}

/// Array-valued fields match when any element is a candidate.
fn in_candidates(value: &Value, candidates: &[Value]) -> bool {
    match value {
        Value::Array(values) => values.iter().any(|v| candidates.contains(v)),
        v => candidates.contains(v),
    }
}

fn ordered(value: &Value, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    if value.is_null() || operand.is_null() {
        return false;
    }
    accept(compare_values(value, operand))
}

/// Order two JSON values. Numbers compare as `f64`, strings by code point,
/// booleans `false < true`; mismatched types order by type rank.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(f64::NAN);
            let fb = nb.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

/// Resolve a dot-separated path inside an item.
pub fn get_field_value<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = item;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(query: Value, item: Value) -> bool {
        matcher(Some(&query))(&item)
    }

    #[test]
    fn test_empty_query_matches_all() {
        assert!(matcher(None)(&json!({"id": 1})));
        assert!(check(json!({}), json!({"id": 1})));
    }

    #[test]
    fn test_equality() {
        assert!(check(json!({"tag": "idea"}), json!({"id": 1, "tag": "idea"})));
        assert!(!check(json!({"tag": "idea"}), json!({"id": 1, "tag": "other"})));
        assert!(!check(json!({"tag": "idea"}), json!({"id": 1})));
        assert!(check(json!({"tag": null}), json!({"id": 1})));
    }

    #[test]
    fn test_comparison_operators() {
        let item = json!({"id": 1, "priority": 5, "title": "m"});
        assert!(check(json!({"priority": {"$gt": 3, "$lte": 5}}), item.clone()));
        assert!(!check(json!({"priority": {"$lt": 5}}), item.clone()));
        assert!(check(json!({"title": {"$gte": "a"}}), item.clone()));
        assert!(!check(json!({"missing": {"$gt": 0}}), item));
    }

    #[test]
    fn test_set_operators() {
        let item = json!({"id": 1, "tag": "idea", "labels": ["a", "b"]});
        assert!(check(json!({"tag": {"$in": ["idea", "todo"]}}), item.clone()));
        assert!(!check(json!({"tag": {"$nin": ["idea"]}}), item.clone()));
        assert!(check(json!({"labels": {"$in": ["b"]}}), item.clone()));
        assert!(check(json!({"tag": {"$ne": "todo"}}), item));
    }

    #[test]
    fn test_exists_and_nested_paths() {
        let item = json!({"id": 1, "author": {"name": "ada"}});
        assert!(check(json!({"author.name": "ada"}), item.clone()));
        assert!(check(json!({"author": {"$exists": true}}), item.clone()));
        assert!(check(json!({"editor": {"$exists": false}}), item));
    }

    #[test]
    fn test_combinators() {
        let item = json!({"id": 1, "tag": "idea", "done": false});
        assert!(check(
            json!({"$or": [{"tag": "todo"}, {"done": false}]}),
            item.clone()
        ));
        assert!(!check(
            json!({"$and": [{"tag": "idea"}, {"done": true}]}),
            item
        ));
    }

    #[test]
    fn test_paging_keys_ignored() {
        assert!(check(
            json!({"tag": "idea", "$limit": 10, "$skip": 20, "$sort": {"id": 1}}),
            json!({"id": 1, "tag": "idea"})
        ));
    }
}
