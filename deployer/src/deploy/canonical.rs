//! Structural comparison of container definitions
//!
//! Both sides are canonicalized first: attributes holding an empty list are
//! dropped and `environment` is stable-sorted by `name`. After that, key sets
//! must match exactly, nested mappings are compared recursively and every
//! other list is compared positionally.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde_json::{Map, Value};

const ENVIRONMENT_KEY: &str = "environment";

/// Canonical form of a list of container definitions
pub fn canonicalize(containers: &[Value]) -> Vec<Value> {
    containers.iter().map(canonicalize_container).collect()
}

fn canonicalize_container(container: &Value) -> Value {
    let Value::Object(attributes) = container else {
        return container.clone();
    };

    let mut canonical = Map::new();
    for (key, value) in attributes {
        match value {
            Value::Array(items) if items.is_empty() => continue,
            Value::Array(items) if key == ENVIRONMENT_KEY => {
                let mut sorted = items.clone();
                sorted.sort_by(compare_by_name);
                canonical.insert(key.clone(), Value::Array(sorted));
            }
            _ => {
                canonical.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(canonical)
}

fn compare_by_name(a: &Value, b: &Value) -> Ordering {
    let name = |v: &Value| v.get("name").and_then(Value::as_str).map(str::to_owned);
    name(a).cmp(&name(b))
}

/// True when both container lists are structurally equal after canonicalization
pub fn same_spec(a: &[Value], b: &[Value]) -> bool {
    let a = canonicalize(a);
    let b = canonicalize(b);
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(left, right)| match (left, right) {
            (Value::Object(left), Value::Object(right)) => same_mapping(left, right),
            _ => left == right,
        })
}

fn same_mapping(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    if a.len() != b.len() || a.keys().any(|k| !b.contains_key(k)) {
        return false;
    }
    a.iter().all(|(key, left)| match (left, b.get(key)) {
        (Value::Object(left), Some(Value::Object(right))) => same_mapping(left, right),
        (Value::Object(_), _) => false,
        (_, right) => Some(left) == right,
    })
}

/// Human readable differences between two container lists
///
/// One line per changed path, `-` for removed, `+` for added and `~` for a
/// changed value. Empty when the lists are equal after canonicalization.
pub fn diff(origin: &[Value], desired: &[Value]) -> Vec<String> {
    let origin = Value::Array(canonicalize(origin));
    let desired = Value::Array(canonicalize(desired));
    let mut lines = Vec::new();
    diff_value("", &origin, &desired, &mut lines);
    lines
}

fn diff_value(path: &str, origin: &Value, desired: &Value, lines: &mut Vec<String>) {
    match (origin, desired) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = format!("{}.{}", path, key);
                match (a.get(key), b.get(key)) {
                    (Some(left), Some(right)) => diff_value(&child, left, right, lines),
                    (Some(left), None) => lines.push(format!("- {}: {}", trim(&child), left)),
                    (None, Some(right)) => lines.push(format!("+ {}: {}", trim(&child), right)),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for index in 0..a.len().max(b.len()) {
                let child = format!("{}[{}]", path, index);
                match (a.get(index), b.get(index)) {
                    (Some(left), Some(right)) => diff_value(&child, left, right, lines),
                    (Some(left), None) => lines.push(format!("- {}: {}", trim(&child), left)),
                    (None, Some(right)) => lines.push(format!("+ {}: {}", trim(&child), right)),
                    (None, None) => {}
                }
            }
        }
        _ if origin != desired => {
            lines.push(format!("~ {}: {} -> {}", trim(path), origin, desired));
        }
        _ => {}
    }
}

fn trim(path: &str) -> &str {
    path.trim_start_matches('.')
}
