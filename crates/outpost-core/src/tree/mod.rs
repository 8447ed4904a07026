//! Structural operations on configuration trees.
//!
//! Configuration is an untyped tree of objects, arrays and scalars,
//! represented as [`serde_json::Value`]. This module holds the merge and
//! reset primitives the configuration resolver builds on, plus RFC 6901
//! pointer helpers for navigating and mutating trees in place.

use serde_json::Value;
use tracing::{debug, error};

/// RFC 6901 pointer addressing the whole document.
pub const POINTER_WHOLE_DOC: &str = "";

/// Deep-merge `incoming` over `original`.
///
/// Objects merge key-wise recursively. Every other combination replaces
/// the slot entirely: lists are replaced wholesale, and an explicit null
/// is a legal value that replaces.
#[must_use]
pub fn deep_merge(original: &Value, incoming: &Value) -> Value {
    match (original, incoming) {
        (Value::Object(original_map), Value::Object(incoming_map)) => {
            let mut merged = original_map.clone();
            for (key, incoming_child) in incoming_map {
                match original_map.get(key) {
                    Some(original_child) => {
                        merged.insert(key.clone(), deep_merge(original_child, incoming_child));
                    },
                    None => {
                        merged.insert(key.clone(), incoming_child.clone());
                    },
                }
            }
            Value::Object(merged)
        },
        _ => incoming.clone(),
    }
}

/// Apply RESET pointers to `current`, pulling replacement values from
/// `defaults`.
///
/// Per pointer: the whole-document pointer replaces everything with the
/// defaults; a pointer whose parent is an array is disallowed and skipped;
/// a pointer whose parent is an object either restores the default subtree
/// (when the defaults carry a value at that pointer, including an explicit
/// null) or removes the key entirely (when they do not); a missing or
/// scalar parent is a no-op.
#[must_use]
pub fn reset_paths(mut current: Value, defaults: &Value, pointers: &[String]) -> Value {
    for pointer in pointers {
        if pointer == POINTER_WHOLE_DOC {
            // Whole-document reset supersedes any other pointer.
            return defaults.clone();
        }

        let Some((head, last)) = split_pointer(pointer) else {
            error!(pointer = %pointer, "ignoring malformed reset pointer");
            continue;
        };

        if matches!(resolve_pointer(&current, head), Some(Value::Array(_))) {
            error!(
                pointer = %pointer,
                "ignoring reset pointer addressing an array element"
            );
            continue;
        }

        let default_target = resolve_pointer(defaults, pointer).cloned();

        match resolve_pointer_mut(&mut current, head) {
            Some(Value::Object(parent)) => match default_target {
                Some(value) => {
                    parent.insert(last, value);
                },
                None => {
                    parent.remove(&last);
                },
            },
            Some(_) => {
                error!(
                    pointer = %pointer,
                    "reset pointer parent is not a container, skipping"
                );
            },
            None => {
                debug!(pointer = %pointer, "reset pointer parent missing, nothing to do");
            },
        }
    }

    current
}

/// Split a non-empty pointer into its parent pointer and the unescaped
/// final reference token. Returns `None` for malformed pointers.
#[must_use]
pub fn split_pointer(pointer: &str) -> Option<(&str, String)> {
    if pointer.is_empty() || !pointer.starts_with('/') {
        return None;
    }
    let idx = pointer.rfind('/')?;
    let head = &pointer[..idx];
    let last = unescape_token(&pointer[idx + 1..]);
    Some((head, last))
}

/// Coerce a tree value to its interpolation text: strings verbatim,
/// numbers and booleans via display, null as `null`, containers as
/// serialized JSON.
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        container => serde_json::to_string(container).unwrap_or_default(),
    }
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn resolve_pointer<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() {
        Some(value)
    } else {
        value.pointer(pointer)
    }
}

fn resolve_pointer_mut<'a>(value: &'a mut Value, pointer: &str) -> Option<&'a mut Value> {
    if pointer.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(pointer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deep_merge_objects_recursively() {
        let original = json!({"a": {"x": 1, "y": 2}, "keep": true});
        let incoming = json!({"a": {"y": 3, "z": 4}});
        let merged = deep_merge(&original, &incoming);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 4}, "keep": true}));
    }

    #[test]
    fn test_deep_merge_replaces_lists_wholesale() {
        let original = json!({"listKey": ["item1", "item2"]});
        let incoming = json!({"listKey": ["item3"]});
        assert_eq!(
            deep_merge(&original, &incoming),
            json!({"listKey": ["item3"]})
        );
    }

    #[test]
    fn test_deep_merge_explicit_null_replaces() {
        let original = json!({"a": {"x": 1}});
        let incoming = json!({"a": null});
        assert_eq!(deep_merge(&original, &incoming), json!({"a": null}));
    }

    #[test]
    fn test_deep_merge_scalar_to_container_and_back() {
        let original = json!({"a": 1});
        let incoming = json!({"a": {"nested": true}});
        assert_eq!(deep_merge(&original, &incoming), json!({"a": {"nested": true}}));
        assert_eq!(deep_merge(&incoming, &original), json!({"a": 1}));
    }

    #[test]
    fn test_reset_whole_document() {
        let current = json!({"anything": 1});
        let defaults = json!({"singleLevelKey": "default"});
        let result = reset_paths(current, &defaults, &[String::new()]);
        assert_eq!(result, defaults);
    }

    #[test]
    fn test_reset_restores_default_subtree() {
        let current = json!({"singleLevelKey": "changed", "other": 1});
        let defaults = json!({"singleLevelKey": "default value"});
        let result = reset_paths(current, &defaults, &["/singleLevelKey".to_string()]);
        assert_eq!(result, json!({"singleLevelKey": "default value", "other": 1}));
    }

    #[test]
    fn test_reset_removes_key_without_default() {
        let current = json!({"newSingleLevelKey": "v", "path": {"newLeafKey": "w", "leafKey": 1}});
        let defaults = json!({"path": {"leafKey": 0}});
        let result = reset_paths(
            current,
            &defaults,
            &["/newSingleLevelKey".to_string(), "/path/newLeafKey".to_string()],
        );
        assert_eq!(result, json!({"path": {"leafKey": 1}}));
    }

    #[test]
    fn test_reset_restores_explicit_null_default() {
        let current = json!({"key": "set"});
        let defaults = json!({"key": null});
        let result = reset_paths(current, &defaults, &["/key".to_string()]);
        assert_eq!(result, json!({"key": null}));
    }

    #[test]
    fn test_reset_array_element_is_ignored() {
        let current = json!({"listKey": ["item1", "item2"]});
        let defaults = json!({"listKey": ["a", "b"]});
        let result = reset_paths(current, &defaults, &["/listKey/0".to_string()]);
        assert_eq!(result, json!({"listKey": ["item1", "item2"]}));
    }

    #[test]
    fn test_reset_missing_parent_is_noop() {
        let current = json!({"a": 1});
        let defaults = json!({"deep": {"key": true}});
        let result = reset_paths(current.clone(), &defaults, &["/deep/key".to_string()]);
        assert_eq!(result, current);
    }

    #[test]
    fn test_split_pointer_unescapes_last_token() {
        let (head, last) = split_pointer("/a~1b/c~0d").unwrap();
        assert_eq!(head, "/a~1b");
        assert_eq!(last, "c~d");
        assert!(split_pointer("").is_none());
        assert!(split_pointer("no-slash").is_none());
    }

    #[test]
    fn test_value_text_coercions() {
        assert_eq!(value_text(&json!("plain")), "plain");
        assert_eq!(value_text(&json!(3)), "3");
        assert_eq!(value_text(&json!(true)), "true");
        assert_eq!(value_text(&json!(null)), "null");
        assert_eq!(value_text(&json!({"k": [1, 2]})), r#"{"k":[1,2]}"#);
    }
}
