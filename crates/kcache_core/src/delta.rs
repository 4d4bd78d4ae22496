//! JSON patch deltas between successive values of a key.
//!
//! Deltas are JSON patch documents (an array of `add`, `remove` and
//! `replace` operations addressed by JSON pointer). [`diff`] produces a patch
//! that [`apply`] turns the ancestor value into the new value.

use crate::error::{CacheError, CacheResult};
use kcache_storage::SegmentFile;
use serde_json::{Map, Value};

/// Computes a patch turning `source` into `target`.
#[must_use]
pub fn diff(source: &Value, target: &Value) -> Value {
    let mut ops = Vec::new();
    let mut path = String::new();
    diff_into(&mut path, source, target, &mut ops);
    Value::Array(ops)
}

fn diff_into(path: &mut String, source: &Value, target: &Value, ops: &mut Vec<Value>) {
    if source == target {
        return;
    }
    match (source, target) {
        (Value::Object(from), Value::Object(to)) => {
            for (key, from_value) in from {
                let len = path.len();
                push_token(path, key);
                match to.get(key) {
                    Some(to_value) => diff_into(path, from_value, to_value, ops),
                    None => ops.push(op("remove", path, None)),
                }
                path.truncate(len);
            }
            for (key, to_value) in to {
                if !from.contains_key(key) {
                    let len = path.len();
                    push_token(path, key);
                    ops.push(op("add", path, Some(to_value)));
                    path.truncate(len);
                }
            }
        }
        (Value::Array(from), Value::Array(to)) => {
            let common = from.len().min(to.len());
            for i in 0..common {
                let len = path.len();
                push_token(path, &i.to_string());
                diff_into(path, &from[i], &to[i], ops);
                path.truncate(len);
            }
            for (i, value) in to.iter().enumerate().skip(common) {
                let len = path.len();
                push_token(path, &i.to_string());
                ops.push(op("add", path, Some(value)));
                path.truncate(len);
            }
            for i in (common..from.len()).rev() {
                let len = path.len();
                push_token(path, &i.to_string());
                ops.push(op("remove", path, None));
                path.truncate(len);
            }
        }
        _ => ops.push(op("replace", path, Some(target))),
    }
}

fn push_token(path: &mut String, token: &str) {
    path.push('/');
    for c in token.chars() {
        match c {
            '~' => path.push_str("~0"),
            '/' => path.push_str("~1"),
            c => path.push(c),
        }
    }
}

fn op(name: &str, path: &str, value: Option<&Value>) -> Value {
    let mut map = Map::new();
    map.insert("op".into(), Value::String(name.into()));
    map.insert("path".into(), Value::String(path.into()));
    if let Some(value) = value {
        map.insert("value".into(), value.clone());
    }
    Value::Object(map)
}

/// Applies `patch` to `document` in place.
///
/// # Errors
///
/// Returns [`CacheError::InvalidPatch`] if the patch is malformed or
/// addresses a location that does not exist. The document may be partially
/// patched when an error is returned.
pub fn apply(document: &mut Value, patch: &Value) -> CacheResult<()> {
    let ops = patch
        .as_array()
        .ok_or_else(|| CacheError::invalid_patch("patch is not an array"))?;

    for operation in ops {
        let name = operation
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| CacheError::invalid_patch("operation without op"))?;
        let path = operation
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| CacheError::invalid_patch("operation without path"))?;
        let value = operation.get("value");

        match name {
            "add" => add(document, path, required(value, name)?.clone())?,
            "remove" => {
                remove(document, path)?;
            }
            "replace" => {
                remove(document, path)?;
                add(document, path, required(value, name)?.clone())?;
            }
            "test" => {
                let actual = document
                    .pointer(path)
                    .ok_or_else(|| missing(path))?;
                if actual != required(value, name)? {
                    return Err(CacheError::invalid_patch(format!("test failed at {path}")));
                }
            }
            other => {
                return Err(CacheError::invalid_patch(format!(
                    "unsupported operation {other}"
                )))
            }
        }
    }
    Ok(())
}

/// Parses both values as JSON and returns the serialized patch between them.
///
/// # Errors
///
/// Returns [`CacheError::Json`] if either value is not JSON.
pub fn diff_bytes(ancestor: &[u8], value: &[u8]) -> CacheResult<Vec<u8>> {
    let source: Value = serde_json::from_slice(ancestor)?;
    let target: Value = serde_json::from_slice(value)?;
    Ok(serde_json::to_vec(&diff(&source, &target))?)
}

/// Applies a serialized patch to a serialized ancestor value.
///
/// # Errors
///
/// Returns an error if either input is not JSON or the patch does not apply.
pub fn apply_bytes(ancestor: &[u8], patch: &[u8]) -> CacheResult<Vec<u8>> {
    let mut document: Value = serde_json::from_slice(ancestor)?;
    let patch: Value = serde_json::from_slice(patch)?;
    apply(&mut document, &patch)?;
    Ok(serde_json::to_vec(&document)?)
}

/// Reads the delta record (`i32` length and patch) at `position` of a delta
/// file. Returns `None` if no complete record is there.
#[must_use]
pub fn read_delta_record(file: &SegmentFile, position: u32) -> Option<Vec<u8>> {
    file.read_bytes(position, |bytes| {
        let len = i32::from_be_bytes(bytes.get(..4)?.try_into().ok()?);
        let end = 4 + usize::try_from(len).ok()?;
        bytes.get(..end).map(<[u8]>::to_vec)
    })
}

fn required<'a>(value: Option<&'a Value>, name: &str) -> CacheResult<&'a Value> {
    value.ok_or_else(|| CacheError::invalid_patch(format!("{name} without value")))
}

fn missing(path: &str) -> CacheError {
    CacheError::invalid_patch(format!("no value at {path}"))
}

fn split(path: &str) -> CacheResult<(&str, String)> {
    let at = path
        .rfind('/')
        .ok_or_else(|| CacheError::invalid_patch(format!("invalid pointer {path}")))?;
    let token = path[at + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..at], token))
}

fn add(document: &mut Value, path: &str, value: Value) -> CacheResult<()> {
    if path.is_empty() {
        *document = value;
        return Ok(());
    }
    let (parent, token) = split(path)?;
    match document.pointer_mut(parent).ok_or_else(|| missing(parent))? {
        Value::Object(map) => {
            map.insert(token, value);
        }
        Value::Array(items) => {
            let index = if token == "-" {
                items.len()
            } else {
                token
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i <= items.len())
                    .ok_or_else(|| missing(path))?
            };
            items.insert(index, value);
        }
        _ => return Err(missing(path)),
    }
    Ok(())
}

fn remove(document: &mut Value, path: &str) -> CacheResult<Value> {
    if path.is_empty() {
        return Ok(std::mem::take(document));
    }
    let (parent, token) = split(path)?;
    match document.pointer_mut(parent).ok_or_else(|| missing(parent))? {
        Value::Object(map) => map.remove(&token).ok_or_else(|| missing(path)),
        Value::Array(items) => {
            let index = token
                .parse::<usize>()
                .ok()
                .filter(|i| *i < items.len())
                .ok_or_else(|| missing(path))?;
            Ok(items.remove(index))
        }
        _ => Err(missing(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z~/]{0,3}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
                prop::collection::btree_map("[ab0~/]{0,2}", inner, 0..4)
                    .prop_map(|members| Value::Object(members.into_iter().collect())),
            ]
        })
    }

    fn roundtrip(source: Value, target: Value) {
        let patch = diff(&source, &target);
        let mut patched = source.clone();
        apply(&mut patched, &patch).unwrap();
        assert_eq!(patched, target, "patch {patch}");
    }

    #[test]
    fn replaces_scalar_member() {
        let patch = diff(&json!({"a": 1}), &json!({"a": 2}));
        assert_eq!(patch, json!([{"op": "replace", "path": "/a", "value": 2}]));
    }

    #[test]
    fn identical_values_give_empty_patch() {
        assert_eq!(diff(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})), json!([]));
    }

    #[test]
    fn nested_objects_and_arrays() {
        roundtrip(
            json!({"a": {"b": [1, 2, 3], "c": "x"}, "d": true}),
            json!({"a": {"b": [1, 5], "e": null}, "f": {"g": 1}}),
        );
        roundtrip(json!([1]), json!([1, {"k": [2]}, 3]));
        roundtrip(json!({"a": 1}), json!([1]));
    }

    #[test]
    fn escapes_pointer_tokens() {
        let patch = diff(&json!({}), &json!({"a/b": 1, "c~d": 2}));
        let paths: Vec<_> = patch
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect();
        assert!(paths.contains(&"/a~1b".to_string()));
        assert!(paths.contains(&"/c~0d".to_string()));
        roundtrip(json!({"a/b": 0}), json!({"a/b": 1, "c~d": 2}));
    }

    #[test]
    fn array_operations() {
        let mut doc = json!({"xs": [1, 2]});
        let patch = json!([
            {"op": "add", "path": "/xs/-", "value": 3},
            {"op": "add", "path": "/xs/0", "value": 0},
            {"op": "replace", "path": "/xs/2", "value": 9},
            {"op": "remove", "path": "/xs/1"},
        ]);
        apply(&mut doc, &patch).unwrap();
        assert_eq!(doc, json!({"xs": [0, 9, 3]}));

        assert!(apply(&mut doc, &json!([{"op": "add", "path": "/xs/5", "value": 1}])).is_err());
        assert!(apply(&mut doc, &json!([{"op": "remove", "path": "/xs/x"}])).is_err());

        let shrink = diff(&json!([1, 2, 3, 4]), &json!([1]));
        assert_eq!(
            shrink,
            json!([
                {"op": "remove", "path": "/3"},
                {"op": "remove", "path": "/2"},
                {"op": "remove", "path": "/1"},
            ])
        );
    }

    #[test]
    fn replaces_whole_document() {
        roundtrip(json!({"a": 1}), json!("scalar"));
        roundtrip(json!({"": {"": 1}}), json!({"": {"": 2, "/": 3}}));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn diff_then_apply_reaches_target(source in json_value(), target in json_value()) {
            let patch = diff(&source, &target);
            let mut patched = source.clone();
            apply(&mut patched, &patch).unwrap();
            prop_assert_eq!(patched, target);
        }
    }

    #[test]
    fn bytes_roundtrip() {
        let patch = diff_bytes(br#"{"a":1}"#, br#"{"a":2}"#).unwrap();
        let value = apply_bytes(br#"{"a":1}"#, &patch).unwrap();
        assert_eq!(value, br#"{"a":2}"#);
    }

    #[test]
    fn apply_rejects_bad_patches() {
        let mut doc = json!({"a": 1});
        assert!(apply(&mut doc, &json!({"op": "add"})).is_err());
        assert!(apply(&mut doc, &json!([{"op": "remove", "path": "/b"}])).is_err());
        assert!(apply(&mut doc, &json!([{"op": "move", "path": "/a"}])).is_err());
        assert!(apply(&mut doc, &json!([{"op": "test", "path": "/a", "value": 2}])).is_err());
    }

    #[test]
    fn reads_delta_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.delta"), 64).unwrap();
        file.append_int(2);
        file.append_bytes(b"[]");
        file.append_int(10);

        assert_eq!(read_delta_record(&file, 0).unwrap(), b"\0\0\0\x02[]");
        assert!(read_delta_record(&file, 6).is_none());
        assert!(read_delta_record(&file, 40).is_none());
    }

    #[test]
    fn diff_of_non_json_fails() {
        assert!(matches!(
            diff_bytes(b"not json", b"{}"),
            Err(CacheError::Json(_))
        ));
    }
}
