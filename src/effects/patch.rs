use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("bad JSON pointer '{0}'")]
    BadPointer(String),

    #[error("path '{0}' does not exist")]
    PathNotFound(String),

    #[error("index '{index}' is out of bounds at '{path}'")]
    IndexOutOfBounds { path: String, index: String },

    #[error("test failed at '{path}': expected {expected}, found {found}")]
    TestFailed {
        path: String,
        expected: Value,
        found: Value,
    },

    #[error("cannot move '{from}' into its own child '{path}'")]
    MoveIntoSelf { from: String, path: String },
}

type PatchResult<T> = Result<T, PatchError>;

/// One RFC 6902 operation. `value` doubles as the JSONLogic slot when the
/// effect executor materializes ops against a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. }
            | PatchOp::Move { path, .. }
            | PatchOp::Copy { path, .. }
            | PatchOp::Test { path, .. } => path,
        }
    }
}

/// Applies the operations in order to `target`, mutating it. The caller is
/// expected to work on a copy; a failed op leaves `target` partially
/// patched.
pub fn apply_patch(target: &mut Value, ops: &[PatchOp]) -> PatchResult<()> {
    for op in ops {
        apply_one(target, op)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, op: &PatchOp) -> PatchResult<()> {
    match op {
        PatchOp::Add { path, value } => add(target, path, value.clone()),
        PatchOp::Remove { path } => remove(target, path).map(|_| ()),
        PatchOp::Replace { path, value } => {
            let slot = resolve_mut(target, path)?;
            *slot = value.clone();
            Ok(())
        }
        PatchOp::Move { from, path } => {
            if path.starts_with(from.as_str())
                && path.as_bytes().get(from.len()) == Some(&b'/')
            {
                return Err(PatchError::MoveIntoSelf {
                    from: from.clone(),
                    path: path.clone(),
                });
            }
            let taken = remove(target, from)?;
            add(target, path, taken)
        }
        PatchOp::Copy { from, path } => {
            let copied = resolve(target, from)?.clone();
            add(target, path, copied)
        }
        PatchOp::Test { path, value } => {
            let found = resolve(target, path)?;
            if found != value {
                return Err(PatchError::TestFailed {
                    path: path.clone(),
                    expected: value.clone(),
                    found: found.clone(),
                });
            }
            Ok(())
        }
    }
}

fn split_pointer(path: &str) -> PatchResult<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(PatchError::BadPointer(path.to_string()));
    }
    Ok(path[1..]
        .split('/')
        .map(|part| part.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn resolve<'a>(target: &'a Value, path: &str) -> PatchResult<&'a Value> {
    let mut current = target;
    for part in split_pointer(path)? {
        current = step(current, &part, path)?;
    }
    Ok(current)
}

fn resolve_mut<'a>(target: &'a mut Value, path: &str) -> PatchResult<&'a mut Value> {
    let mut current = target;
    for part in split_pointer(path)? {
        current = match current {
            Value::Object(map) => map
                .get_mut(&part)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = array_index(&part, items.len(), false, path)?;
                &mut items[index]
            }
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }
    Ok(current)
}

fn step<'a>(current: &'a Value, part: &str, path: &str) -> PatchResult<&'a Value> {
    match current {
        Value::Object(map) => map
            .get(part)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let index = array_index(part, items.len(), false, path)?;
            Ok(&items[index])
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

fn array_index(part: &str, len: usize, allow_end: bool, path: &str) -> PatchResult<usize> {
    if part == "-" {
        if allow_end {
            return Ok(len);
        }
        return Err(PatchError::IndexOutOfBounds {
            path: path.to_string(),
            index: part.to_string(),
        });
    }
    let index: usize = part.parse().map_err(|_| PatchError::IndexOutOfBounds {
        path: path.to_string(),
        index: part.to_string(),
    })?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if len == 0 && !allow_end || index > limit {
        return Err(PatchError::IndexOutOfBounds {
            path: path.to_string(),
            index: part.to_string(),
        });
    }
    Ok(index)
}

fn add(target: &mut Value, path: &str, value: Value) -> PatchResult<()> {
    let parts = split_pointer(path)?;
    let Some((last, parents)) = parts.split_last() else {
        // whole-document replacement
        *target = value;
        return Ok(());
    };

    let mut current = target;
    for part in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(part)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = array_index(part, items.len(), false, path)?;
                &mut items[index]
            }
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, items.len(), true, path)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

fn remove(target: &mut Value, path: &str) -> PatchResult<Value> {
    let parts = split_pointer(path)?;
    let Some((last, parents)) = parts.split_last() else {
        return Err(PatchError::BadPointer(path.to_string()));
    };

    let mut current = target;
    for part in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(part)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = array_index(part, items.len(), false, path)?;
                &mut items[index]
            }
            _ => return Err(PatchError::PathNotFound(path.to_string())),
        };
    }

    match current {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false, path)?;
            Ok(items.remove(index))
        }
        _ => Err(PatchError::PathNotFound(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "name": "Sandpoint",
            "level": 3,
            "variables": {"morale": 5},
            "tags": ["coastal", "small"],
        })
    }

    fn parse_ops(raw: Value) -> Vec<PatchOp> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn ops_deserialize_from_rfc6902_json() {
        let ops = parse_ops(json!([
            {"op": "replace", "path": "/level", "value": 4},
            {"op": "add", "path": "/variables/festival", "value": true},
            {"op": "remove", "path": "/tags/0"},
        ]));
        let mut target = doc();
        apply_patch(&mut target, &ops).unwrap();
        assert_eq!(target["level"], json!(4));
        assert_eq!(target["variables"]["festival"], json!(true));
        assert_eq!(target["tags"], json!(["small"]));
    }

    #[test]
    fn add_appends_to_arrays_with_dash() {
        let mut target = doc();
        let ops = parse_ops(json!([{"op": "add", "path": "/tags/-", "value": "fortified"}]));
        apply_patch(&mut target, &ops).unwrap();
        assert_eq!(target["tags"], json!(["coastal", "small", "fortified"]));
    }

    #[test]
    fn move_and_copy_relocate_values() {
        let mut target = doc();
        let ops = parse_ops(json!([
            {"op": "copy", "from": "/variables/morale", "path": "/variables/moraleBackup"},
            {"op": "move", "from": "/level", "path": "/variables/level"},
        ]));
        apply_patch(&mut target, &ops).unwrap();
        assert_eq!(target["variables"]["moraleBackup"], json!(5));
        assert_eq!(target["variables"]["level"], json!(3));
        assert!(target.get("level").is_none());
    }

    #[test]
    fn test_op_guards_the_rest_of_the_patch() {
        let mut target = doc();
        let ops = parse_ops(json!([
            {"op": "test", "path": "/level", "value": 99},
            {"op": "replace", "path": "/level", "value": 4},
        ]));
        let err = apply_patch(&mut target, &ops).unwrap_err();
        assert!(matches!(err, PatchError::TestFailed { .. }));
    }

    #[test]
    fn escaped_pointer_tokens_resolve() {
        let mut target = json!({"a/b": 1, "c~d": 2});
        let ops = parse_ops(json!([
            {"op": "replace", "path": "/a~1b", "value": 10},
            {"op": "replace", "path": "/c~0d", "value": 20},
        ]));
        apply_patch(&mut target, &ops).unwrap();
        assert_eq!(target, json!({"a/b": 10, "c~d": 20}));
    }

    #[test]
    fn missing_paths_and_bad_indices_fail() {
        let mut target = doc();
        assert!(matches!(
            apply_patch(&mut target, &parse_ops(json!([{"op": "remove", "path": "/absent"}]))),
            Err(PatchError::PathNotFound(_))
        ));
        assert!(matches!(
            apply_patch(&mut target, &parse_ops(json!([{"op": "replace", "path": "/tags/9", "value": 1}]))),
            Err(PatchError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            apply_patch(&mut target, &parse_ops(json!([{"op": "add", "path": "no-slash", "value": 1}]))),
            Err(PatchError::BadPointer(_))
        ));
    }

    #[test]
    fn moving_a_branch_into_itself_is_rejected() {
        let mut target = json!({"a": {"b": 1}});
        let ops = vec![PatchOp::Move {
            from: "/a".to_string(),
            path: "/a/b".to_string(),
        }];
        assert!(matches!(
            apply_patch(&mut target, &ops),
            Err(PatchError::MoveIntoSelf { .. })
        ));
    }
}
