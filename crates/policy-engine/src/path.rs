//! Dotted-path access over a [`serde_json::Value`] graph.
//!
//! Paths are dot-separated field names, each optionally followed by one or
//! more `[index]` suffixes: `controls[0].controlId`, `matrix[1][2]`,
//! `metadata.labels.sensitivity`. The empty path denotes the root value.
//!
//! Reads never fail on missing data: a missing field, an index past the end,
//! or a field lookup on a non-object all resolve to `None`. Only malformed
//! path syntax is an error on the read side. Writes create intermediate
//! containers as needed and fail when asked to traverse through a scalar or
//! to write past the end of a list.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// Parsed paths kept per resolver. Further paths are parsed on every call.
const MAX_CACHED_PATHS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid path '{path}': {reason}")]
    Syntax { path: String, reason: String },

    #[error("index {index} is out of bounds for '{path}' (length {len})")]
    OutOfBounds { path: String, index: usize, len: usize },

    #[error("cannot traverse '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// Parse a path string into its segments.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, PathError> {
    let syntax = |reason: &str| PathError::Syntax {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    if path.is_empty() {
        return Ok(segments);
    }

    for (position, part) in path.split('.').enumerate() {
        let (name, mut rest) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };

        if name.contains(']') {
            return Err(syntax("unexpected ']'"));
        }
        if name.is_empty() {
            // A bare index is only allowed at the very start (root list).
            if position > 0 || rest.is_empty() {
                return Err(syntax("empty segment"));
            }
        } else {
            segments.push(Segment::Field(name.to_string()));
        }

        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(syntax("expected '[' after index"));
            }
            let close = rest.find(']').ok_or_else(|| syntax("unclosed '['"))?;
            let index = rest[1..close]
                .parse::<usize>()
                .map_err(|_| syntax("index must be a non-negative integer"))?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }

    Ok(segments)
}

/// Resolver with a cache of parsed paths. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct PathResolver {
    cache: DashMap<String, Arc<[Segment]>>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `path` against `root`. Returns `Ok(None)` when any segment is
    /// missing.
    pub fn resolve<'a>(&self, root: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
        let segments = self.segments(path)?;
        let mut current = root;
        for segment in segments.iter() {
            let next = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => lookup(map, name),
                (Segment::Index(index), Value::Array(items)) => items.get(*index),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Mutable counterpart of [`resolve`](Self::resolve).
    pub fn resolve_mut<'a>(
        &self,
        root: &'a mut Value,
        path: &str,
    ) -> Result<Option<&'a mut Value>, PathError> {
        let segments = self.segments(path)?;
        let mut current = root;
        for segment in segments.iter() {
            let next = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => match existing_key(map, name) {
                    Some(key) => map.get_mut(&key),
                    None => None,
                },
                (Segment::Index(index), Value::Array(items)) => items.get_mut(*index),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// True iff `path` resolves to a non-null value.
    pub fn exists(&self, root: &Value, path: &str) -> Result<bool, PathError> {
        Ok(self
            .resolve(root, path)?
            .is_some_and(|value| !value.is_null()))
    }

    /// Write `value` at `path`, creating intermediate objects (or lists, when
    /// the next segment is an index) for missing or null slots.
    ///
    /// Writing at index `len` appends; any larger index is
    /// [`PathError::OutOfBounds`].
    pub fn set(&self, root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
        let segments = self.segments(path)?;
        let Some((last, parents)) = segments.split_last() else {
            *root = value;
            return Ok(());
        };

        let mut current = root;
        for (position, segment) in parents.iter().enumerate() {
            current = child_or_insert(current, segment, &segments[position + 1], path)?;
        }
        write_slot(current, last, value, path)
    }

    /// Remove the value at `path`, returning it. Missing paths are `Ok(None)`.
    pub fn remove(&self, root: &mut Value, path: &str) -> Result<Option<Value>, PathError> {
        let segments = self.segments(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Ok(Some(std::mem::take(root)));
        };

        let mut current = root;
        for segment in parents {
            let next = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => match existing_key(map, name) {
                    Some(key) => map.get_mut(&key),
                    None => None,
                },
                (Segment::Index(index), Value::Array(items)) => items.get_mut(*index),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }

        Ok(match (last, current) {
            (Segment::Field(name), Value::Object(map)) => {
                existing_key(map, name).and_then(|key| map.remove(&key))
            }
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        })
    }

    fn segments(&self, path: &str) -> Result<Arc<[Segment]>, PathError> {
        if let Some(hit) = self.cache.get(path) {
            return Ok(Arc::clone(hit.value()));
        }
        let parsed: Arc<[Segment]> = parse_path(path)?.into();
        if self.cache.len() < MAX_CACHED_PATHS {
            self.cache.insert(path.to_string(), Arc::clone(&parsed));
        }
        Ok(parsed)
    }
}

/// Exact key first, then an ASCII case-insensitive match.
fn lookup<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

pub(crate) fn existing_key(map: &Map<String, Value>, name: &str) -> Option<String> {
    if map.contains_key(name) {
        return Some(name.to_string());
    }
    map.keys().find(|key| key.eq_ignore_ascii_case(name)).cloned()
}

fn container_for(segment: &Segment) -> Value {
    match segment {
        Segment::Field(_) => Value::Object(Map::new()),
        Segment::Index(_) => Value::Array(Vec::new()),
    }
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn child_or_insert<'a>(
    current: &'a mut Value,
    segment: &Segment,
    next: &Segment,
    path: &str,
) -> Result<&'a mut Value, PathError> {
    if current.is_null() {
        *current = container_for(segment);
    }
    let found = kind(current);
    let slot = match segment {
        Segment::Field(name) => {
            let Value::Object(map) = current else {
                return Err(mismatch(path, "object", found));
            };
            let key = existing_key(map, name).unwrap_or_else(|| name.clone());
            map.entry(key).or_insert(Value::Null)
        }
        Segment::Index(index) => {
            let Value::Array(items) = current else {
                return Err(mismatch(path, "array", found));
            };
            let len = items.len();
            if *index == len {
                items.push(Value::Null);
            }
            items.get_mut(*index).ok_or_else(|| PathError::OutOfBounds {
                path: path.to_string(),
                index: *index,
                len,
            })?
        }
    };
    if slot.is_null() {
        *slot = container_for(next);
    }
    Ok(slot)
}

fn write_slot(current: &mut Value, segment: &Segment, value: Value, path: &str) -> Result<(), PathError> {
    if current.is_null() {
        *current = container_for(segment);
    }
    let found = kind(current);
    match segment {
        Segment::Field(name) => {
            let Value::Object(map) = current else {
                return Err(mismatch(path, "object", found));
            };
            let key = existing_key(map, name).unwrap_or_else(|| name.clone());
            map.insert(key, value);
        }
        Segment::Index(index) => {
            let Value::Array(items) = current else {
                return Err(mismatch(path, "array", found));
            };
            let len = items.len();
            match (*index).cmp(&len) {
                std::cmp::Ordering::Less => items[*index] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    return Err(PathError::OutOfBounds {
                        path: path.to_string(),
                        index: *index,
                        len,
                    })
                }
            }
        }
    }
    Ok(())
}

fn mismatch(path: &str, expected: &'static str, found: &'static str) -> PathError {
    PathError::TypeMismatch {
        path: path.to_string(),
        expected,
        found,
    }
}
