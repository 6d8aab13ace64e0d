use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::path::{existing_key, kind, PathError, PathResolver};
use crate::schema::{MutationOp, PolicyMutation};

/// Mutation paths with this prefix address the resource's label map. The
/// remainder is the label key verbatim, dots included.
pub const LABELS_PREFIX: &str = "metadata.labels.";

const LABELS_PATH: &str = "metadata.labels";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("cannot add to '{path}': expected a list, found {found}")]
    NotAList { path: String, found: &'static str },

    #[error("'{op}' is not supported on label path '{path}'")]
    UnsupportedTarget { op: &'static str, path: String },

    #[error("label map at 'metadata.labels' is not an object (found {found})")]
    LabelsNotAMap { found: &'static str },
}

/// Applies field-level mutations to a resource in place.
///
/// Mutations are not transactional: when one fails, those before it stay
/// applied.
#[derive(Debug, Default)]
pub struct MutationApplier {
    paths: Arc<PathResolver>,
}

impl MutationApplier {
    pub fn new(paths: Arc<PathResolver>) -> Self {
        Self { paths }
    }

    pub fn apply(&self, mutations: &[PolicyMutation], resource: &mut Value) -> Result<(), MutationError> {
        for mutation in mutations {
            self.apply_one(mutation, resource)?;
        }
        Ok(())
    }

    fn apply_one(&self, mutation: &PolicyMutation, resource: &mut Value) -> Result<(), MutationError> {
        let label_key = mutation.path.strip_prefix(LABELS_PREFIX);
        debug!(op = ?mutation.op, path = %mutation.path, "applying mutation");

        match (mutation.op, label_key) {
            (MutationOp::Set, Some(key)) => {
                labels_mut(resource)?.insert(key.to_string(), Value::String(label_text(&mutation.value)));
            }
            (MutationOp::Set, None) => {
                self.paths.set(resource, &mutation.path, mutation.value.clone())?;
            }
            (MutationOp::Remove, Some(key)) => {
                if let Some(labels) = existing_labels(resource) {
                    labels.remove(key);
                }
            }
            (MutationOp::Remove, None) => {
                self.paths.remove(resource, &mutation.path)?;
            }
            (MutationOp::Add, Some(_)) => {
                return Err(MutationError::UnsupportedTarget {
                    op: "add",
                    path: mutation.path.clone(),
                });
            }
            (MutationOp::Add, None) => self.append(resource, mutation)?,
            (MutationOp::Unknown, _) => {
                warn!(path = %mutation.path, "unknown mutation operation; skipping");
            }
        }
        Ok(())
    }

    fn append(&self, resource: &mut Value, mutation: &PolicyMutation) -> Result<(), MutationError> {
        match self.paths.resolve_mut(resource, &mutation.path)? {
            Some(Value::Array(items)) => items.push(mutation.value.clone()),
            None | Some(Value::Null) => {
                self.paths
                    .set(resource, &mutation.path, Value::Array(vec![mutation.value.clone()]))?;
            }
            Some(other) => {
                return Err(MutationError::NotAList {
                    path: mutation.path.clone(),
                    found: kind(other),
                });
            }
        }
        Ok(())
    }
}

/// The label map, created when missing.
fn labels_mut(resource: &mut Value) -> Result<&mut Map<String, Value>, MutationError> {
    if resource.is_null() {
        *resource = Value::Object(Map::new());
    }
    let found = kind(resource);
    let Value::Object(root) = resource else {
        return Err(MutationError::Path(PathError::TypeMismatch {
            path: LABELS_PATH.to_string(),
            expected: "object",
            found,
        }));
    };

    let metadata = child_or_insert(root, "metadata");
    let found = kind(metadata);
    let Value::Object(metadata) = metadata else {
        return Err(MutationError::Path(PathError::TypeMismatch {
            path: LABELS_PATH.to_string(),
            expected: "object",
            found,
        }));
    };

    let labels = child_or_insert(metadata, "labels");
    let found = kind(labels);
    match labels {
        Value::Object(map) => Ok(map),
        _ => Err(MutationError::LabelsNotAMap { found }),
    }
}

/// The label map if one is already present. Never creates anything.
fn existing_labels(resource: &mut Value) -> Option<&mut Map<String, Value>> {
    let Value::Object(root) = resource else {
        return None;
    };
    let key = existing_key(root, "metadata")?;
    let Some(Value::Object(metadata)) = root.get_mut(&key) else {
        return None;
    };
    let key = existing_key(metadata, "labels")?;
    match metadata.get_mut(&key) {
        Some(Value::Object(labels)) => Some(labels),
        _ => None,
    }
}

/// Field `name` under the resolver's key matching, replacing a `null` or
/// missing value with an empty map.
fn child_or_insert<'a>(map: &'a mut Map<String, Value>, name: &str) -> &'a mut Value {
    let key = existing_key(map, name).unwrap_or_else(|| name.to_string());
    let child = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
    if child.is_null() {
        *child = Value::Object(Map::new());
    }
    child
}

/// Labels are strings: strings verbatim, `null` empty, anything else as JSON.
fn label_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
