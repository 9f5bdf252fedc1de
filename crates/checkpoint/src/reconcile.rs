//! Structural reconciliation of restored data against a target tree
//!
//! The walk is depth-first and stops at the first mismatch. Composite nodes
//! must have exactly the target's key set; leaves are coerced to the kind,
//! dtype and shape of the target leaf. The target's leaf values are never
//! read.

use checkpoint_core::{element_count, join_path, ArrayLeaf, SchemaError, Tree};
use std::collections::BTreeMap;

use crate::codec::StoredNode;

type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// Reshape `data` after `target`, failing on the first mismatch
pub(crate) fn reconcile(data: StoredNode, target: &Tree, path: &str) -> SchemaResult<StoredNode> {
    match target {
        Tree::Map(fields) => {
            let mut children = into_children(data, target, path)?;
            check_key_set(fields.keys().map(String::as_str), &children, path)?;
            let mut out = BTreeMap::new();
            for (key, sub_target) in fields {
                // Present: the key sets were just checked to be equal
                if let Some(child) = children.remove(key) {
                    let child_path = join_path(path, key);
                    out.insert(key.clone(), reconcile(child, sub_target, &child_path)?);
                }
            }
            Ok(StoredNode::Map(out))
        }
        Tree::Seq(items) => {
            let mut children = into_children(data, target, path)?;
            let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
            check_key_set(keys.iter().map(String::as_str), &children, path)?;
            let mut out = Vec::with_capacity(items.len());
            for (key, sub_target) in keys.iter().zip(items) {
                if let Some(child) = children.remove(key) {
                    let child_path = join_path(path, key);
                    out.push(reconcile(child, sub_target, &child_path)?);
                }
            }
            Ok(StoredNode::Seq(out))
        }
        leaf => coerce_leaf(data, leaf, path),
    }
}

/// Children of a composite data node keyed by name; sequences use indices
fn into_children(
    data: StoredNode,
    target: &Tree,
    path: &str,
) -> SchemaResult<BTreeMap<String, StoredNode>> {
    match data {
        StoredNode::Map(m) => Ok(m),
        StoredNode::Seq(s) => Ok(s
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect()),
        other => Err(type_mismatch(path, target, &other)),
    }
}

fn check_key_set<'a>(
    target_keys: impl Iterator<Item = &'a str> + Clone,
    children: &BTreeMap<String, StoredNode>,
    path: &str,
) -> SchemaResult<()> {
    for key in target_keys.clone() {
        if !children.contains_key(key) {
            return Err(SchemaError::MissingField {
                path: join_path(path, key),
            });
        }
    }
    let expected: Vec<&str> = target_keys.collect();
    for key in children.keys() {
        if !expected.contains(&key.as_str()) {
            return Err(SchemaError::UnknownField {
                path: join_path(path, key),
            });
        }
    }
    Ok(())
}

fn coerce_leaf(data: StoredNode, target: &Tree, path: &str) -> SchemaResult<StoredNode> {
    match (target, data) {
        (Tree::Array(t), StoredNode::Array(a)) => coerce_array(a, t, path).map(StoredNode::Array),
        (Tree::Array(t), StoredNode::Scalar(s)) if t.len() == 1 => {
            ArrayLeaf::from_scalars(t.dtype(), t.shape().to_vec(), [s])
                .map(StoredNode::Array)
                .map_err(|e| leaf_mismatch(path, e.to_string()))
        }
        (Tree::Scalar(t), StoredNode::Scalar(s)) => Ok(StoredNode::Scalar(s.cast_like(*t))),
        (Tree::Scalar(t), StoredNode::Array(a)) if a.len() == 1 => {
            let value = a
                .element(0)
                .ok_or_else(|| leaf_mismatch(path, "empty array".to_string()))?;
            Ok(StoredNode::Scalar(value.cast_like(*t)))
        }
        (Tree::String(_), StoredNode::String(s)) => Ok(StoredNode::String(s)),
        (Tree::Sharded(t), StoredNode::ShardRef(mut r)) => {
            if element_count(&r.shape) != Some(t.array.len()) {
                return Err(leaf_mismatch(
                    path,
                    format!("expected shape {:?}, found {:?}", t.array.shape(), r.shape),
                ));
            }
            r.mesh = t.mesh.clone();
            r.dtype = t.array.dtype();
            r.shape = t.array.shape().to_vec();
            Ok(StoredNode::ShardRef(r))
        }
        (target, other) => Err(type_mismatch(path, target, &other)),
    }
}

fn coerce_array(data: ArrayLeaf, target: &ArrayLeaf, path: &str) -> SchemaResult<ArrayLeaf> {
    if data.len() != target.len() {
        return Err(leaf_mismatch(
            path,
            format!("expected shape {:?}, found {:?}", target.shape(), data.shape()),
        ));
    }
    let cast = data.cast(target.dtype());
    if cast.shape() == target.shape() {
        return Ok(cast);
    }
    cast.reshape(target.shape().to_vec())
        .map_err(|e| leaf_mismatch(path, e.to_string()))
}

fn type_mismatch(path: &str, target: &Tree, found: &StoredNode) -> SchemaError {
    SchemaError::TypeMismatch {
        path: display_path(path),
        expected: target.kind().to_string(),
        found: found.kind().to_string(),
    }
}

fn leaf_mismatch(path: &str, reason: String) -> SchemaError {
    SchemaError::LeafMismatch {
        path: display_path(path),
        reason,
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
