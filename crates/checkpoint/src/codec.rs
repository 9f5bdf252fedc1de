//! Tree serialization
//!
//! Trees are encoded with `bincode` as a tagged [`StoredNode`], so every
//! composite node records whether it is a mapping or a sequence and an
//! untyped restore gives back exactly the shape that was saved. Sharded
//! leaves are not encoded inline: their arrays go through a
//! [`ShardTransport`] and the payload keeps a [`ShardRef`] in their place.
//!
//! Shard keys are `<shard_dir>/<n>`, where `n` is the leaf's position in a
//! depth-first walk. Tree keys never reach the storage path.

use bytes::Bytes;
use checkpoint_core::{
    join_path, ArrayLeaf, DType, Error, MeshSpec, Result, Scalar, ShardedArray, Tree,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::reconcile::reconcile;
use crate::transport::ShardTransport;

/// On-disk form of a tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum StoredNode {
    Array(ArrayLeaf),
    Scalar(Scalar),
    String(String),
    ShardRef(ShardRef),
    Map(BTreeMap<String, StoredNode>),
    Seq(Vec<StoredNode>),
}

impl StoredNode {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            StoredNode::Array(_) => "array",
            StoredNode::Scalar(_) => "scalar",
            StoredNode::String(_) => "string",
            StoredNode::ShardRef(_) => "sharded",
            StoredNode::Map(_) => "map",
            StoredNode::Seq(_) => "seq",
        }
    }
}

/// Pointer to a sharded leaf held by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ShardRef {
    /// Transport key
    pub key: String,
    /// Dotted tree path, for messages only
    pub path: String,
    pub mesh: MeshSpec,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

/// Encode a tree that has no sharded leaves
pub fn serialize(tree: &Tree) -> Result<Bytes> {
    let mut shards = Vec::new();
    let stored = to_stored(tree, "", "", &mut shards);
    if let Some((r, _)) = shards.first() {
        return Err(needs_transport(&r.path));
    }
    Ok(Bytes::from(bincode::serialize(&stored)?))
}

/// Decode a payload, reconciling it against `target` when given
pub fn deserialize(bytes: &[u8], target: Option<&Tree>) -> Result<Tree> {
    let stored = decode_and_reconcile(bytes, target)?;
    materialize(stored, &mut std::iter::empty::<ArrayLeaf>())
}

/// Serializer that routes sharded leaves through a transport
#[derive(Clone)]
pub struct TreeCodec {
    transport: Option<Arc<dyn ShardTransport>>,
}

impl TreeCodec {
    /// Codec for trees without sharded leaves
    pub fn inline() -> Self {
        Self { transport: None }
    }

    /// Codec that writes and reads sharded leaves through `transport`
    pub fn with_transport(transport: Arc<dyn ShardTransport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn transport(&self) -> Option<&Arc<dyn ShardTransport>> {
        self.transport.as_ref()
    }

    /// Encode `tree`, writing its sharded leaves under `shard_dir`
    #[instrument(skip(self, tree), fields(leaves = tree.leaf_count()))]
    pub async fn serialize(&self, tree: &Tree, shard_dir: &str) -> Result<Bytes> {
        let mut shards = Vec::new();
        let stored = to_stored(tree, "", shard_dir, &mut shards);

        if !shards.is_empty() {
            let transport = self.require_transport(&shards[0].0.path)?;
            for (r, sharded) in &shards {
                transport.write_shard(&sharded.array, &r.key).await?;
            }
            debug!(count = shards.len(), shard_dir, "Sharded leaves written");
        }

        Ok(Bytes::from(bincode::serialize(&stored)?))
    }

    /// Decode a payload, fetching sharded leaves from the transport
    #[instrument(skip(self, bytes, target), fields(bytes = bytes.len(), typed = target.is_some()))]
    pub async fn deserialize(&self, bytes: &[u8], target: Option<&Tree>) -> Result<Tree> {
        let stored = decode_and_reconcile(bytes, target)?;

        let mut refs = Vec::new();
        collect_refs(&stored, &mut refs);
        let mut arrays = Vec::with_capacity(refs.len());
        if !refs.is_empty() {
            let transport = self.require_transport(&refs[0].path)?;
            for r in &refs {
                let array = transport.read_shard(&r.key, &r.mesh).await?;
                arrays.push(fit_array(array, r)?);
            }
            debug!(count = arrays.len(), "Sharded leaves read");
        }

        materialize(stored, &mut arrays.into_iter())
    }

    fn require_transport(&self, path: &str) -> Result<&Arc<dyn ShardTransport>> {
        self.transport.as_ref().ok_or_else(|| needs_transport(path))
    }
}

fn needs_transport(path: &str) -> Error {
    Error::Transport {
        message: format!(
            "sharded leaf {} needs a shard transport",
            if path.is_empty() { "<root>" } else { path }
        ),
    }
}

impl std::fmt::Debug for TreeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCodec")
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

fn to_stored<'a>(
    tree: &'a Tree,
    path: &str,
    shard_dir: &str,
    shards: &mut Vec<(ShardRef, &'a ShardedArray)>,
) -> StoredNode {
    match tree {
        Tree::Array(a) => StoredNode::Array(a.clone()),
        Tree::Scalar(s) => StoredNode::Scalar(*s),
        Tree::String(s) => StoredNode::String(s.clone()),
        Tree::Sharded(sharded) => {
            let r = ShardRef {
                key: format!("{}/{}", shard_dir, shards.len()),
                path: path.to_string(),
                mesh: sharded.mesh.clone(),
                dtype: sharded.array.dtype(),
                shape: sharded.array.shape().to_vec(),
            };
            shards.push((r.clone(), sharded));
            StoredNode::ShardRef(r)
        }
        Tree::Map(m) => StoredNode::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), to_stored(v, &join_path(path, k), shard_dir, shards)))
                .collect(),
        ),
        Tree::Seq(s) => StoredNode::Seq(
            s.iter()
                .enumerate()
                .map(|(i, v)| to_stored(v, &join_path(path, &i.to_string()), shard_dir, shards))
                .collect(),
        ),
    }
}

fn decode_and_reconcile(bytes: &[u8], target: Option<&Tree>) -> Result<StoredNode> {
    let stored: StoredNode = bincode::deserialize(bytes)?;
    match target {
        Some(target) => Ok(reconcile(stored, target, "")?),
        None => Ok(stored),
    }
}

fn collect_refs<'a>(node: &'a StoredNode, out: &mut Vec<&'a ShardRef>) {
    match node {
        StoredNode::ShardRef(r) => out.push(r),
        StoredNode::Map(m) => m.values().for_each(|v| collect_refs(v, out)),
        StoredNode::Seq(s) => s.iter().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// Bring a fetched shard to the dtype and shape its reference asks for
fn fit_array(array: ArrayLeaf, r: &ShardRef) -> Result<ArrayLeaf> {
    let array = array.cast(r.dtype);
    if array.shape() == r.shape.as_slice() {
        Ok(array)
    } else {
        array.reshape(r.shape.clone())
    }
}

/// Turn a stored node back into a tree; `arrays` yields fetched shards in
/// the same depth-first order `collect_refs` visits them
fn materialize(node: StoredNode, arrays: &mut impl Iterator<Item = ArrayLeaf>) -> Result<Tree> {
    Ok(match node {
        StoredNode::Array(a) => Tree::Array(a),
        StoredNode::Scalar(s) => Tree::Scalar(s),
        StoredNode::String(s) => Tree::String(s),
        StoredNode::ShardRef(r) => {
            let array = arrays.next().ok_or_else(|| needs_transport(&r.path))?;
            Tree::Sharded(ShardedArray {
                array,
                mesh: r.mesh,
            })
        }
        StoredNode::Map(m) => Tree::Map(
            m.into_iter()
                .map(|(k, v)| Ok((k, materialize(v, arrays)?)))
                .collect::<Result<_>>()?,
        ),
        StoredNode::Seq(s) => Tree::Seq(
            s.into_iter()
                .map(|v| materialize(v, arrays))
                .collect::<Result<_>>()?,
        ),
    })
}
