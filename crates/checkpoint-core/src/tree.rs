//! Tree-shaped checkpoint payloads
//!
//! A [`Tree`] is either a leaf (numeric array, scalar, string, sharded array)
//! or a composite node (key-ordered mapping or sequence). The same type is
//! used for saved payloads and for restore targets; a target only contributes
//! its shape, key sets and leaf kinds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Element type of an [`ArrayLeaf`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Lowercase name used in messages and tool output
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar leaf value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as u8 as f64,
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::Int(i) => i,
            Scalar::Float(f) => f as i64,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::Float(f) => f != 0.0,
        }
    }

    /// Convert to the same variant as `like`
    pub fn cast_like(self, like: Scalar) -> Scalar {
        match like {
            Scalar::Bool(_) => Scalar::Bool(self.as_bool()),
            Scalar::Int(_) => Scalar::Int(self.as_i64()),
            Scalar::Float(_) => Scalar::Float(self.as_f64()),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
        }
    }

    fn write_as(self, dtype: DType, out: &mut Vec<u8>) {
        match dtype {
            DType::Bool => out.push(self.as_bool() as u8),
            DType::U8 => out.push(self.as_i64() as u8),
            DType::I32 => out.extend_from_slice(&(self.as_i64() as i32).to_le_bytes()),
            DType::I64 => out.extend_from_slice(&self.as_i64().to_le_bytes()),
            DType::F32 => out.extend_from_slice(&(self.as_f64() as f32).to_le_bytes()),
            DType::F64 => out.extend_from_slice(&self.as_f64().to_le_bytes()),
        }
    }
}

/// Number of elements in `shape`, or `None` if it overflows `usize`
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

/// Dense array leaf: dtype, shape and raw little-endian element bytes
///
/// Decoding goes through [`ArrayLeaf::new`], so a deserialized array has
/// been validated like a constructed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArrayLeaf")]
pub struct ArrayLeaf {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

/// Unvalidated wire form of an [`ArrayLeaf`]
#[derive(Serialize, Deserialize)]
struct RawArrayLeaf {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl TryFrom<RawArrayLeaf> for ArrayLeaf {
    type Error = Error;

    fn try_from(raw: RawArrayLeaf) -> Result<Self> {
        ArrayLeaf::new(raw.dtype, raw.shape, raw.data)
    }
}

impl ArrayLeaf {
    /// Create an array, validating the buffer length against shape and dtype
    ///
    /// # Errors
    ///
    /// `InvalidArray` if the shape overflows or the buffer length does not
    /// match `product(shape) * dtype.size()`.
    pub fn new(dtype: DType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = element_count(&shape)
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| Error::InvalidArray {
                message: format!("{} array of shape {:?} is too large", dtype, shape),
            })?;
        if data.len() != expected {
            return Err(Error::InvalidArray {
                message: format!(
                    "{} array of shape {:?} needs {} bytes, got {}",
                    dtype,
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F32, shape, data)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F64, shape, data)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I32, shape, data)
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I64, shape, data)
    }

    pub fn from_u8(shape: Vec<usize>, values: &[u8]) -> Result<Self> {
        Self::new(DType::U8, shape, values.to_vec())
    }

    /// Build an array of `dtype` from scalar elements, casting each one
    pub fn from_scalars(
        dtype: DType,
        shape: Vec<usize>,
        values: impl IntoIterator<Item = Scalar>,
    ) -> Result<Self> {
        let mut data = Vec::new();
        for value in values {
            value.write_as(dtype, &mut data);
        }
        Self::new(dtype, shape, data)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element `index` in row-major order
    pub fn element(&self, index: usize) -> Option<Scalar> {
        let size = self.dtype.size();
        let bytes = self.data.get(index * size..(index + 1) * size)?;
        let value = match self.dtype {
            DType::Bool => Scalar::Bool(bytes[0] != 0),
            DType::U8 => Scalar::Int(bytes[0] as i64),
            DType::I32 => Scalar::Int(i32::from_le_bytes(bytes.try_into().ok()?) as i64),
            DType::I64 => Scalar::Int(i64::from_le_bytes(bytes.try_into().ok()?)),
            DType::F32 => Scalar::Float(f32::from_le_bytes(bytes.try_into().ok()?) as f64),
            DType::F64 => Scalar::Float(f64::from_le_bytes(bytes.try_into().ok()?)),
        };
        Some(value)
    }

    pub fn elements(&self) -> impl Iterator<Item = Scalar> + '_ {
        (0..self.len()).filter_map(move |i| self.element(i))
    }

    /// Element-wise conversion to another dtype
    pub fn cast(&self, dtype: DType) -> ArrayLeaf {
        if dtype == self.dtype {
            return self.clone();
        }
        let mut data = Vec::with_capacity(self.len() * dtype.size());
        for value in self.elements() {
            value.write_as(dtype, &mut data);
        }
        ArrayLeaf {
            dtype,
            shape: self.shape.clone(),
            data: Bytes::from(data),
        }
    }

    /// Same elements under a new shape; the element count must match
    pub fn reshape(&self, shape: Vec<usize>) -> Result<ArrayLeaf> {
        if element_count(&shape) != Some(self.len()) {
            return Err(Error::InvalidArray {
                message: format!(
                    "cannot reshape {} elements into {:?}",
                    self.len(),
                    shape
                ),
            });
        }
        Ok(ArrayLeaf {
            dtype: self.dtype,
            shape,
            data: self.data.clone(),
        })
    }
}

/// Logical device mesh a sharded array is laid out over
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeshSpec {
    /// Named mesh axes and their sizes, outermost first
    pub axes: Vec<(String, usize)>,
}

impl MeshSpec {
    /// Build a mesh from `(axis name, size)` pairs, outermost first
    pub fn new<S: Into<String>>(axes: impl IntoIterator<Item = (S, usize)>) -> Self {
        Self {
            axes: axes.into_iter().map(|(n, s)| (n.into(), s)).collect(),
        }
    }

    /// Total devices the mesh spans
    pub fn device_count(&self) -> usize {
        self.axes.iter().fold(1usize, |acc, (_, s)| acc.saturating_mul(*s))
    }
}

/// Array leaf whose bytes are handed to a shard transport on save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedArray {
    pub array: ArrayLeaf,
    pub mesh: MeshSpec,
}

/// Recursive checkpoint value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tree {
    Array(ArrayLeaf),
    Scalar(Scalar),
    String(String),
    Sharded(ShardedArray),
    Map(BTreeMap<String, Tree>),
    Seq(Vec<Tree>),
}

impl Tree {
    /// Build a mapping node
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Tree)>) -> Tree {
        Tree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a sequence node
    pub fn seq(items: impl IntoIterator<Item = Tree>) -> Tree {
        Tree::Seq(items.into_iter().collect())
    }

    /// Node kind as named in schema errors
    pub fn kind(&self) -> &'static str {
        match self {
            Tree::Array(_) => "array",
            Tree::Scalar(_) => "scalar",
            Tree::String(_) => "string",
            Tree::Sharded(_) => "sharded",
            Tree::Map(_) => "map",
            Tree::Seq(_) => "seq",
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Tree::Map(_) | Tree::Seq(_))
    }

    /// Keys of a composite node; sequences use their indices
    pub fn child_keys(&self) -> Option<Vec<String>> {
        match self {
            Tree::Map(m) => Some(m.keys().cloned().collect()),
            Tree::Seq(s) => Some((0..s.len()).map(|i| i.to_string()).collect()),
            _ => None,
        }
    }

    /// Look up a node by dotted path (`params.layers.0.bias`)
    pub fn get(&self, path: &str) -> Option<&Tree> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, key| match node {
            Tree::Map(m) => m.get(key),
            Tree::Seq(s) => key.parse::<usize>().ok().and_then(|i| s.get(i)),
            _ => None,
        })
    }

    /// All leaves with their dotted paths, depth-first in key order
    pub fn leaves(&self) -> Vec<(String, &Tree)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, path: String, out: &mut Vec<(String, &'a Tree)>) {
        match self {
            Tree::Map(m) => {
                for (k, v) in m {
                    v.collect_leaves(join_path(&path, k), out);
                }
            }
            Tree::Seq(s) => {
                for (i, v) in s.iter().enumerate() {
                    v.collect_leaves(join_path(&path, &i.to_string()), out);
                }
            }
            leaf => out.push((path, leaf)),
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Tree::Map(m) => m.values().map(Tree::leaf_count).sum(),
            Tree::Seq(s) => s.iter().map(Tree::leaf_count).sum(),
            _ => 1,
        }
    }
}

/// Append `key` to a dotted path
pub fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

impl From<ArrayLeaf> for Tree {
    fn from(a: ArrayLeaf) -> Self {
        Tree::Array(a)
    }
}

impl From<ShardedArray> for Tree {
    fn from(a: ShardedArray) -> Self {
        Tree::Sharded(a)
    }
}

impl From<Scalar> for Tree {
    fn from(s: Scalar) -> Self {
        Tree::Scalar(s)
    }
}

impl From<f64> for Tree {
    fn from(v: f64) -> Self {
        Tree::Scalar(Scalar::Float(v))
    }
}

impl From<i64> for Tree {
    fn from(v: i64) -> Self {
        Tree::Scalar(Scalar::Int(v))
    }
}

impl From<bool> for Tree {
    fn from(v: bool) -> Self {
        Tree::Scalar(Scalar::Bool(v))
    }
}

impl From<&str> for Tree {
    fn from(v: &str) -> Self {
        Tree::String(v.to_string())
    }
}

impl From<String> for Tree {
    fn from(v: String) -> Self {
        Tree::String(v)
    }
}

impl From<Vec<Tree>> for Tree {
    fn from(v: Vec<Tree>) -> Self {
        Tree::Seq(v)
    }
}
