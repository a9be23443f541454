//! JSON Patch construction
//!
//! Kubernetes applies webhook patches with RFC 6902 semantics, where `add`
//! into a missing (null) array or map fails. A Pod with no volumes has no
//! `spec.volumes` key at all, so the first append has to create the array
//! itself, while later appends index into it. [`ArrayField`] and [`MapField`]
//! own that branching so evaluators never format pointer strings by hand.
//!
//! Pointer tokens are passed unescaped; `jsonptr` encodes `/` as `~1` and `~`
//! as `~0`, which is what keys like `cni.projectcalico.org/ipAddrs` need.

use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde_json::{Map, Value};

/// Build a pointer from unescaped tokens
pub fn pointer<'t, I, T>(tokens: I) -> PointerBuf
where
    I: IntoIterator<Item = T>,
    T: Into<jsonptr::Token<'t>>,
{
    PointerBuf::from_tokens(tokens)
}

/// `add` operation
pub fn add(path: PointerBuf, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

/// `replace` operation
pub fn replace(path: PointerBuf, value: Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation { path, value })
}

/// `remove` operation
pub fn remove(path: PointerBuf) -> PatchOperation {
    PatchOperation::Remove(RemoveOperation { path })
}

/// An array-valued field being appended to.
///
/// Tracks the length the array will have after each emitted operation, so a
/// sequence of pushes against an initially absent array yields one
/// whole-array `add` followed by indexed `add`s.
#[derive(Debug, Clone)]
pub struct ArrayField {
    path: PointerBuf,
    len: usize,
}

impl ArrayField {
    /// Array at `path` currently holding `len` elements (0 when absent)
    pub fn new(path: PointerBuf, len: usize) -> Self {
        Self { path, len }
    }

    /// Array at `path` mirroring an optional Kubernetes list field
    pub fn of<T>(path: PointerBuf, current: Option<&Vec<T>>) -> Self {
        Self::new(path, current.map_or(0, Vec::len))
    }

    /// Current element count including pushes emitted so far
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no elements exist yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the element at `index`
    pub fn element(&self, index: usize) -> PointerBuf {
        let mut path = self.path.clone();
        path.push_back(index.to_string());
        path
    }

    /// Emit the operation appending `value`
    pub fn push(&mut self, value: Value) -> PatchOperation {
        let op = if self.len == 0 {
            add(self.path.clone(), Value::Array(vec![value]))
        } else {
            add(self.element(self.len), value)
        };
        self.len += 1;
        op
    }
}

/// A string map field (labels, annotations) being inserted into.
#[derive(Debug, Clone)]
pub struct MapField {
    path: PointerBuf,
    present: bool,
}

impl MapField {
    /// Map at `path`; `present` is false when the object has no such key
    pub fn new(path: PointerBuf, present: bool) -> Self {
        Self { path, present }
    }

    /// Map at `path` mirroring an optional Kubernetes map field
    pub fn of<M>(path: PointerBuf, current: Option<&M>) -> Self {
        Self::new(path, current.is_some())
    }

    /// Emit the operation setting `key` to `value`
    pub fn insert(&mut self, key: &str, value: Value) -> PatchOperation {
        if self.present {
            let mut path = self.path.clone();
            path.push_back(key);
            add(path, value)
        } else {
            self.present = true;
            let mut map = Map::new();
            map.insert(key.to_string(), value);
            add(self.path.clone(), Value::Object(map))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use json_patch::PatchOperation;
    use serde_json::Value;

    /// Render operations the way the API server receives them
    pub fn to_json(ops: &[PatchOperation]) -> Vec<Value> {
        ops.iter()
            .map(|op| serde_json::to_value(op).expect("patch operation serializes"))
            .collect()
    }
}
