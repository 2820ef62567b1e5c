//! Graph copying.
//!
//! [`CopyMapper`] clones a sub-graph into a fresh [`Namespace`], memoized by
//! node identity: a node shared between two entry points is copied once and
//! the copies keep sharing it. This is a DAG-preserving copy, not a tree
//! copy.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::array::{Array, ArrayKind, ArrayRef, Namespace, NodeId};
use crate::error::Result;

#[derive(Default)]
pub struct CopyMapper {
    memo: HashMap<NodeId, ArrayRef>,
}

impl CopyMapper {
    pub fn new() -> CopyMapper {
        CopyMapper::default()
    }

    /// Copy `node` and everything reachable from it into `namespace`.
    /// Named kinds (placeholders, data wrappers, outputs) register
    /// themselves in the target namespace under their own name.
    pub fn copy(&mut self, namespace: &mut Namespace, node: &ArrayRef) -> Result<ArrayRef> {
        if let Some(copied) = self.memo.get(&node.id()) {
            return Ok(copied.clone());
        }

        let copied = match node.kind() {
            ArrayKind::Placeholder { name } => {
                let copied = Array::placeholder(name.clone(), node.shape().clone(), node.dtype());
                namespace.insert(name.clone(), copied.clone())?;
                copied
            }
            ArrayKind::DataWrapper { name, data } => {
                let copied = Array::data_wrapper(name.clone(), data.clone());
                namespace.insert(name.clone(), copied.clone())?;
                copied
            }
            ArrayKind::Output { name, inner } => {
                let inner = self.copy(namespace, inner)?;
                let copied = Array::output(name.clone(), inner);
                namespace.insert(name.clone(), copied.clone())?;
                copied
            }
            ArrayKind::IndexLambda { expr, bindings } => {
                let mut copied_bindings = IndexMap::new();
                for (binding_name, value) in bindings {
                    copied_bindings.insert(binding_name.clone(), self.copy(namespace, value)?);
                }
                Array::index_lambda(
                    expr.clone(),
                    node.shape().clone(),
                    node.dtype(),
                    copied_bindings,
                )
            }
        };

        self.memo.insert(node.id(), copied.clone());
        Ok(copied)
    }
}

/// Copy every named node of `source` (and its reachable sub-graph) into a
/// fresh namespace, preserving sharing and insertion order.
pub fn copy_namespace(source: &Namespace) -> Result<(Namespace, CopyMapper)> {
    let mut mapper = CopyMapper::new();
    let mut target = Namespace::new();
    for (_, node) in source.iter() {
        mapper.copy(&mut target, node)?;
    }
    Ok((target, mapper))
}

// ─── Tests ────────────────────────────────────────────────────────
