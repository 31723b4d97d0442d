//! Internal graph bookkeeping shared by the builder and the executor.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::ops::{OpKind, ValueType};
use crate::tensor::Tensor;

/// Identifier of a value produced or declared inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a node in insertion (and execution) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Graph-level constant bound to a value.
#[derive(Debug, Clone)]
pub(super) enum ConstantValue {
    Path(PathBuf),
    Tensor(Tensor),
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ValueOrigin {
    Input,
    Constant,
    Node(NodeId),
}

/// Recorded application of an operation to existing values.
#[derive(Debug, Clone)]
pub(super) struct NodeRecord {
    pub(super) op: OpKind,
    pub(super) inputs: Vec<ValueId>,
    pub(super) outputs: Vec<ValueId>,
}

/// Mutable graph storage populated by [`GraphBuilder`](super::GraphBuilder).
#[derive(Debug, Default)]
pub(super) struct GraphInner {
    pub(super) next_value: u32,
    pub(super) nodes: Vec<NodeRecord>,
    pub(super) value_types: HashMap<ValueId, ValueType>,
    pub(super) origins: HashMap<ValueId, ValueOrigin>,
    pub(super) inputs: Vec<ValueId>,
    pub(super) constants: Vec<(ValueId, ConstantValue)>,
    /// Handle values and the node that consumes each one.
    pub(super) handle_consumers: HashMap<ValueId, NodeId>,
    /// Pure applications already recorded, for merging duplicates.
    pub(super) merge_index: HashMap<(OpKind, Vec<ValueId>), NodeId>,
}

impl GraphInner {
    pub(super) fn allocate_value(&mut self, ty: ValueType, origin: ValueOrigin) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        self.value_types.insert(value, ty);
        self.origins.insert(value, origin);
        value
    }
}
