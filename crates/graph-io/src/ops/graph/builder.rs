//! Mutable builder used to stage operations before they are frozen into a [`Graph`].

use std::path::PathBuf;

use tracing::trace;

use crate::error::{OpError, OpResult};
use crate::ops::{Op, OpKind, TensorType, ValueType};
use crate::tensor::{BroadcastPattern, Tensor};

use super::executor::Graph;
use super::state::{ConstantValue, GraphInner, NodeId, NodeRecord, ValueId, ValueOrigin};

/// Records graph inputs, constants, and node applications.
///
/// Values must exist before they can be consumed, so nodes are always recorded in a valid
/// execution order. Each transfer handle may feed exactly one node.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    inner: GraphInner,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a runtime-supplied input. Transfer handles cannot be fed from outside.
    pub fn input(&mut self, ty: ValueType) -> OpResult<ValueId> {
        if ty.is_handle() {
            return Err(OpError::graph(format!(
                "{ty} cannot be a graph input; handles are produced by start nodes"
            )));
        }
        let value = self.inner.allocate_value(ty, ValueOrigin::Input);
        self.inner.inputs.push(value);
        Ok(value)
    }

    /// Declares a runtime-supplied path input.
    pub fn path_input(&mut self) -> ValueId {
        let value = self.inner.allocate_value(ValueType::Path, ValueOrigin::Input);
        self.inner.inputs.push(value);
        value
    }

    /// Binds a constant path.
    pub fn path_constant(&mut self, path: impl Into<PathBuf>) -> ValueId {
        let value = self
            .inner
            .allocate_value(ValueType::Path, ValueOrigin::Constant);
        self.inner
            .constants
            .push((value, ConstantValue::Path(path.into())));
        value
    }

    /// Binds a constant tensor; its pattern marks every extent-1 axis as broadcastable.
    pub fn tensor_constant(&mut self, tensor: Tensor) -> ValueId {
        let pattern = BroadcastPattern::new(tensor.shape().dims().iter().map(|&dim| dim == 1));
        let ty = ValueType::Tensor(TensorType::new(tensor.dtype(), pattern));
        let value = self.inner.allocate_value(ty, ValueOrigin::Constant);
        self.inner
            .constants
            .push((value, ConstantValue::Tensor(tensor)));
        value
    }

    pub fn value_type(&self, value: ValueId) -> Option<&ValueType> {
        self.inner.value_types.get(&value)
    }

    /// Applies `op` to existing values and returns its outputs.
    pub fn make_node(
        &mut self,
        op: impl Into<OpKind>,
        inputs: &[ValueId],
    ) -> OpResult<Vec<ValueId>> {
        let op = op.into();
        let mut input_types = Vec::with_capacity(inputs.len());
        for (position, value) in inputs.iter().enumerate() {
            let ty = self.inner.value_types.get(value).ok_or_else(|| {
                OpError::graph(format!("{op}: value {value} is not defined in this graph"))
            })?;
            if ty.is_handle() {
                if let Some(consumer) = self.inner.handle_consumers.get(value) {
                    return Err(OpError::graph(format!(
                        "{op}: handle {value} is already consumed by node {}",
                        consumer.0
                    )));
                }
                if inputs[..position].contains(value) {
                    return Err(OpError::graph(format!(
                        "{op}: handle {value} is passed more than once"
                    )));
                }
            }
            input_types.push(ty.clone());
        }

        let output_types = op.output_types(&input_types)?;

        let merge_key = (op.clone(), inputs.to_vec());
        if op.is_pure() {
            if let Some(existing) = self.inner.merge_index.get(&merge_key) {
                trace!(%op, node = existing.0, "merged duplicate application");
                return Ok(self.inner.nodes[existing.0 as usize].outputs.clone());
            }
        }

        let node = NodeId(self.inner.nodes.len() as u32);
        for (value, ty) in inputs.iter().zip(&input_types) {
            if ty.is_handle() {
                self.inner.handle_consumers.insert(*value, node);
            }
        }
        let outputs: Vec<ValueId> = output_types
            .into_iter()
            .map(|ty| self.inner.allocate_value(ty, ValueOrigin::Node(node)))
            .collect();
        trace!(%op, node = node.0, ?inputs, ?outputs, "recorded node");

        if op.is_pure() {
            self.inner.merge_index.insert(merge_key, node);
        }
        self.inner.nodes.push(NodeRecord {
            op,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// Freezes the graph with the given outputs.
    ///
    /// Fails if an output is unknown or a handle, or if any handle is never waited on.
    pub fn build(self, outputs: &[ValueId]) -> OpResult<Graph> {
        for value in outputs {
            match self.inner.value_types.get(value) {
                None => {
                    return Err(OpError::graph(format!(
                        "output {value} is not defined in this graph"
                    )))
                }
                Some(ty) if ty.is_handle() => {
                    return Err(OpError::graph(format!(
                        "output {value} is a transfer handle; wait on it instead"
                    )))
                }
                Some(_) => {}
            }
        }

        let mut unwaited: Vec<ValueId> = self
            .inner
            .value_types
            .iter()
            .filter(|(value, ty)| {
                ty.is_handle() && !self.inner.handle_consumers.contains_key(*value)
            })
            .map(|(value, _)| *value)
            .collect();
        unwaited.sort();
        if let Some(value) = unwaited.first() {
            let producer = match self.inner.origins.get(value) {
                Some(ValueOrigin::Node(node)) => self.inner.nodes[node.0 as usize].op.to_string(),
                _ => "<unknown>".to_string(),
            };
            return Err(OpError::graph(format!(
                "transfer handle {value} produced by {producer} is never waited on"
            )));
        }

        Ok(Graph::new(self.inner, outputs.to_vec()))
    }
}
