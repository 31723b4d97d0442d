//! Frozen graph and its single-threaded executor.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::error::{OpError, OpResult};
use crate::ops::{Op, OpKind, Value, ValueType};

use super::state::{ConstantValue, GraphInner, ValueId};

/// Immutable graph ready to run.
///
/// Each run evaluates nodes in recording order. Shareable values are cloned for every consumer
/// but the last; transfer handles have exactly one consumer and are moved into it.
#[derive(Debug)]
pub struct Graph {
    inner: GraphInner,
    outputs: Vec<ValueId>,
    use_counts: HashMap<ValueId, usize>,
}

impl Graph {
    pub(super) fn new(inner: GraphInner, outputs: Vec<ValueId>) -> Self {
        let mut use_counts: HashMap<ValueId, usize> = HashMap::new();
        for node in &inner.nodes {
            for value in &node.inputs {
                *use_counts.entry(*value).or_default() += 1;
            }
        }
        for value in &outputs {
            *use_counts.entry(*value).or_default() += 1;
        }
        Self {
            inner,
            outputs,
            use_counts,
        }
    }

    /// Runtime inputs in declaration order.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn value_type(&self, value: ValueId) -> Option<&ValueType> {
        self.inner.value_types.get(&value)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Operations in execution order.
    pub fn ops(&self) -> impl Iterator<Item = &OpKind> {
        self.inner.nodes.iter().map(|node| &node.op)
    }

    /// Runs every node once and returns the graph outputs in order.
    pub fn run(&self, feeds: Vec<(ValueId, Value)>) -> OpResult<Vec<Value>> {
        let mut slots: HashMap<ValueId, Value> = HashMap::new();
        let mut remaining = self.use_counts.clone();

        for (value, fed) in feeds {
            let ty = self
                .inner
                .inputs
                .contains(&value)
                .then(|| self.inner.value_types.get(&value))
                .flatten()
                .ok_or_else(|| OpError::graph(format!("{value} is not a graph input")))?;
            if !fed.conforms_to(ty) {
                return Err(OpError::graph(format!(
                    "input {value} expects {ty}, got a {} value",
                    fed.kind_name()
                )));
            }
            if slots.insert(value, fed).is_some() {
                return Err(OpError::graph(format!("input {value} is fed more than once")));
            }
        }
        if let Some(missing) = self.inner.inputs.iter().find(|v| !slots.contains_key(*v)) {
            return Err(OpError::graph(format!("no value fed for input {missing}")));
        }

        for (value, constant) in &self.inner.constants {
            let constant = match constant {
                ConstantValue::Path(path) => Value::Path(path.clone()),
                ConstantValue::Tensor(tensor) => Value::Tensor(tensor.clone()),
            };
            slots.insert(*value, constant);
        }

        for (index, node) in self.inner.nodes.iter().enumerate() {
            let inputs = node
                .inputs
                .iter()
                .map(|value| take_use(&mut slots, &mut remaining, *value))
                .collect::<OpResult<Vec<_>>>()?;
            trace!(node = index, op = %node.op, "running node");
            let produced = node.op.perform(inputs)?;
            if produced.len() != node.outputs.len() {
                return Err(OpError::graph(format!(
                    "{} produced {} values, expected {}",
                    node.op,
                    produced.len(),
                    node.outputs.len()
                )));
            }
            for (value, result) in node.outputs.iter().zip(produced) {
                if remaining.get(value).copied().unwrap_or(0) > 0 {
                    slots.insert(*value, result);
                }
            }
        }

        let outputs = self
            .outputs
            .iter()
            .map(|value| take_use(&mut slots, &mut remaining, *value))
            .collect::<OpResult<Vec<_>>>()?;
        debug!(nodes = self.inner.nodes.len(), outputs = outputs.len(), "graph run complete");
        Ok(outputs)
    }
}

/// Hands out one use of `value`, moving it out of its slot on the last use.
fn take_use(
    slots: &mut HashMap<ValueId, Value>,
    remaining: &mut HashMap<ValueId, usize>,
    value: ValueId,
) -> OpResult<Value> {
    let missing = || OpError::graph(format!("value {value} has not been computed"));
    let count = remaining.get_mut(&value).ok_or_else(missing)?;
    *count = count.saturating_sub(1);
    if *count == 0 {
        slots.remove(&value).ok_or_else(missing)
    } else {
        let current = slots.get(&value).ok_or_else(missing)?;
        current
            .share()
            .ok_or_else(|| OpError::graph(format!("handle {value} cannot be consumed twice")))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in &self.inner.inputs {
            if let Some(ty) = self.inner.value_types.get(value) {
                writeln!(f, "input {value}: {ty}")?;
            }
        }
        for (value, constant) in &self.inner.constants {
            match constant {
                ConstantValue::Path(path) => writeln!(f, "{value} = path {:?}", path)?,
                ConstantValue::Tensor(tensor) => writeln!(
                    f,
                    "{value} = tensor {} {:?}",
                    tensor.dtype(),
                    tensor.shape().dims()
                )?,
            }
        }
        for node in &self.inner.nodes {
            let outputs = node
                .outputs
                .iter()
                .map(ValueId::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let inputs = node
                .inputs
                .iter()
                .map(ValueId::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "{outputs} = {}({inputs})", node.op)?;
        }
        let outputs = self
            .outputs
            .iter()
            .map(ValueId::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "return {outputs}")
    }
}
