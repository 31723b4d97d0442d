//! Graph operations for disk loading and point-to-point transfer.
//!
//! Every operation kind implements [`Op`]; [`OpKind`] closes the set so the graph can store,
//! compare, and hash nodes without trait objects. Equality of two operations means they are
//! interchangeable given the same inputs.

pub mod functional;
pub mod graph;
mod load;
mod transfer;
mod value;

use std::fmt;

use crate::error::{OpError, OpResult};

pub use functional::{irecv, isend, load, recv, send, wait};
pub use graph::{Graph, GraphBuilder, NodeId, ValueId};
pub use load::LoadFromDisk;
pub use transfer::{ReceiveStart, ReceiveWait, SendStart, SendWait};
pub use value::{
    HandleKind, ReceiveHandle, SendHandle, TensorType, TransferHandle, Value, ValueType,
};

/// Shared contract of every graph operation.
pub trait Op: fmt::Display {
    /// Types the outputs of an application to inputs of the given types, rejecting ill-typed
    /// applications.
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>>;

    /// Whether two equal applications to the same inputs may share one node.
    fn is_pure(&self) -> bool {
        true
    }

    /// Compute step. Inputs arrive already computed and are consumed.
    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    Load(LoadFromDisk),
    SendStart(SendStart),
    ReceiveStart(ReceiveStart),
    SendWait(SendWait),
    ReceiveWait(ReceiveWait),
}

impl OpKind {
    fn as_op(&self) -> &dyn Op {
        match self {
            OpKind::Load(op) => op,
            OpKind::SendStart(op) => op,
            OpKind::ReceiveStart(op) => op,
            OpKind::SendWait(op) => op,
            OpKind::ReceiveWait(op) => op,
        }
    }
}

impl Op for OpKind {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        self.as_op().output_types(inputs)
    }

    fn is_pure(&self) -> bool {
        self.as_op().is_pure()
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        self.as_op().perform(inputs)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_op(), f)
    }
}

macro_rules! impl_from_op {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for OpKind {
                fn from(op: $variant) -> Self {
                    OpKind::$variant(op)
                }
            }
        )*
    };
}

impl_from_op!(SendStart, ReceiveStart, SendWait, ReceiveWait);

impl From<LoadFromDisk> for OpKind {
    fn from(op: LoadFromDisk) -> Self {
        OpKind::Load(op)
    }
}

pub(crate) fn expect_arity(
    op: &dyn fmt::Display,
    inputs: &[ValueType],
    expected: usize,
) -> OpResult<()> {
    if inputs.len() != expected {
        return Err(OpError::graph(format!(
            "{op} takes {expected} input(s), got {}",
            inputs.len()
        )));
    }
    Ok(())
}
