//! Convenience constructors that record load and transfer nodes on a [`GraphBuilder`].
//!
//! ```rust,ignore
//! let mut builder = GraphBuilder::new();
//! let path = builder.path_input();
//! let x = load(&mut builder, path, DType::I64, BroadcastPattern::vector(), MmapMode::None)?;
//! let graph = builder.build(&[x])?;
//! let outputs = graph.run(vec![(path, Value::from("stored-array.npy"))])?;
//! ```

use crate::error::{OpError, OpResult};
use crate::io::MmapMode;
use crate::ops::graph::{GraphBuilder, ValueId};
use crate::ops::{
    HandleKind, LoadFromDisk, ReceiveStart, ReceiveWait, SendStart, SendWait, ValueType,
};
use crate::tensor::{BroadcastPattern, DType, Shape};
use crate::transport::{PeerAddress, TransportContext};

/// Records a loader node reading `path` and returns the loaded tensor value.
pub fn load(
    builder: &mut GraphBuilder,
    path: ValueId,
    dtype: DType,
    pattern: BroadcastPattern,
    mmap_mode: MmapMode,
) -> OpResult<ValueId> {
    first_output(builder.make_node(LoadFromDisk::new(dtype, pattern, mmap_mode), &[path])?)
}

/// Starts a non-blocking send of `data` and returns the send handle.
pub fn isend(
    builder: &mut GraphBuilder,
    context: &TransportContext,
    data: ValueId,
    peer: PeerAddress,
) -> OpResult<ValueId> {
    first_output(builder.make_node(SendStart::new(context, peer)?, &[data])?)
}

/// Starts a non-blocking receive and returns the receive handle.
pub fn irecv(
    builder: &mut GraphBuilder,
    context: &TransportContext,
    peer: PeerAddress,
    dtype: DType,
    shape: Shape,
) -> OpResult<ValueId> {
    first_output(builder.make_node(ReceiveStart::new(context, peer, dtype, shape)?, &[])?)
}

/// Records the wait matching `handle`: a tensor for receives, an acknowledgment for sends.
pub fn wait(builder: &mut GraphBuilder, handle: ValueId) -> OpResult<ValueId> {
    let outputs = match builder.value_type(handle).cloned() {
        Some(ValueType::Handle(HandleKind::Send)) => builder.make_node(SendWait, &[handle])?,
        Some(ValueType::Handle(HandleKind::Receive(_))) => {
            builder.make_node(ReceiveWait, &[handle])?
        }
        Some(other) => {
            return Err(OpError::graph(format!(
                "wait expects a transfer handle, {handle} is {other}"
            )))
        }
        None => {
            return Err(OpError::graph(format!(
                "value {handle} is not defined in this graph"
            )))
        }
    };
    first_output(outputs)
}

/// Sends `data` to `peer` and returns the acknowledgment of the completed send.
pub fn send(
    builder: &mut GraphBuilder,
    context: &TransportContext,
    data: ValueId,
    peer: PeerAddress,
) -> OpResult<ValueId> {
    let handle = isend(builder, context, data, peer)?;
    wait(builder, handle)
}

/// Receives a `dtype` tensor of `shape` from `peer`.
pub fn recv(
    builder: &mut GraphBuilder,
    context: &TransportContext,
    peer: PeerAddress,
    dtype: DType,
    shape: Shape,
) -> OpResult<ValueId> {
    let handle = irecv(builder, context, peer, dtype, shape)?;
    wait(builder, handle)
}

fn first_output(outputs: Vec<ValueId>) -> OpResult<ValueId> {
    outputs
        .first()
        .copied()
        .ok_or_else(|| OpError::graph("operation produced no outputs"))
}
