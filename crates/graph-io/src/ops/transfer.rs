//! Non-blocking point-to-point transfer as paired start/wait graph nodes.
//!
//! A start node issues the request and emits a [`TransferHandle`] immediately; the matching
//! wait node takes that handle as its only input, so it is ordered after the start and is the
//! only place the executing thread blocks. None of these nodes are differentiable.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::BytesMut;
use tracing::debug;

use super::load::single_input;
use super::value::{HandleKind, TensorType, TransferHandle, Value, ValueType};
use super::value::{ReceiveHandle, SendHandle};
use super::{expect_arity, Op};
use crate::error::{OpError, OpResult};
use crate::tensor::{BroadcastPattern, DType, Shape};
use crate::transport::{PeerAddress, TransportContext};

/// Starts a receive of a `dtype` tensor of `shape` from `peer`.
#[derive(Debug, Clone)]
pub struct ReceiveStart {
    context: TransportContext,
    peer: PeerAddress,
    dtype: DType,
    shape: Shape,
    byte_len: usize,
}

impl ReceiveStart {
    pub fn new(
        context: &TransportContext,
        peer: PeerAddress,
        dtype: DType,
        shape: Shape,
    ) -> OpResult<Self> {
        context.check_peer(peer.rank)?;
        let byte_len = shape
            .checked_num_elements()
            .and_then(|count| count.checked_mul(dtype.size_in_bytes()))
            .ok_or_else(|| {
                OpError::config(format!(
                    "receive buffer for {dtype} {:?} overflows",
                    shape.dims()
                ))
            })?;
        Ok(Self {
            context: context.clone(),
            peer,
            dtype,
            shape,
            byte_len,
        })
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Type of the tensor the matching wait produces; no axis is marked broadcastable.
    pub fn result_type(&self) -> TensorType {
        TensorType::new(self.dtype, BroadcastPattern::dense(self.shape.rank()))
    }

    fn info(&self) -> (PeerAddress, DType, &Shape) {
        (self.peer, self.dtype, &self.shape)
    }
}

impl PartialEq for ReceiveStart {
    fn eq(&self, other: &Self) -> bool {
        self.info() == other.info()
    }
}

impl Eq for ReceiveStart {}

impl Hash for ReceiveStart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info().hash(state);
    }
}

impl Op for ReceiveStart {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        expect_arity(self, inputs, 0)?;
        Ok(vec![ValueType::Handle(HandleKind::Receive(
            self.result_type(),
        ))])
    }

    fn is_pure(&self) -> bool {
        false
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        if !inputs.is_empty() {
            return Err(OpError::graph(format!(
                "{self} takes no inputs, got {}",
                inputs.len()
            )));
        }
        let buffer = BytesMut::zeroed(self.byte_len);
        let request = self.context.transport().begin_receive(
            buffer,
            self.dtype,
            self.peer.rank,
            self.peer.tag,
        )?;
        debug!(peer = %self.peer, dtype = %self.dtype, bytes = self.byte_len, "posted receive");
        let handle = ReceiveHandle::new(request, self.dtype, self.shape.clone(), self.peer);
        Ok(vec![Value::Handle(TransferHandle::Receive(handle))])
    }
}

impl fmt::Display for ReceiveStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Recv{{source: {}, tag: {}, dtype: {}, shape: {:?}}}",
            self.peer.rank,
            self.peer.tag,
            self.dtype,
            self.shape.dims()
        )
    }
}

/// Starts sending its tensor input to `peer`.
#[derive(Debug, Clone)]
pub struct SendStart {
    context: TransportContext,
    peer: PeerAddress,
}

impl SendStart {
    pub fn new(context: &TransportContext, peer: PeerAddress) -> OpResult<Self> {
        context.check_peer(peer.rank)?;
        Ok(Self {
            context: context.clone(),
            peer,
        })
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }
}

impl PartialEq for SendStart {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
    }
}

impl Eq for SendStart {}

impl Hash for SendStart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
    }
}

impl Op for SendStart {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        expect_arity(self, inputs, 1)?;
        match &inputs[0] {
            ValueType::Tensor(_) => Ok(vec![ValueType::Handle(HandleKind::Send)]),
            other => Err(OpError::graph(format!(
                "{self} expects a tensor input, got {other}"
            ))),
        }
    }

    fn is_pure(&self) -> bool {
        false
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        let tensor = single_input(inputs)?.into_tensor()?;
        let payload = tensor.data().to_bytes();
        let bytes = payload.len();
        let request = self.context.transport().begin_send(
            payload,
            tensor.dtype(),
            self.peer.rank,
            self.peer.tag,
        )?;
        debug!(peer = %self.peer, dtype = %tensor.dtype(), bytes, "posted send");
        let handle = SendHandle::new(request, tensor, self.peer);
        Ok(vec![Value::Handle(TransferHandle::Send(handle))])
    }
}

impl fmt::Display for SendStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Send{{dest: {}, tag: {}}}", self.peer.rank, self.peer.tag)
    }
}

/// Blocks on a receive handle and yields the received tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReceiveWait;

impl Op for ReceiveWait {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        expect_arity(self, inputs, 1)?;
        match &inputs[0] {
            ValueType::Handle(HandleKind::Receive(ty)) => Ok(vec![ValueType::Tensor(ty.clone())]),
            other => Err(OpError::graph(format!(
                "{self} expects a receive handle, got {other}"
            ))),
        }
    }

    fn is_pure(&self) -> bool {
        false
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        match single_input(inputs)?.into_handle()? {
            TransferHandle::Receive(handle) => Ok(vec![Value::Tensor(handle.wait()?)]),
            TransferHandle::Send(handle) => Err(OpError::graph(format!(
                "{self} was given a send handle for {}",
                handle.peer()
            ))),
        }
    }
}

impl fmt::Display for ReceiveWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecvWait")
    }
}

/// Blocks on a send handle and yields an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SendWait;

impl Op for SendWait {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        expect_arity(self, inputs, 1)?;
        match &inputs[0] {
            ValueType::Handle(HandleKind::Send) => Ok(vec![ValueType::Ack]),
            other => Err(OpError::graph(format!(
                "{self} expects a send handle, got {other}"
            ))),
        }
    }

    fn is_pure(&self) -> bool {
        false
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        match single_input(inputs)?.into_handle()? {
            TransferHandle::Send(handle) => Ok(vec![Value::Ack(handle.wait()?)]),
            TransferHandle::Receive(handle) => Err(OpError::graph(format!(
                "{self} was given a receive handle for {}",
                handle.peer()
            ))),
        }
    }
}

impl fmt::Display for SendWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendWait")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalWorld;

    fn contexts(size: usize) -> Vec<TransportContext> {
        LocalWorld::new(size).unwrap().into_contexts()
    }

    #[test]
    fn receive_equality_covers_peer_tag_dtype_and_shape() {
        let ctx = contexts(3).remove(0);
        let recv = |rank, tag, dtype, dims: &[usize]| {
            ReceiveStart::new(&ctx, PeerAddress::new(rank, tag), dtype, Shape::new(dims)).unwrap()
        };
        let base = recv(1, 7, DType::I64, &[3]);
        assert_eq!(base, recv(1, 7, DType::I64, &[3]));
        assert_ne!(base, recv(2, 7, DType::I64, &[3]));
        assert_ne!(base, recv(1, 8, DType::I64, &[3]));
        assert_ne!(base, recv(1, 7, DType::F64, &[3]));
        assert_ne!(base, recv(1, 7, DType::I64, &[3, 1]));
    }

    #[test]
    fn send_equality_covers_peer_and_tag() {
        let ctx = contexts(3).remove(0);
        let send = |rank, tag| SendStart::new(&ctx, PeerAddress::new(rank, tag)).unwrap();
        assert_eq!(send(1, 7), send(1, 7));
        assert_ne!(send(1, 7), send(2, 7));
        assert_ne!(send(1, 7), send(1, 6));
    }

    #[test]
    fn waits_are_equal_by_kind() {
        assert_eq!(ReceiveWait, ReceiveWait);
        assert_eq!(SendWait, SendWait::default());
    }

    #[test]
    fn peers_outside_the_world_are_config_errors() {
        let ctx = contexts(2).remove(0);
        assert!(matches!(
            SendStart::new(&ctx, PeerAddress::new(2, 0)),
            Err(OpError::Config(_))
        ));
        assert!(matches!(
            ReceiveStart::new(&ctx, PeerAddress::new(5, 0), DType::F32, Shape::new([1])),
            Err(OpError::Config(_))
        ));
    }

    #[test]
    fn oversized_receive_buffers_are_rejected_at_construction() {
        let ctx = contexts(2).remove(0);
        let peer = PeerAddress::new(1, 0);
        let err = ReceiveStart::new(&ctx, peer, DType::I64, Shape::new([usize::MAX / 4]))
            .unwrap_err();
        assert!(matches!(err, OpError::Config(msg) if msg.contains("overflows")));
        assert!(ReceiveStart::new(&ctx, peer, DType::I64, Shape::new([usize::MAX, 2])).is_err());
        let fits = ReceiveStart::new(&ctx, peer, DType::U8, Shape::new([usize::MAX / 4])).unwrap();
        assert_eq!(fits.byte_len, usize::MAX / 4);
    }

    #[test]
    fn handle_types_are_not_interchangeable() {
        let ctx = contexts(2).remove(0);
        let recv = ReceiveStart::new(&ctx, PeerAddress::new(1, 0), DType::F32, Shape::new([2, 2]))
            .unwrap();
        let handle = recv.output_types(&[]).unwrap().remove(0);
        assert_eq!(
            ReceiveWait.output_types(std::slice::from_ref(&handle)).unwrap(),
            vec![ValueType::tensor(DType::F32, BroadcastPattern::matrix())]
        );
        assert!(SendWait.output_types(&[handle]).is_err());
        assert!(SendWait
            .output_types(&[ValueType::tensor(DType::F32, BroadcastPattern::vector())])
            .is_err());
        assert!(SendStart::new(&ctx, PeerAddress::new(1, 0))
            .unwrap()
            .output_types(&[ValueType::Handle(HandleKind::Send)])
            .is_err());
    }

    #[test]
    fn start_and_wait_roundtrip_through_values() {
        let mut ctxs = contexts(2);
        let b = ctxs.pop().unwrap();
        let a = ctxs.pop().unwrap();
        let tensor = crate::tensor::Tensor::from_vec(Shape::new([2]), vec![4i32, 5]).unwrap();

        let recv = ReceiveStart::new(&b, PeerAddress::new(0, 1), DType::I32, Shape::new([2]))
            .unwrap()
            .perform(vec![])
            .unwrap();
        let send = SendStart::new(&a, PeerAddress::new(1, 1))
            .unwrap()
            .perform(vec![Value::Tensor(tensor)])
            .unwrap();

        let received = ReceiveWait.perform(recv).unwrap().remove(0).into_tensor().unwrap();
        assert_eq!(received.to_vec::<i32>().unwrap(), vec![4, 5]);
        assert!(SendWait.perform(send).unwrap().remove(0).into_ack().unwrap());
    }
}
