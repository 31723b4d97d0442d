//! Static value types and runtime values flowing between graph nodes.
//!
//! Transfer handles are a separate variant from tensors at both levels, so the builder rejects
//! a handle where a tensor is expected (and vice versa) before anything executes. At runtime a
//! handle is move-only: it is taken out of its slot by the single wait node that consumes it.

use std::fmt;
use std::path::PathBuf;

use bytes::BytesMut;
use tracing::debug;

use crate::error::{OpError, OpResult};
use crate::tensor::{BroadcastPattern, DType, Shape, Tensor};
use crate::transport::{PeerAddress, PendingRequest};

/// Element type plus broadcastable pattern of a tensor-valued graph value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dtype: DType,
    pub pattern: BroadcastPattern,
}

impl TensorType {
    pub fn new(dtype: DType, pattern: BroadcastPattern) -> Self {
        Self { dtype, pattern }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}, {}>", self.dtype, self.pattern)
    }
}

/// What kind of in-flight request a handle carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Send,
    /// Receive whose wait yields a tensor of this type.
    Receive(TensorType),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Tensor(TensorType),
    Path,
    Handle(HandleKind),
    /// Completion token of a send.
    Ack,
}

impl ValueType {
    pub fn tensor(dtype: DType, pattern: BroadcastPattern) -> Self {
        ValueType::Tensor(TensorType::new(dtype, pattern))
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, ValueType::Handle(_))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(ty) => write!(f, "{ty}"),
            ValueType::Path => f.write_str("path"),
            ValueType::Handle(HandleKind::Send) => f.write_str("handle<send>"),
            ValueType::Handle(HandleKind::Receive(ty)) => write!(f, "handle<recv {ty}>"),
            ValueType::Ack => f.write_str("ack"),
        }
    }
}

/// Runtime value stored in an executor slot.
#[derive(Debug)]
pub enum Value {
    Tensor(Tensor),
    Path(PathBuf),
    Handle(TransferHandle),
    Ack(bool),
}

impl Value {
    /// Clones shareable values; handles are never duplicated.
    pub fn share(&self) -> Option<Value> {
        match self {
            Value::Tensor(tensor) => Some(Value::Tensor(tensor.clone())),
            Value::Path(path) => Some(Value::Path(path.clone())),
            Value::Ack(done) => Some(Value::Ack(*done)),
            Value::Handle(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Path(_) => "path",
            Value::Handle(_) => "handle",
            Value::Ack(_) => "ack",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> OpResult<Tensor> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            other => Err(unexpected("tensor", &other)),
        }
    }

    pub fn into_path(self) -> OpResult<PathBuf> {
        match self {
            Value::Path(path) => Ok(path),
            other => Err(unexpected("path", &other)),
        }
    }

    pub fn into_ack(self) -> OpResult<bool> {
        match self {
            Value::Ack(done) => Ok(done),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub fn into_handle(self) -> OpResult<TransferHandle> {
        match self {
            Value::Handle(handle) => Ok(handle),
            other => Err(unexpected("handle", &other)),
        }
    }

    /// Runtime check that a fed value fits a declared input type.
    pub(crate) fn conforms_to(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (Value::Tensor(tensor), ValueType::Tensor(expected)) => {
                tensor.dtype() == expected.dtype && expected.pattern.admits(tensor.shape())
            }
            (Value::Path(_), ValueType::Path) => true,
            (Value::Ack(_), ValueType::Ack) => true,
            _ => false,
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<PathBuf> for Value {
    fn from(path: PathBuf) -> Self {
        Value::Path(path)
    }
}

impl From<&str> for Value {
    fn from(path: &str) -> Self {
        Value::Path(PathBuf::from(path))
    }
}

fn unexpected(expected: &str, found: &Value) -> OpError {
    OpError::graph(format!(
        "expected a {expected} value, found a {}",
        found.kind_name()
    ))
}

/// Outstanding non-blocking transfer paired with the buffer it refers to.
#[derive(Debug)]
pub enum TransferHandle {
    Send(SendHandle),
    Receive(ReceiveHandle),
}

/// In-flight send; keeps the source tensor alive until the wait completes.
pub struct SendHandle {
    request: Box<dyn PendingRequest<()>>,
    source: Tensor,
    peer: PeerAddress,
}

impl SendHandle {
    pub(crate) fn new(
        request: Box<dyn PendingRequest<()>>,
        source: Tensor,
        peer: PeerAddress,
    ) -> Self {
        Self {
            request,
            source,
            peer,
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Blocks until the send completes, then releases the source buffer.
    pub fn wait(self) -> OpResult<bool> {
        let SendHandle {
            request,
            source,
            peer,
        } = self;
        request.wait()?;
        debug!(%peer, bytes = source.as_bytes().len(), "send completed");
        Ok(true)
    }
}

impl fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendHandle")
            .field("peer", &self.peer)
            .field("dtype", &self.source.dtype())
            .field("shape", &self.source.shape().dims())
            .finish_non_exhaustive()
    }
}

/// In-flight receive; the destination buffer lives inside the request until it completes.
pub struct ReceiveHandle {
    request: Box<dyn PendingRequest<BytesMut>>,
    dtype: DType,
    shape: Shape,
    peer: PeerAddress,
}

impl ReceiveHandle {
    pub(crate) fn new(
        request: Box<dyn PendingRequest<BytesMut>>,
        dtype: DType,
        shape: Shape,
        peer: PeerAddress,
    ) -> Self {
        Self {
            request,
            dtype,
            shape,
            peer,
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Blocks until the receive completes and returns the populated tensor.
    pub fn wait(self) -> OpResult<Tensor> {
        let ReceiveHandle {
            request,
            dtype,
            shape,
            peer,
        } = self;
        let buffer = request.wait()?;
        debug!(%peer, bytes = buffer.len(), "receive completed");
        Tensor::from_bytes(dtype, shape, buffer.freeze())
    }
}

impl fmt::Debug for ReceiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveHandle")
            .field("peer", &self.peer)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape.dims())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conformance_checks_dtype_and_pattern() {
        let tensor = Tensor::from_vec(Shape::new([3, 1]), vec![1.0f32, 2.0, 3.0]).unwrap();
        let value = Value::Tensor(tensor);
        assert!(value.conforms_to(&ValueType::tensor(DType::F32, BroadcastPattern::column())));
        assert!(!value.conforms_to(&ValueType::tensor(DType::F64, BroadcastPattern::column())));
        assert!(!value.conforms_to(&ValueType::tensor(DType::F32, BroadcastPattern::vector())));
        assert!(!value.conforms_to(&ValueType::Path));
    }

    #[test]
    fn accessors_report_kind_mismatches() {
        let err = Value::from("a.npy").into_tensor().unwrap_err();
        assert_eq!(
            err.to_string(),
            "graph error: expected a tensor value, found a path"
        );
        assert!(Value::Ack(true).share().is_some());
    }

    #[test]
    fn value_types_display() {
        let ty = ValueType::Handle(HandleKind::Receive(TensorType::new(
            DType::I64,
            BroadcastPattern::vector(),
        )));
        assert_eq!(ty.to_string(), "handle<recv tensor<int64, (False,)>>");
    }
}
