//! Point-to-point message transport used by the send/receive operations.
//!
//! A [`Transport`] issues non-blocking sends and receives and hands back
//! [`PendingRequest`] tokens that block only when waited on. The process-wide communication
//! context is an explicit capability: initialisation yields a [`TransportAvailability`], and
//! send/receive nodes can only be built from an available [`TransportContext`].

mod local;

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::error::{OpError, OpResult};
use crate::tensor::DType;

pub use local::{AbortHandle, LocalTransport, LocalWorld};

/// Index of a process within the world.
pub type Rank = usize;
/// Logical channel between a pair of ranks.
pub type Tag = i32;

/// Remote endpoint and logical channel of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    pub rank: Rank,
    pub tag: Tag,
}

impl PeerAddress {
    pub fn new(rank: Rank, tag: Tag) -> Self {
        Self { rank, tag }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {} tag {}", self.rank, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport request with rank {peer} on tag {tag} aborted before completion")]
    Aborted { peer: Rank, tag: Tag },
    #[error(
        "message size mismatch on tag {tag}: \
         receive posted {expected} bytes, message carries {actual}"
    )]
    SizeMismatch {
        tag: Tag,
        expected: usize,
        actual: usize,
    },
    #[error(
        "element type mismatch on tag {tag}: \
         receive expects {expected}, message carries {found}"
    )]
    TypeMismatch {
        tag: Tag,
        expected: DType,
        found: DType,
    },
    #[error("rank {rank} is outside a world of size {size}")]
    InvalidRank { rank: Rank, size: usize },
    #[error("transport failure: {0}")]
    Failed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque token for an outstanding non-blocking request.
pub trait PendingRequest<T>: Send {
    /// Blocks the calling thread until the request completes.
    fn wait(self: Box<Self>) -> TransportResult<T>;
}

/// Non-blocking point-to-point transport.
pub trait Transport: Send + Sync {
    /// Returns a human-readable transport identifier (e.g., `"local"`).
    fn name(&self) -> &str;

    /// Rank of this process.
    fn rank(&self) -> Rank;

    /// Number of ranks in the world.
    fn size(&self) -> usize;

    /// Starts sending `payload` of `dtype` elements to `dest`. The payload stays alive inside
    /// the request until it completes.
    fn begin_send(
        &self,
        payload: Bytes,
        dtype: DType,
        dest: Rank,
        tag: Tag,
    ) -> TransportResult<Box<dyn PendingRequest<()>>>;

    /// Starts receiving `dtype` elements into `buffer`; the filled buffer is returned by `wait`.
    fn begin_receive(
        &self,
        buffer: BytesMut,
        dtype: DType,
        source: Rank,
        tag: Tag,
    ) -> TransportResult<Box<dyn PendingRequest<BytesMut>>>;
}

/// Initialised communication context shared by every send/receive node of a process.
#[derive(Clone)]
pub struct TransportContext {
    transport: Arc<dyn Transport>,
}

impl TransportContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Rejects peers outside the world.
    pub(crate) fn check_peer(&self, peer: Rank) -> OpResult<()> {
        let size = self.size();
        if peer >= size {
            return Err(OpError::config(
                TransportError::InvalidRank { rank: peer, size }.to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("transport", &self.transport.name())
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}

/// Result of transport initialisation.
#[derive(Debug, Clone)]
pub enum TransportAvailability {
    Available(TransportContext),
    Unavailable { reason: String },
}

impl TransportAvailability {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        TransportAvailability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, TransportAvailability::Available(_))
    }

    /// Returns the context, or a configuration error when transfers are disabled.
    pub fn context(&self) -> OpResult<TransportContext> {
        match self {
            TransportAvailability::Available(context) => Ok(context.clone()),
            TransportAvailability::Unavailable { reason } => Err(OpError::config(format!(
                "transfer operations are disabled: {reason}"
            ))),
        }
    }
}

impl From<TransportContext> for TransportAvailability {
    fn from(context: TransportContext) -> Self {
        TransportAvailability::Available(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_transport_is_a_config_error() {
        let availability = TransportAvailability::unavailable("no transport configured");
        assert!(!availability.is_available());
        let err = availability.context().unwrap_err();
        assert!(matches!(err, OpError::Config(msg) if msg.contains("no transport configured")));
    }

    #[test]
    fn context_rejects_out_of_range_peers() {
        let world = LocalWorld::new(2).unwrap();
        let context = world.into_contexts().remove(0);
        assert!(context.check_peer(1).is_ok());
        assert!(matches!(context.check_peer(2), Err(OpError::Config(_))));
    }
}
