//! Disk loading and point-to-point transfer operations for lazy tensor graphs.
//!
//! The crate provides a loader node that reads a single-array `.npy` file into the graph and
//! paired start/wait nodes that move tensors between ranks without blocking until the result
//! is needed. In-flight transfers travel through the graph as move-only handles.

pub mod config;
pub mod error;
pub mod io;
pub mod ops;
pub mod telemetry;
pub mod tensor;
pub mod transport;

pub use config::{TransportBackend, TransportConfig};
pub use error::{OpError, OpResult};
pub use io::MmapMode;
pub use ops::{Graph, GraphBuilder, Op, OpKind, Value, ValueId, ValueType};
pub use tensor::{BroadcastPattern, DType, Shape, Tensor};
pub use transport::{PeerAddress, TransportAvailability, TransportContext};
