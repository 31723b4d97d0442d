//! Core tensor abstractions shared by the loader and the transfer operations.
//!
//! The tensor module defines dtypes, concrete shapes, broadcastable patterns, and the host
//! tensor whose payload is either owned bytes or a copy-on-write file mapping.

pub mod dtype;
mod host_tensor;
pub mod shape;
pub mod storage;

pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::{BroadcastPattern, Shape};
pub use storage::{StorageElement, TensorData};
