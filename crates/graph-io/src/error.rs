//! Error taxonomy shared by the loader, transfer operations, and graph executor.

use std::io;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by node construction, graph building, and compute steps.
#[derive(Debug, Error)]
pub enum OpError {
    /// Invalid static configuration, raised when a node is constructed.
    #[error("configuration error: {0}")]
    Config(String),
    /// The file on disk is not a single-array file this crate can decode.
    #[error("format error: {0}")]
    Format(String),
    /// The stored element type disagrees with the configured one.
    #[error("expected an array of type {expected}, got {found} instead")]
    TypeMismatch { expected: String, found: String },
    /// A non-blocking request failed or was aborted by the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Ill-typed or ill-ordered graph construction or execution.
    #[error("graph error: {0}")]
    Graph(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl OpError {
    pub fn config(message: impl Into<String>) -> Self {
        OpError::Config(message.into())
    }

    pub fn format(message: impl Into<String>) -> Self {
        OpError::Format(message.into())
    }

    pub fn graph(message: impl Into<String>) -> Self {
        OpError::Graph(message.into())
    }

    pub fn type_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        OpError::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

pub type OpResult<T> = Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mismatch_message_names_both_types() {
        let err = OpError::type_mismatch("float64", "int32");
        assert_eq!(
            err.to_string(),
            "expected an array of type float64, got int32 instead"
        );
    }

    #[test]
    fn transport_errors_convert() {
        let err: OpError = TransportError::Aborted { peer: 1, tag: 3 }.into();
        assert!(matches!(err, OpError::Transport(_)));
    }
}
