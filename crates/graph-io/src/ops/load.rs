//! Graph node that loads an array from a single-array `.npy` file.
//!
//! Non-differentiable. The node checks the stored element type against its configuration but
//! trusts the caller that the stored shape fits the declared broadcastable pattern.

use std::fmt;
use std::path::Path;

use tracing::debug;

use super::value::{TensorType, Value, ValueType};
use super::{expect_arity, Op};
use crate::error::{OpError, OpResult};
use crate::io::{MmapMode, NpyReader};
use crate::tensor::{BroadcastPattern, DType, Tensor};

const ARCHIVE_EXTENSION: &str = "npz";

/// Loads a dense array of a fixed dtype and broadcastable pattern from a path value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadFromDisk {
    dtype: DType,
    pattern: BroadcastPattern,
    mmap_mode: MmapMode,
}

impl LoadFromDisk {
    pub fn new(dtype: DType, pattern: BroadcastPattern, mmap_mode: MmapMode) -> Self {
        Self {
            dtype,
            pattern,
            mmap_mode,
        }
    }

    /// Builds a loader from a textual mmap mode; anything but `None` or `"c"` is rejected.
    pub fn with_mode_str(
        dtype: DType,
        pattern: BroadcastPattern,
        mmap_mode: Option<&str>,
    ) -> OpResult<Self> {
        Ok(Self::new(dtype, pattern, MmapMode::parse(mmap_mode)?))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn pattern(&self) -> &BroadcastPattern {
        &self.pattern
    }

    pub fn mmap_mode(&self) -> MmapMode {
        self.mmap_mode
    }

    pub fn output_type(&self) -> TensorType {
        TensorType::new(self.dtype, self.pattern.clone())
    }

    /// Compute step: reads `path` and validates its element type.
    pub fn load(&self, path: &Path) -> OpResult<Tensor> {
        if is_archive_path(path) {
            return Err(OpError::format(format!(
                "expected a .npy file, got {} instead",
                path.display()
            )));
        }

        let reader = NpyReader::open(path)?;
        let header = reader.header();
        if header.dtype() != Some(self.dtype) {
            return Err(OpError::type_mismatch(self.dtype, header.dtype_name()));
        }

        let tensor = reader.into_tensor(self.mmap_mode)?;
        debug!(
            path = %path.display(),
            dtype = %tensor.dtype(),
            shape = ?tensor.shape().dims(),
            mmap = %self.mmap_mode,
            "loaded array"
        );
        Ok(tensor)
    }
}

impl Op for LoadFromDisk {
    fn output_types(&self, inputs: &[ValueType]) -> OpResult<Vec<ValueType>> {
        expect_arity(self, inputs, 1)?;
        match &inputs[0] {
            ValueType::Path => Ok(vec![ValueType::Tensor(self.output_type())]),
            other => Err(OpError::graph(format!(
                "{self} expects a path input, got {other}"
            ))),
        }
    }

    fn perform(&self, inputs: Vec<Value>) -> OpResult<Vec<Value>> {
        let path = single_input(inputs)?.into_path()?;
        Ok(vec![Value::Tensor(self.load(&path)?)])
    }
}

impl fmt::Display for LoadFromDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Load{{dtype: {}, broadcastable: {}, mmap: {}}}",
            self.dtype, self.pattern, self.mmap_mode
        )
    }
}

/// Matches on the text after the last `.`, so a bare `.npz` file name counts too.
fn is_archive_path(path: &Path) -> bool {
    path.to_string_lossy().rsplit('.').next() == Some(ARCHIVE_EXTENSION)
}

pub(super) fn single_input(inputs: Vec<Value>) -> OpResult<Value> {
    let count = inputs.len();
    let mut inputs = inputs.into_iter();
    match (inputs.next(), inputs.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(OpError::graph(format!("expected one input value, got {count}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_covers_every_field() {
        let base = LoadFromDisk::new(DType::I64, BroadcastPattern::vector(), MmapMode::None);
        assert_eq!(base, base.clone());
        assert_ne!(
            base,
            LoadFromDisk::new(DType::I32, BroadcastPattern::vector(), MmapMode::None)
        );
        assert_ne!(
            base,
            LoadFromDisk::new(DType::I64, BroadcastPattern::matrix(), MmapMode::None)
        );
        assert_ne!(
            base,
            LoadFromDisk::new(DType::I64, BroadcastPattern::vector(), MmapMode::CopyOnWrite)
        );
        let set: HashSet<_> = [base.clone(), base].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn mode_strings_are_validated_at_construction() {
        let build = |mode: Option<&'static str>| {
            LoadFromDisk::with_mode_str(DType::F64, BroadcastPattern::matrix(), mode)
        };
        for mode in [None, Some("c")] {
            assert!(build(mode).is_ok());
        }
        for mode in ["r", "r+", "w+"] {
            let err = build(Some(mode)).unwrap_err();
            assert!(matches!(err, OpError::Config(_)));
        }
    }

    #[test]
    fn only_path_inputs_type_check() {
        let op = LoadFromDisk::new(DType::F32, BroadcastPattern::column(), MmapMode::None);
        let outputs = op.output_types(&[ValueType::Path]).unwrap();
        assert_eq!(
            outputs,
            vec![ValueType::tensor(DType::F32, BroadcastPattern::column())]
        );
        assert!(op.output_types(&[ValueType::Ack]).is_err());
        assert!(op.output_types(&[]).is_err());
    }

    #[test]
    fn archive_extension_is_rejected_before_touching_disk() {
        let op = LoadFromDisk::new(DType::F32, BroadcastPattern::vector(), MmapMode::None);
        let err = op.load(Path::new("/nonexistent/weights.npz")).unwrap_err();
        assert!(matches!(err, OpError::Format(_)));
    }

    #[test]
    fn archive_detection_uses_the_last_dot_component() {
        for archive in ["weights.npz", ".npz", "dir/.npz", "a.b.npz"] {
            assert!(is_archive_path(Path::new(archive)), "{archive}");
        }
        for single in ["weights.npy", "dir.npz/weights.npy", "weights.npz.npy"] {
            assert!(!is_archive_path(Path::new(single)), "{single}");
        }
    }

    #[test]
    fn display_lists_configuration() {
        let op = LoadFromDisk::new(DType::I64, BroadcastPattern::vector(), MmapMode::CopyOnWrite);
        assert_eq!(
            op.to_string(),
            "Load{dtype: int64, broadcastable: (False,), mmap: c}"
        );
    }
}
