//! Host-backed tensor produced by the loader and carried by transfer buffers.

use bytes::Bytes;

use super::{dtype::DType, shape::Shape, storage::StorageElement, storage::TensorData};
use crate::error::{OpError, OpResult};

/// Dense, C-ordered host tensor with an immutable payload.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    data: TensorData,
}

impl Tensor {
    /// Constructs a tensor from typed values, validating the length against the shape.
    pub fn from_vec<T: StorageElement>(shape: Shape, data: Vec<T>) -> OpResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(OpError::graph(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let mut bytes = Vec::with_capacity(data.len() * T::DTYPE.size_in_bytes());
        for value in data {
            value.write_le(&mut bytes);
        }
        Ok(Tensor {
            shape,
            dtype: T::DTYPE,
            data: TensorData::Owned(Bytes::from(bytes)),
        })
    }

    /// Wraps raw little-endian bytes, ensuring the payload matches the expected byte length.
    pub fn from_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> OpResult<Self> {
        let expected = expected_byte_len(dtype, &shape)?;
        if bytes.len() != expected {
            return Err(OpError::graph(format!(
                "tensor byte length {} does not match expected {} for {} {:?}",
                bytes.len(),
                expected,
                dtype,
                shape.dims()
            )));
        }
        Ok(Tensor {
            shape,
            dtype,
            data: TensorData::Owned(bytes),
        })
    }

    /// Wraps an already validated storage region.
    pub(crate) fn from_data(dtype: DType, shape: Shape, data: TensorData) -> OpResult<Self> {
        let expected = expected_byte_len(dtype, &shape)?;
        if data.len() != expected {
            return Err(OpError::format(format!(
                "array payload holds {} bytes, header implies {}",
                data.len(),
                expected
            )));
        }
        Ok(Tensor { shape, dtype, data })
    }

    /// Returns a zero-initialised tensor of the requested dtype and shape.
    pub fn zeros(dtype: DType, shape: Shape) -> OpResult<Self> {
        let len = expected_byte_len(dtype, &shape)?;
        Ok(Tensor {
            shape,
            dtype,
            data: TensorData::Owned(Bytes::from(vec![0u8; len])),
        })
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrows the raw little-endian payload.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Reports whether the payload is a lazily paged file mapping.
    pub fn is_mapped(&self) -> bool {
        self.data.is_mapped()
    }

    /// Decodes the payload into typed values; the element type must match exactly.
    pub fn to_vec<T: StorageElement>(&self) -> OpResult<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(OpError::type_mismatch(T::DTYPE, self.dtype));
        }
        Ok(self
            .as_bytes()
            .chunks_exact(self.dtype.size_in_bytes())
            .map(T::from_le_slice)
            .collect())
    }
}

fn expected_byte_len(dtype: DType, shape: &Shape) -> OpResult<usize> {
    shape
        .checked_num_elements()
        .and_then(|count| count.checked_mul(dtype.size_in_bytes()))
        .ok_or_else(|| OpError::graph(format!("tensor shape {:?} overflows", shape.dims())))
}
