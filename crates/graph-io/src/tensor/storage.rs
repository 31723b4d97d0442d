//! Backing storage for host tensors and the scalar element trait used to read it back.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use half::f16;
use memmap2::Mmap;

use super::dtype::DType;

/// Trait describing a scalar that can be decoded from (and encoded into) little-endian storage.
///
/// Implementations tie a Rust type to exactly one [`DType`], which is what keeps typed
/// read-back free of implicit conversion.
pub trait StorageElement: Copy + Send + Sync + 'static {
    /// The dtype this Rust type represents.
    const DTYPE: DType;
    /// Decodes one element from exactly `DTYPE.size_in_bytes()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
    /// Appends the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_storage_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl StorageElement for $ty {
                const DTYPE: DType = $dtype;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_storage_element!(
    i8 => DType::I8,
    i16 => DType::I16,
    i32 => DType::I32,
    i64 => DType::I64,
    u8 => DType::U8,
    u16 => DType::U16,
    u32 => DType::U32,
    u64 => DType::U64,
    f16 => DType::F16,
    f32 => DType::F32,
    f64 => DType::F64,
);

impl StorageElement for bool {
    const DTYPE: DType = DType::Bool;

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
}

/// Raw payload of a host tensor.
///
/// Both variants are immutable and cheap to clone, so a tensor handed to a non-blocking send
/// stays valid until the transfer completes.
#[derive(Clone)]
pub enum TensorData {
    /// Fully materialised bytes.
    Owned(Bytes),
    /// A private copy-on-write mapping of a file; pages are read only when touched.
    Mapped { map: Arc<Mmap>, range: Range<usize> },
}

impl TensorData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::Owned(bytes) => &bytes[..],
            TensorData::Mapped { map, range } => &map[range.clone()],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Owned(bytes) => bytes.len(),
            TensorData::Mapped { range, .. } => range.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, TensorData::Mapped { .. })
    }

    /// Returns the payload as `Bytes`, copying out of the mapping when needed.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            TensorData::Owned(bytes) => bytes.clone(),
            TensorData::Mapped { .. } => Bytes::copy_from_slice(self.as_bytes()),
        }
    }
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorData::Owned(bytes) => f.debug_tuple("Owned").field(&bytes.len()).finish(),
            TensorData::Mapped { range, .. } => {
                f.debug_struct("Mapped").field("range", range).finish()
            }
        }
    }
}
