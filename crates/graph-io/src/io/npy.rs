//! Reader and writer for single-array `.npy` files.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};

use crate::error::{OpError, OpResult};
use crate::tensor::{DType, Shape, Tensor, TensorData};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// How array payloads are brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MmapMode {
    /// Copy the whole payload into memory.
    #[default]
    None,
    /// Map the file privately; pages are read lazily and writes never reach the file.
    CopyOnWrite,
}

impl MmapMode {
    /// Parses an optional mode string; `None` and `"c"` are the only accepted values.
    pub fn parse(mode: Option<&str>) -> OpResult<Self> {
        match mode {
            None => Ok(MmapMode::None),
            Some(mode) => mode.parse(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MmapMode::None => "none",
            MmapMode::CopyOnWrite => "c",
        }
    }
}

impl FromStr for MmapMode {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MmapMode::None),
            "c" | "copy-on-write" => Ok(MmapMode::CopyOnWrite),
            other => Err(OpError::config(format!(
                "the only supported values for mmap_mode are none and 'c', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MmapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded `.npy` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Shape,
}

impl NpyHeader {
    /// Resolves the stored descriptor, if it names a supported native dtype.
    pub fn dtype(&self) -> Option<DType> {
        DType::from_npy_descr(&self.descr)
    }

    /// Human-readable element type, falling back to the raw descriptor.
    pub fn dtype_name(&self) -> String {
        self.dtype()
            .map(|dtype| dtype.name().to_string())
            .unwrap_or_else(|| self.descr.clone())
    }
}

pub struct NpyReader {
    file: File,
    header: NpyHeader,
    data_offset: u64,
}

impl NpyReader {
    pub fn open(path: impl AsRef<Path>) -> OpResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut magic = [0u8; 6];
        read_exact_or_format(&mut file, &mut magic)?;
        if &magic != MAGIC {
            return Err(OpError::format(format!(
                "{} is not an .npy file (bad magic)",
                path.display()
            )));
        }

        let mut version = [0u8; 2];
        read_exact_or_format(&mut file, &mut version)?;
        let header_len = match version[0] {
            1 => read_u16(&mut file)? as usize,
            2 | 3 => read_u32(&mut file)? as usize,
            major => {
                return Err(OpError::format(format!(
                    "unsupported .npy format version {}.{}",
                    major, version[1]
                )))
            }
        };

        let mut header_bytes = vec![0u8; header_len];
        read_exact_or_format(&mut file, &mut header_bytes)?;
        let text = std::str::from_utf8(&header_bytes)
            .map_err(|_| OpError::format("npy header is not valid utf-8"))?;
        let header = parse_header(text)?;
        let data_offset = file.stream_position()?;

        Ok(Self {
            file,
            header,
            data_offset,
        })
    }

    pub fn header(&self) -> &NpyHeader {
        &self.header
    }

    /// Reads the payload as a tensor of the stored dtype.
    ///
    /// Fortran-ordered arrays of rank 2 and up are copied into C order, so they come back owned
    /// even under [`MmapMode::CopyOnWrite`].
    pub fn into_tensor(mut self, mode: MmapMode) -> OpResult<Tensor> {
        let dtype = self.header.dtype().ok_or_else(|| {
            OpError::format(format!("unsupported array descriptor '{}'", self.header.descr))
        })?;
        let shape = self.header.shape.clone();
        let byte_len = shape
            .checked_num_elements()
            .and_then(|count| count.checked_mul(dtype.size_in_bytes()))
            .ok_or_else(|| OpError::format(format!("array shape {:?} overflows", shape.dims())))?;

        let data = match mode {
            MmapMode::None => {
                self.file.seek(SeekFrom::Start(self.data_offset))?;
                let mut raw = vec![0u8; byte_len];
                read_exact_or_format(&mut self.file, &mut raw)?;
                TensorData::Owned(Bytes::from(raw))
            }
            MmapMode::CopyOnWrite => {
                let start = usize::try_from(self.data_offset)
                    .map_err(|_| OpError::format("array data offset out of range"))?;
                let end = start
                    .checked_add(byte_len)
                    .ok_or_else(|| OpError::format("array payload length overflows"))?;
                let file_len = usize::try_from(self.file.metadata()?.len())
                    .map_err(|_| OpError::format("array file too large to map"))?;
                if file_len < end {
                    return Err(OpError::format(format!(
                        "array payload truncated: need {} bytes, file has {}",
                        end, file_len
                    )));
                }
                // SAFETY: the mapping is private, so writes by this process never reach the file;
                // concurrent truncation of the file by another process is outside our control.
                let map = unsafe { MmapOptions::new().map_copy_read_only(&self.file)? };
                TensorData::Mapped {
                    map: Arc::new(map),
                    range: start..end,
                }
            }
        };

        if self.header.fortran_order && shape.rank() > 1 {
            let reordered = fortran_to_c(data.as_bytes(), shape.dims(), dtype.size_in_bytes());
            return Tensor::from_data(dtype, shape, TensorData::Owned(Bytes::from(reordered)));
        }
        Tensor::from_data(dtype, shape, data)
    }
}

/// Rewrites a column-major payload in row-major element order.
fn fortran_to_c(raw: &[u8], dims: &[usize], elem_size: usize) -> Vec<u8> {
    if raw.is_empty() {
        return Vec::new();
    }
    let mut strides = Vec::with_capacity(dims.len());
    let mut stride = elem_size;
    for &dim in dims {
        strides.push(stride);
        stride *= dim;
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut index = vec![0usize; dims.len()];
    for _ in 0..raw.len() / elem_size {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.extend_from_slice(&raw[offset..offset + elem_size]);
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

/// Writes `tensor` as a version 1.0 `.npy` file.
pub fn save_npy(path: impl AsRef<Path>, tensor: &Tensor) -> OpResult<()> {
    let header = format_header(tensor.dtype(), tensor.shape());
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(MAGIC)?;
    let header_len = header.len();
    if let Ok(len) = u16::try_from(header_len) {
        writer.write_all(&[1, 0])?;
        writer.write_all(&len.to_le_bytes())?;
    } else {
        let len = u32::try_from(header_len)
            .map_err(|_| OpError::format("npy header too large"))?;
        writer.write_all(&[2, 0])?;
        writer.write_all(&len.to_le_bytes())?;
    }
    writer.write_all(header.as_bytes())?;
    writer.write_all(tensor.as_bytes())?;
    writer.flush()?;
    Ok(())
}

fn format_header(dtype: DType, shape: &Shape) -> String {
    let dims = match shape.dims() {
        [] => "()".to_string(),
        [single] => format!("({single},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype.npy_descr(),
        dims
    );
    // magic + version + u16 length + header + trailing newline
    let prefix = MAGIC.len() + 2 + 2;
    let unpadded = prefix + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');
    header
}

#[derive(Debug, PartialEq)]
enum HeaderValue {
    Str(String),
    Bool(bool),
    Tuple(Vec<usize>),
}

fn parse_header(text: &str) -> OpResult<NpyHeader> {
    let mut parser = HeaderParser {
        src: text.as_bytes(),
        pos: 0,
    };
    let entries = parser.parse_dict()?;

    let mut descr = None;
    let mut fortran_order = None;
    let mut shape = None;
    for (key, value) in entries {
        match (key.as_str(), value) {
            ("descr", HeaderValue::Str(s)) => descr = Some(s),
            ("fortran_order", HeaderValue::Bool(b)) => fortran_order = Some(b),
            ("shape", HeaderValue::Tuple(dims)) => shape = Some(Shape::new(dims)),
            (key, value) => {
                return Err(OpError::format(format!(
                    "unexpected npy header entry '{key}': {value:?}"
                )))
            }
        }
    }

    Ok(NpyHeader {
        descr: descr.ok_or_else(|| OpError::format("npy header missing 'descr'"))?,
        fortran_order: fortran_order
            .ok_or_else(|| OpError::format("npy header missing 'fortran_order'"))?,
        shape: shape.ok_or_else(|| OpError::format("npy header missing 'shape'"))?,
    })
}

/// Minimal parser for the Python dict literal stored in `.npy` headers.
struct HeaderParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl HeaderParser<'_> {
    fn parse_dict(&mut self) -> OpResult<Vec<(String, HeaderValue)>> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                return Ok(entries);
            }
            let key = self.parse_str()?;
            self.skip_ws();
            self.expect(b':')?;
            let value = self.parse_value()?;
            entries.push((key, value));
            self.skip_ws();
            if !self.eat(b',') {
                self.skip_ws();
                self.expect(b'}')?;
                return Ok(entries);
            }
        }
    }

    fn parse_value(&mut self) -> OpResult<HeaderValue> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'') | Some(b'"') => Ok(HeaderValue::Str(self.parse_str()?)),
            Some(b'(') => self.parse_tuple(),
            Some(b'[') => Err(OpError::format("structured array descriptors are not supported")),
            _ => {
                let rest = &self.src[self.pos..];
                if rest.starts_with(b"True") {
                    self.pos += 4;
                    Ok(HeaderValue::Bool(true))
                } else if rest.starts_with(b"False") {
                    self.pos += 5;
                    Ok(HeaderValue::Bool(false))
                } else {
                    Err(self.error("expected a string, tuple, or boolean"))
                }
            }
        }
    }

    fn parse_tuple(&mut self) -> OpResult<HeaderValue> {
        self.expect(b'(')?;
        let mut dims = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b')') {
                return Ok(HeaderValue::Tuple(dims));
            }
            let start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            let digits = std::str::from_utf8(&self.src[start..self.pos])
                .map_err(|_| self.error("invalid dimension"))?;
            let dim = digits
                .parse::<usize>()
                .map_err(|_| self.error("invalid dimension"))?;
            dims.push(dim);
            // python 2 long suffix
            self.eat(b'L');
            self.skip_ws();
            if !self.eat(b',') {
                self.skip_ws();
                self.expect(b')')?;
                return Ok(HeaderValue::Tuple(dims));
            }
        }
    }

    fn parse_str(&mut self) -> OpResult<String> {
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == quote {
                let value = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(value);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string"))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> OpResult<()> {
        self.skip_ws();
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> OpError {
        OpError::format(format!("malformed npy header at byte {}: {}", self.pos, message))
    }
}

fn read_exact_or_format(reader: &mut impl Read, buf: &mut [u8]) -> OpResult<()> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => OpError::format("unexpected end of .npy file"),
        _ => OpError::Io(err),
    })
}

fn read_u16(reader: &mut impl Read) -> OpResult<u16> {
    let mut buf = [0u8; 2];
    read_exact_or_format(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> OpResult<u32> {
    let mut buf = [0u8; 4];
    read_exact_or_format(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
