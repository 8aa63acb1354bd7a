//! Dense, row-major tensors shared by the eager backend, the tracer and the
//! graph runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I64,
    I8,
    U8,
}

impl DType {
    /// Size of one element in bytes
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I64 => 8,
            DType::I8 | DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::I8 => "i8",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("shape {shape:?} needs {expected} elements, got {found}")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
    #[error("expected a {expected} tensor, found {found}")]
    DTypeMismatch { expected: DType, found: DType },
    #[error("{len} bytes is not a whole number of {dtype} elements")]
    ByteLength { dtype: DType, len: usize },
}

/// Typed element storage.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Tensor { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(shape, TensorData::F32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self, TensorError> {
        Self::new(shape, TensorData::I64(data))
    }

    pub fn from_i8(shape: Vec<usize>, data: Vec<i8>) -> Result<Self, TensorError> {
        Self::new(shape, TensorData::I8(data))
    }

    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self, TensorError> {
        Self::new(shape, TensorData::U8(data))
    }

    /// Rank-0 f32 tensor
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::F32(vec![value]),
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Tensor {
            shape,
            data: TensorData::F32(vec![0.0; n]),
        }
    }

    /// f32 tensor whose element `i` (row-major) is `f(i)`.
    #[must_use]
    pub fn from_fn(shape: Vec<usize>, f: impl FnMut(usize) -> f32) -> Self {
        let n = shape.iter().product();
        Tensor {
            shape,
            data: TensorData::F32((0..n).map(f).collect()),
        }
    }

    #[inline]
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Number of elements
    #[inline]
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the element payload in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.numel() * self.dtype().size()
    }

    pub fn as_f32(&self) -> Result<&[f32], TensorError> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32,
                found: other.dtype(),
            }),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64], TensorError> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::I64,
                found: other.dtype(),
            }),
        }
    }

    /// Same data under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::new(shape, self.data)
    }

    /// Element payload as little-endian bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I8(v) => bytemuck::cast_slice::<i8, u8>(v.as_slice()).to_vec(),
            TensorData::U8(v) => v.clone(),
        }
    }

    /// Rebuild a tensor from little-endian bytes (any alignment).
    pub fn from_le_bytes(dtype: DType, shape: Vec<usize>, bytes: &[u8]) -> Result<Self, TensorError> {
        if bytes.len() % dtype.size() != 0 {
            return Err(TensorError::ByteLength {
                dtype,
                len: bytes.len(),
            });
        }
        let data = match dtype {
            DType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::I64 => TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(c);
                        i64::from_le_bytes(buf)
                    })
                    .collect(),
            ),
            DType::I8 => TensorData::I8(bytemuck::cast_slice::<u8, i8>(bytes).to_vec()),
            DType::U8 => TensorData::U8(bytes.to_vec()),
        };
        Self::new(shape, data)
    }

    /// Rows `start..end` along axis 0.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self, TensorError> {
        let row: usize = self.shape.iter().skip(1).product();
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = end - start;
        }
        let (a, b) = (start * row, end * row);
        let data = match &self.data {
            TensorData::F32(v) => TensorData::F32(v[a..b].to_vec()),
            TensorData::I64(v) => TensorData::I64(v[a..b].to_vec()),
            TensorData::I8(v) => TensorData::I8(v[a..b].to_vec()),
            TensorData::U8(v) => TensorData::U8(v[a..b].to_vec()),
        };
        Self::new(shape, data)
    }
}

impl From<Vec<i64>> for Tensor {
    /// 1-D id tensor
    fn from(ids: Vec<i64>) -> Self {
        Tensor {
            shape: vec![ids.len()],
            data: TensorData::I64(ids),
        }
    }
}
