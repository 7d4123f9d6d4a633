use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::Error;

/// Element type of a checkpoint tensor.
///
/// Covers the PyTorch storage classes that appear in the wild. The complex
/// types can be parsed from a checkpoint but have no safetensors
/// representation, so writing them fails with [`Error::UnsupportedDtype`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
    C64,
    C128,
}

impl DType {
    pub fn byte_size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 | DType::C64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::C128 => 16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F64 => "F64",
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::I64 => "I64",
            DType::I32 => "I32",
            DType::I16 => "I16",
            DType::I8 => "I8",
            DType::U8 => "U8",
            DType::Bool => "BOOL",
            DType::C64 => "C64",
            DType::C128 => "C128",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized tensor: contiguous row-major bytes plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl Tensor {
    /// Builds a tensor, checking that the data length matches the dtype and
    /// shape.
    pub fn new(dtype: DType, shape: Vec<u64>, data: Vec<u8>) -> Result<Self, Error> {
        match Self::expected_len(dtype, &shape) {
            Some(expected) if expected == data.len() as u64 => Ok(Self { dtype, shape, data }),
            other => Err(Error::InconsistentDataSize {
                expected: other.unwrap_or(u64::MAX),
                found: data.len() as u64,
            }),
        }
    }

    /// Byte length implied by a dtype and shape, or `None` when the product
    /// overflows.
    pub fn expected_len(dtype: DType, shape: &[u64]) -> Option<u64> {
        shape
            .iter()
            .try_fold(1u64, |n, &dim| n.checked_mul(dim))?
            .checked_mul(dtype.byte_size() as u64)
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Name-to-tensor map that preserves insertion order.
pub type TensorMap = IndexMap<String, Tensor>;

/// The checkpoint layouts the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Textual-inversion embedding: tensor under `string_to_param["*"]`.
    Embedding,
    /// Autoencoder: tensors under `state_dict`, copied verbatim.
    Vae,
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding" => Ok(Variant::Embedding),
            "vae" => Ok(Variant::Vae),
            other => Err(Error::UnsupportedVariant(other.to_string())),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Embedding => f.write_str("embedding"),
            Variant::Vae => f.write_str("vae"),
        }
    }
}

/// Training metadata recovered from a checkpoint, when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingInfo {
    /// Name of the checkpoint the model was trained on.
    pub trained_on: Option<String>,
    /// Number of training steps.
    pub steps: Option<i64>,
}
