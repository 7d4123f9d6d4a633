//! Safetensors archive writer.
//!
//! Output layout is a little-endian `u64` header length, a compact JSON
//! header space-padded to 8-byte alignment, then the raw tensor bytes
//! concatenated in insertion order. The optional `__metadata__` map is
//! serialized first, so readers that scan the header prefix see it before
//! any tensor entry.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::Error;
use crate::models::{DType, Tensor};

/// Tensor data is aligned to this many bytes by padding the header.
const ALIGNMENT: usize = 8;

#[derive(Serialize)]
struct TensorInfo<'a> {
    dtype: &'static str,
    shape: &'a [u64],
    data_offsets: (u64, u64),
}

#[derive(Serialize)]
struct Header<'a> {
    #[serde(rename = "__metadata__", skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a BTreeMap<String, String>>,
    #[serde(flatten)]
    tensors: IndexMap<&'a str, TensorInfo<'a>>,
}

/// Accumulates named tensors and writes them as a safetensors archive.
///
/// All validation (duplicate names, data sizes, representable dtypes,
/// non-empty tensor set) happens before the first byte is written.
///
/// # Examples
///
/// ```
/// use ptsafe::{ArchiveWriter, DType, Tensor};
///
/// let mut writer = ArchiveWriter::new();
/// writer.add("weight", Tensor::new(DType::F32, vec![2, 2], vec![0u8; 16])?)?;
/// let bytes = writer.serialize()?;
/// assert!(bytes.len() % 8 == 0);
/// # Ok::<(), ptsafe::Error>(())
/// ```
#[derive(Default)]
pub struct ArchiveWriter {
    tensors: IndexMap<String, Tensor>,
    metadata: Option<BTreeMap<String, String>>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named tensor. Names must be unique and the tensor's byte
    /// length must match its dtype and shape.
    pub fn add(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<(), Error> {
        let name = name.into();
        if self.tensors.contains_key(&name) {
            return Err(Error::DuplicateTensor(name));
        }
        match Tensor::expected_len(tensor.dtype, &tensor.shape) {
            Some(expected) if expected == tensor.byte_len() => {}
            other => {
                return Err(Error::InconsistentDataSize {
                    expected: other.unwrap_or(u64::MAX),
                    found: tensor.byte_len(),
                });
            }
        }
        self.tensors.insert(name, tensor);
        Ok(())
    }

    /// Sets the `__metadata__` string map written at the front of the header.
    pub fn set_metadata(&mut self, metadata: BTreeMap<String, String>) {
        self.metadata = Some(metadata);
    }

    /// Serializes the archive into a byte vector.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Writes the archive to any sink.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), Error> {
        let header = self.encode_header()?;
        self.write_payload(&mut writer, &header)
    }

    /// Writes the archive to a file. Nothing is created on disk when the
    /// tensor set does not validate.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let header = self.encode_header()?;
        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(256 * 1024, file);
        self.write_payload(&mut writer, &header)?;
        writer.flush()?;
        Ok(())
    }

    fn encode_header(&self) -> Result<Vec<u8>, Error> {
        if self.tensors.is_empty() {
            return Err(Error::EmptyTensorSet);
        }

        let mut infos = IndexMap::new();
        let mut offset = 0u64;
        for (name, tensor) in &self.tensors {
            let end = offset + tensor.byte_len();
            infos.insert(
                name.as_str(),
                TensorInfo {
                    dtype: dtype_tag(tensor.dtype)?,
                    shape: &tensor.shape,
                    data_offsets: (offset, end),
                },
            );
            offset = end;
        }

        let header = Header {
            metadata: self.metadata.as_ref(),
            tensors: infos,
        };
        let mut bytes = serde_json::to_vec(&header)?;
        let padding = (ALIGNMENT - bytes.len() % ALIGNMENT) % ALIGNMENT;
        bytes.extend(std::iter::repeat(b' ').take(padding));
        Ok(bytes)
    }

    fn write_payload(&self, writer: &mut impl Write, header: &[u8]) -> Result<(), Error> {
        writer.write_all(&(header.len() as u64).to_le_bytes())?;
        writer.write_all(header)?;
        for tensor in self.tensors.values() {
            writer.write_all(&tensor.data)?;
        }
        Ok(())
    }
}

/// Safetensors has no complex dtypes; everything else maps to its own tag.
fn dtype_tag(dtype: DType) -> Result<&'static str, Error> {
    match dtype {
        DType::C64 | DType::C128 => Err(Error::UnsupportedDtype(dtype.as_str().to_string())),
        other => Ok(other.as_str()),
    }
}
