//! PyTorch checkpoint container reader.
//!
//! A `.pt` checkpoint is a ZIP archive holding a pickle stream with the model
//! structure and raw storage entries with the tensor bytes. [`Checkpoint`]
//! parses the pickle into a [`Value`] graph, loads every referenced storage,
//! and materializes tensor views (offset and strides applied) into contiguous
//! row-major buffers.
//!
//! Opening by path memory-maps the file; [`Checkpoint::from_reader`] works
//! with any `Read + Seek` source.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::Path;

use memmap2::MmapOptions;

use crate::error::Error;
use crate::models::Tensor;
use crate::pickle_vm::{contiguous_strides, parse_pickle, TensorRef, Value};

/// Maximum nesting depth when walking a checkpoint graph.
const MAX_EXTRACT_DEPTH: usize = 128;

/// Maximum byte size of a single materialized tensor (8 GiB).
const MAX_TENSOR_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// A parsed checkpoint: the object graph plus all referenced storage buffers.
pub struct Checkpoint {
    root: Value,
    storages: BTreeMap<String, Vec<u8>>,
}

impl Checkpoint {
    /// Opens a checkpoint file from a path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::PathNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::from_bytes(&mmap)
    }

    /// Parses a checkpoint held in memory.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        Self::from_reader(io::Cursor::new(data))
    }

    /// Parses a checkpoint from any `Read + Seek` source.
    ///
    /// All referenced storage entries are loaded eagerly, so a tensor whose
    /// storage is missing from the container fails here, not at
    /// materialization time.
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, Error> {
        let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
            Error::CorruptCheckpoint(format!("not a valid checkpoint container: {}", e))
        })?;

        let pickle_name = find_pickle_file(&archive)?;
        let root = {
            let mut entry = archive.by_name(&pickle_name).map_err(|e| {
                Error::CorruptCheckpoint(format!("cannot read '{}': {}", pickle_name, e))
            })?;
            parse_pickle(&mut entry)?
        };

        let storage_keys = collect_storage_keys(&root);
        let prefix = find_data_prefix(&archive, &storage_keys);
        let mut storages = BTreeMap::new();
        for key in &storage_keys {
            let storage_path = format!("{}{}", prefix, key);
            let data = read_zip_entry(&mut archive, &storage_path)
                .or_else(|| read_zip_entry(&mut archive, key))
                .ok_or_else(|| {
                    Error::CorruptCheckpoint(format!(
                        "storage '{}' not found in checkpoint container",
                        key
                    ))
                })?;
            storages.insert(key.clone(), data);
        }

        Ok(Self { root, storages })
    }

    /// The root of the parsed object graph.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Copies a tensor view out of its storage into a contiguous row-major
    /// buffer.
    ///
    /// Contiguous views are a single slice copy; anything else (transposes,
    /// expanded or otherwise restrided views) is gathered element by element
    /// or row by row. A view that reaches past the end of its storage fails
    /// with [`Error::StorageBounds`].
    pub fn materialize(&self, tensor: &TensorRef) -> Result<Tensor, Error> {
        if tensor.stride.len() != tensor.shape.len() {
            return Err(Error::CorruptCheckpoint(format!(
                "tensor stride rank {} does not match shape rank {}",
                tensor.stride.len(),
                tensor.shape.len()
            )));
        }
        let storage = self.storages.get(&tensor.storage_key).ok_or_else(|| {
            Error::CorruptCheckpoint(format!(
                "tensor references unknown storage '{}'",
                tensor.storage_key
            ))
        })?;

        let elem = tensor.dtype.byte_size() as u64;
        let numel = checked_numel(&tensor.shape)?;
        if numel == 0 {
            return Tensor::new(tensor.dtype, tensor.shape.clone(), Vec::new());
        }

        let available = storage.len() as u64;

        if numel == 1 || tensor.stride == contiguous_strides(&tensor.shape) {
            let start = tensor
                .storage_offset
                .checked_mul(elem)
                .ok_or_else(overflow)?;
            let needed = numel
                .checked_mul(elem)
                .and_then(|len| start.checked_add(len))
                .ok_or_else(overflow)?;
            if needed > available {
                return Err(Error::StorageBounds {
                    key: tensor.storage_key.clone(),
                    needed,
                    available,
                });
            }
            let data = storage[start as usize..needed as usize].to_vec();
            return Tensor::new(tensor.dtype, tensor.shape.clone(), data);
        }

        // Furthest element the view can touch; past-the-end views must fail
        // rather than alias or truncate.
        let mut max_index = tensor.storage_offset;
        for (&dim, &step) in tensor.shape.iter().zip(&tensor.stride) {
            let span = (dim - 1).checked_mul(step).ok_or_else(overflow)?;
            max_index = max_index.checked_add(span).ok_or_else(overflow)?;
        }
        let needed = max_index
            .checked_add(1)
            .and_then(|n| n.checked_mul(elem))
            .ok_or_else(overflow)?;
        if needed > available {
            return Err(Error::StorageBounds {
                key: tensor.storage_key.clone(),
                needed,
                available,
            });
        }

        // Overlapping views (stride 0) can expand far beyond the storage size
        let out_len = numel.checked_mul(elem).ok_or_else(overflow)?;
        if out_len > MAX_TENSOR_BYTES {
            return Err(Error::CorruptCheckpoint(format!(
                "materialized tensor would be {} bytes, limit is {}",
                out_len, MAX_TENSOR_BYTES
            )));
        }

        let data = gather(
            storage,
            &tensor.shape,
            &tensor.stride,
            tensor.storage_offset,
            elem as usize,
            out_len as usize,
        );
        Tensor::new(tensor.dtype, tensor.shape.clone(), data)
    }

    /// Walks the graph and returns every tensor with a dotted-path name,
    /// in graph order. Depth-limited.
    pub fn named_tensors(&self) -> Vec<(String, &TensorRef)> {
        let mut out = Vec::new();
        collect_tensors("", &self.root, &mut out, 0);
        out
    }
}

fn overflow() -> Error {
    Error::CorruptCheckpoint("tensor geometry overflows a 64-bit byte count".into())
}

fn checked_numel(shape: &[u64]) -> Result<u64, Error> {
    shape
        .iter()
        .try_fold(1u64, |n, &dim| n.checked_mul(dim))
        .ok_or_else(overflow)
}

/// Copies a strided view into a contiguous buffer. Bounds were checked by
/// the caller. Whole rows are copied when the innermost stride is 1.
fn gather(
    storage: &[u8],
    shape: &[u64],
    stride: &[u64],
    offset: u64,
    elem: usize,
    out_len: usize,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(out_len);
    let last = shape.len() - 1;
    let (outer, row_elems, outer_stride) = if stride[last] == 1 {
        (&shape[..last], shape[last] as usize, &stride[..last])
    } else {
        (shape, 1usize, stride)
    };
    let row_len = row_elems * elem;
    let mut index = vec![0u64; outer.len()];

    loop {
        let mut linear = offset;
        for (i, &ix) in index.iter().enumerate() {
            linear += ix * outer_stride[i];
        }
        let start = linear as usize * elem;
        data.extend_from_slice(&storage[start..start + row_len]);

        let mut d = outer.len();
        loop {
            if d == 0 {
                return data;
            }
            d -= 1;
            index[d] += 1;
            if index[d] < outer[d] {
                break;
            }
            index[d] = 0;
        }
    }
}

/// Collects unique, sorted storage keys referenced anywhere in the graph.
fn collect_storage_keys(root: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    let mut work = vec![root];
    while let Some(value) = work.pop() {
        match value {
            Value::Tensor(tensor) => keys.push(tensor.storage_key.clone()),
            Value::Storage(storage) => keys.push(storage.key.clone()),
            Value::List(items) | Value::Tuple(items) => work.extend(items.iter()),
            Value::Dict(pairs) => {
                for (k, v) in pairs {
                    work.push(k);
                    work.push(v);
                }
            }
            _ => {}
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

fn collect_tensors<'a>(
    prefix: &str,
    value: &'a Value,
    out: &mut Vec<(String, &'a TensorRef)>,
    depth: usize,
) {
    if depth > MAX_EXTRACT_DEPTH {
        return;
    }
    match value {
        Value::Tensor(tensor) => out.push((prefix.to_string(), tensor)),
        Value::Dict(pairs) => {
            for (key, value) in pairs {
                let name = match key {
                    Value::Str(s) => join_name(prefix, s),
                    Value::Int(v) => join_name(prefix, &v.to_string()),
                    _ => continue,
                };
                collect_tensors(&name, value, out, depth + 1);
            }
        }
        Value::List(items) | Value::Tuple(items) => {
            for (i, item) in items.iter().enumerate() {
                let name = join_name(prefix, &i.to_string());
                collect_tensors(&name, item, out, depth + 1);
            }
        }
        _ => {}
    }
}

fn join_name(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn read_zip_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Option<Vec<u8>> {
    let mut entry = archive.by_name(name).ok()?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data).ok()?;
    Some(data)
}

fn find_pickle_file<R: Read + Seek>(archive: &zip::ZipArchive<R>) -> Result<String, Error> {
    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(|s| s.to_string()))
        .collect();

    // Common patterns
    for pattern in &["archive/data.pkl", "data.pkl"] {
        if names.iter().any(|n| n == *pattern) {
            return Ok(pattern.to_string());
        }
    }

    // Fall back to any .pkl entry
    for name in &names {
        if name.ends_with(".pkl") {
            return Ok(name.clone());
        }
    }

    Err(Error::CorruptCheckpoint(
        "no pickle entry found in checkpoint container".to_string(),
    ))
}

fn find_data_prefix<R: Read + Seek>(
    archive: &zip::ZipArchive<R>,
    storage_keys: &[String],
) -> String {
    let Some(first_key) = storage_keys.first() else {
        return String::new();
    };

    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(|s| s.to_string()))
        .collect();

    // Try common prefixes
    for prefix in &["archive/data/", "data/", ""] {
        let path = format!("{}{}", prefix, first_key);
        if names.iter().any(|n| n == &path) {
            return prefix.to_string();
        }
    }

    // Dynamic prefix: any entry ending with /<first_key>
    let suffix = format!("/{}", first_key);
    for name in &names {
        if name.ends_with(&suffix) {
            return name[..name.len() - first_key.len()].to_string();
        }
    }

    String::new()
}
