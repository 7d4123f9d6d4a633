//! Hand-rolled PyTorch checkpoint files for tests: pickle streams built
//! opcode by opcode, wrapped in a stored ZIP.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use tempfile::NamedTempFile;

pub struct PtTensorSpec {
    pub name: String,
    pub storage_type: String,
    pub storage_key: String,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
    pub storage_offset: usize,
    pub numel: usize,
}

/// A plain (non-tensor) pickle value for extra checkpoint fields.
pub enum Scalar<'a> {
    Int(i64),
    Str(&'a str),
    None,
}

pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return vec![];
    }
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

pub fn push_int(p: &mut Vec<u8>, val: usize) {
    if val <= 255 {
        p.push(0x4b); // BININT1
        p.push(val as u8);
    } else if val <= 65535 {
        p.push(0x4d); // BININT2
        p.extend_from_slice(&(val as u16).to_le_bytes());
    } else {
        p.push(0x4a); // BININT
        p.extend_from_slice(&(val as i32).to_le_bytes());
    }
}

pub fn push_int_tuple(p: &mut Vec<u8>, vals: &[usize]) {
    match vals.len() {
        0 => p.push(0x29), // EMPTY_TUPLE
        1 => {
            push_int(p, vals[0]);
            p.push(0x85); // TUPLE1
        }
        2 => {
            push_int(p, vals[0]);
            push_int(p, vals[1]);
            p.push(0x86); // TUPLE2
        }
        3 => {
            push_int(p, vals[0]);
            push_int(p, vals[1]);
            push_int(p, vals[2]);
            p.push(0x87); // TUPLE3
        }
        _ => {
            p.push(0x28); // MARK
            for &v in vals {
                push_int(p, v);
            }
            p.push(0x74); // TUPLE
        }
    }
}

pub fn push_global(p: &mut Vec<u8>, module: &str, name: &str) {
    p.push(0x63); // GLOBAL
    p.extend_from_slice(module.as_bytes());
    p.push(b'\n');
    p.extend_from_slice(name.as_bytes());
    p.push(b'\n');
}

pub fn push_short_binunicode(p: &mut Vec<u8>, s: &str) {
    assert!(s.len() <= 255);
    p.push(0x8c); // SHORT_BINUNICODE
    p.push(s.len() as u8);
    p.extend_from_slice(s.as_bytes());
}

pub fn push_scalar(p: &mut Vec<u8>, value: &Scalar) {
    match value {
        Scalar::Int(v) => {
            p.push(0x4a); // BININT
            p.extend_from_slice(&(*v as i32).to_le_bytes());
        }
        Scalar::Str(s) => push_short_binunicode(p, s),
        Scalar::None => p.push(0x4e), // NONE
    }
}

/// _rebuild_tensor_v2(storage, offset, shape, stride, False, OrderedDict())
pub fn push_tensor(p: &mut Vec<u8>, spec: &PtTensorSpec) {
    push_global(p, "torch._utils", "_rebuild_tensor_v2");

    p.push(0x28); // MARK for args tuple

    // arg0: storage via BINPERSID
    p.push(0x28); // MARK for persistent_id tuple
    push_short_binunicode(p, "storage");
    push_global(p, "torch", &spec.storage_type);
    push_short_binunicode(p, &spec.storage_key);
    push_short_binunicode(p, "cpu");
    push_int(p, spec.numel);
    p.push(0x74); // TUPLE
    p.push(0x51); // BINPERSID

    push_int(p, spec.storage_offset);
    push_int_tuple(p, &spec.shape);
    push_int_tuple(p, &spec.stride);
    p.push(0x89); // NEWFALSE requires_grad

    // OrderedDict() backward hooks
    push_global(p, "collections", "OrderedDict");
    p.push(0x29); // EMPTY_TUPLE
    p.push(0x52); // REDUCE

    p.push(0x74); // TUPLE (closes args)
    p.push(0x52); // REDUCE
}

/// _rebuild_parameter(tensor, True, OrderedDict())
pub fn push_parameter(p: &mut Vec<u8>, spec: &PtTensorSpec) {
    push_global(p, "torch._utils", "_rebuild_parameter");
    p.push(0x28); // MARK
    push_tensor(p, spec);
    p.push(0x88); // NEWTRUE requires_grad
    push_global(p, "collections", "OrderedDict");
    p.push(0x29); // EMPTY_TUPLE
    p.push(0x52); // REDUCE
    p.push(0x74); // TUPLE
    p.push(0x52); // REDUCE
}

/// Legacy _rebuild_tensor(storage, offset, shape): no stride argument.
pub fn push_legacy_tensor(p: &mut Vec<u8>, spec: &PtTensorSpec) {
    push_global(p, "torch._utils", "_rebuild_tensor");
    p.push(0x28); // MARK
    p.push(0x28); // MARK for persistent_id tuple
    push_short_binunicode(p, "storage");
    push_global(p, "torch", &spec.storage_type);
    push_short_binunicode(p, &spec.storage_key);
    push_short_binunicode(p, "cpu");
    push_int(p, spec.numel);
    p.push(0x74); // TUPLE
    p.push(0x51); // BINPERSID
    push_int(p, spec.storage_offset);
    push_int_tuple(p, &spec.shape);
    p.push(0x74); // TUPLE
    p.push(0x52); // REDUCE
}

/// `{name: tensor, ...}` with no wrapper key.
pub fn build_state_dict_pickle(specs: &[PtTensorSpec]) -> Vec<u8> {
    let mut p = vec![0x80, 2]; // PROTO 2
    p.push(0x7d); // EMPTY_DICT
    p.push(0x28); // MARK

    for spec in specs {
        push_short_binunicode(&mut p, &spec.name);
        push_tensor(&mut p, spec);
    }

    p.push(0x75); // SETITEMS
    p.push(0x2e); // STOP
    p
}

/// `{'string_to_param': {'*': tensor}, extras...}`.
pub fn build_embedding_pickle(
    spec: &PtTensorSpec,
    extras: &[(&str, Scalar)],
    as_parameter: bool,
) -> Vec<u8> {
    let mut p = vec![0x80, 2]; // PROTO 2
    p.push(0x7d); // EMPTY_DICT (root)
    p.push(0x28); // MARK

    push_short_binunicode(&mut p, "string_to_param");
    p.push(0x7d); // EMPTY_DICT
    push_short_binunicode(&mut p, "*");
    if as_parameter {
        push_parameter(&mut p, spec);
    } else {
        push_tensor(&mut p, spec);
    }
    p.push(0x73); // SETITEM

    for (key, value) in extras {
        push_short_binunicode(&mut p, key);
        push_scalar(&mut p, value);
    }

    p.push(0x75); // SETITEMS
    p.push(0x2e); // STOP
    p
}

/// `{'state_dict': {name: tensor, ...}, extras...}`.
pub fn build_vae_pickle(specs: &[PtTensorSpec], extras: &[(&str, Scalar)]) -> Vec<u8> {
    let mut p = vec![0x80, 2]; // PROTO 2
    p.push(0x7d); // EMPTY_DICT (root)
    p.push(0x28); // MARK

    push_short_binunicode(&mut p, "state_dict");
    p.push(0x7d); // EMPTY_DICT
    p.push(0x28); // MARK
    for spec in specs {
        push_short_binunicode(&mut p, &spec.name);
        push_tensor(&mut p, spec);
    }
    p.push(0x75); // SETITEMS (inner)

    for (key, value) in extras {
        push_short_binunicode(&mut p, key);
        push_scalar(&mut p, value);
    }

    p.push(0x75); // SETITEMS (root)
    p.push(0x2e); // STOP
    p
}

/// ZIP bytes with the standard `archive/` entry layout.
pub fn build_checkpoint_bytes(pickle: &[u8], storage_data: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    build_checkpoint_bytes_with_layout(pickle, storage_data, "archive/data.pkl", "archive/data/")
}

/// ZIP bytes with a caller-chosen pickle entry name and storage prefix.
pub fn build_checkpoint_bytes_with_layout(
    pickle: &[u8],
    storage_data: &BTreeMap<String, Vec<u8>>,
    pickle_name: &str,
    data_prefix: &str,
) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.start_file(pickle_name, options).unwrap();
    zip.write_all(pickle).unwrap();

    for (key, data) in storage_data {
        zip.start_file(format!("{}{}", data_prefix, key), options)
            .unwrap();
        zip.write_all(data).unwrap();
    }

    zip.finish().unwrap().into_inner()
}

/// Same as [`build_checkpoint_bytes`] but written to a temp file.
pub fn build_checkpoint_file(
    pickle: &[u8],
    storage_data: &BTreeMap<String, Vec<u8>>,
) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&build_checkpoint_bytes(pickle, storage_data))
        .unwrap();
    file.flush().unwrap();
    file
}
