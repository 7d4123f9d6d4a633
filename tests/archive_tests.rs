use std::collections::BTreeMap;

use ptsafe::{ArchiveWriter, DType, Error, Tensor};
use safetensors::tensor::SafeTensors;

mod common;
use common::data_generators::*;

fn f32_tensor(shape: Vec<u64>) -> Tensor {
    let numel = shape.iter().product::<u64>() as usize;
    let data = make_f32_data(numel);
    Tensor::new(DType::F32, shape, bytemuck::cast_slice(&data).to_vec()).unwrap()
}

// ----- Round trips -----

#[test]
fn mixed_dtypes_round_trip() {
    let f32_data = make_f32_data(6);
    let f16_data = make_f16_data(4);
    let bf16_data = make_bf16_data(4);
    let i64_data = make_i64_data(3);
    let bool_data = make_bool_data(5);

    let mut writer = ArchiveWriter::new();
    writer
        .add(
            "weights",
            Tensor::new(DType::F32, vec![2, 3], bytemuck::cast_slice(&f32_data).to_vec()).unwrap(),
        )
        .unwrap();
    writer
        .add(
            "halves",
            Tensor::new(DType::F16, vec![4], bytemuck::cast_slice(&f16_data).to_vec()).unwrap(),
        )
        .unwrap();
    writer
        .add(
            "brains",
            Tensor::new(DType::BF16, vec![2, 2], bytemuck::cast_slice(&bf16_data).to_vec())
                .unwrap(),
        )
        .unwrap();
    writer
        .add(
            "counts",
            Tensor::new(DType::I64, vec![3], bytemuck::cast_slice(&i64_data).to_vec()).unwrap(),
        )
        .unwrap();
    writer
        .add("mask", Tensor::new(DType::Bool, vec![5], bool_data.clone()).unwrap())
        .unwrap();

    let bytes = writer.serialize().unwrap();
    let archive = SafeTensors::deserialize(&bytes).unwrap();
    assert_eq!(archive.len(), 5);

    let weights = archive.tensor("weights").unwrap();
    assert_eq!(weights.dtype(), safetensors::tensor::Dtype::F32);
    assert_eq!(weights.shape(), &[2, 3]);
    assert_eq!(weights.data(), bytemuck::cast_slice::<f32, u8>(&f32_data));

    let halves = archive.tensor("halves").unwrap();
    assert_eq!(halves.dtype(), safetensors::tensor::Dtype::F16);
    assert_eq!(halves.data(), bytemuck::cast_slice::<half::f16, u8>(&f16_data));

    let brains = archive.tensor("brains").unwrap();
    assert_eq!(brains.dtype(), safetensors::tensor::Dtype::BF16);
    assert_eq!(brains.data(), bytemuck::cast_slice::<half::bf16, u8>(&bf16_data));

    let counts = archive.tensor("counts").unwrap();
    assert_eq!(counts.dtype(), safetensors::tensor::Dtype::I64);
    assert_eq!(counts.data(), bytemuck::cast_slice::<i64, u8>(&i64_data));

    let mask = archive.tensor("mask").unwrap();
    assert_eq!(mask.dtype(), safetensors::tensor::Dtype::BOOL);
    assert_eq!(mask.data(), bool_data.as_slice());
}

#[test]
fn zero_size_tensor_round_trips() {
    let mut writer = ArchiveWriter::new();
    writer
        .add("empty", Tensor::new(DType::F32, vec![0, 3], Vec::new()).unwrap())
        .unwrap();

    let bytes = writer.serialize().unwrap();
    let archive = SafeTensors::deserialize(&bytes).unwrap();
    let empty = archive.tensor("empty").unwrap();
    assert_eq!(empty.shape(), &[0, 3]);
    assert!(empty.data().is_empty());
}

// ----- Header layout -----

#[test]
fn header_is_eight_byte_aligned() {
    for name_len in 1..=17 {
        let name = "n".repeat(name_len);
        let mut writer = ArchiveWriter::new();
        writer.add(name, f32_tensor(vec![1])).unwrap();

        let bytes = writer.serialize().unwrap();
        let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!((8 + header_len) % 8, 0, "name_len={}", name_len);
        assert_eq!(bytes.len(), 8 + header_len + 4);

        // Trailing pad spaces must not break JSON parsing.
        let header: serde_json::Value =
            serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();
        assert!(header.is_object());
    }
}

#[test]
fn data_offsets_are_contiguous() {
    let u8_data = make_u8_data(5);
    let f64_data = make_f64_data(2);

    let mut writer = ArchiveWriter::new();
    writer.add("first", f32_tensor(vec![3])).unwrap();
    writer
        .add("second", Tensor::new(DType::U8, vec![5], u8_data).unwrap())
        .unwrap();
    writer
        .add(
            "third",
            Tensor::new(DType::F64, vec![2], bytemuck::cast_slice(&f64_data).to_vec()).unwrap(),
        )
        .unwrap();

    let bytes = writer.serialize().unwrap();
    let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    let header: serde_json::Value = serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();

    let mut spans: Vec<(u64, u64)> = ["first", "second", "third"]
        .iter()
        .map(|name| {
            let offsets = header[name]["data_offsets"].as_array().unwrap();
            (offsets[0].as_u64().unwrap(), offsets[1].as_u64().unwrap())
        })
        .collect();
    spans.sort();

    let payload_len = (bytes.len() - 8 - header_len) as u64;
    assert_eq!(spans[0].0, 0);
    assert_eq!(spans[0].1, spans[1].0);
    assert_eq!(spans[1].1, spans[2].0);
    assert_eq!(spans[2].1, payload_len);
}

#[test]
fn metadata_is_written_first() {
    let mut metadata = BTreeMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    metadata.insert("steps".to_string(), "500".to_string());

    let mut writer = ArchiveWriter::new();
    writer.set_metadata(metadata);
    writer.add("weights", f32_tensor(vec![2])).unwrap();

    let bytes = writer.serialize().unwrap();
    let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    let header_text = std::str::from_utf8(&bytes[8..8 + header_len]).unwrap();
    assert!(
        header_text.starts_with("{\"__metadata__\""),
        "header={}",
        header_text
    );

    let header: serde_json::Value = serde_json::from_str(header_text).unwrap();
    assert_eq!(header["__metadata__"]["format"], "pt");
    assert_eq!(header["__metadata__"]["steps"], "500");
}

#[test]
fn insertion_order_is_preserved() {
    let mut writer = ArchiveWriter::new();
    writer.add("beta", f32_tensor(vec![1])).unwrap();
    writer.add("alpha", f32_tensor(vec![1])).unwrap();
    writer.add("gamma", f32_tensor(vec![1])).unwrap();

    let bytes = writer.serialize().unwrap();
    let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    let header_text = std::str::from_utf8(&bytes[8..8 + header_len]).unwrap();

    let beta = header_text.find("\"beta\"").unwrap();
    let alpha = header_text.find("\"alpha\"").unwrap();
    let gamma = header_text.find("\"gamma\"").unwrap();
    assert!(beta < alpha && alpha < gamma, "header={}", header_text);
}

// ----- Files -----

#[test]
fn write_file_matches_serialize() {
    let mut writer = ArchiveWriter::new();
    writer.add("weights", f32_tensor(vec![2, 2])).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.safetensors");
    writer.write_file(&path).unwrap();

    let from_disk = std::fs::read(&path).unwrap();
    assert_eq!(from_disk, writer.serialize().unwrap());
}

#[test]
fn unsupported_dtype_never_touches_disk() {
    let mut writer = ArchiveWriter::new();
    writer
        .add("spectrum", Tensor::new(DType::C64, vec![1], vec![0u8; 8]).unwrap())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.safetensors");
    match writer.write_file(&path) {
        Err(Error::UnsupportedDtype(tag)) => assert_eq!(tag, "C64"),
        other => panic!("Expected UnsupportedDtype, got {:?}", other),
    }
    assert!(!path.exists());
}
