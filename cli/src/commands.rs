//! Command handlers for the ptsafe CLI

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use humansize::{DECIMAL, format_size};
use ptsafe::{ArchiveWriter, Checkpoint, Error, TensorMap, TrainingInfo, Variant, extract};

use crate::utils::{create_progress_bar, is_pt_file, safetensors_path};

// ============================================================================
// Conversion Driver
// ============================================================================

/// Convert a single checkpoint file or every checkpoint in a directory
pub fn convert_path(path: &Path, variant: &str, verbose: bool) -> Result<()> {
    let variant = Variant::from_str(variant)?;

    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()).into());
    }
    if path.is_dir() {
        convert_directory(path, variant, verbose)
    } else if path.is_file() && is_pt_file(path) {
        convert_file(path, variant, verbose)
    } else {
        println!("{} is not a valid directory or .pt file.", path.display());
        Ok(())
    }
}

/// Convert every .pt file in a directory, reporting failures without
/// stopping the batch
fn convert_directory(dir: &Path, variant: Variant, verbose: bool) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory '{}'", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_pt_file(path))
        .collect();
    files.sort();

    let pb = create_progress_bar(files.len() as u64)?;
    let mut converted = 0usize;
    let mut failed = 0usize;

    for file in &files {
        pb.set_message(format!("Processing {}", file.display()));
        match convert_file(file, variant, verbose) {
            Ok(()) => converted += 1,
            Err(err) => {
                failed += 1;
                eprintln!("Error converting {}: {}", file.display(), err);
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("Done");
    println!("Converted {} file(s), {} failure(s).", converted, failed);
    Ok(())
}

/// Convert one checkpoint file, writing the output next to it
fn convert_file(path: &Path, variant: Variant, verbose: bool) -> Result<()> {
    if verbose {
        println!("Processing file: {}", path.display());
    }

    let checkpoint = Checkpoint::open(path)?;
    let (tensors, info) = extract(&checkpoint, variant)?;

    if verbose {
        print_training_info(variant, &tensors, &info);
    }

    let output = safetensors_path(path);
    let mut writer = ArchiveWriter::new();
    for (name, tensor) in tensors {
        writer.add(name, tensor)?;
    }
    writer
        .write_file(&output)
        .with_context(|| format!("Failed to write output file '{}'", output.display()))?;
    println!("Saved converted file: {}", output.display());
    Ok(())
}

fn print_training_info(variant: Variant, tensors: &TensorMap, info: &TrainingInfo) {
    if variant == Variant::Embedding {
        match &info.trained_on {
            Some(name) => println!("Trained on {}.", name),
            None => println!("Checkpoint name not found in the model."),
        }
    }

    match info.steps {
        Some(steps) => println!("Trained for {} steps.", steps),
        None => println!("Step not found in the model."),
    }

    if variant == Variant::Embedding {
        if let Some(tensor) = tensors.get("emb_params") {
            println!("Dimensions of embedding tensor: {:?}", tensor.shape);
        }
    }
    println!();
}

// ============================================================================
// Checkpoint Inspection
// ============================================================================

/// Print a table listing every tensor in a checkpoint
pub fn show_info(file: &Path) -> Result<()> {
    let checkpoint = Checkpoint::open(file)
        .with_context(|| format!("Failed to open file '{}'", file.display()))?;
    let named = checkpoint.named_tensors();

    println!("File: {}", file.display());
    println!("Total Tensors: {}", named.len());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["#", "Name", "DType", "Shape", "Size"]);

    let mut total_bytes = 0u64;
    for (i, (name, tensor)) in named.iter().enumerate() {
        let shape_str = if tensor.shape.is_empty() {
            "(scalar)".to_string()
        } else {
            format!(
                "[{}]",
                tensor
                    .shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let numel = tensor.shape.iter().fold(1u64, |n, &d| n.saturating_mul(d));
        let bytes = numel.saturating_mul(tensor.dtype.byte_size() as u64);
        total_bytes = total_bytes.saturating_add(bytes);

        table.add_row(Row::from(vec![
            Cell::new(i),
            Cell::new(name),
            Cell::new(tensor.dtype),
            Cell::new(shape_str),
            Cell::new(format_size(bytes, DECIMAL)),
        ]));
    }

    println!("{}", table);
    println!("Total size: {}", format_size(total_bytes, DECIMAL));
    Ok(())
}
