//! Utility functions for the ptsafe CLI

use std::path::{Path, PathBuf};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

/// Create a standard progress bar style
pub fn create_progress_style() -> Result<ProgressStyle> {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .map_err(|e| anyhow::anyhow!("Failed to create progress style: {}", e))
        .map(|s| s.progress_chars("#>-"))
}

/// Create a new progress bar with standard styling
pub fn create_progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(create_progress_style()?);
    Ok(pb)
}

/// True when the path names a `.pt` checkpoint file
pub fn is_pt_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".pt"))
}

/// Output path for a converted checkpoint: same location, `.safetensors`
/// extension
pub fn safetensors_path(input: &Path) -> PathBuf {
    input.with_extension("safetensors")
}
