//! ptsafe CLI: convert PyTorch checkpoints to safetensors

mod commands;
mod utils;

use clap::CommandFactory;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anyhow::Result;

use commands::{convert_path, show_info};

#[derive(Parser)]
#[command(
    name = "ptsafe",
    version,
    about = "ptsafe CLI: convert PyTorch checkpoints to safetensors",
    long_about = "ptsafe converts PyTorch checkpoint files (.pt) to the safetensors format.\n\nSupported checkpoint variants:\n  - embedding (textual-inversion embeddings)\n  - vae (autoencoder weights)\n\nA single .pt file or a whole directory of .pt files can be converted in one invocation.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a .pt checkpoint file or a directory of them to safetensors
    #[command(
        about = "Convert a .pt checkpoint file or a directory of them to safetensors.",
        long_about = "Convert PyTorch checkpoint files to safetensors.\n\nWhen PATH is a directory, every .pt file inside it is converted; a failure on one file is reported and the rest are still processed. Each output lands next to its input with a .safetensors extension.\n\nExamples:\n  ptsafe convert embedding.pt embedding\n  ptsafe convert ./vae-folder vae --verbose\n"
    )]
    Convert {
        /// Checkpoint file or directory
        #[arg(help = "Path to a .pt checkpoint file or a directory of .pt files")]
        path: PathBuf,
        /// Checkpoint variant: embedding or vae
        #[arg(help = "Checkpoint variant: embedding or vae")]
        variant: String,
        /// Print training metadata while converting
        #[arg(long, help = "Print training metadata for each converted file")]
        verbose: bool,
    },
    /// Show the tensors inside a .pt checkpoint
    #[command(
        about = "Show the tensors inside a .pt checkpoint.",
        long_about = "List every tensor in a PyTorch checkpoint with its dtype, shape, and size, without converting anything.\n\nExample:\n  ptsafe info model.pt\n"
    )]
    Info {
        /// Path to the .pt file
        #[arg(help = "Path to the .pt checkpoint file to inspect")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Convert {
            path,
            variant,
            verbose,
        }) => {
            convert_path(path, variant, *verbose)?;
        }
        Some(Commands::Info { file }) => {
            show_info(file)?;
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
