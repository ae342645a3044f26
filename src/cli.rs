use crate::docker::LAYER_SUFFIX;
use crate::error::{Result, UnlayerError};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "unlayer")]
#[command(about = "Unpack the layers of a saved Docker image archive")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Unpack every layer into its own directory
    Unpack {
        /// Image archive produced by `docker save`
        #[arg(short, long)]
        source: PathBuf,

        /// Output root (defaults to the archive name without its extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Member name suffix identifying nested layer archives
        #[arg(long, default_value = LAYER_SUFFIX)]
        layer_suffix: String,

        /// Keep each layer.tar after unpacking it
        #[arg(short, long)]
        keep_archives: bool,

        /// Write a JSON report of the run to this file
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the layer archives in an image archive without unpacking
    List {
        /// Image archive produced by `docker save`
        #[arg(short, long)]
        source: PathBuf,

        /// Member name suffix identifying nested layer archives
        #[arg(long, default_value = LAYER_SUFFIX)]
        layer_suffix: String,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    pub fn verbose(&self) -> bool {
        match self {
            Commands::Unpack { verbose, .. } => *verbose,
            Commands::List { .. } => false,
        }
    }
}

/// Output root for `source` when none is given: `image.tar` unpacks to `image`.
///
/// A name without an extension gets `.out` appended so the output root
/// never lands on the source file itself.
pub fn default_output_root(source: &Path) -> Result<PathBuf> {
    let file_name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            UnlayerError::InvalidInput(format!(
                "Cannot derive an output directory from {}",
                source.display()
            ))
        })?;

    let stem = [".tar.gz", ".tgz", ".tar"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .or_else(|| Path::new(file_name).file_stem().and_then(|stem| stem.to_str()))
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            UnlayerError::InvalidInput(format!(
                "Cannot derive an output directory from {}",
                source.display()
            ))
        })?;

    if stem == file_name {
        return Ok(PathBuf::from(format!("{}.out", file_name)));
    }
    Ok(PathBuf::from(stem))
}
