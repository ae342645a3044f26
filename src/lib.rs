//! # Unlayer - Docker Image Archive Layer Unpacker
//!
//! A command-line tool that takes the tar archive written by `docker save`
//! and unpacks every layer into its own directory.
//!
//! ## Features
//!
//! - **Layer Discovery**: nested archives are found by member name suffix (`layer.tar`)
//! - **Single-Member Extraction**: only layer members are copied out of the image archive
//! - **Per-Layer Isolation**: a broken layer is reported without stopping the others
//! - **Cleanup**: each nested archive is deleted once its contents are unpacked
//! - **Path Safety**: members that would escape the output directory are refused
//! - **JSON Report**: optional machine-readable summary of the run
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use unlayer::docker::{ImageUnpacker, UnpackOptions};
//!
//! let unpacker = ImageUnpacker::new(UnpackOptions::default());
//! let summary = unpacker.unpack(Path::new("image.tar"), Path::new("image"))?;
//! println!("{} layers unpacked", summary.succeeded());
//! # Ok::<(), unlayer::UnlayerError>(())
//! ```
//!
//! For `image.tar` holding `a1/layer.tar`, the output is `image/a1/layer/`.

/// Command line interface definitions
pub mod cli;
/// Docker image archive unpacking
pub mod docker;
/// Error types and handling
pub mod error;

pub use cli::*;
pub use error::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn test_cli_parsing() {
        use clap::Parser;

        let args = vec![
            "unlayer",
            "unpack",
            "--source", "image.tar",
            "--output", "out",
            "--keep-archives",
            "--verbose"
        ];

        let cli = Cli::try_parse_from(args).unwrap();

        match cli.command {
            Commands::Unpack { source, output, layer_suffix, keep_archives, report, verbose } => {
                assert_eq!(source, PathBuf::from("image.tar"));
                assert_eq!(output.unwrap().to_str().unwrap(), "out");
                assert_eq!(layer_suffix, "layer.tar");
                assert!(keep_archives);
                assert!(report.is_none());
                assert!(verbose);
            }
            _ => panic!("Expected unpack command"),
        }
    }

    #[test]
    fn test_cli_parsing_list() {
        use clap::Parser;

        let args = vec![
            "unlayer",
            "list",
            "--source", "image.tar",
            "--layer-suffix", "fs.tar",
            "--json",
        ];

        let cli = Cli::try_parse_from(args).unwrap();
        assert!(!cli.command.verbose());

        match cli.command {
            Commands::List { source, layer_suffix, json } => {
                assert_eq!(source, PathBuf::from("image.tar"));
                assert_eq!(layer_suffix, "fs.tar");
                assert!(json);
            }
            _ => panic!("Expected list command"),
        }
    }

    #[test]
    fn test_error_types() {
        use std::io;

        // Test error conversion
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let unlayer_error: UnlayerError = io_error.into();

        match unlayer_error {
            UnlayerError::IoError(_) => {}, // Expected
            _ => panic!("Expected IoError"),
        }
    }

    #[test]
    fn test_error_messages() {
        let err = UnlayerError::MissingLayerFile {
            path: PathBuf::from("image/a1/layer.tar"),
        };
        assert_eq!(err.to_string(), "Layer archive not found: image/a1/layer.tar");

        let err = UnlayerError::UnsafeMemberPath("../x/layer.tar".to_string());
        assert!(err.to_string().contains("../x/layer.tar"));
    }

    #[test]
    fn test_default_output_root() {
        assert_eq!(default_output_root(Path::new("image.tar")).unwrap(), PathBuf::from("image"));
        assert_eq!(default_output_root(Path::new("/tmp/test.tar")).unwrap(), PathBuf::from("test"));
        assert_eq!(default_output_root(Path::new("nginx.tar.gz")).unwrap(), PathBuf::from("nginx"));
        assert_eq!(default_output_root(Path::new("nginx.tgz")).unwrap(), PathBuf::from("nginx"));
        assert_eq!(default_output_root(Path::new("image.img")).unwrap(), PathBuf::from("image"));
        // No extension: the source file itself must not become the output root
        assert_eq!(default_output_root(Path::new("busybox")).unwrap(), PathBuf::from("busybox.out"));
        assert_eq!(
            default_output_root(Path::new("/srv/images/busybox")).unwrap(),
            PathBuf::from("busybox.out")
        );
        assert!(default_output_root(Path::new(".tar")).is_err());
        assert!(default_output_root(Path::new("/")).is_err());
    }
}
