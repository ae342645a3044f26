use crate::docker::{MemberKind, UnpackSummary};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnlayerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The archive is missing, empty or not a tar archive.
    #[error("Cannot open archive {}: {source}", path.display())]
    ArchiveOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The image archive opened fine but broke while streaming layer members.
    #[error("Cannot read archive {}: {source}", path.display())]
    ArchiveRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Layer archive not found: {}", path.display())]
    MissingLayerFile { path: PathBuf },

    #[error("Cannot create directory {}: {source}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot remove layer archive {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to unpack layer archive {}: {source}", path.display())]
    LayerExtract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A layer member that is a directory, device or a link with no regular
    /// file behind it inside the image archive.
    #[error("Layer member {member} is a {kind} with no regular file behind it")]
    NotRegularFile { member: String, kind: MemberKind },

    #[error("Unsafe member path in image archive: {0}")]
    UnsafeMemberPath(String),

    #[error("All {} layers failed to unpack", .0.layers.len())]
    AllLayersFailed(Box<UnpackSummary>),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, UnlayerError>;
