//! Error types for the tiler.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using TilerError.
pub type Result<T> = std::result::Result<T, TilerError>;

/// Main error type for tileset generation.
#[derive(Error, Debug)]
pub enum TilerError {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a specific file.
    #[error("I/O error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse or emit JSON data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to read or re-encode a texture.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Source data that cannot be turned into geometry.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Coordinate reference system the CRS service does not know.
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),

    /// Spool file is truncated or carries an unknown format.
    #[error("Spool error: {0}")]
    Spool(String),

    /// Failed to encode a tile content payload.
    #[error("Export error: {0}")]
    Export(String),

    /// Failed to write the tileset manifest. Always fatal for a run.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The worker pool could not be started.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl TilerError {
    /// Attach a path to an I/O error so logs say which file failed.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TilerError::File {
            path: path.into(),
            source,
        }
    }
}

/// Extension for attaching a path to `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| TilerError::file(path, e))
    }
}
