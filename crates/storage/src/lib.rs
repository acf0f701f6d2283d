//! Storage Layer
//!
//! Creates per-flight session directories under a storage root and names
//! the files inside them. Mounting the removable medium is left to the
//! operating system; the root is expected to exist and be writable.

mod directory;
mod layout;

pub use directory::{DirectoryStorage, SessionStorage};
pub use layout::{segment_file_name, RawLayout, SegmentPaths, SessionLayout};

use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage root not available: {0}")]
    RootUnavailable(PathBuf),
    #[error("Failed to create {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No free session name for {0} after {1} attempts")]
    NameExhausted(String, u32),
}
