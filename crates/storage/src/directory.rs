//! Session directories on a mounted storage root

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info};

use crate::layout::{RawLayout, SessionLayout};
use crate::StorageError;

/// Maximum same-second suffixes tried before giving up
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Storage collaborator used by the recorder
pub trait SessionStorage: Send + Sync {
    /// Create a fresh, empty session directory
    fn create_session_directory(&self) -> Result<SessionLayout, StorageError>;

    /// Create the per-stream directories of a raw multi-stream session
    fn create_raw_layout(
        &self,
        session: &SessionLayout,
        with_depth: bool,
    ) -> Result<RawLayout, StorageError>;
}

/// `flight_YYYYMMDD_HHMMSS` directories under a fixed root
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a session directory named after `now`
    pub fn create_session_directory_at(
        &self,
        now: NaiveDateTime,
    ) -> Result<SessionLayout, StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::RootUnavailable(self.root.clone()));
        }

        let base = format!("flight_{}", now.format("%Y%m%d_%H%M%S"));
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            let dir = self.root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    info!(path = %dir.display(), "Session directory created");
                    return Ok(SessionLayout::new(dir));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} exists, trying next suffix", name);
                }
                Err(source) => {
                    return Err(StorageError::CreateDirectory { path: dir, source });
                }
            }
        }
        Err(StorageError::NameExhausted(base, MAX_NAME_ATTEMPTS))
    }
}

fn create_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::CreateDirectory {
        path: path.to_path_buf(),
        source,
    })
}

impl SessionStorage for DirectoryStorage {
    fn create_session_directory(&self) -> Result<SessionLayout, StorageError> {
        self.create_session_directory_at(Local::now().naive_local())
    }

    fn create_raw_layout(
        &self,
        session: &SessionLayout,
        with_depth: bool,
    ) -> Result<RawLayout, StorageError> {
        let raw = RawLayout::under(session, with_depth);
        create_dir(&raw.left)?;
        create_dir(&raw.right)?;
        if let Some(depth) = &raw.depth {
            create_dir(depth)?;
        }
        info!(
            path = %raw.base.display(),
            depth = with_depth,
            "Raw recording layout created"
        );
        Ok(raw)
    }
}
