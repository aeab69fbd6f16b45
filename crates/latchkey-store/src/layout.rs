use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

const CODES_FILE: &str = "lock_codes.json";
const FAILURES_FILE: &str = "failed_codes.json";
const LOCK_FILE: &str = ".lock";

/// File layout of a latchkey data directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn codes_file(&self) -> PathBuf {
        self.root.join(CODES_FILE)
    }

    #[inline]
    pub fn failures_file(&self) -> PathBuf {
        self.root.join(FAILURES_FILE)
    }

    /// Exclusive lock held by the running daemon.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
