use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Scoped working storage for one import job: the upstream checkout,
/// the destination checkout being mutated, and the patch repository.
/// The backing tempdir is removed on drop, on every exit path.
#[derive(Debug)]
pub struct WorkingTree {
    root: tempfile::TempDir,
}

impl WorkingTree {
    pub fn new() -> anyhow::Result<Self> {
        let root = tempfile::tempdir().context("create working tree")?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.path().join("source")
    }

    /// The package directory all patch actions mutate.
    pub fn dest_dir(&self) -> PathBuf {
        self.root.path().join("dest")
    }

    pub fn patch_dir(&self) -> PathBuf {
        self.root.path().join("patch")
    }
}
