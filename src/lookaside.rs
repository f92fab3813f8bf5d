use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

use crate::error::ImportError;

/// Blob-store capability for large source files that are referenced
/// from the metadata sidecar instead of committed inline.
pub trait Uploader {
    fn upload(&self, source: &Path, checksum: &str) -> anyhow::Result<()>;
    fn exists(&self, checksum: &str) -> anyhow::Result<bool>;
}

/// Directory-backed lookaside: blobs land under `root/<checksum>`.
#[derive(Debug)]
pub struct DirUploader {
    root: PathBuf,
}

impl DirUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Uploader for DirUploader {
    fn upload(&self, source: &Path, checksum: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| ImportError::upload(format!("create {}: {e}", self.root.display())))?;
        let dest = self.root.join(checksum);
        if dest.exists() {
            tracing::info!("{} already in lookaside, skipping", checksum);
            return Ok(());
        }
        std::fs::copy(source, &dest).map_err(|e| {
            ImportError::upload(format!(
                "upload {} -> {}: {e}",
                source.display(),
                dest.display()
            ))
        })?;
        Ok(())
    }

    fn exists(&self, checksum: &str) -> anyhow::Result<bool> {
        Ok(self.root.join(checksum).exists())
    }
}

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn metadata_path(tree: &Path, package: &str) -> PathBuf {
    tree.join(format!(".{package}.metadata"))
}

/// The `.{package}.checksum` sidecar records the hash of the source
/// archive the package history originated from. Imports carry it over
/// verbatim and report it as provenance; patch actions never touch it.
pub fn checksum_path(tree: &Path, package: &str) -> PathBuf {
    tree.join(format!(".{package}.checksum"))
}

pub fn parse_checksum(path: &Path) -> anyhow::Result<Option<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value.to_string()))
}

/// Parses the `<checksum>  <path>` sidecar lines into a path-to-checksum
/// map. A missing file is an empty map, not an error.
pub fn parse_metadata(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };

    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(checksum), Some(name)) = (parts.next(), parts.next()) else {
            anyhow::bail!("malformed metadata line in {}: {line}", path.display());
        };
        out.insert(name.to_string(), checksum.to_string());
    }
    Ok(out)
}

pub fn write_metadata(path: &Path, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
    let mut out = String::new();
    for (name, checksum) in entries {
        out.push_str(checksum);
        out.push_str("  ");
        out.push_str(name);
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
