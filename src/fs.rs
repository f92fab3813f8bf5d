use std::path::{Path, PathBuf};

use anyhow::Context as _;
use walkdir::WalkDir;

pub fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().components().any(|c| c.as_os_str() == ".git") {
            continue;
        }

        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let dst_path = dst.join(rel);
        copy_file(entry.path(), &dst_path)?;
    }

    Ok(())
}

pub fn copy_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

/// Empties a checked-out repository so an import starts from a clean
/// tree. `.git` is kept.
pub fn remove_everything(repo: &Path) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(repo).with_context(|| format!("read {}", repo.display()))? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("remove {}", path.display()))?;
        } else {
            std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}

pub fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(raw.lines().map(str::to_string).collect())
}

pub fn write_lines(path: &Path, lines: &[String]) -> anyhow::Result<()> {
    let mut out = lines.join("\n");
    out.push('\n');
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Finds exactly one file with the given name anywhere under `root`,
/// ignoring `.git`. More than one match is ambiguous and an error.
pub fn find_file_by_name(root: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let matches = collect_matches(root, |p| {
        p.file_name().is_some_and(|f| f == name)
    })?;
    single_match(matches, root, name)
}

/// Finds exactly one file with the given extension under `root`.
pub fn find_file_by_extension(root: &Path, ext: &str) -> anyhow::Result<PathBuf> {
    let matches = collect_matches(root, |p| {
        p.extension().is_some_and(|e| e == ext)
    })?;
    single_match(matches, root, &format!("*.{ext}"))
}

fn collect_matches(
    root: &Path,
    keep: impl Fn(&Path) -> bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        if keep(entry.path()) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

fn single_match(matches: Vec<PathBuf>, root: &Path, what: &str) -> anyhow::Result<PathBuf> {
    match matches.len() {
        0 => anyhow::bail!("{what} not found in {}", root.display()),
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        n => anyhow::bail!("{n} files named {what} found in {}", root.display()),
    }
}
