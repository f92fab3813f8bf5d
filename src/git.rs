use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Context as _;

use crate::error::{is_transient, ErrorKind, ImportError};

const COMMITTER_NAME: &str = "srpmproc";
const COMMITTER_EMAIL: &str = "srpmproc@localhost";

fn run_git(cwd: Option<&Path>, args: &[&str]) -> anyhow::Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    // Keep identity out of ambient config so commits and annotated tags
    // work the same on any machine.
    cmd.arg("-c")
        .arg(format!("user.name={COMMITTER_NAME}"))
        .arg("-c")
        .arg(format!("user.email={COMMITTER_EMAIL}"));
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    let out = cmd.output().with_context(|| format!("git {args:?}"))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        return Err(anyhow::Error::new(
            ImportError::new(
                ErrorKind::GitTransport {
                    transient: stderr_is_transient(&stderr),
                },
                format!(
                    "git {} failed: {}",
                    args.first().unwrap_or(&"?"),
                    stderr.trim()
                ),
            )
            .with_details(serde_json::json!({
                "missing_repository": stderr_is_missing_repo(&stderr),
            })),
        ));
    }

    String::from_utf8(out.stdout).context("decode git output")
}

/// Distinguishes a repository that is not there from auth or
/// connectivity trouble; only the former may be treated as an empty
/// patch source.
fn stderr_is_missing_repo(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "repository not found",
        "does not exist",
        "does not appear to be a git repository",
        "could not be found",
        "no such file or directory",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn stderr_is_transient(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "could not resolve host",
        "connection timed out",
        "connection refused",
        "connection reset",
        "early eof",
        "the remote end hung up",
        "rpc failed",
        "operation timed out",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Retries `op` with bounded backoff while it keeps failing with a
/// transient transport error. Fatal errors surface immediately.
pub fn with_retry<T>(mut op: impl FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(250);
    let mut last = None;
    for attempt in 0..ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) if is_transient(&err) && attempt + 1 < ATTEMPTS => {
                tracing::warn!("transient git failure, retrying: {err:#}");
                std::thread::sleep(delay);
                delay *= 2;
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("retry loop exhausted")))
}

/// Lists remote refs as a ref-name to commit map. An unreachable or
/// missing repository surfaces as a transport error.
pub fn ls_remote(url: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let stdout = run_git(None, &["ls-remote", url])?;
    let mut refs = BTreeMap::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let sha = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if !sha.is_empty() && !name.is_empty() {
            refs.insert(name.to_string(), sha.to_string());
        }
    }
    Ok(refs)
}

pub fn clone(url: &str, to: &Path, branch: Option<&str>) -> anyhow::Result<()> {
    let to_str = to.to_string_lossy();
    let mut args = vec!["clone"];
    if let Some(branch) = branch {
        args.push("--branch");
        args.push(branch);
    }
    args.push(url);
    args.push(&to_str);
    run_git(None, &args)?;
    Ok(())
}

/// Creates a brand-new branch with no parent history. Used when the
/// destination branch does not exist yet.
pub fn checkout_orphan(repo: &Path, branch: &str) -> anyhow::Result<()> {
    run_git(Some(repo), &["checkout", "--orphan", branch])?;
    Ok(())
}

pub fn add_all(repo: &Path) -> anyhow::Result<()> {
    run_git(Some(repo), &["add", "--all"])?;
    Ok(())
}

pub fn is_dirty(repo: &Path) -> anyhow::Result<bool> {
    let status = run_git(Some(repo), &["status", "--porcelain"])?;
    Ok(!status.trim().is_empty())
}

pub fn commit(repo: &Path, message: &str) -> anyhow::Result<String> {
    run_git(Some(repo), &["commit", "-m", message])?;
    head_commit(repo)
}

pub fn head_commit(repo: &Path) -> anyhow::Result<String> {
    Ok(run_git(Some(repo), &["rev-parse", "HEAD"])?.trim().to_string())
}

pub fn tag_annotated(repo: &Path, tag: &str, message: &str) -> anyhow::Result<()> {
    run_git(Some(repo), &["tag", "-a", "-m", message, tag])?;
    Ok(())
}

/// Resolves an existing tag to the commit it points at, peeling
/// annotated tags. `None` when the tag does not exist.
pub fn tag_target(repo: &Path, tag: &str) -> anyhow::Result<Option<String>> {
    let spec = format!("refs/tags/{tag}^{{commit}}");
    let out = Command::new("git")
        .current_dir(repo)
        .args(["rev-parse", "-q", "--verify", &spec])
        .output()
        .context("git rev-parse")?;
    if !out.status.success() {
        return Ok(None);
    }
    let sha = String::from_utf8(out.stdout).context("decode git output")?;
    Ok(Some(sha.trim().to_string()))
}

pub fn push(repo: &Path, refspec: &str) -> anyhow::Result<()> {
    run_git(Some(repo), &["push", "origin", refspec])?;
    Ok(())
}

pub fn apply_patch(repo: &Path, patch: &Path) -> anyhow::Result<()> {
    let patch_str = patch.to_string_lossy();
    run_git(Some(repo), &["apply", &patch_str])
        .with_context(|| format!("apply {}", patch.display()))?;
    Ok(())
}
