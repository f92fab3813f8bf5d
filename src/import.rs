use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;

use crate::error::is_missing_repository;
use crate::fs;
use crate::git;
use crate::lookaside::{self, DirUploader, Uploader};
use crate::patch_config;
use crate::patch_engine::{self, EngineContext};
use crate::repo::RepoCoordinates;
use crate::rpm;
use crate::tag::{self, Namespace};
use crate::worktree::WorkingTree;

#[derive(Debug, Clone)]
pub struct ImportJob {
    pub package: String,
    pub release_ver: u32,
    pub source: RepoCoordinates,
    pub dest: RepoCoordinates,
    /// Forge holding per-package patch repositories. A package without
    /// one imports unpatched.
    pub patch: Option<RepoCoordinates>,
    pub source_branch: Option<String>,
    pub dest_branch: Option<String>,
    pub distprefix: String,
    pub distcustom: Option<String>,
    pub script_timeout: Duration,
    pub lookaside_dir: Option<PathBuf>,
}

impl ImportJob {
    pub fn source_branch_name(&self) -> String {
        self.source_branch
            .clone()
            .unwrap_or_else(|| format!("c{}", self.release_ver))
    }

    pub fn dest_branch_name(&self) -> String {
        self.dest_branch
            .clone()
            .unwrap_or_else(|| format!("r{}", self.release_ver))
    }

    /// The dist value substituted into `%{?dist}`, always dot-prefixed.
    pub fn dist(&self) -> String {
        match &self.distcustom {
            Some(d) if d.starts_with('.') => d.clone(),
            Some(d) => format!(".{d}"),
            None => format!(".{}{}", self.distprefix, self.release_ver),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Fetching,
    ConfigLoading,
    Patching,
    Diffing,
    Committing,
    Tagging,
    Done,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Fetching => "fetching",
            JobState::ConfigLoading => "config-loading",
            JobState::Patching => "patching",
            JobState::Diffing => "diffing",
            JobState::Committing => "committing",
            JobState::Tagging => "tagging",
            JobState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub package: String,
    pub branch: String,
    pub nvr: String,
    pub namespace: &'static str,
    pub tag: String,
    pub commit: String,
    pub actions_applied: usize,
    pub no_op: bool,
    /// Hash of the original source archive, carried over from the
    /// upstream tree's checksum sidecar when one exists.
    pub source_checksum: Option<String>,
}

/// Two jobs targeting the same destination branch must not interleave;
/// everything in between is freely concurrent.
fn branch_lock(key: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(key.to_string()).or_default().clone()
}

pub fn run(job: &ImportJob) -> anyhow::Result<ImportReport> {
    let dest_branch = job.dest_branch_name();
    let lock_key = format!(
        "{}/{}/{}@{dest_branch}",
        job.dest.host, job.dest.org, job.package
    );
    let lock = branch_lock(&lock_key);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut state = JobState::Fetching;
    execute(job, &dest_branch, &mut state).map_err(|err| {
        tracing::error!("import of {} failed while {state}: {err:#}", job.package);
        err
    })
}

fn execute(
    job: &ImportJob,
    dest_branch: &str,
    state: &mut JobState,
) -> anyhow::Result<ImportReport> {
    let tree = WorkingTree::new()?;

    // Fetch the upstream branch and the destination history.
    let source_url = job.source.url(&job.package);
    let source_branch = job.source_branch_name();
    tracing::info!("fetching {source_url} branch {source_branch}");
    git::with_retry(|| git::clone(&source_url, &tree.source_dir(), Some(&source_branch)))?;

    let dest_url = job.dest.url(&job.package);
    let dest_refs = git::with_retry(|| git::ls_remote(&dest_url))?;
    let dest_dir = tree.dest_dir();
    if dest_refs.contains_key(&format!("refs/heads/{dest_branch}")) {
        git::with_retry(|| git::clone(&dest_url, &dest_dir, Some(dest_branch)))?;
    } else {
        tracing::info!("destination branch {dest_branch} does not exist yet, bootstrapping");
        git::with_retry(|| git::clone(&dest_url, &dest_dir, None))?;
        git::checkout_orphan(&dest_dir, dest_branch)?;
    }

    let patch_checkout = fetch_patch_repo(job, &tree)?;

    // The destination branch becomes an exact copy of upstream; the
    // patch actions then diverge it. NVR is read before patching so
    // the tag always names the upstream release being imported.
    fs::remove_everything(&dest_dir)?;
    fs::copy_tree(&tree.source_dir(), &dest_dir)?;
    let spec = rpm::find_spec_file(&dest_dir)?;
    let nvr = rpm::parse_nvr(&spec, &job.dist())?;
    let source_checksum =
        lookaside::parse_checksum(&lookaside::checksum_path(&dest_dir, &job.package))?;
    tracing::info!("importing {} to {dest_branch}", nvr.nvr());

    *state = JobState::ConfigLoading;
    let config = patch_config::load_patch_config(patch_checkout.as_deref(), dest_branch)?;

    *state = JobState::Patching;
    let uploader = job.lookaside_dir.as_ref().map(DirUploader::new);
    let ctx = EngineContext {
        package: &job.package,
        patch_dir: patch_checkout.as_deref(),
        uploader: uploader.as_ref().map(|u| u as &dyn Uploader),
        script_timeout: job.script_timeout,
    };
    let outcome = patch_engine::apply_actions(&ctx, &dest_dir, &config)?;
    let actions_applied = outcome.log.iter().filter(|r| r.applied).count();

    *state = JobState::Diffing;
    git::add_all(&dest_dir)?;
    let namespace = Namespace::from_mutation(outcome.any_action_applied);
    let tag_name = tag::tag_name(namespace, dest_branch, &nvr);
    let tag_message = format!("import {}", nvr.nvr());

    if !git::is_dirty(&dest_dir)? {
        // Nothing changed since the last import. Re-runs still make
        // sure the provenance tag made it out.
        tracing::info!("{} already imported on {dest_branch}", nvr.nvr());
        *state = JobState::Tagging;
        let head = git::head_commit(&dest_dir)?;
        if tag::create(&dest_dir, &tag_name, &head, &tag_message)? {
            git::with_retry(|| git::push(&dest_dir, &format!("refs/tags/{tag_name}")))?;
        }
        *state = JobState::Done;
        return Ok(ImportReport {
            package: job.package.clone(),
            branch: dest_branch.to_string(),
            nvr: nvr.nvr(),
            namespace: namespace.as_str(),
            tag: tag_name,
            commit: head,
            actions_applied,
            no_op: true,
            source_checksum,
        });
    }

    *state = JobState::Committing;
    let message = format!(
        "import {}\n\nsource: {source_url} branch {source_branch}\nactions applied: {actions_applied}",
        nvr.nvr()
    );
    let commit = git::commit(&dest_dir, &message)?;

    *state = JobState::Tagging;
    tag::create(&dest_dir, &tag_name, &commit, &tag_message)?;
    git::with_retry(|| git::push(&dest_dir, &format!("HEAD:refs/heads/{dest_branch}")))?;
    git::with_retry(|| git::push(&dest_dir, &format!("refs/tags/{tag_name}")))?;

    *state = JobState::Done;
    tracing::info!("tagged {tag_name} at {commit}");
    Ok(ImportReport {
        package: job.package.clone(),
        branch: dest_branch.to_string(),
        nvr: nvr.nvr(),
        namespace: namespace.as_str(),
        tag: tag_name,
        commit,
        actions_applied,
        no_op: false,
        source_checksum,
    })
}

/// Clones the per-package patch repository when one exists. A forge
/// that has no repository for this package means an empty patch
/// config; any other failure (auth, connectivity, a broken repo)
/// fails the job rather than silently importing unpatched.
fn fetch_patch_repo(job: &ImportJob, tree: &WorkingTree) -> anyhow::Result<Option<PathBuf>> {
    let Some(coords) = &job.patch else {
        return Ok(None);
    };
    let url = coords.url(&job.package);
    match git::with_retry(|| git::ls_remote(&url)) {
        Ok(_) => {
            git::with_retry(|| git::clone(&url, &tree.patch_dir(), None))?;
            Ok(Some(tree.patch_dir()))
        }
        Err(err) if is_missing_repository(&err) => {
            tracing::info!("no patch repository for {}: {err:#}", job.package);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
