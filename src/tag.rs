use std::path::Path;

use crate::error::ImportError;
use crate::git;
use crate::rpm::Nvr;

/// Provenance namespace for an import tag. Plain imports land under
/// `imports/`; runs where at least one patch action mutated the tree
/// land under `patched/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Imports,
    Patched,
}

impl Namespace {
    pub fn from_mutation(any_action_applied: bool) -> Self {
        if any_action_applied {
            Namespace::Patched
        } else {
            Namespace::Imports
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Imports => "imports",
            Namespace::Patched => "patched",
        }
    }
}

pub fn tag_name(namespace: Namespace, branch: &str, nvr: &Nvr) -> String {
    format!("{}/{branch}/{}", namespace.as_str(), nvr.nvr())
}

/// Creates the annotated import tag at `commit`. Re-tagging the same
/// commit is idempotent; a tag already pointing elsewhere aborts the
/// job so history is never rewritten.
pub fn create(repo: &Path, tag: &str, commit: &str, message: &str) -> anyhow::Result<bool> {
    if let Some(existing) = git::tag_target(repo, tag)? {
        if existing == commit {
            tracing::info!("tag {tag} already points at {commit}, nothing to do");
            return Ok(false);
        }
        return Err(ImportError::tag_conflict(tag, &existing, commit));
    }
    git::tag_annotated(repo, tag, message)?;
    Ok(true)
}
