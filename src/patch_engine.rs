use std::collections::BTreeSet;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use regex::Regex;

use crate::error::ImportError;
use crate::fs;
use crate::git;
use crate::lookaside::{self, Uploader};
use crate::patch_config::{
    AddFile, AppendRelease, ApplyPatch, ApplyScript, DeleteFile, DeleteLine, FileKind,
    PatchAction, PatchConfig, ReplaceFile, SearchAndReplace, SpecChangelog,
};
use crate::rpm::{self, DirectiveKind};

#[derive(Debug)]
pub struct ActionRecord {
    pub index: usize,
    pub kind: &'static str,
    pub applied: bool,
}

/// What one engine run did to the tree. Consumed by the tag manager to
/// pick the `patched/` vs `imports/` namespace.
#[derive(Debug, Default)]
pub struct MutationOutcome {
    pub any_action_applied: bool,
    pub files_changed: BTreeSet<PathBuf>,
    pub log: Vec<ActionRecord>,
}

pub struct EngineContext<'a> {
    pub package: &'a str,
    pub patch_dir: Option<&'a Path>,
    pub uploader: Option<&'a dyn Uploader>,
    pub script_timeout: Duration,
}

struct Effect {
    applied: bool,
    files: Vec<PathBuf>,
}

impl Effect {
    fn applied(files: Vec<PathBuf>) -> Self {
        Self {
            applied: true,
            files,
        }
    }

    fn skipped() -> Self {
        Self {
            applied: false,
            files: Vec::new(),
        }
    }
}

/// Executes the ordered action list against the tree. Later actions
/// observe the effects of earlier ones. The first failure aborts the
/// rest of the list; prior mutations are left in place and the caller
/// must not commit the tree.
pub fn apply_actions(
    ctx: &EngineContext<'_>,
    tree: &Path,
    config: &PatchConfig,
) -> anyhow::Result<MutationOutcome> {
    let mut outcome = MutationOutcome::default();

    for (index, action) in config.actions.iter().enumerate() {
        tracing::info!("action {index}: {}", action.kind());
        let effect = execute(ctx, tree, action)
            .map_err(|err| ImportError::patch_apply(index, action.kind(), err))?;

        if effect.applied {
            outcome.any_action_applied = true;
        }
        for file in effect.files {
            let rel = file.strip_prefix(tree).unwrap_or(&file).to_path_buf();
            outcome.files_changed.insert(rel);
        }
        outcome.log.push(ActionRecord {
            index,
            kind: action.kind(),
            applied: effect.applied,
        });
    }

    Ok(outcome)
}

fn execute(ctx: &EngineContext<'_>, tree: &Path, action: &PatchAction) -> anyhow::Result<Effect> {
    match action {
        PatchAction::AppendRelease(a) => append_release(tree, a),
        PatchAction::ApplyPatch(a) => apply_patch(ctx, tree, a),
        PatchAction::ApplyScript(a) => apply_script(ctx, tree, a),
        PatchAction::AddFile(a) => add_file(ctx, tree, a),
        PatchAction::DeleteFile(a) => delete_file(ctx, tree, a),
        PatchAction::DeleteLine(a) => delete_line(tree, a),
        PatchAction::ReplaceFile(a) => replace_file(ctx, tree, a),
        PatchAction::SearchAndReplace(a) => search_and_replace(tree, a),
        PatchAction::SpecChangelog(a) => spec_changelog(tree, a),
    }
}

/// `specfile` resolves to the package's one spec file; a path with a
/// separator is taken relative to the tree root; a bare name is looked
/// up anywhere in the tree and must be unique.
fn resolve_target(tree: &Path, target: &str) -> anyhow::Result<PathBuf> {
    if target == "specfile" {
        return rpm::find_spec_file(tree);
    }
    if target.contains('/') {
        let path = tree.join(target);
        anyhow::ensure!(path.is_file(), "target not found: {target}");
        return Ok(path);
    }
    fs::find_file_by_name(tree, target)
}

fn patch_repo_file(ctx: &EngineContext<'_>, subdir: &str, name: &str) -> anyhow::Result<PathBuf> {
    let dir = ctx
        .patch_dir
        .context("no patch repository checkout available")?;
    let path = dir.join(subdir).join(name);
    anyhow::ensure!(
        path.is_file(),
        "{name} not found under {subdir}/ in the patch repository"
    );
    Ok(path)
}

fn append_release(tree: &Path, a: &AppendRelease) -> anyhow::Result<Effect> {
    if !a.enabled {
        tracing::info!("release modification disabled");
        return Ok(Effect::skipped());
    }

    let spec = rpm::find_spec_file(tree)?;
    let mut lines = fs::read_lines(&spec)?;
    if rpm::uses_autorelease(&lines) {
        tracing::warn!("%autorelease found, skipping release modification");
        return Ok(Effect::skipped());
    }

    let idx = lines
        .iter()
        .position(|l| rpm::is_release_line(l))
        .context("no Release: line found")?;
    lines[idx].push_str(&a.suffix);
    fs::write_lines(&spec, &lines)?;
    Ok(Effect::applied(vec![spec]))
}

fn apply_patch(ctx: &EngineContext<'_>, tree: &Path, a: &ApplyPatch) -> anyhow::Result<Effect> {
    let patch = patch_repo_file(ctx, "files", &a.filename)?;
    git::apply_patch(tree, &patch)?;

    // Carry the patch file alongside the sources and register it so
    // the destination spec records where the change came from.
    let spec = rpm::find_spec_file(tree)?;
    let mut lines = fs::read_lines(&spec)?;
    let next = rpm::directive_indices(&lines, DirectiveKind::Patch)?
        .iter()
        .max()
        .map(|n| n + 1)
        .unwrap_or(0);
    rpm::insert_directive(&mut lines, DirectiveKind::Patch, next, &a.filename)?;

    let carried = tree.join("SOURCES").join(&a.filename);
    fs::copy_file(&patch, &carried)?;
    fs::write_lines(&spec, &lines)?;
    Ok(Effect::applied(vec![spec, carried]))
}

fn apply_script(ctx: &EngineContext<'_>, tree: &Path, a: &ApplyScript) -> anyhow::Result<Effect> {
    let script = patch_repo_file(ctx, "scripts", &a.script)?;
    tracing::info!("running script {}", script.display());

    let mut child = Command::new("/bin/bash")
        .arg(&script)
        .current_dir(tree)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {}", script.display()))?;

    let deadline = Instant::now() + ctx.script_timeout;
    let status = loop {
        if let Some(status) = child.try_wait().context("wait for script")? {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            anyhow::bail!(
                "script {} exceeded the {}s timeout",
                a.script,
                ctx.script_timeout.as_secs()
            );
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).ok();
        }
        anyhow::bail!("script {} failed: {}", a.script, stderr.trim());
    }
    Ok(Effect::applied(Vec::new()))
}

fn add_file(ctx: &EngineContext<'_>, tree: &Path, a: &AddFile) -> anyhow::Result<Effect> {
    let source = patch_repo_file(ctx, "files", &a.name)?;
    let spec = rpm::find_spec_file(tree)?;
    let mut lines = fs::read_lines(&spec)?;
    let mut files = Vec::new();

    let kind = match a.kind {
        FileKind::Patch => DirectiveKind::Patch,
        FileKind::Source => DirectiveKind::Source,
    };

    if a.add_to_spec {
        rpm::insert_directive(&mut lines, kind, a.number, &a.name)?;
        if kind == DirectiveKind::Patch && !rpm::uses_autosetup(&lines) {
            rpm::insert_patch_apply_line(&mut lines, a.number)?;
        }
    }

    if a.upload {
        let uploader = ctx
            .uploader
            .ok_or_else(|| ImportError::upload("no lookaside uploader configured"))?;
        let checksum = lookaside::sha256_file(&source)?;
        uploader.upload(&source, &checksum)?;

        let meta = lookaside::metadata_path(tree, ctx.package);
        let mut entries = lookaside::parse_metadata(&meta)?;
        entries.insert(format!("SOURCES/{}", a.name), checksum);
        lookaside::write_metadata(&meta, &entries)?;
        files.push(meta);
    } else {
        let dest = tree.join("SOURCES").join(&a.name);
        anyhow::ensure!(!dest.exists(), "target exists: {}", a.name);
        fs::copy_file(&source, &dest)?;
        files.push(dest);
    }

    if a.add_to_spec {
        fs::write_lines(&spec, &lines)?;
        files.push(spec);
    }
    Ok(Effect::applied(files))
}

fn delete_file(ctx: &EngineContext<'_>, tree: &Path, a: &DeleteFile) -> anyhow::Result<Effect> {
    let path = tree.join(&a.filename);
    let meta = lookaside::metadata_path(tree, ctx.package);
    let mut entries = lookaside::parse_metadata(&meta)?;
    let mut files = Vec::new();

    let inline = path.is_file();
    let in_metadata = entries.remove(&a.filename).is_some();
    anyhow::ensure!(
        inline || in_metadata,
        "{} not present in tree or metadata",
        a.filename
    );

    if inline {
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        files.push(path.clone());
    }
    if in_metadata {
        lookaside::write_metadata(&meta, &entries)?;
        files.push(meta);
    }

    // Scrub any Source/Patch directive naming the file.
    let base = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| a.filename.clone());
    let spec = rpm::find_spec_file(tree)?;
    let mut lines = fs::read_lines(&spec)?;
    if rpm::remove_file_references(&mut lines, &base) {
        fs::write_lines(&spec, &lines)?;
        files.push(spec);
    }

    Ok(Effect::applied(files))
}

fn delete_line(tree: &Path, a: &DeleteLine) -> anyhow::Result<Effect> {
    let path = resolve_target(tree, &a.target)?;
    let mut lines = fs::read_lines(&path)?;

    for entry in &a.lines {
        let block: Vec<&str> = entry.split('\n').collect();
        let mut removed = 0;
        let mut i = 0;
        while i + block.len() <= lines.len() {
            if lines[i..i + block.len()]
                .iter()
                .zip(&block)
                .all(|(have, want)| have == want)
            {
                lines.drain(i..i + block.len());
                removed += 1;
            } else {
                i += 1;
            }
        }
        anyhow::ensure!(removed > 0, "no lines matching {entry:?} in {}", a.target);
    }

    fs::write_lines(&path, &lines)?;
    Ok(Effect::applied(vec![path]))
}

fn replace_file(ctx: &EngineContext<'_>, tree: &Path, a: &ReplaceFile) -> anyhow::Result<Effect> {
    let source = patch_repo_file(ctx, "files", &a.filename)?;
    let target = tree.join("SOURCES").join(&a.filename);

    if a.upload_to_lookaside {
        let uploader = ctx
            .uploader
            .ok_or_else(|| ImportError::upload("no lookaside uploader configured"))?;
        let meta = lookaside::metadata_path(tree, ctx.package);
        let mut entries = lookaside::parse_metadata(&meta)?;
        let key = format!("SOURCES/{}", a.filename);
        anyhow::ensure!(
            target.is_file() || entries.contains_key(&key),
            "nothing to replace: {}",
            a.filename
        );

        let checksum = lookaside::sha256_file(&source)?;
        uploader.upload(&source, &checksum)?;
        entries.insert(key, checksum);
        lookaside::write_metadata(&meta, &entries)?;

        let mut files = vec![meta];
        if target.is_file() {
            // The replacement lives in the lookaside now; keep the
            // large blob out of the commit.
            std::fs::remove_file(&target)
                .with_context(|| format!("remove {}", target.display()))?;
            files.push(target);
        }
        return Ok(Effect::applied(files));
    }

    anyhow::ensure!(target.is_file(), "target does not exist: {}", a.filename);
    fs::copy_file(&source, &target)?;
    Ok(Effect::applied(vec![target]))
}

fn search_and_replace(tree: &Path, a: &SearchAndReplace) -> anyhow::Result<Effect> {
    let path = resolve_target(tree, &a.target)?;
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

    let updated = if a.regex {
        let re = Regex::new(&a.find).with_context(|| format!("invalid pattern: {}", a.find))?;
        anyhow::ensure!(
            re.is_match(&content),
            "no matches for pattern {:?} in {}",
            a.find,
            a.target
        );
        re.replacen(&content, a.count.unwrap_or(0), a.replace.as_str())
            .to_string()
    } else {
        anyhow::ensure!(
            content.contains(&a.find),
            "no occurrences of {:?} in {}",
            a.find,
            a.target
        );
        match a.count {
            Some(limit) => content.replacen(&a.find, &a.replace, limit),
            None => content.replace(&a.find, &a.replace),
        }
    };

    std::fs::write(&path, updated).with_context(|| format!("write {}", path.display()))?;
    Ok(Effect::applied(vec![path]))
}

fn spec_changelog(tree: &Path, a: &SpecChangelog) -> anyhow::Result<Effect> {
    let spec = rpm::find_spec_file(tree)?;
    let mut lines = fs::read_lines(&spec)?;
    if rpm::uses_autochangelog(&lines) {
        tracing::warn!("%autochangelog found, skipping changelog entry");
        return Ok(Effect::skipped());
    }

    let nvr = rpm::parse_nvr(&spec, "")?;
    let idx = lines
        .iter()
        .position(|l| rpm::is_changelog_line(l))
        .context("no %changelog section found")?;

    let date = chrono::Local::now().format("%a %b %d %Y");
    let mut entry = vec![format!("* {date} {} <{}> - {}", a.name, a.email, nvr.evr())];
    for body in &a.line {
        entry.push(format!("- {body}"));
    }
    // Keep a separator before any existing entries.
    if lines.get(idx + 1).is_some_and(|l| !l.trim().is_empty()) {
        entry.push(String::new());
    }
    lines.splice(idx + 1..idx + 1, entry);

    fs::write_lines(&spec, &lines)?;
    Ok(Effect::applied(vec![spec]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{find_import_error, ErrorKind};
    use crate::lookaside::DirUploader;
    use crate::patch_config::load_patch_config;

    fn ctx<'a>(patch_dir: Option<&'a Path>, uploader: Option<&'a dyn Uploader>) -> EngineContext<'a> {
        EngineContext {
            package: "bash",
            patch_dir,
            uploader,
            script_timeout: Duration::from_secs(5),
        }
    }

    fn write_spec(tree: &Path) -> PathBuf {
        let specs = tree.join("SPECS");
        std::fs::create_dir_all(&specs).expect("mkdir SPECS");
        let spec = specs.join("bash.spec");
        let body = concat!(
            "Name: bash\n",
            "Version: 5.1.8\n",
            "Release: 9%{?dist}\n",
            "Source0: bash-5.1.8.tar.gz\n",
            "Patch0: fix-history.patch\n",
            "\n",
            "%prep\n",
            "%setup -q\n",
            "%patch -P 0 -p1\n",
            "\n",
            "%changelog\n",
            "* Mon Jan 05 2026 Old Maintainer <old@example.org> - 5.1.8-8\n",
            "- previous entry\n",
        );
        std::fs::write(&spec, body).expect("write spec");
        spec
    }

    fn run_one(
        ctx: &EngineContext<'_>,
        tree: &Path,
        yaml: &str,
    ) -> anyhow::Result<MutationOutcome> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.yml"), yaml).expect("write yaml");
        let config = load_patch_config(Some(dir.path()), "r9")?;
        apply_actions(ctx, tree, &config)
    }

    #[test]
    fn search_and_replace_literal_all_and_counted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("notes.txt");
        std::fs::write(&file, "aaa bbb aaa\n")?;

        let outcome = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - search_and_replace:\n      - target: notes.txt\n        find: aaa\n        replace: ccc\n",
        )?;
        assert!(outcome.any_action_applied);
        assert_eq!(std::fs::read_to_string(&file)?, "ccc bbb ccc\n");

        std::fs::write(&file, "aaa bbb aaa\n")?;
        run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - search_and_replace:\n      - target: notes.txt\n        find: aaa\n        replace: ccc\n        count: 1\n",
        )?;
        assert_eq!(std::fs::read_to_string(&file)?, "ccc bbb aaa\n");
        Ok(())
    }

    #[test]
    fn search_and_replace_regex_mode() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("conf"), "port=1234\n")?;

        run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - search_and_replace:\n      - target: conf\n        find: \"port=[0-9]+\"\n        replace: port=80\n        regex: true\n",
        )?;
        assert_eq!(std::fs::read_to_string(tmp.path().join("conf"))?, "port=80\n");
        Ok(())
    }

    #[test]
    fn search_and_replace_without_match_fails_with_action_index() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("f"), "hello\n").expect("write");

        let err = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - search_and_replace:\n      - target: f\n        find: absent\n        replace: x\n",
        )
        .unwrap_err();
        let found = find_import_error(&err).expect("ImportError");
        assert_eq!(found.kind, ErrorKind::PatchApply);
        assert_eq!(found.details.as_ref().unwrap()["action_index"], 0);
        assert_eq!(
            found.details.as_ref().unwrap()["action"],
            "search_and_replace"
        );
    }

    #[test]
    fn delete_line_removes_exact_matches_only() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("list.txt");
        std::fs::write(&file, "a\nb\nc\n")?;

        run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - delete_line:\n      - target: list.txt\n        lines:\n          - b\n",
        )?;
        assert_eq!(std::fs::read_to_string(&file)?, "a\nc\n");
        Ok(())
    }

    #[test]
    fn delete_line_matches_multiline_blocks() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("block.txt");
        std::fs::write(&file, "keep\nfirst\nsecond\ntail\n")?;

        run_one(
            &ctx(None, None),
            tmp.path(),
            concat!(
                "patch:\n",
                "  - delete_line:\n",
                "      - target: block.txt\n",
                "        lines:\n",
                "          - |-\n",
                "            first\n",
                "            second\n",
            ),
        )?;
        assert_eq!(std::fs::read_to_string(&file)?, "keep\ntail\n");
        Ok(())
    }

    #[test]
    fn delete_line_without_match_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("f"), "a\n").expect("write");

        let err = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - delete_line:\n      - target: f\n        lines:\n          - zz\n",
        )
        .unwrap_err();
        assert_eq!(
            find_import_error(&err).expect("ImportError").kind,
            ErrorKind::PatchApply
        );
    }

    #[test]
    fn append_release_edits_the_release_line() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());

        let outcome = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - append_release:\n      - suffix: .myorg\n        enabled: true\n",
        )?;
        assert!(outcome.any_action_applied);
        let body = std::fs::read_to_string(&spec)?;
        assert!(body.contains("Release: 9%{?dist}.myorg"));
        Ok(())
    }

    #[test]
    fn disabled_append_release_counts_as_no_mutation() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_spec(tmp.path());

        let outcome = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - append_release:\n      - suffix: .myorg\n        enabled: false\n",
        )?;
        assert!(!outcome.any_action_applied);
        assert_eq!(outcome.log.len(), 1);
        assert!(!outcome.log[0].applied);
        Ok(())
    }

    #[test]
    fn append_release_skips_autorelease_specs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(
            tmp.path().join("auto.spec"),
            "Name: auto\nVersion: 1\nRelease: %autorelease\n",
        )?;

        let outcome = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - append_release:\n      - suffix: .x\n        enabled: true\n",
        )?;
        assert!(!outcome.any_action_applied);
        Ok(())
    }

    #[test]
    fn add_file_copies_and_registers_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(patch_repo.path().join("files").join("myorg.conf"), "x=1\n")?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - add_file:\n      - type: source\n        name: myorg.conf\n        number: 10\n",
        )?;

        assert!(tmp.path().join("SOURCES").join("myorg.conf").is_file());
        let body = std::fs::read_to_string(&spec)?;
        assert!(body.contains("Source10: myorg.conf"));
        Ok(())
    }

    #[test]
    fn add_file_patch_gets_an_application_line() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(patch_repo.path().join("files").join("more.patch"), "")?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - add_file:\n      - type: patch\n        name: more.patch\n        number: 1\n",
        )?;

        let body = std::fs::read_to_string(&spec)?;
        assert!(body.contains("Patch1: more.patch"));
        assert!(body.contains("%patch -P 1 -p1"));
        Ok(())
    }

    #[test]
    fn add_file_number_collision_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_spec(tmp.path());
        let patch_repo = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(patch_repo.path().join("files")).expect("mkdir");
        std::fs::write(patch_repo.path().join("files").join("dup.patch"), "").expect("write");

        let err = run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - add_file:\n      - type: patch\n        name: dup.patch\n        number: 0\n",
        )
        .unwrap_err();
        assert_eq!(
            find_import_error(&err).expect("ImportError").kind,
            ErrorKind::PatchApply
        );
    }

    #[test]
    fn delete_file_removes_tree_file_and_spec_reference() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());
        std::fs::create_dir_all(tmp.path().join("SOURCES"))?;
        std::fs::write(tmp.path().join("SOURCES").join("fix-history.patch"), "p")?;

        run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - delete_file:\n      - filename: SOURCES/fix-history.patch\n",
        )?;

        assert!(!tmp.path().join("SOURCES").join("fix-history.patch").exists());
        let body = std::fs::read_to_string(&spec)?;
        assert!(!body.contains("Patch0: fix-history.patch"));
        Ok(())
    }

    #[test]
    fn delete_file_missing_everywhere_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_spec(tmp.path());

        let err = run_one(
            &ctx(None, None),
            tmp.path(),
            "patch:\n  - delete_file:\n      - filename: SOURCES/ghost\n",
        )
        .unwrap_err();
        assert_eq!(
            find_import_error(&err).expect("ImportError").kind,
            ErrorKind::PatchApply
        );
    }

    #[test]
    fn replace_file_overwrites_existing_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_spec(tmp.path());
        std::fs::create_dir_all(tmp.path().join("SOURCES"))?;
        std::fs::write(tmp.path().join("SOURCES").join("bashrc"), "old\n")?;
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(patch_repo.path().join("files").join("bashrc"), "new\n")?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - replace_file:\n      - filename: bashrc\n",
        )?;
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("SOURCES").join("bashrc"))?,
            "new\n"
        );
        Ok(())
    }

    #[test]
    fn replace_file_via_lookaside_updates_metadata_and_drops_inline_blob() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_spec(tmp.path());
        std::fs::create_dir_all(tmp.path().join("SOURCES"))?;
        std::fs::write(tmp.path().join("SOURCES").join("big.tar.gz"), "old-blob")?;
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(patch_repo.path().join("files").join("big.tar.gz"), "new-blob")?;
        let store = tempfile::tempdir()?;
        let uploader = DirUploader::new(store.path());

        run_one(
            &ctx(Some(patch_repo.path()), Some(&uploader)),
            tmp.path(),
            "patch:\n  - replace_file:\n      - filename: big.tar.gz\n        upload_to_lookaside: true\n",
        )?;

        assert!(!tmp.path().join("SOURCES").join("big.tar.gz").exists());
        let meta = lookaside::parse_metadata(&lookaside::metadata_path(tmp.path(), "bash"))?;
        let checksum = meta.get("SOURCES/big.tar.gz").expect("metadata entry");
        assert_eq!(
            std::fs::read(store.path().join(checksum))?,
            b"new-blob"
        );
        Ok(())
    }

    #[test]
    fn spec_changelog_prepends_an_entry() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());

        run_one(
            &ctx(None, None),
            tmp.path(),
            concat!(
                "patch:\n",
                "  - spec_changelog:\n",
                "      - name: Release Engineering\n",
                "        email: releng@example.org\n",
                "        line:\n",
                "          - Rebuilt for our distribution\n",
            ),
        )?;

        let lines = fs::read_lines(&spec)?;
        let idx = lines.iter().position(|l| l == "%changelog").expect("%changelog");
        assert!(lines[idx + 1].starts_with("* "));
        assert!(lines[idx + 1].ends_with("Release Engineering <releng@example.org> - 5.1.8-9"));
        assert_eq!(lines[idx + 2], "- Rebuilt for our distribution");
        assert_eq!(lines[idx + 3], "");
        assert!(lines[idx + 4].starts_with("* Mon Jan 05 2026"));
        Ok(())
    }

    #[test]
    fn apply_patch_mutates_tree_and_registers_the_patch() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = write_spec(tmp.path());
        std::fs::write(tmp.path().join("config.ini"), "old\n")?;
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(
            patch_repo.path().join("files").join("update.patch"),
            concat!(
                "--- a/config.ini\n",
                "+++ b/config.ini\n",
                "@@ -1 +1 @@\n",
                "-old\n",
                "+new\n",
            ),
        )?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - apply_patch:\n      - filename: update.patch\n",
        )?;

        assert_eq!(std::fs::read_to_string(tmp.path().join("config.ini"))?, "new\n");
        let body = std::fs::read_to_string(&spec)?;
        assert!(body.contains("Patch1: update.patch"));
        assert!(tmp.path().join("SOURCES").join("update.patch").is_file());
        Ok(())
    }

    #[test]
    fn apply_patch_conflict_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_spec(tmp.path());
        std::fs::write(tmp.path().join("config.ini"), "different\n").expect("write");
        let patch_repo = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(patch_repo.path().join("files")).expect("mkdir");
        std::fs::write(
            patch_repo.path().join("files").join("update.patch"),
            "--- a/config.ini\n+++ b/config.ini\n@@ -1 +1 @@\n-old\n+new\n",
        )
        .expect("write");

        let err = run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - apply_patch:\n      - filename: update.patch\n",
        )
        .unwrap_err();
        assert_eq!(
            find_import_error(&err).expect("ImportError").kind,
            ErrorKind::PatchApply
        );
    }

    #[test]
    fn apply_script_runs_in_the_tree() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("scripts"))?;
        std::fs::write(
            patch_repo.path().join("scripts").join("touch.sh"),
            "echo made-by-script > script-output.txt\n",
        )?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - apply_script:\n      - script: touch.sh\n",
        )?;
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("script-output.txt"))?,
            "made-by-script\n"
        );
        Ok(())
    }

    #[test]
    fn apply_script_failure_fails_the_job() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let patch_repo = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(patch_repo.path().join("scripts")).expect("mkdir");
        std::fs::write(
            patch_repo.path().join("scripts").join("fail.sh"),
            "echo broken >&2\nexit 3\n",
        )
        .expect("write");

        let err = run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            "patch:\n  - apply_script:\n      - script: fail.sh\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
    }

    #[test]
    fn apply_script_timeout_cancels_the_job() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let patch_repo = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(patch_repo.path().join("scripts")).expect("mkdir");
        std::fs::write(patch_repo.path().join("scripts").join("slow.sh"), "sleep 30\n")
            .expect("write");

        let short = EngineContext {
            script_timeout: Duration::from_millis(200),
            ..ctx(Some(patch_repo.path()), None)
        };
        let err = run_one(
            &short,
            tmp.path(),
            "patch:\n  - apply_script:\n      - script: slow.sh\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("timeout"));
    }

    #[test]
    fn failure_aborts_remaining_actions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("f");
        std::fs::write(&file, "one\n").expect("write");

        let err = run_one(
            &ctx(None, None),
            tmp.path(),
            concat!(
                "patch:\n",
                "  - search_and_replace:\n",
                "      - target: f\n",
                "        find: one\n",
                "        replace: two\n",
                "  - delete_line:\n",
                "      - target: f\n",
                "        lines:\n",
                "          - missing\n",
                "  - search_and_replace:\n",
                "      - target: f\n",
                "        find: two\n",
                "        replace: three\n",
            ),
        )
        .unwrap_err();

        // First action ran and is retained; third never ran.
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "two\n");
        let found = find_import_error(&err).expect("ImportError");
        assert_eq!(found.details.as_ref().unwrap()["action_index"], 1);
    }

    #[test]
    fn later_actions_see_earlier_effects() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        write_spec(tmp.path());
        let patch_repo = tempfile::tempdir()?;
        std::fs::create_dir_all(patch_repo.path().join("files"))?;
        std::fs::write(patch_repo.path().join("files").join("added.conf"), "v=0\n")?;

        run_one(
            &ctx(Some(patch_repo.path()), None),
            tmp.path(),
            concat!(
                "patch:\n",
                "  - add_file:\n",
                "      - type: source\n",
                "        name: added.conf\n",
                "        number: 20\n",
                "  - search_and_replace:\n",
                "      - target: added.conf\n",
                "        find: v=0\n",
                "        replace: v=1\n",
            ),
        )?;
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("SOURCES").join("added.conf"))?,
            "v=1\n"
        );
        Ok(())
    }
}
