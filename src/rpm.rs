use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::fs;

fn macro_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\{(\??)([A-Za-z0-9_]+)\}").expect("macro regex"))
}

pub fn find_spec_file(dir: &Path) -> anyhow::Result<PathBuf> {
    fs::find_file_by_extension(dir, "spec")
}

pub fn is_release_line(line: &str) -> bool {
    line.starts_with("Release:")
}

pub fn is_changelog_line(line: &str) -> bool {
    line.trim() == "%changelog"
}

pub fn uses_autorelease(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|l| l.starts_with("Release:") && l.contains("%autorelease"))
}

pub fn uses_autochangelog(lines: &[String]) -> bool {
    lines.iter().any(|l| l.trim_start().starts_with("%autochangelog"))
}

pub fn uses_autosetup(lines: &[String]) -> bool {
    lines.iter().any(|l| {
        let t = l.trim_start();
        t.starts_with("%autosetup") || t.starts_with("%forgeautosetup") || t.starts_with("%autopatch")
    })
}

/// Name-(Epoch-)Version-Release read straight from a spec file, with
/// simple macro substitution. This is a deliberately small subset of
/// what rpmspec does; packages with exotic macro use need the real
/// tooling upstream of this importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nvr {
    pub name: String,
    pub version: String,
    pub release: String,
    pub epoch: Option<String>,
}

impl Nvr {
    pub fn nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }

    /// `[epoch:]version-release`, the form changelog entries carry.
    pub fn evr(&self) -> String {
        match &self.epoch {
            Some(e) => format!("{e}:{}-{}", self.version, self.release),
            None => format!("{}-{}", self.version, self.release),
        }
    }
}

/// Reads NVR fields from a spec file. `dist` replaces `%{?dist}` /
/// `%{dist}` in the Release value; pass an empty string to strip it.
pub fn parse_nvr(spec_path: &Path, dist: &str) -> anyhow::Result<Nvr> {
    let lines = fs::read_lines(spec_path)?;

    let mut macros: Vec<(String, String)> = Vec::new();
    let mut name = None;
    let mut version = None;
    let mut release = None;
    let mut epoch = None;

    for line in &lines {
        if let Some(rest) = line
            .strip_prefix("%global ")
            .or_else(|| line.strip_prefix("%define "))
        {
            let mut parts = rest.split_whitespace();
            if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                macros.push((k.to_string(), v.to_string()));
            }
            continue;
        }
        capture_field(line, "Name:", &mut name);
        capture_field(line, "Version:", &mut version);
        capture_field(line, "Release:", &mut release);
        capture_field(line, "Epoch:", &mut epoch);
    }

    let name = name.ok_or_else(|| anyhow::anyhow!("no Name: in {}", spec_path.display()))?;
    let version =
        version.ok_or_else(|| anyhow::anyhow!("no Version: in {}", spec_path.display()))?;
    let release =
        release.ok_or_else(|| anyhow::anyhow!("no Release: in {}", spec_path.display()))?;

    macros.push(("name".to_string(), name.clone()));
    macros.push(("version".to_string(), version.clone()));
    macros.push(("dist".to_string(), dist.to_string()));

    Ok(Nvr {
        name: expand_macros(&name, &macros),
        version: expand_macros(&version, &macros),
        release: expand_macros(&release, &macros),
        epoch: epoch.map(|e| expand_macros(&e, &macros)),
    })
}

fn capture_field(line: &str, prefix: &str, slot: &mut Option<String>) {
    if slot.is_none() {
        if let Some(rest) = line.strip_prefix(prefix) {
            *slot = Some(rest.trim().to_string());
        }
    }
}

fn expand_macros(value: &str, macros: &[(String, String)]) -> String {
    let mut out = value.to_string();
    for _ in 0..8 {
        if !out.contains("%{") {
            break;
        }
        let next = macro_re()
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                let optional = &caps[1] == "?";
                let key = &caps[2];
                match macros.iter().rev().find(|(k, _)| k == key) {
                    Some((_, v)) => v.clone(),
                    // Unknown optional macros expand to nothing, the
                    // rpm behavior. Unknown required macros are left
                    // in place for the caller to see.
                    None if optional => String::new(),
                    None => caps[0].to_string(),
                }
            })
            .to_string();
        if next == out {
            break;
        }
        out = next;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Source,
    Patch,
}

impl DirectiveKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            DirectiveKind::Source => "Source",
            DirectiveKind::Patch => "Patch",
        }
    }

    fn line_re(&self) -> anyhow::Result<Regex> {
        Regex::new(&format!(r"^{}([0-9]+):\s*(.+)$", self.prefix()))
            .map_err(|e| anyhow::anyhow!("directive regex: {e}"))
    }
}

/// Numbers already taken by `Source`/`Patch` directives.
pub fn directive_indices(lines: &[String], kind: DirectiveKind) -> anyhow::Result<BTreeSet<u32>> {
    let re = kind.line_re()?;
    let mut out = BTreeSet::new();
    for line in lines {
        if let Some(caps) = re.captures(line) {
            if let Ok(n) = caps[1].parse::<u32>() {
                out.insert(n);
            }
        }
    }
    Ok(out)
}

/// Inserts `Source<n>:`/`Patch<n>:` after the last directive of the
/// same kind, after the last Source for a first Patch, or after the
/// Release line when neither exists.
pub fn insert_directive(
    lines: &mut Vec<String>,
    kind: DirectiveKind,
    number: u32,
    filename: &str,
) -> anyhow::Result<()> {
    let taken = directive_indices(lines, kind)?;
    if taken.contains(&number) {
        anyhow::bail!("{}{number} already exists in spec", kind.prefix());
    }

    let new_line = format!("{}{number}: {filename}", kind.prefix());
    let same_kind = kind.line_re()?;
    let source_kind = DirectiveKind::Source.line_re()?;

    let mut insert_at = None;
    for (i, line) in lines.iter().enumerate() {
        if same_kind.is_match(line) {
            insert_at = Some(i + 1);
        }
    }
    if insert_at.is_none() {
        for (i, line) in lines.iter().enumerate() {
            if source_kind.is_match(line) {
                insert_at = Some(i + 1);
            }
        }
    }
    if insert_at.is_none() {
        insert_at = lines
            .iter()
            .position(|l| is_release_line(l))
            .map(|i| i + 1);
    }

    let at = insert_at
        .ok_or_else(|| anyhow::anyhow!("no position to insert {}{number}", kind.prefix()))?;
    lines.insert(at, new_line);
    Ok(())
}

/// Adds a `%patch -P <n> -p1` application line in `%prep`: after the
/// last existing `%patch` line, or after `%setup` when there is none.
pub fn insert_patch_apply_line(lines: &mut Vec<String>, number: u32) -> anyhow::Result<()> {
    let apply_line = format!("%patch -P {number} -p1");

    let mut last_patch = None;
    let mut setup = None;
    for (i, line) in lines.iter().enumerate() {
        let t = line.trim_start();
        if t.starts_with("%patch") {
            last_patch = Some(i);
        }
        if setup.is_none() && t.starts_with("%setup") {
            setup = Some(i);
        }
    }

    let at = match (last_patch, setup) {
        (Some(i), _) => i + 1,
        (None, Some(i)) => i + 1,
        (None, None) => anyhow::bail!("no %patch or %setup line to anchor the patch application"),
    };
    lines.insert(at, apply_line);
    Ok(())
}

/// Drops `Source<n>:`/`Patch<n>:` lines naming `filename`. Returns
/// whether anything was removed.
pub fn remove_file_references(lines: &mut Vec<String>, filename: &str) -> bool {
    let before = lines.len();
    lines.retain(|line| {
        let is_ref = (line.starts_with("Source") || line.starts_with("Patch"))
            && line.contains(':')
            && line
                .split_once(':')
                .is_some_and(|(_, v)| v.trim() == filename);
        !is_ref
    });
    lines.len() != before
}
