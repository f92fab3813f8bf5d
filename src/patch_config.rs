use std::path::Path;

use serde::Deserialize;

use crate::error::ImportError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Patch,
    Source,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppendRelease {
    pub suffix: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplyPatch {
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApplyScript {
    pub script: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AddFile {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub name: String,
    pub number: u32,
    #[serde(default = "default_true")]
    pub add_to_spec: bool,
    #[serde(default)]
    pub upload: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeleteFile {
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeleteLine {
    pub target: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplaceFile {
    pub filename: String,
    #[serde(default)]
    pub upload_to_lookaside: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SearchAndReplace {
    pub target: String,
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SpecChangelog {
    pub name: String,
    pub email: String,
    pub line: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    AppendRelease(AppendRelease),
    ApplyPatch(ApplyPatch),
    ApplyScript(ApplyScript),
    AddFile(AddFile),
    DeleteFile(DeleteFile),
    DeleteLine(DeleteLine),
    ReplaceFile(ReplaceFile),
    SearchAndReplace(SearchAndReplace),
    SpecChangelog(SpecChangelog),
}

impl PatchAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PatchAction::AppendRelease(_) => "append_release",
            PatchAction::ApplyPatch(_) => "apply_patch",
            PatchAction::ApplyScript(_) => "apply_script",
            PatchAction::AddFile(_) => "add_file",
            PatchAction::DeleteFile(_) => "delete_file",
            PatchAction::DeleteLine(_) => "delete_line",
            PatchAction::ReplaceFile(_) => "replace_file",
            PatchAction::SearchAndReplace(_) => "search_and_replace",
            PatchAction::SpecChangelog(_) => "spec_changelog",
        }
    }

    fn validate(&self) -> Result<(), String> {
        fn non_empty(field: &str, value: &str) -> Result<(), String> {
            if value.is_empty() {
                return Err(format!("{field} cannot be empty"));
            }
            Ok(())
        }

        match self {
            PatchAction::AppendRelease(a) => non_empty("suffix", &a.suffix),
            PatchAction::ApplyPatch(a) => non_empty("filename", &a.filename),
            PatchAction::ApplyScript(a) => non_empty("script", &a.script),
            PatchAction::AddFile(a) => {
                non_empty("name", &a.name)?;
                if a.upload && a.kind == FileKind::Patch {
                    return Err("upload applies only to source files".to_string());
                }
                Ok(())
            }
            PatchAction::DeleteFile(a) => non_empty("filename", &a.filename),
            PatchAction::DeleteLine(a) => {
                non_empty("target", &a.target)?;
                if a.lines.is_empty() {
                    return Err("lines cannot be empty".to_string());
                }
                Ok(())
            }
            PatchAction::ReplaceFile(a) => non_empty("filename", &a.filename),
            PatchAction::SearchAndReplace(a) => {
                non_empty("target", &a.target)?;
                non_empty("find", &a.find)
            }
            PatchAction::SpecChangelog(a) => {
                non_empty("name", &a.name)?;
                non_empty("email", &a.email)?;
                if a.line.is_empty() {
                    return Err("line cannot be empty".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Parses one `patch:` list entry payload: the entry's single key
/// names the action kind, its value is the list of invocations.
/// serde_yaml's `from_value` cannot dispatch an externally-tagged enum
/// from a plain mapping, so the key is matched by hand.
fn parse_group(kind: &str, value: &serde_yaml::Value) -> Result<Vec<PatchAction>, String> {
    fn list<T>(value: &serde_yaml::Value, wrap: fn(T) -> PatchAction) -> Result<Vec<PatchAction>, String>
    where
        T: serde::de::DeserializeOwned,
    {
        let items: Vec<T> = serde_yaml::from_value(value.clone()).map_err(|e| e.to_string())?;
        Ok(items.into_iter().map(wrap).collect())
    }

    match kind {
        "append_release" => list(value, PatchAction::AppendRelease),
        "apply_patch" => list(value, PatchAction::ApplyPatch),
        "apply_script" => list(value, PatchAction::ApplyScript),
        "add_file" => list(value, PatchAction::AddFile),
        "delete_file" => list(value, PatchAction::DeleteFile),
        "delete_line" => list(value, PatchAction::DeleteLine),
        "replace_file" => list(value, PatchAction::ReplaceFile),
        "search_and_replace" => list(value, PatchAction::SearchAndReplace),
        "spec_changelog" => list(value, PatchAction::SpecChangelog),
        other => Err(format!("unknown action kind: {other}")),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchConfig {
    pub actions: Vec<PatchAction>,
}

impl PatchConfig {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Loads the layered patch configuration for one package/branch.
///
/// `main.yml` applies first. `<branch>.yml` follows when present;
/// its mere presence suppresses the `package.yml` fallback even if it
/// contributes no actions. Any invalid entry fails the whole load.
pub fn load_patch_config(patch_dir: Option<&Path>, branch: &str) -> anyhow::Result<PatchConfig> {
    let Some(dir) = patch_dir else {
        return Ok(PatchConfig::default());
    };

    let mut actions = Vec::new();

    let main = dir.join("main.yml");
    if main.exists() {
        tracing::info!("patch config: {}", main.display());
        load_file(&main, &mut actions)?;
    }

    let branch_file = dir.join(format!("{branch}.yml"));
    if branch_file.exists() {
        tracing::info!("patch config: {}", branch_file.display());
        load_file(&branch_file, &mut actions)?;
    } else {
        let package = dir.join("package.yml");
        if package.exists() {
            tracing::info!("patch config: {}", package.display());
            load_file(&package, &mut actions)?;
        }
    }

    Ok(PatchConfig { actions })
}

fn load_file(path: &Path, out: &mut Vec<PatchAction>) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ImportError::config(path, format!("read failed: {e}")))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|e| ImportError::config(path, e.to_string()))?;

    if doc.is_null() {
        return Ok(());
    }
    let Some(map) = doc.as_mapping() else {
        return Err(ImportError::config(path, "top level must be a mapping"));
    };
    for key in map.keys() {
        if key.as_str() != Some("patch") {
            return Err(ImportError::config(
                path,
                format!("unknown top-level key: {key:?}"),
            ));
        }
    }
    let Some(patch) = map.get("patch") else {
        return Ok(());
    };
    if patch.is_null() {
        return Ok(());
    }
    let Some(entries) = patch.as_sequence() else {
        return Err(ImportError::config(path, "'patch' must be a list"));
    };

    for (index, entry) in entries.iter().enumerate() {
        let Some(map) = entry.as_mapping() else {
            return Err(ImportError::config_action(
                path,
                index,
                "entry must be a mapping of one action kind",
            ));
        };
        if map.len() != 1 {
            return Err(ImportError::config_action(
                path,
                index,
                format!("entry must name exactly one action kind, found {}", map.len()),
            ));
        }
        for (key, value) in map {
            let Some(kind) = key.as_str() else {
                return Err(ImportError::config_action(
                    path,
                    index,
                    "action kind must be a string",
                ));
            };
            let actions = parse_group(kind, value)
                .map_err(|reason| ImportError::config_action(path, index, reason))?;
            for action in actions {
                action
                    .validate()
                    .map_err(|reason| ImportError::config_action(path, index, reason))?;
                out.push(action);
            }
        }
    }

    Ok(())
}
