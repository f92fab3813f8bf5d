#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    PatchApply,
    GitTransport { transient: bool },
    TagConflict,
    Upload,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Config => "E_CONFIG",
            ErrorKind::PatchApply => "E_PATCH_APPLY",
            ErrorKind::GitTransport { .. } => "E_GIT_TRANSPORT",
            ErrorKind::TagConflict => "E_TAG_CONFLICT",
            ErrorKind::Upload => "E_UPLOAD",
        }
    }
}

#[derive(Debug)]
pub struct ImportError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
    source: Option<anyhow::Error>,
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl ImportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Keeps the underlying failure in the chain so its own kind stays
    /// recoverable by downcast.
    pub fn with_source(mut self, cause: anyhow::Error) -> Self {
        self.source = Some(cause);
        self
    }

    pub fn config(file: &std::path::Path, message: impl Into<String>) -> anyhow::Error {
        let message = message.into();
        anyhow::Error::new(
            Self::new(
                ErrorKind::Config,
                format!("invalid patch config {}: {message}", file.display()),
            )
            .with_details(serde_json::json!({
                "file": file.display().to_string(),
            })),
        )
    }

    pub fn config_action(
        file: &std::path::Path,
        index: usize,
        message: impl Into<String>,
    ) -> anyhow::Error {
        let message = message.into();
        anyhow::Error::new(
            Self::new(
                ErrorKind::Config,
                format!(
                    "invalid patch config {} (action {index}): {message}",
                    file.display()
                ),
            )
            .with_details(serde_json::json!({
                "file": file.display().to_string(),
                "action_index": index,
            })),
        )
    }

    pub fn patch_apply(index: usize, action: &str, cause: anyhow::Error) -> anyhow::Error {
        anyhow::Error::new(
            Self::new(ErrorKind::PatchApply, format!("action {index} ({action}) failed"))
                .with_details(serde_json::json!({
                    "action_index": index,
                    "action": action,
                }))
                .with_source(cause),
        )
    }

    pub fn git_transport(transient: bool, message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(
            ErrorKind::GitTransport { transient },
            message.into(),
        ))
    }

    pub fn tag_conflict(tag: &str, existing: &str, wanted: &str) -> anyhow::Error {
        anyhow::Error::new(
            Self::new(
                ErrorKind::TagConflict,
                format!("tag {tag} already exists and points at {existing}, not {wanted}"),
            )
            .with_details(serde_json::json!({
                "tag": tag,
                "existing_commit": existing,
                "wanted_commit": wanted,
            })),
        )
    }

    pub fn upload(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::new(ErrorKind::Upload, message.into()))
    }
}

pub fn find_import_error(err: &anyhow::Error) -> Option<&ImportError> {
    err.chain().find_map(|e| e.downcast_ref::<ImportError>())
}

pub fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        find_import_error(err).map(|e| e.kind),
        Some(ErrorKind::GitTransport { transient: true })
    )
}

/// True when a transport failure means the remote repository does not
/// exist, as opposed to auth or connectivity trouble.
pub fn is_missing_repository(err: &anyhow::Error) -> bool {
    find_import_error(err)
        .filter(|e| matches!(e.kind, ErrorKind::GitTransport { .. }))
        .and_then(|e| e.details.as_ref())
        .and_then(|d| d.get("missing_repository"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
