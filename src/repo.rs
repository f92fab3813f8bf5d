use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ssh,
    Https,
    /// Plain filesystem path, used for local mirrors and test fixtures.
    File,
}

/// Where to reach a git forge. Credentials are never embedded; ssh
/// identity comes from the ambient agent/config of `user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCoordinates {
    pub host: String,
    pub org: String,
    pub protocol: Protocol,
    pub user: String,
}

impl RepoCoordinates {
    pub fn new(host: impl Into<String>, org: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            org: org.into(),
            protocol,
            user: "git".to_string(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn url(&self, package: &str) -> String {
        match self.protocol {
            Protocol::Ssh => format!(
                "ssh://{}@{}/{}/{package}.git",
                self.user, self.host, self.org
            ),
            Protocol::Https => format!("https://{}/{}/{package}.git", self.host, self.org),
            Protocol::File => format!("{}/{}/{package}.git", self.host, self.org),
        }
    }
}
