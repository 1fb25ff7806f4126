//! OpenStack cloud-config
//!
//! The cloud-config is an INI file with a single `[Global]` section. Exactly
//! one credential method must be configured: username and password, a trust
//! id (used with the trustee's username and password), or a file holding a
//! pre-issued token.

use anyhow::{bail, Context, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GlobalSection {
    #[serde(rename = "auth-url")]
    pub auth_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "user-domain-name", default)]
    pub user_domain_name: Option<String>,
    #[serde(rename = "project-id", default)]
    pub project_id: Option<String>,
    #[serde(rename = "project-name", default)]
    pub project_name: Option<String>,
    #[serde(rename = "project-domain-name", default)]
    pub project_domain_name: Option<String>,
    #[serde(rename = "trust-id", default)]
    pub trust_id: Option<String>,
    #[serde(rename = "token-file", default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "ca-file", default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudConfigFile {
    #[serde(rename = "Global", alias = "global")]
    global: GlobalSection,
}

/// How the client authenticates against Keystone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    Trust { username: String, password: String, trust_id: String },
    TokenFile(PathBuf),
}

/// Validated cloud-config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub global: GlobalSection,
    pub credentials: Credentials,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl CloudConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cloud-config {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid cloud-config {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: CloudConfigFile = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Ini))
            .build()?
            .try_deserialize()?;
        Self::from_section(file.global)
    }

    pub fn from_section(global: GlobalSection) -> Result<Self> {
        if global.auth_url.trim().is_empty() {
            bail!("auth-url must be set");
        }

        let username = non_empty(&global.username);
        let password = non_empty(&global.password);
        let trust_id = non_empty(&global.trust_id);
        let token_file = global.token_file.clone();

        let credentials = match (username, password, trust_id, token_file) {
            (Some(username), Some(password), None, None) => Credentials::Password { username, password },
            (Some(username), Some(password), Some(trust_id), None) => Credentials::Trust {
                username,
                password,
                trust_id,
            },
            (None, None, None, Some(path)) => Credentials::TokenFile(path),
            (None, None, None, None) => {
                bail!("no credentials: set username and password, trust-id, or token-file")
            }
            _ => bail!("exactly one credential method must be set: password, trust or token-file"),
        };

        if matches!(credentials, Credentials::Password { .. })
            && non_empty(&global.project_id).is_none()
            && non_empty(&global.project_name).is_none()
        {
            bail!("password authentication needs project-id or project-name");
        }

        Ok(Self { global, credentials })
    }

    pub fn region(&self) -> Option<&str> {
        self.global.region.as_deref().filter(|r| !r.is_empty())
    }

    pub fn user_domain(&self) -> &str {
        self.global
            .user_domain_name
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or("Default")
    }

    pub fn project_domain(&self) -> &str {
        self.global
            .project_domain_name
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or("Default")
    }
}
