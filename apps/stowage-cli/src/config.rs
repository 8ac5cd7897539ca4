//! CLI configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/stowage/cli.toml`
//! - Windows: `%APPDATA%/stowage/cli.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stowage_uploader::UploaderConfig;

/// Environment variable overriding the configured token.
pub const TOKEN_ENV: &str = "STOWAGE_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Base URL of the storage service.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Bearer token. Keep this file private.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub uploader: UploaderConfig,
}

fn default_server_url() -> String {
    "http://localhost:8080".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            uploader: UploaderConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads `path` (or the default location), creating it with defaults
    /// when missing.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Token from the environment, else from the file.
    pub fn token(&self) -> Option<String> {
        self.resolve_token(std::env::var(TOKEN_ENV).ok())
    }

    fn resolve_token(&self, env: Option<String>) -> Option<String> {
        env.filter(|t| !t.trim().is_empty())
            .or_else(|| self.token.clone().filter(|t| !t.trim().is_empty()))
    }
}

fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("stowage").join("cli.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("stowage").join("cli.toml")
    }
}
