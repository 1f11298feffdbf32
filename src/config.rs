use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Rotation, SourceSpec, TokenConfig, TokenState, TokenType, VaultSpec};
use crate::vault::VaultKind;

/// `rotate_before` used by `force_rotate`: longer than the maximum GitLab
/// token lifetime, so every token counts as expiring.
pub const FORCE_ROTATE_BEFORE: Duration = Duration::from_secs(366 * 24 * 3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing token definition")]
    MissingTokens,

    #[error("invalid config for token source '{0}': missing rotation definition")]
    MissingRotation(String),

    #[error("invalid config for token source '{0}': missing token owner for source")]
    MissingOwner(String),

    #[error("invalid config for token source '{0}': missing token role for source")]
    MissingRole(String),

    #[error("duplicate token name '{0}'")]
    DuplicateName(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    #[serde(default)]
    pub default_rotation: Option<Rotation>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force_rotate: bool,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub vault: VaultSettings,
}

/// One token as written in the file; `rotation` falls back to the default.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub name: String,
    pub state: TokenState,
    #[serde(default)]
    pub rotation: Option<Rotation>,
    pub source: SourceSpec,
    pub vault: VaultSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceSettings {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultSettings {
    #[serde(rename = "type")]
    pub kind: Option<VaultKind>,
    pub url: Option<String>,
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.is_empty() {
            return Err(ConfigError::MissingTokens);
        }

        let mut seen = HashSet::new();
        for t in &self.tokens {
            if t.rotation.is_none() && self.default_rotation.is_none() {
                return Err(ConfigError::MissingRotation(t.source.name.clone()));
            }

            // group and project tokens are created on behalf of an owner with a role
            if matches!(t.source.token_type, TokenType::Project | TokenType::Group) {
                if t.source.owner.is_empty() {
                    return Err(ConfigError::MissingOwner(t.source.name.clone()));
                }
                if t.source.role.is_empty() {
                    return Err(ConfigError::MissingRole(t.source.name.clone()));
                }
            }

            if !seen.insert(t.name.as_str()) {
                return Err(ConfigError::DuplicateName(t.name.clone()));
            }
        }
        Ok(())
    }

    /// Resolve every entry into a [`TokenConfig`], filling in the default
    /// rotation. Call [`Config::validate`] first.
    pub fn token_configs(&self, force_rotate: bool) -> Result<Vec<TokenConfig>, ConfigError> {
        self.tokens
            .iter()
            .map(|t| {
                let mut rotation = t
                    .rotation
                    .clone()
                    .or_else(|| self.default_rotation.clone())
                    .ok_or_else(|| ConfigError::MissingRotation(t.source.name.clone()))?;
                if t.rotation.is_none() {
                    tracing::debug!(name = %t.name, "using default rotation for token");
                }
                if force_rotate {
                    rotation.rotate_before = FORCE_ROTATE_BEFORE;
                    tracing::debug!(name = %t.name, "forcing rotation");
                }
                Ok(TokenConfig {
                    name: t.name.clone(),
                    state: t.state.clone(),
                    rotation,
                    source: t.source.clone(),
                    vault: t.vault.clone(),
                })
            })
            .collect()
    }
}

/// Read, parse and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = Config::from_yaml(&raw)?;
    config.validate()?;
    Ok(config)
}
