use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroize;

use crate::mask::mask;

/// Desired lifecycle of a configured token.
///
/// Unrecognised values from the configuration file are kept verbatim so the
/// engine can report them per token instead of failing the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TokenState {
    Active,
    Inactive,
    Deleted,
    Unknown(String),
}

impl From<String> for TokenState {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "active" => TokenState::Active,
            "inactive" => TokenState::Inactive,
            "deleted" => TokenState::Deleted,
            _ => TokenState::Unknown(raw),
        }
    }
}

impl From<TokenState> for String {
    fn from(state: TokenState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenState::Active => f.write_str("active"),
            TokenState::Inactive => f.write_str("inactive"),
            TokenState::Deleted => f.write_str("deleted"),
            TokenState::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Kind of access token on the source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Personal,
    Project,
    Group,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenType::Personal => "personal",
            TokenType::Project => "project",
            TokenType::Group => "group",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    /// How long before expiry a still-valid token is rotated anyway.
    #[serde(with = "crate::models::duration")]
    pub rotate_before: Duration,
    /// Lifetime requested for newly created or rotated tokens.
    #[serde(with = "crate::models::duration")]
    pub validity: Duration,
}

/// Where the token lives on the source side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// User, project or group ID (or full path) owning the token.
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Where the token's secret is stored in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSpec {
    /// Vault (1Password) or KV mount (HashiCorp) name.
    pub path: String,
    pub item: String,
    pub field: String,
    /// Optional backend ID of `path`; takes precedence over the name when set.
    #[serde(default, alias = "pathID", skip_serializing_if = "Option::is_none")]
    pub path_id: Option<String>,
    /// Optional backend ID of `item`; takes precedence over the name when set.
    #[serde(default, alias = "itemID", skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

/// One fully resolved token definition, read-only during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    pub name: String,
    pub state: TokenState,
    pub rotation: Rotation,
    pub source: SourceSpec,
    pub vault: VaultSpec,
}

/// A credential as returned by a source.
///
/// `value` is empty when the source cannot return plaintext on read.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    pub description: String,
    pub scopes: Vec<String>,
    pub token_type: TokenType,
    pub owner: String,
    pub value: String,
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("scopes", &self.scopes)
            .field("token_type", &self.token_type)
            .field("owner", &self.owner)
            .field("value", &mask(&self.value))
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_keeps_unknown_values() {
        let state: TokenState = serde_yaml::from_str("revoked").unwrap();
        assert_eq!(state, TokenState::Unknown("revoked".into()));
        assert_eq!(state.to_string(), "revoked");

        let state: TokenState = serde_yaml::from_str("Active").unwrap();
        assert_eq!(state, TokenState::Active);
    }

    #[test]
    fn test_token_debug_masks_value() {
        let token = Token {
            name: "ci".into(),
            description: String::new(),
            scopes: vec!["api".into()],
            token_type: TokenType::Personal,
            owner: String::new(),
            value: "glpat-abcdefgh".into(),
            expiration: Utc::now(),
        };
        let out = format!("{:?}", token);
        assert!(out.contains("glpat-a...h"));
        assert!(!out.contains("abcdefgh"));
    }

    #[test]
    fn test_vault_spec_accepts_id_aliases() {
        let spec: VaultSpec = serde_yaml::from_str(
            "path: ops\nitem: ci\nfield: password\npathID: v123\nitemID: i456\n",
        )
        .unwrap();
        assert_eq!(spec.path_id.as_deref(), Some("v123"));
        assert_eq!(spec.item_id.as_deref(), Some("i456"));
    }
}
