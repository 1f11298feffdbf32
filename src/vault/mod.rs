pub mod hashicorp;
pub mod onepassword;

use async_trait::async_trait;

use crate::errors::VaultError;
use crate::models::{VaultItem, VaultSpec};

/// Abstraction over secret storage backends.
/// Implementations: 1Password Connect, HashiCorp Vault KV v2.
///
/// Dry-run is fixed when the adapter is built. Under dry-run every mutating
/// call returns a plausible result without contacting the backend.
#[async_trait]
pub trait Vault: Send + Sync {
    fn is_dry_run(&self) -> bool;

    /// Missing items (or an empty field) are [`VaultError::ItemNotFound`].
    async fn get_item(&self, spec: &VaultSpec) -> Result<VaultItem, VaultError>;

    async fn create_item(&self, spec: &VaultSpec, value: &str) -> Result<VaultItem, VaultError>;

    async fn update_item(&self, spec: &VaultSpec, value: &str) -> Result<(), VaultError>;

    async fn delete_item(&self, spec: &VaultSpec) -> Result<(), VaultError>;
}

/// Backend selected by `--vault-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
pub enum VaultKind {
    #[value(name = "1password")]
    #[serde(rename = "1password")]
    OnePassword,
    #[value(name = "hashicorp")]
    #[serde(rename = "hashicorp")]
    HashiCorp,
}
