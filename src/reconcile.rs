//! Reconciliation engine: compares one token's source and vault state and
//! applies the smallest set of mutations that brings them back in sync.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Operation, ReconcileError};
use crate::mask::mask;
use crate::models::{duration, Token, TokenConfig, TokenState, VaultItem};
use crate::source::Source;
use crate::vault::Vault;

/// What a reconciliation did (or would do under dry-run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Inactive token, nothing touched.
    Skip,
    /// Token and vault item present and fresh.
    Keep,
    RotateAndUpdate,
    RotateAndCreate,
    CreateAndUpdate,
    CreateAndCreate,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Skip => "skip",
            Action::Keep => "keep",
            Action::RotateAndUpdate => "rotate_update",
            Action::RotateAndCreate => "rotate_create",
            Action::CreateAndUpdate => "create_update",
            Action::CreateAndCreate => "create_create",
            Action::Delete => "delete",
        }
    }

    /// True when the action issues mutating adapter calls.
    pub fn mutates(&self) -> bool {
        !matches!(self, Action::Skip | Action::Keep)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision matrix over the observed existence flags.
///
/// `fresh` only matters when both sides exist.
pub fn decide(token_exists: bool, item_exists: bool, fresh: bool) -> Action {
    match (token_exists, item_exists) {
        (true, true) if fresh => Action::Keep,
        (true, true) => Action::RotateAndUpdate,
        (true, false) => Action::RotateAndCreate,
        (false, true) => Action::CreateAndUpdate,
        (false, false) => Action::CreateAndCreate,
    }
}

/// A token is fresh when it outlives `now + rotate_before` and the vault
/// holds a non-empty copy.
pub fn is_fresh(token: &Token, item: &VaultItem, rotate_before: Duration, now: DateTime<Utc>) -> bool {
    let Ok(margin) = chrono::Duration::from_std(rotate_before) else {
        return false;
    };
    let Some(threshold) = now.checked_add_signed(margin) else {
        return false;
    };
    token.expiration > threshold && !item.value.is_empty()
}

/// Time left until `expiration`, zero when already expired.
fn expires_in(expiration: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expiration - now).to_std().unwrap_or_default()
}

pub struct Reconciler {
    source: Box<dyn Source>,
    vault: Box<dyn Vault>,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(source: Box<dyn Source>, vault: Box<dyn Vault>, cancel: CancellationToken) -> Self {
        Self {
            source,
            vault,
            cancel,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.vault.is_dry_run()
    }

    /// Reconcile one token configuration according to its state.
    pub async fn reconcile(&self, cfg: &TokenConfig) -> Result<Action, ReconcileError> {
        match &cfg.state {
            TokenState::Inactive => {
                info!(name = %cfg.name, "token state is inactive, skipping");
                Ok(Action::Skip)
            }
            TokenState::Deleted => self.delete(cfg).await.map(|_| Action::Delete),
            TokenState::Active => self.update(cfg).await,
            TokenState::Unknown(raw) => Err(ReconcileError::InvalidState(raw.clone())),
        }
    }

    fn ensure_running(&self, op: Operation) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(op));
        }
        Ok(())
    }

    async fn update(&self, cfg: &TokenConfig) -> Result<Action, ReconcileError> {
        self.ensure_running(Operation::GetItem)?;
        let item = match self.vault.get_item(&cfg.vault).await {
            Ok(item) => Some(item),
            Err(e) if e.is_not_found() => {
                debug!(name = %cfg.name, path = %cfg.vault.path, item = %cfg.vault.item, "vault item not found");
                None
            }
            Err(e) => return Err(ReconcileError::from_vault(Operation::GetItem, e)),
        };

        self.ensure_running(Operation::GetToken)?;
        let token = match self.source.get_token(&cfg.source).await {
            Ok(token) => Some(token),
            Err(e) if e.is_not_found() => {
                debug!(name = %cfg.name, "token not found in source");
                None
            }
            Err(e) => return Err(ReconcileError::from_source(Operation::GetToken, e)),
        };

        let now = Utc::now();
        let fresh = match (&token, &item) {
            (Some(token), Some(item)) => is_fresh(token, item, cfg.rotation.rotate_before, now),
            _ => false,
        };
        let action = decide(token.is_some(), item.is_some(), fresh);

        if let Some(token) = &token {
            let remaining = expires_in(token.expiration, now);
            match action {
                Action::Keep => {
                    let secret = item.as_ref().map(|i| mask(&i.value)).unwrap_or_default();
                    info!(
                        name = %cfg.name,
                        secret = %secret,
                        rotate_before = %duration::format(cfg.rotation.rotate_before),
                        expires_in = %duration::format(remaining),
                        expires_at = %token.expiration,
                        "skipping rotation, vault item available and token still valid"
                    );
                    return Ok(action);
                }
                _ => info!(
                    name = %cfg.name,
                    rotate_before = %duration::format(cfg.rotation.rotate_before),
                    expires_in = %duration::format(remaining),
                    expires_at = %token.expiration,
                    "rotating token"
                ),
            }
        } else {
            info!(name = %cfg.name, "creating new token");
        }

        let fresh_token = match action {
            Action::RotateAndUpdate | Action::RotateAndCreate => {
                self.ensure_running(Operation::RotateToken)?;
                self.source
                    .rotate_token(cfg)
                    .await
                    .map_err(|e| ReconcileError::from_source(Operation::RotateToken, e))?
            }
            _ => {
                self.ensure_running(Operation::CreateToken)?;
                self.source
                    .create_token(cfg)
                    .await
                    .map_err(|e| ReconcileError::from_source(Operation::CreateToken, e))?
            }
        };
        debug!(name = %cfg.name, secret = %mask(&fresh_token.value), expires_at = %fresh_token.expiration, "source returned token");

        match action {
            Action::RotateAndUpdate | Action::CreateAndUpdate => {
                info!(path = %cfg.vault.path, item = %cfg.vault.item, "updating vault item");
                self.ensure_running(Operation::UpdateItem)?;
                self.vault
                    .update_item(&cfg.vault, &fresh_token.value)
                    .await
                    .map_err(|e| ReconcileError::from_vault(Operation::UpdateItem, e))?;
            }
            _ => {
                info!(path = %cfg.vault.path, item = %cfg.vault.item, "creating vault item");
                self.ensure_running(Operation::CreateItem)?;
                self.vault
                    .create_item(&cfg.vault, &fresh_token.value)
                    .await
                    .map_err(|e| ReconcileError::from_vault(Operation::CreateItem, e))?;
            }
        }

        Ok(action)
    }

    async fn delete(&self, cfg: &TokenConfig) -> Result<(), ReconcileError> {
        info!(name = %cfg.name, "deleting token in source");
        self.ensure_running(Operation::DeleteToken)?;
        match self.source.delete_token(&cfg.source).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(name = %cfg.name, "token already deleted"),
            Err(e) => return Err(ReconcileError::from_source(Operation::DeleteToken, e)),
        }

        info!(name = %cfg.name, path = %cfg.vault.path, item = %cfg.vault.item, "deleting item in vault");
        self.ensure_running(Operation::DeleteItem)?;
        match self.vault.delete_item(&cfg.vault).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(name = %cfg.name, "vault item already deleted"),
            Err(e) => return Err(ReconcileError::from_vault(Operation::DeleteItem, e)),
        }
        Ok(())
    }
}
