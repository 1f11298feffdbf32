use std::fmt;
use thiserror::Error;

use crate::models::TokenType;
use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("token not found")]
    TokenNotFound,

    #[error("{0} tokens are not supported by this source")]
    Unsupported(TokenType),

    #[error("invalid source definition: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::TokenNotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Remote(e) if e.is_cancelled())
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("item not found")]
    ItemNotFound,

    #[error("vault '{0}' not found")]
    VaultNotFound(String),

    #[error("invalid vault item: {0}")]
    InvalidItem(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::ItemNotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VaultError::Remote(e) if e.is_cancelled())
    }
}

/// Adapter call that produced a reconciliation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetToken,
    CreateToken,
    RotateToken,
    DeleteToken,
    GetItem,
    CreateItem,
    UpdateItem,
    DeleteItem,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::GetToken => "get token",
            Operation::CreateToken => "create token",
            Operation::RotateToken => "rotate token",
            Operation::DeleteToken => "delete token",
            Operation::GetItem => "get vault item",
            Operation::CreateItem => "create vault item",
            Operation::UpdateItem => "update vault item",
            Operation::DeleteItem => "delete vault item",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid token state: {0}")]
    InvalidState(String),

    #[error("failed to get vault item: {0}")]
    VaultQueryFailed(#[source] VaultError),

    #[error("failed to get token: {0}")]
    SourceQueryFailed(#[source] SourceError),

    #[error("failed to create token: {0}")]
    CreationFailed(#[source] SourceError),

    #[error("failed to rotate token: {0}")]
    RotationFailed(#[source] SourceError),

    #[error("failed to create vault item: {0}")]
    VaultCreateFailed(#[source] VaultError),

    #[error("failed to update vault item: {0}")]
    VaultUpdateFailed(#[source] VaultError),

    #[error("failed to delete token: {0}")]
    SourceDeleteFailed(#[source] SourceError),

    #[error("failed to delete vault item: {0}")]
    VaultDeleteFailed(#[source] VaultError),

    #[error("cancelled during {0}")]
    Cancelled(Operation),
}

impl ReconcileError {
    /// The adapter call that failed, if the error came from one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            ReconcileError::InvalidState(_) => None,
            ReconcileError::VaultQueryFailed(_) => Some(Operation::GetItem),
            ReconcileError::SourceQueryFailed(_) => Some(Operation::GetToken),
            ReconcileError::CreationFailed(_) => Some(Operation::CreateToken),
            ReconcileError::RotationFailed(_) => Some(Operation::RotateToken),
            ReconcileError::VaultCreateFailed(_) => Some(Operation::CreateItem),
            ReconcileError::VaultUpdateFailed(_) => Some(Operation::UpdateItem),
            ReconcileError::SourceDeleteFailed(_) => Some(Operation::DeleteToken),
            ReconcileError::VaultDeleteFailed(_) => Some(Operation::DeleteItem),
            ReconcileError::Cancelled(op) => Some(*op),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileError::Cancelled(_))
    }

    pub(crate) fn from_source(op: Operation, err: SourceError) -> Self {
        if err.is_cancelled() {
            return ReconcileError::Cancelled(op);
        }
        match op {
            Operation::GetToken => ReconcileError::SourceQueryFailed(err),
            Operation::CreateToken => ReconcileError::CreationFailed(err),
            Operation::RotateToken => ReconcileError::RotationFailed(err),
            _ => ReconcileError::SourceDeleteFailed(err),
        }
    }

    pub(crate) fn from_vault(op: Operation, err: VaultError) -> Self {
        if err.is_cancelled() {
            return ReconcileError::Cancelled(op);
        }
        match op {
            Operation::GetItem => ReconcileError::VaultQueryFailed(err),
            Operation::CreateItem => ReconcileError::VaultCreateFailed(err),
            Operation::UpdateItem => ReconcileError::VaultUpdateFailed(err),
            _ => ReconcileError::VaultDeleteFailed(err),
        }
    }
}
