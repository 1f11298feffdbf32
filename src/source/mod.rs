pub mod gitlab;

use async_trait::async_trait;

use crate::errors::SourceError;
use crate::models::{SourceSpec, Token, TokenConfig};

/// A system issuing access tokens.
///
/// `get_token` and `delete_token` report a missing token as
/// [`SourceError::TokenNotFound`]; callers treat that as a state, not a failure.
#[async_trait]
pub trait Source: Send + Sync {
    async fn get_token(&self, spec: &SourceSpec) -> Result<Token, SourceError>;

    async fn create_token(&self, cfg: &TokenConfig) -> Result<Token, SourceError>;

    /// Replace the token's value, returning the new plaintext.
    async fn rotate_token(&self, cfg: &TokenConfig) -> Result<Token, SourceError>;

    async fn delete_token(&self, spec: &SourceSpec) -> Result<(), SourceError>;
}
