//! token-operator: keeps source-issued access tokens and their vault copies
//! in sync.
//!
//! Re-exports modules needed by the `tocli` binary and integration tests in
//! `tests/`.

pub mod batch;
pub mod cli;
pub mod config;
pub mod errors;
pub mod mask;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod source;
pub mod vault;
