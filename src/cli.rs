use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;
use crate::source::gitlab;
use crate::vault::VaultKind;

/// tocli: keeps GitLab access tokens and their vault copies in sync
#[derive(Debug, Parser)]
#[command(
    name = "tocli",
    version,
    about,
    after_help = "EXAMPLES:\n\n  \
    # Rotate personal tokens on GitLab.com into 1Password Connect\n  \
    tocli --source-token glpat-... --vault-url http://localhost:8080 --vault-token ... \\\n    \
    --config personal-tokens.yaml --dry-run\n\n  \
    # Rotate tokens on a self-hosted GitLab into HashiCorp Vault\n  \
    tocli --source-url https://gitlab.example.com/api/v4 --source-token glpat-... \\\n    \
    --vault-type hashicorp --vault-url https://vault.example.com --vault-token ... \\\n    \
    --config gitlab-example-tokens.yaml"
)]
pub struct Cli {
    /// The path to the configuration file
    #[arg(long, env = "CONFIG", default_value = "./tocli.yaml")]
    pub config: PathBuf,

    /// The source API URL [default: https://gitlab.com/api/v4]
    #[arg(long, env = "SOURCE_URL")]
    pub source_url: Option<String>,

    /// The source token to use
    #[arg(long, env = "SOURCE_TOKEN", hide_env_values = true)]
    pub source_token: String,

    /// Which vault backend to use [default: 1password]
    #[arg(long, env = "VAULT_TYPE", value_enum)]
    pub vault_type: Option<VaultKind>,

    /// The vault API URL to use
    #[arg(long, env = "VAULT_URL")]
    pub vault_url: Option<String>,

    /// The vault token to use
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub vault_token: String,

    /// Do a dry-run, don't change anything
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Force rotation of all tokens by setting rotate_before to one year
    #[arg(long, env = "FORCE_ROTATE")]
    pub force_rotate: bool,

    /// Continue with the remaining tokens after a failure
    #[arg(long, env = "KEEP_GOING")]
    pub keep_going: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// StatsD address (host:port) for metrics, disabled when unset
    #[arg(long, env = "STATS_ADDR")]
    pub stats_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Effective settings after merging the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source_url: String,
    pub vault_type: VaultKind,
    pub vault_url: Option<String>,
    pub dry_run: bool,
    pub force_rotate: bool,
}

impl Cli {
    /// Fill settings the user did not pass (by flag or env) from `config`,
    /// then fall back to built-in defaults. Credentials never come from the
    /// file.
    pub fn settings(&self, config: &Config) -> Settings {
        Settings {
            source_url: self
                .source_url
                .clone()
                .or_else(|| config.source.url.clone().filter(|u| !u.is_empty()))
                .unwrap_or_else(|| gitlab::DEFAULT_URL.to_string()),
            vault_type: self
                .vault_type
                .or(config.vault.kind)
                .unwrap_or(VaultKind::OnePassword),
            vault_url: self
                .vault_url
                .clone()
                .or_else(|| config.vault.url.clone().filter(|u| !u.is_empty())),
            dry_run: self.dry_run || config.dry_run,
            force_rotate: self.force_rotate || config.force_rotate,
        }
    }
}
