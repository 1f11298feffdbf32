use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use token_operator::batch::{Batch, BatchMode};
use token_operator::cli::{Cli, LogFormat, Settings};
use token_operator::config;
use token_operator::metrics::Metrics;
use token_operator::reconcile::Reconciler;
use token_operator::remote::Caller;
use token_operator::retry::Backoff;
use token_operator::source::{gitlab::GitLab, Source};
use token_operator::vault::{hashicorp::HashiCorp, onepassword::OnePassword, Vault, VaultKind};

#[tokio::main]
async fn main() {
    // flags may come from a local .env file
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    if let Err(e) = init_tracing(args.log_format) {
        eprintln!("Error: failed to set up logging: {:#}", e);
        std::process::exit(1);
    }

    let code = match run(args).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    opentelemetry::global::shutdown_tracer_provider();
    std::process::exit(code);
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // Export spans over OTLP only when a collector is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "tocli"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let fmt_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "token_operator=info,tocli=info".into()),
        ))
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

/// Returns whether every token reconciled successfully.
async fn run(args: Cli) -> anyhow::Result<bool> {
    let file = config::load(&args.config).context("failed to load config")?;
    let settings = args.settings(&file);
    tracing::debug!(?settings, tokens = file.tokens.len(), "read config");

    let tokens = file
        .token_configs(settings.force_rotate)
        .context("failed to resolve token definitions")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let caller = Caller::new(Backoff::default(), cancel.clone()).context("failed to create HTTP client")?;
    let source = new_source(&args, &settings, caller.clone()).context("failed to create source")?;
    let vault = new_vault(&args, &settings, caller).context("failed to create vault")?;
    let reconciler = Reconciler::new(source, vault, cancel.clone());

    let metrics = Metrics::new(args.stats_addr.as_deref()).context("failed to create metrics exporter")?;
    let mode = if args.keep_going {
        BatchMode::KeepGoing
    } else {
        BatchMode::FailFast
    };

    if settings.dry_run {
        tracing::info!("dry-run enabled, no changes will be made");
    }

    let report = Batch::new(&reconciler, &metrics, cancel, mode).run(&tokens).await;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(action) => println!("{:<32} ok      {}", outcome.name, action),
            Err(e) => println!("{:<32} FAILED  {}", outcome.name, e),
        }
    }
    for name in &report.skipped {
        println!("{:<32} skipped", name);
    }

    if report.is_success() {
        tracing::debug!("token rotation complete");
    } else {
        tracing::warn!(
            failed = report.failures(),
            skipped = report.skipped.len(),
            "token rotation finished with errors"
        );
    }
    Ok(report.is_success())
}

fn new_source(args: &Cli, settings: &Settings, caller: Caller) -> anyhow::Result<Box<dyn Source>> {
    if args.source_token.is_empty() {
        anyhow::bail!("no token for source specified");
    }
    let gitlab = GitLab::new(&settings.source_url, args.source_token.clone(), caller)?
        .with_dry_run(settings.dry_run);
    Ok(Box::new(gitlab))
}

fn new_vault(args: &Cli, settings: &Settings, caller: Caller) -> anyhow::Result<Box<dyn Vault>> {
    if args.vault_token.is_empty() {
        anyhow::bail!("no token for vault specified");
    }
    let url = settings
        .vault_url
        .as_deref()
        .with_context(|| format!("--vault-url is required for {:?}", settings.vault_type))?;

    let vault: Box<dyn Vault> = match settings.vault_type {
        VaultKind::OnePassword => Box::new(
            OnePassword::new(url, args.vault_token.clone(), caller)?.with_dry_run(settings.dry_run),
        ),
        VaultKind::HashiCorp => Box::new(
            HashiCorp::new(url, args.vault_token.clone(), caller)?.with_dry_run(settings.dry_run),
        ),
    };
    Ok(vault)
}

/// Cancel the run on Ctrl-C or SIGTERM; in-flight requests finish, no
/// further attempts are made.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        tracing::warn!("shutdown signal received, cancelling");
        cancel.cancel();
    });
}
