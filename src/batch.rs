//! Sequential runner over all configured tokens.

use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::errors::ReconcileError;
use crate::metrics::Metrics;
use crate::models::TokenConfig;
use crate::reconcile::{Action, Reconciler};

/// What to do after a token fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    FailFast,
    KeepGoing,
}

#[derive(Debug)]
pub struct Outcome {
    pub name: String,
    pub result: Result<Action, ReconcileError>,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
    /// Tokens never attempted because the run stopped early.
    pub skipped: Vec<String>,
}

impl Report {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_ok()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0 && self.skipped.is_empty()
    }
}

pub struct Batch<'a> {
    reconciler: &'a Reconciler,
    metrics: &'a Metrics,
    cancel: CancellationToken,
    mode: BatchMode,
}

impl<'a> Batch<'a> {
    pub fn new(reconciler: &'a Reconciler, metrics: &'a Metrics, cancel: CancellationToken, mode: BatchMode) -> Self {
        Self {
            reconciler,
            metrics,
            cancel,
            mode,
        }
    }

    pub async fn run(&self, tokens: &[TokenConfig]) -> Report {
        let mut report = Report::default();

        for (idx, cfg) in tokens.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = tokens.len() - idx, "run cancelled, skipping remaining tokens");
                report.skipped.extend(tokens[idx..].iter().map(|t| t.name.clone()));
                break;
            }

            let span = info_span!(
                "reconcile",
                name = %cfg.name,
                state = %cfg.state,
                dry_run = self.reconciler.is_dry_run()
            );
            let started = Instant::now();
            let result = self.reconciler.reconcile(cfg).instrument(span).await;
            let elapsed = started.elapsed();

            match &result {
                Ok(action) => {
                    info!(name = %cfg.name, action = %action, elapsed_ms = elapsed.as_millis() as u64, "token reconciled");
                    self.metrics.record(action.as_str(), true, elapsed);
                }
                Err(e) => {
                    error!(name = %cfg.name, error = %e, "token reconciliation failed");
                    let op = e.operation().map(|op| op.to_string()).unwrap_or_else(|| "invalid_state".into());
                    self.metrics.record(&op.replace(' ', "_"), false, elapsed);
                }
            }

            let failed = result.is_err();
            report.outcomes.push(Outcome {
                name: cfg.name.clone(),
                result,
            });

            if failed && self.mode == BatchMode::FailFast {
                report.skipped.extend(tokens[idx + 1..].iter().map(|t| t.name.clone()));
                break;
            }
        }

        report
    }
}
