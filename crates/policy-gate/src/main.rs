mod cli;
mod config;
mod gate;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use policy_engine::{loader, PolicyEnforcer, PolicyStore};

use crate::cli::{Cli, Command};
use crate::config::Config;

/// Exit code for a policy file that fails validation.
const EXIT_INVALID_POLICY: u8 = 2;
/// Exit code when `--enforce` hits at least one deny.
const EXIT_VIOLATION: u8 = 3;

const COMPONENT: &str = "policy-gate";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    // Logs go to stderr; stdout carries the JSON results.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(
        config_file = %cli.config.display(),
        version = env!("CARGO_PKG_VERSION"),
        "policy-gate starting"
    );

    match cli.command {
        Command::Validate { policy } => {
            let policy_file = policy.unwrap_or_else(|| cfg.policy_file.clone());
            validate(&cfg, policy_file).await
        }
        Command::Evaluate {
            policy,
            context,
            enforce,
            metrics,
        } => {
            let policy_file = policy.unwrap_or_else(|| cfg.policy_file.clone());
            evaluate(&cfg, policy_file, context, enforce, metrics).await
        }
    }
}

async fn validate(cfg: &Config, policy_file: PathBuf) -> Result<ExitCode> {
    match loader::load_policy(&policy_file) {
        Ok(doc) => {
            info!(policy_file = %policy_file.display(), "policy is valid");
            println!(
                "{}",
                serde_json::json!({
                    "valid": true,
                    "policyFile": policy_file.display().to_string(),
                    "name": doc.name,
                    "rules": doc.rules.len(),
                    "exceptions": doc.exceptions.len(),
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let detail = format!("{err:#}");
            error!(policy_file = %policy_file.display(), error = %detail, "policy is invalid");

            if let Some(path) = &cfg.logging.audit_log_path {
                let (audit, handle) = AuditSink::start(path)
                    .await
                    .context("failed to start audit logger")?;
                audit
                    .log(AuditEntry::new(
                        AuditEventType::PolicyValidationFailed,
                        AuditSource::new(COMPONENT),
                        serde_json::json!({
                            "policyFile": policy_file.display().to_string(),
                            "error": detail,
                        }),
                    ))
                    .await?;
                drop(audit);
                handle.await.context("audit writer task failed")?;
            }

            println!(
                "{}",
                serde_json::json!({
                    "valid": false,
                    "policyFile": policy_file.display().to_string(),
                    "error": detail,
                })
            );
            Ok(ExitCode::from(EXIT_INVALID_POLICY))
        }
    }
}

async fn evaluate(
    cfg: &Config,
    policy_file: PathBuf,
    context_file: PathBuf,
    enforce: bool,
    print_metrics: bool,
) -> Result<ExitCode> {
    let contexts = gate::read_contexts(&context_file).await?;
    let store = PolicyStore::open(&policy_file)
        .await
        .context("failed to load policy file")?;
    let mut builder = PolicyEnforcer::builder(Arc::new(store));

    let audit = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .context("failed to start audit logger")?;
            builder = builder.auditor(Arc::new(sink));
            info!(audit_log = %path.display(), "audit logging enabled");
            Some(handle)
        }
        None => None,
    };
    // Nothing fallible runs between starting the audit writer and
    // run_and_flush, which always drains it.
    if let Some(timeout) = cfg.engine.source_timeout() {
        builder = builder.source_timeout(timeout);
    }
    let enforcer = builder.build();

    info!(contexts = contexts.len(), enforce, "evaluating contexts");

    let report = {
        let mut stdout = std::io::stdout().lock();
        gate::run_and_flush(enforcer, audit, contexts, enforce, print_metrics, &mut stdout).await?
    };

    info!(
        evaluated = report.evaluated,
        violations = report.violations,
        "evaluation finished"
    );

    if enforce && report.violations > 0 {
        return Ok(ExitCode::from(EXIT_VIOLATION));
    }
    Ok(ExitCode::SUCCESS)
}
