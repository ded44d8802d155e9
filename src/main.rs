use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_agent::audit::AuditLog;
use inbox_agent::channels::{EmailChannel, EmailConfig};
use inbox_agent::classifier::GeminiClassifier;
use inbox_agent::config::AppConfig;
use inbox_agent::error::ConfigError;
use inbox_agent::pipeline::types::ExecutionOutcome;
use inbox_agent::pipeline::{DecisionPipeline, PipelineOptions, RuleTable};
use inbox_agent::safety::{FileStateStore, SafetyLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing: stdout plus a daily file under logs/
    let file_appender = tracing_appender::rolling::daily("logs", "inbox-agent.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    // ── CLI flags ────────────────────────────────────────────────────
    let mut dry_run = false;
    let mut config_path = "config/agent.toml".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--config" => {
                config_path = args
                    .next()
                    .context("--config requires a path argument")?;
            }
            other => config_path = other.to_string(),
        }
    }

    info!(config = %config_path, dry_run, "Starting inbox-agent v{}", env!("CARGO_PKG_VERSION"));

    // ── Configuration (fatal on any problem — no message is touched) ─
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    let rules = RuleTable::compile(&config.rules).context("invalid rule table")?;
    info!(rules = rules.len(), "Rule table compiled");

    let gemini_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".into()))?;
    let email_config = EmailConfig::from_env()?;

    // ── Components ───────────────────────────────────────────────────
    let mut classifier = GeminiClassifier::new(
        secrecy::SecretString::from(gemini_key),
        config.agent.model.clone(),
        Duration::from_secs(config.agent.request_timeout_secs),
    )?;
    if let Some(path) = &config.agent.system_prompt_path {
        match std::fs::read_to_string(path) {
            Ok(prompt) => classifier = classifier.with_system_instruction(prompt),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "Could not read system prompt file, using built-in instructions"
            ),
        }
    }

    let safety = Arc::new(SafetyLayer::open(
        &config.safety,
        FileStateStore::new(config.storage.state_path.clone()),
    ));
    let audit = Arc::new(AuditLog::open(config.storage.audit_path.clone())?);

    let channel = Arc::new(EmailChannel::new(
        email_config,
        config.safety.allowed_reply_domains.clone(),
    ));

    let pipeline = DecisionPipeline::new(
        Arc::new(classifier),
        channel.clone(),
        rules,
        safety,
        audit,
        PipelineOptions {
            dry_run,
            review_label: Some(config.safety.review_label.clone()),
        },
    );

    // ── Shutdown: stop fetching, let in-flight decisions finish ─────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received — finishing in-flight work");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    // ── One poll cycle ───────────────────────────────────────────────
    let decisions = pipeline
        .run_cycle(channel.as_ref(), config.agent.fetch_limit, &shutdown)
        .await?;

    let executed = decisions
        .iter()
        .filter(|d| d.outcome == ExecutionOutcome::Success)
        .count();
    let simulated = decisions
        .iter()
        .filter(|d| d.outcome == ExecutionOutcome::Simulated)
        .count();
    let failed = decisions
        .iter()
        .filter(|d| matches!(d.outcome, ExecutionOutcome::Failed { .. }))
        .count();
    let skipped = decisions
        .iter()
        .filter(|d| matches!(d.outcome, ExecutionOutcome::Skipped { .. }))
        .count();

    info!(
        processed = decisions.len(),
        executed, simulated, skipped, failed, "Agent run complete"
    );
    Ok(())
}
