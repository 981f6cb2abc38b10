use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;

use outreach_engine::channels::TransportRegistry;
use outreach_engine::config::EngineConfig;
use outreach_engine::content::TemplateGenerator;
use outreach_engine::dispatch::{Orchestrator, SendPacer};
use outreach_engine::feedback::{FeedbackProcessor, SpoolReader};
use outreach_engine::operator::OperatorConsole;
use outreach_engine::store::{Database, LibSqlBackend};
use outreach_engine::targets::{TargetStore, ingest_file, ingest_stream};

const USAGE: &str = "\
outreach-engine <command>

Commands:
  ingest <file.jsonl | ->      Merge discovery records (- reads stdin)
  dispatch [max]               Run one dispatch batch (default: batch ceiling)
  classify [spool-dir]         Drain the inbound spool and classify feedback
  schedule <cron-expr>         Run dispatch + classify on a cron schedule
  operator <action> [args..]   Manual overrides:
      blacklist <org> <reason>
      unblacklist <org>
      clear-cooldown <org>
      cooldown <org> <days>
      reset <target-uuid>
      suppress <target-uuid> <reason>
      similar <org> <role>
      unresolved [limit]
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = EngineConfig::from_env();
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{USAGE}");
        std::process::exit(2);
    };

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );

    match command {
        "ingest" => {
            let path = args
                .get(1)
                .context("Usage: outreach-engine ingest <file.jsonl | ->")?;
            let store = TargetStore::new(Arc::clone(&db));
            let summary = if path == "-" {
                ingest_stream(&store, tokio::io::stdin()).await?
            } else {
                ingest_file(&store, Path::new(path)).await?
            };
            eprintln!(
                "Ingested {} records: {} created, {} merged, {} skipped",
                summary.total(),
                summary.created,
                summary.merged,
                summary.skipped
            );
        }
        "dispatch" => {
            let max = match args.get(1) {
                Some(raw) => raw.parse().context("max must be a positive integer")?,
                None => config.batch_ceiling,
            };
            let summary = run_dispatch(Arc::clone(&db), &config, max).await?;
            eprintln!(
                "Batch done: {} sent, {} denied, {} transport failures, {} deferred by day cap",
                summary.sent, summary.denied, summary.failed_transport, summary.deferred_day_cap
            );
        }
        "classify" => {
            let summary = run_classify(Arc::clone(&db), &config, args.get(1)).await?;
            eprintln!(
                "Processed {} messages: {} resolved, {} unresolved, {} side effects, {} errors",
                summary.processed,
                summary.resolved,
                summary.unresolved,
                summary.side_effects,
                summary.errors
            );
        }
        "schedule" => {
            let expr = args
                .get(1)
                .context("Usage: outreach-engine schedule <cron-expr>")?;
            run_schedule(db, &config, expr).await?;
        }
        "operator" => {
            run_operator(db, &config, &args[1..]).await?;
        }
        other => {
            eprintln!("Unknown command: {other}\n");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

/// Stderr logging, plus a daily-rolling audit file when a log directory is
/// configured. Both sinks stay active together; the returned guard must
/// live for the process.
fn init_tracing(config: &EngineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (subscriber, guard) = build_subscriber(config.log_dir.as_deref());
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {e}");
    }
    guard
}

fn build_subscriber(
    log_dir: Option<&str>,
) -> (
    Box<dyn tracing::Subscriber + Send + Sync>,
    Option<tracing_appender::non_blocking::WorkerGuard>,
) {
    use tracing_subscriber::layer::SubscriberExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let audit = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Box::new(registry.with(audit)), Some(guard))
        }
        None => (Box::new(registry), None),
    }
}

async fn run_dispatch(
    db: Arc<dyn Database>,
    config: &EngineConfig,
    max: usize,
) -> anyhow::Result<outreach_engine::dispatch::BatchSummary> {
    let registry = TransportRegistry::from_env();
    if registry.is_empty() {
        bail!(
            "No transport configured; set OUTREACH_SMTP_HOST, OUTREACH_PORTAL_URL \
             or OUTREACH_API_URL"
        );
    }
    tracing::info!(transports = registry.len(), "Transports configured");

    let pacer = SendPacer::new(config.pace_interval, config.pace_jitter)?;
    let orchestrator = Orchestrator::new(
        db,
        Arc::new(registry),
        Arc::new(TemplateGenerator::default()),
        Arc::new(pacer),
        config.clone(),
    );
    Ok(orchestrator.run_batch(max).await?)
}

async fn run_classify(
    db: Arc<dyn Database>,
    config: &EngineConfig,
    dir_arg: Option<&String>,
) -> anyhow::Result<outreach_engine::feedback::ProcessSummary> {
    let dir = dir_arg
        .cloned()
        .or_else(|| std::env::var("OUTREACH_SPOOL_DIR").ok())
        .unwrap_or_else(|| "./spool".to_string());

    let emails = SpoolReader::new(&dir).drain().await?;
    let processor = FeedbackProcessor::new(db, config.cooldowns);
    Ok(processor.process_batch(&emails).await)
}

/// Long-running mode: fire a dispatch batch and a classify pass at every
/// cron tick.
async fn run_schedule(
    db: Arc<dyn Database>,
    config: &EngineConfig,
    expr: &str,
) -> anyhow::Result<()> {
    let schedule =
        cron::Schedule::from_str(expr).with_context(|| format!("Invalid cron expression {expr:?}"))?;
    tracing::info!(schedule = %expr, "Scheduler started");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            bail!("Cron expression {expr:?} has no upcoming fire time");
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tracing::info!(next = %next, "Sleeping until next tick");
        tokio::time::sleep(wait).await;

        match run_dispatch(Arc::clone(&db), config, config.batch_ceiling).await {
            Ok(summary) => tracing::info!(sent = summary.sent, "Scheduled dispatch done"),
            Err(e) => tracing::error!(error = %e, "Scheduled dispatch failed"),
        }
        match run_classify(Arc::clone(&db), config, None).await {
            Ok(summary) => {
                tracing::info!(processed = summary.processed, "Scheduled classify done");
            }
            Err(e) => tracing::error!(error = %e, "Scheduled classify failed"),
        }
    }
}

async fn run_operator(
    db: Arc<dyn Database>,
    config: &EngineConfig,
    args: &[String],
) -> anyhow::Result<()> {
    let console = OperatorConsole::new(db, config.quotas);
    let action = args.first().map(String::as_str).unwrap_or("");

    match action {
        "blacklist" => {
            let (org, reason) = two_args(args, "operator blacklist <org> <reason>")?;
            console.blacklist(org, reason).await?;
            eprintln!("Blacklisted {org}");
        }
        "unblacklist" => {
            let org = one_arg(args, "operator unblacklist <org>")?;
            console.unblacklist(org).await?;
            eprintln!("Unblacklisted {org}");
        }
        "clear-cooldown" => {
            let org = one_arg(args, "operator clear-cooldown <org>")?;
            console.clear_cooldown(org).await?;
            eprintln!("Cooldown cleared for {org}");
        }
        "cooldown" => {
            let (org, days) = two_args(args, "operator cooldown <org> <days>")?;
            let days: i64 = days.parse().context("days must be an integer")?;
            let until = Utc::now() + chrono::Duration::days(days);
            console.impose_cooldown(org, until).await?;
            eprintln!("Cooldown on {org} until {until}");
        }
        "reset" => {
            let id = one_arg(args, "operator reset <target-uuid>")?;
            let id = id.parse().context("invalid target uuid")?;
            let target = console.reset_target(id).await?;
            eprintln!(
                "Reset {} ({} / {})",
                target.id, target.display_organization, target.display_role
            );
        }
        "suppress" => {
            let (id, reason) = two_args(args, "operator suppress <target-uuid> <reason>")?;
            let id = id.parse().context("invalid target uuid")?;
            let target = console.suppress_target(id, reason).await?;
            eprintln!("Suppressed {} ({})", target.id, target.display_organization);
        }
        "similar" => {
            let (org, role) = two_args(args, "operator similar <org> <role>")?;
            let probe = outreach_engine::targets::RawTargetRecord {
                organization: org.to_string(),
                role_title: role.to_string(),
                source_id: "operator".to_string(),
                discovered_at: Utc::now(),
                priority_score: 0.0,
                contact_email: None,
            };
            let candidates = console.review_similar(&probe).await?;
            if candidates.is_empty() {
                eprintln!("No similar targets");
            }
            for candidate in candidates {
                eprintln!(
                    "{:.2}  {}  {} / {}",
                    candidate.similarity, candidate.id, candidate.organization, candidate.role
                );
            }
        }
        "unresolved" => {
            let limit = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(20);
            let signals = console.unresolved_signals(limit).await?;
            if signals.is_empty() {
                eprintln!("No unresolved signals");
            }
            for signal in signals {
                eprintln!(
                    "{}  {}  {}  from {}  {:?}",
                    signal.created_at,
                    signal.id,
                    signal.classification,
                    signal.sender,
                    signal.subject.as_deref().unwrap_or("(no subject)")
                );
            }
        }
        other => {
            bail!("Unknown operator action {other:?}\n\n{USAGE}");
        }
    }

    Ok(())
}

fn one_arg<'a>(args: &'a [String], usage: &str) -> anyhow::Result<&'a str> {
    args.get(1)
        .map(String::as_str)
        .with_context(|| format!("Usage: outreach-engine {usage}"))
}

fn two_args<'a>(args: &'a [String], usage: &str) -> anyhow::Result<(&'a str, &'a str)> {
    match (args.get(1), args.get(2)) {
        (Some(a), Some(b)) => Ok((a.as_str(), b.as_str())),
        _ => bail!("Usage: outreach-engine {usage}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_file_receives_records_when_log_dir_set() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) = build_subscriber(dir.path().to_str());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("audit sink check");
        });
        // Dropping the guard flushes the non-blocking writer
        drop(guard);

        let mut contents = String::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            contents.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        assert!(contents.contains("audit sink check"));
    }

    #[test]
    fn no_audit_guard_without_log_dir() {
        let (_subscriber, guard) = build_subscriber(None);
        assert!(guard.is_none());
    }
}
