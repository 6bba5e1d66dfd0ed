//! jobtrail CLI: operator interface to the job audit trail.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobtrail::audit::AuditWriter;
use jobtrail::config::Config;
use jobtrail::model::{JobFilter, JobState};
use jobtrail::normalize::Normalizer;
use jobtrail::sink::{Disposition, DispatchConfig, EventSink, Limits};
use jobtrail::telemetry::{TelemetryConfig, init_telemetry};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Parser)]
#[command(name = "jobtrail", about = "Job lifecycle audit trail")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the audit tables if they are missing
    Bootstrap,
    /// Show a job and its stage history
    Show {
        job_id: String,
        /// Also print the fine-grained event log
        #[arg(long)]
        events: bool,
    },
    /// List jobs, most recently accepted first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by producer id
        #[arg(long)]
        producer: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Feed newline-delimited JSON lifecycle events through the sink
    Ingest {
        /// Read from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the canonical envelope for a raw result
    Normalize {
        producer: String,
        /// Raw result as JSON
        raw: String,
        /// The job failed
        #[arg(long)]
        failed: bool,
    },
    /// Delete every job, stage and event row
    Purge {
        /// Required: purge is irreversible
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let outcome = match cli.command {
        Command::Normalize {
            producer,
            raw,
            failed,
        } => cmd_normalize(&producer, &raw, failed),
        Command::Ingest { file } => cmd_ingest(&config, file).await,
        Command::Bootstrap => {
            let writer = writer(&config)?;
            writer.ensure_schema().await?;
            println!("Audit schema ready.");
            Ok(())
        }
        Command::Show { job_id, events } => cmd_show(&writer(&config)?, &job_id, events).await,
        Command::List {
            state,
            producer,
            limit,
        } => cmd_list(&writer(&config)?, state, producer, limit).await,
        Command::Purge { yes } => {
            if !yes {
                anyhow::bail!("purge deletes all audit data; pass --yes to confirm");
            }
            let report = writer(&config)?.purge().await?;
            println!(
                "Purged: {} job(s), {} stage(s), {} event(s)",
                report.jobs, report.stages, report.events
            );
            Ok(())
        }
    };
    guard.force_flush();
    outcome
}

/// Operator commands talk to storage even when the sink would not.
fn writer(config: &Config) -> anyhow::Result<AuditWriter> {
    use secrecy::ExposeSecret;

    let url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    Ok(AuditWriter::connect_lazy(url.expose_secret(), config.pool_size)?
        .with_event_log(config.event_log))
}

fn cmd_normalize(producer: &str, raw: &str, failed: bool) -> anyhow::Result<()> {
    let raw: serde_json::Value = serde_json::from_str(raw)?;
    let envelope = Normalizer::default().normalize(producer, !failed, &raw, None);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

async fn cmd_ingest(config: &Config, file: Option<PathBuf>) -> anyhow::Result<()> {
    let sink = if config.audit_active() {
        EventSink::with_writer(
            Limits::from_config(config),
            Arc::new(writer(config)?),
            DispatchConfig {
                workers: config.workers,
                queue_capacity: config.queue_capacity,
            },
        )
    } else {
        EventSink::logger_only(Limits::from_config(config))
    };

    let input: Box<dyn AsyncRead + Unpin + Send> = match file {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(input).lines();

    let (mut queued, mut logged, mut dropped) = (0usize, 0usize, 0usize);
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let disposition = match serde_json::from_str(&line) {
            Ok(value) => sink.record(value).await,
            Err(e) => {
                tracing::warn!(error = %e, "skipping line that is not JSON");
                dropped += 1;
                continue;
            }
        };
        match disposition {
            Disposition::Queued => queued += 1,
            Disposition::Logged => logged += 1,
            Disposition::Dropped(_) => dropped += 1,
        }
    }
    sink.close().await;

    println!("Ingested: {queued} queued, {logged} logged only, {dropped} dropped");
    Ok(())
}

async fn cmd_list(
    writer: &AuditWriter,
    state: Option<String>,
    producer: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let state: Option<JobState> = match state {
        Some(s) => Some(s.parse()?),
        None => None,
    };
    let jobs = writer
        .list_jobs(&JobFilter {
            state,
            producer_id: producer,
            limit,
        })
        .await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<10}  {:<9}  {:<16}  ACCEPTED",
        "JOB", "PRODUCER", "STATE", "SECONDS", "CODE"
    );
    println!("{}", "-".repeat(120));

    for job in &jobs {
        let code = job
            .result
            .as_ref()
            .and_then(|r| r.get("code"))
            .and_then(|c| c.as_str())
            .unwrap_or("-");
        println!(
            "{:<36}  {:<24}  {:<10}  {:<9}  {:<16}  {}",
            job.job_id,
            job.producer_id.as_deref().unwrap_or("-"),
            job.state,
            job.total_seconds
                .map(|s| format!("{s:.1}"))
                .unwrap_or_else(|| "-".to_string()),
            code,
            job.accepted_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_show(writer: &AuditWriter, job_id: &str, events: bool) -> anyhow::Result<()> {
    let job = writer.get_job(job_id).await?;

    println!("Job:        {}", job.job_id);
    println!("Producer:   {}", job.producer_id.as_deref().unwrap_or("-"));
    println!("State:      {}", job.state);
    for (label, at) in [
        ("Accepted:", job.accepted_at),
        ("Started:", job.started_at),
        ("Finished:", job.finished_at),
    ] {
        if let Some(at) = at {
            println!("{label:<11} {at}");
        }
    }
    if let Some(total) = job.total_seconds {
        println!("Total:      {total:.3}s");
    }
    println!("Meta:       {}", serde_json::to_string_pretty(&job.meta)?);
    if let Some(ref result) = job.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = job.error {
        println!("Error:      {}", serde_json::to_string_pretty(error)?);
    }
    if let Some(ref list) = job.stages_list {
        println!("Stages:     {list}");
    }

    let stages = writer.list_stages(job_id).await?;
    if !stages.is_empty() {
        println!("---");
        for stage in &stages {
            println!(
                "{:<24}  {:<8}  {:>8}  {}",
                stage.name,
                stage.status,
                stage
                    .duration_ms
                    .map(|d| format!("{d}ms"))
                    .unwrap_or_else(|| "-".to_string()),
                stage
                    .ended_at
                    .or(stage.started_at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            );
        }
    }

    if events {
        println!("---");
        for event in writer.list_events(job_id).await? {
            println!("{}  {:<14}  {}", event.ts.to_rfc3339(), event.event_type, event.payload);
        }
    }

    Ok(())
}
