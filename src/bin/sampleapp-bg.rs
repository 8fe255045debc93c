//! sampleapp-bg CLI: run the background host, or exercise it with demo work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sampleapp_bg::config::Config;
use sampleapp_bg::config::jobs::JobsFile;
use sampleapp_bg::engine::BackgroundHost;
use sampleapp_bg::event::{Event, EventBus};
use sampleapp_bg::queue;
use sampleapp_bg::scheduler::{CronHandler, CronJob, CronScheduler};
use sampleapp_bg::scope::ServiceContainer;
use sampleapp_bg::telemetry::{TelemetryConfig, init_telemetry};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sampleapp-bg", about = "Background task queue host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker and the cron scheduler until ctrl-c
    Serve {
        /// TOML file with [[job]] entries
        #[arg(long)]
        jobs: Option<PathBuf>,
        /// Print worker events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Enqueue sample scoped and unscoped work, then shut down
    Demo {
        /// Number of work items to enqueue
        #[arg(long, default_value_t = 10)]
        items: usize,
        /// Make every Nth item fail (0 = never)
        #[arg(long, default_value_t = 4)]
        fail_every: usize,
        /// Simulated work per item in milliseconds
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
        /// Print worker events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

/// Per-scope context handed to scheduled jobs.
struct JobContext {
    scope_id: Uuid,
    created_at: DateTime<Utc>,
}

struct LogJob;

#[async_trait]
impl CronHandler for LogJob {
    type Dependency = JobContext;

    async fn run(
        &self,
        job: &str,
        ctx: Arc<JobContext>,
        _token: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(
            job,
            scope.id = %ctx.scope_id,
            scope.created_at = %ctx.created_at,
            "complete scheduled background work"
        );
        Ok(())
    }
}

fn services() -> ServiceContainer {
    let mut services = ServiceContainer::new();
    services.register_scoped(|_| {
        Ok(JobContext {
            scope_id: Uuid::new_v4(),
            created_at: Utc::now(),
        })
    });
    services
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "sampleapp-bg".to_string(),
        log_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Serve { jobs, json } => cmd_serve(&config, jobs, json).await,
        Command::Demo {
            items,
            fail_every,
            work_ms,
            json,
        } => cmd_demo(&config, items, fail_every, work_ms, json).await,
    }
}

async fn cmd_serve(config: &Config, jobs: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let jobs = match jobs {
        Some(path) => JobsFile::load(&path)?,
        None => JobsFile::default(),
    };

    let events = EventBus::default();
    let printer = json.then(|| tokio::spawn(print_events(events.subscribe())));

    let (queue, receiver) = queue::channel(&config.queue);
    let host =
        BackgroundHost::start_with_events(receiver, Arc::new(services()), &config.queue, events);

    let mut scheduler = CronScheduler::new(queue.clone());
    let handler = Arc::new(LogJob);
    for settings in jobs.enabled() {
        scheduler.add(CronJob::try_from(settings)?, Arc::clone(&handler));
    }

    let stopping = CancellationToken::new();
    let scheduler = tokio::spawn(scheduler.run(stopping.clone()));

    tokio::signal::ctrl_c().await?;
    stopping.cancel();
    scheduler.await?;

    let outcome = host.shutdown().await;
    tracing::info!(?outcome, "host stopped");
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

async fn cmd_demo(
    config: &Config,
    items: usize,
    fail_every: usize,
    work_ms: u64,
    json: bool,
) -> anyhow::Result<()> {
    let events = EventBus::new(items.saturating_mul(4).max(16));
    let printer = tokio::spawn(print_events_or_summary(events.subscribe(), json));

    let (queue, receiver) = queue::channel(&config.queue);
    let host =
        BackgroundHost::start_with_events(receiver, Arc::new(services()), &config.queue, events);

    for n in 1..=items {
        let fail = fail_every > 0 && n % fail_every == 0;
        let delay = Duration::from_millis(work_ms);
        if n % 2 == 0 {
            queue
                .queue_scoped_work::<JobContext, _, _>(move |ctx, _token| async move {
                    tokio::time::sleep(delay).await;
                    anyhow::ensure!(!fail, "demo item {n} failed in scope {}", ctx.scope_id);
                    Ok(())
                })
                .await?;
        } else {
            queue
                .queue_work(move |_token| async move {
                    tokio::time::sleep(delay).await;
                    anyhow::ensure!(!fail, "demo item {n} failed");
                    Ok(())
                })
                .await?;
        }
    }

    // with the last handle gone the worker finishes the backlog and exits
    drop(queue);

    let outcome = host.join().await;
    tracing::info!(?outcome, "demo finished");
    printer.await?;
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_json(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_events_or_summary(mut rx: broadcast::Receiver<Event>, json: bool) {
    use sampleapp_bg::event::EventKind;

    let (mut completed, mut failed) = (0_usize, 0_usize);
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if json {
            print_json(&event);
        }
        match event.kind {
            EventKind::WorkCompleted { .. } => completed += 1,
            EventKind::WorkFailed { .. } | EventKind::WorkPanicked { .. } => failed += 1,
            EventKind::WorkerStopped => break,
            _ => {}
        }
    }
    if !json {
        println!("completed: {completed}, failed: {failed}");
    }
}

fn print_json(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    }
}
