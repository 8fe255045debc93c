//! Cron scheduler.
//!
//! A producer like any other: on each fire it enqueues scoped work for the
//! job's handler, so every run gets a fresh scope and any failure is isolated
//! by the worker loop rather than killing the scheduler.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::config::jobs::JobSettings;
use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::queue::TaskQueue;
use crate::telemetry::{metrics, work::start_job_span};

/// A named cron schedule.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub name: String,
    schedule: cron::Schedule,
}

impl CronJob {
    /// Parse a cron expression (leading seconds field, e.g. `"0 */5 * * * *"`).
    pub fn parse(name: impl Into<String>, expression: &str) -> Result<Self> {
        let name = name.into();
        let schedule = cron::Schedule::from_str(expression).map_err(|e| Error::Schedule {
            job: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { name, schedule })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl TryFrom<&JobSettings> for CronJob {
    type Error = Error;

    fn try_from(settings: &JobSettings) -> Result<Self> {
        CronJob::parse(&settings.name, &settings.schedule)
    }
}

/// What a scheduled job does when it fires.
#[async_trait]
pub trait CronHandler: Send + Sync + 'static {
    /// Resolved from a fresh scope for every run.
    type Dependency: Send + Sync + 'static;

    async fn run(
        &self,
        job: &str,
        dependency: Arc<Self::Dependency>,
        token: CancellationToken,
    ) -> anyhow::Result<()>;
}

type MakeWork = Arc<dyn Fn() -> WorkItem + Send + Sync>;

struct Entry {
    job: CronJob,
    make_work: MakeWork,
}

/// Fires registered jobs on their schedules by enqueueing work.
pub struct CronScheduler {
    queue: TaskQueue,
    entries: Vec<Entry>,
}

impl CronScheduler {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    /// Register a job with its handler.
    pub fn add<H: CronHandler>(&mut self, job: CronJob, handler: Arc<H>) -> &mut Self {
        let name = job.name.clone();
        let make_work: MakeWork = Arc::new(move || {
            let handler = Arc::clone(&handler);
            let name = name.clone();
            WorkItem::scoped::<H::Dependency, _, _>(move |dependency, token| async move {
                handler.run(&name, dependency, token).await
            })
        });
        self.entries.push(Entry { job, make_work });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Run until `stopping` is cancelled or no job has a future fire time.
    pub async fn run(self, stopping: CancellationToken) {
        if self.entries.is_empty() {
            info!("no cron jobs configured, scheduler not started");
            return;
        }
        info!(jobs = self.entries.len(), "cron scheduler started");

        let now = Utc::now();
        let mut next: Vec<Option<DateTime<Utc>>> = self
            .entries
            .iter()
            .map(|entry| {
                let at = entry.job.next_after(now);
                if at.is_none() {
                    warn!(job = %entry.job.name, "schedule has no upcoming fire time, skipping");
                }
                at
            })
            .collect();

        loop {
            let Some((index, at)) = next
                .iter()
                .enumerate()
                .filter_map(|(i, at)| at.map(|at| (i, at)))
                .min_by_key(|(_, at)| *at)
            else {
                info!("no upcoming fire times, scheduler exiting");
                break;
            };

            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                _ = stopping.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let entry = &self.entries[index];
            self.fire(entry, &stopping).await;

            // missed fire times are skipped rather than replayed
            next[index] = entry.job.next_after(at.max(Utc::now()));
        }

        info!("cron scheduler stopped");
    }

    async fn fire(&self, entry: &Entry, stopping: &CancellationToken) {
        let name = entry.job.name.as_str();
        let span = start_job_span(name);
        async {
            info!(job = name, "start scheduled background work");
            match self
                .queue
                .enqueue_with_cancel((entry.make_work)(), stopping)
                .await
            {
                Ok(id) => {
                    metrics::scheduler_fired().add(1, &[KeyValue::new("job", name.to_string())]);
                    info!(job = name, work.id = %id, "scheduled background work queued");
                }
                Err(e) => warn!(job = name, error = %e, "failed to queue scheduled work"),
            }
        }
        .instrument(span)
        .await
    }
}
