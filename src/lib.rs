//! # sampleapp-bg
//!
//! In-process background work for the SampleApp services.
//!
//! Application code enqueues fire-and-forget work on a bounded [`TaskQueue`];
//! a single worker loop executes items one at a time, resolving scoped
//! dependencies per item and isolating failures. The host stops the worker
//! with a bounded drain at shutdown. A cron scheduler enqueues work on a
//! schedule.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sampleapp_bg::config::QueueConfig;
//! use sampleapp_bg::scope::ServiceContainer;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut services = ServiceContainer::new();
//! services.register_scoped(|_| Ok(String::from("scoped repository")));
//!
//! let (queue, host) = sampleapp_bg::engine::start(&QueueConfig::default(), Arc::new(services));
//!
//! queue.queue_work(|_token| async { Ok(()) }).await?;
//! queue
//!     .queue_scoped_work::<String, _, _>(|repo, _token| async move {
//!         tracing::info!(%repo, "scoped work");
//!         Ok(())
//!     })
//!     .await?;
//!
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod scope;
pub mod telemetry;

pub use error::{Error, Result};
pub use model::{WorkId, WorkItem, WorkerState};
pub use queue::{TaskQueue, WorkReceiver};
