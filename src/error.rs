//! Error types for sampleapp-bg.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("task queue is closed")]
    QueueClosed,

    #[error("enqueue cancelled while waiting for capacity")]
    EnqueueCancelled,

    #[error("no scoped registration for {type_name}")]
    Resolve { type_name: &'static str },

    #[error("scope error: {0}")]
    Scope(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("bad schedule for job {job}: {reason}")]
    Schedule { job: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
