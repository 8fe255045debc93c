//! Background execution engine: worker loop, per-item execution, host lifecycle.

pub mod execute;
pub mod host;
pub mod worker;

pub use execute::ExecutionResult;
pub use host::{BackgroundHost, start};
pub use worker::{ShutdownOutcome, WorkerLoop};
