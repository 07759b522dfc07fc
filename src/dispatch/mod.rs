//! Request dispatchers: the queue consumer and the filesystem batch.

pub mod file;
pub mod metrics;
pub mod queue;

pub use file::{BatchSummary, FileDispatcher};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use queue::QueueDispatcher;
