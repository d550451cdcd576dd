pub mod collector;

pub use collector::{MetricsSnapshot, RefreshTimer, SyncMetrics};
