pub mod collector;
pub mod snapshot;

pub use collector::{Metrics, MetricsCollector};
pub use snapshot::{sum_per_core, CounterSnapshot, CounterTotals};
