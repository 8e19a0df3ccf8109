//! Scalar summaries emitted while transforming weights.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Sink for named scalar summaries.
///
/// `verbosity` follows the host convention: lower values are more
/// important. Implementations decide which levels to keep.
pub trait SummaryWriter: Send + Sync {
    /// Record `value` under `name`.
    fn add_summary(&self, name: &str, value: f64, verbosity: u8);
}

/// Forwards summaries to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSummary;

impl SummaryWriter for TracingSummary {
    fn add_summary(&self, name: &str, value: f64, verbosity: u8) {
        debug!(summary = name, value, verbosity, "summary");
    }
}

/// One recorded summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    /// Summary name.
    pub name: String,
    /// Recorded value.
    pub value: f64,
    /// Verbosity level it was emitted at.
    pub verbosity: u8,
}

/// Keeps every summary in memory.
#[derive(Debug, Default)]
pub struct RecordingSummary {
    entries: Mutex<Vec<SummaryEntry>>,
}

impl RecordingSummary {
    /// Empty recorder, shareable across layers.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<SummaryEntry> {
        self.entries.lock().clone()
    }

    /// Values recorded under `name`, in emission order.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .collect()
    }
}

impl SummaryWriter for RecordingSummary {
    fn add_summary(&self, name: &str, value: f64, verbosity: u8) {
        self.entries.lock().push(SummaryEntry {
            name: name.to_string(),
            value,
            verbosity,
        });
    }
}
