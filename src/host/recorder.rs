//! Observer hook for raw protocol traffic.

use std::sync::Mutex;

/// One recorded item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEntry {
    /// A line written to the agent.
    Sent(String),
    /// A line read from the agent.
    Received(String),
    TurnStart(u64),
    TurnEnd { number: u64, success: bool },
}

/// Receives every raw line and turn boundary. Must not block.
pub trait Recorder: Send + Sync {
    fn record(&self, entry: RecordEntry);
}

/// Keeps entries in memory, mostly for tests and replay tooling.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    entries: Mutex<Vec<RecordEntry>>,
}

impl MemoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<RecordEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, entry: RecordEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
