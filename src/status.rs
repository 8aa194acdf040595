use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a recorded failure stays visible to pollers.
pub const FAILED_TTL: Duration = Duration::from_secs(900);

/// Coarse per-server operation state reported to front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// An operation is in flight; payload is its label ("start", "update", ...)
    Busy(String),
    /// The last operation failed; payload is the failure message
    Failed(String),
    /// No operation in flight and no recent failure
    Idle,
}

#[derive(Debug, Default)]
struct Record {
    busy_count: u32,
    label: String,
    failed_at: Option<Instant>,
    failed_msg: String,
    /// Whether the failure was recorded during the current busy cycle;
    /// a balancing end_success must not erase such a failure.
    failed_this_cycle: bool,
}

/// Process-wide table recording which servers have an operation in flight
/// and which recently failed.
///
/// Begin/end calls nest: a start that internally triggers an update calls
/// `begin` twice, and the busy label only clears once the counts balance.
/// A failure stays visible for [`FAILED_TTL`] even after the failing call
/// returns, so asynchronously polling front-ends still observe it.
pub struct StatusTracker {
    records: Mutex<HashMap<String, Record>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Mark an operation as started for `name`, creating the record if
    /// absent. An empty label keeps the current one (outermost wins).
    pub fn begin(&self, name: &str, label: &str) {
        let mut records = self.lock();
        let record = records.entry(name.to_string()).or_default();
        if record.busy_count == 0 {
            record.failed_this_cycle = false;
        }
        record.busy_count += 1;
        if !label.is_empty() {
            record.label = label.to_string();
        }
    }

    /// Balance one `begin`; when the count reaches zero the label clears,
    /// along with any failure left over from a previous cycle. A failure
    /// recorded inside the current cycle (a nested end_failed) survives.
    pub fn end_success(&self, name: &str) {
        let mut records = self.lock();
        let Some(record) = records.get_mut(name) else {
            return;
        };
        record.busy_count = record.busy_count.saturating_sub(1);
        if record.busy_count == 0 {
            record.label.clear();
            if !record.failed_this_cycle {
                record.failed_at = None;
                record.failed_msg.clear();
            }
        }
    }

    /// Balance one `begin` and record a failure. The failed state is kept
    /// even when the count reaches zero (only the label clears).
    pub fn end_failed(&self, name: &str, message: &str) {
        let mut records = self.lock();
        let record = records.entry(name.to_string()).or_default();
        record.busy_count = record.busy_count.saturating_sub(1);
        record.failed_at = Some(Instant::now());
        record.failed_msg = message.trim().to_string();
        record.failed_this_cycle = true;
        if record.busy_count == 0 {
            record.label.clear();
        }
    }

    /// Current state for `name`. Expired failures revert to `Idle`, at
    /// which point callers should consult the live-process table instead.
    pub fn status(&self, name: &str) -> OperationState {
        let mut records = self.lock();
        let Some(record) = records.get_mut(name) else {
            return OperationState::Idle;
        };

        if record.busy_count > 0 {
            return OperationState::Busy(record.label.clone());
        }

        if let Some(failed_at) = record.failed_at {
            if failed_at.elapsed() <= FAILED_TTL {
                return OperationState::Failed(record.failed_msg.clone());
            }
            record.failed_at = None;
            record.failed_msg.clear();
        }

        OperationState::Idle
    }

    /// Drop the record entirely (server removed from the system).
    pub fn clear(&self, name: &str) {
        self.lock().remove(name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Record>> {
        // A poisoned map is still structurally sound; counters stay usable.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn backdate_failure(&self, name: &str, age: Duration) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(name) {
            record.failed_at = Instant::now().checked_sub(age);
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
