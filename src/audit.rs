use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Outcome recorded with an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failed,
    Warning,
}

/// Destination for lifecycle audit entries (starts, stops, crashes,
/// updates, recovery).
///
/// Writing an audit entry must never fail the operation being audited:
/// implementations log their own errors and return normally.
pub trait AuditSink: Send + Sync {
    fn write(&self, action: &str, server: &str, status: AuditStatus, detail: &str);
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    action: &'a str,
    server: &'a str,
    status: AuditStatus,
    detail: &'a str,
}

/// Append-only JSON-lines audit log.
pub struct FileAudit {
    path: PathBuf,
    // Serializes appends from concurrent operations
    guard: Mutex<()>,
}

impl FileAudit {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    fn append(&self, entry: &AuditEntry<'_>) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl AuditSink for FileAudit {
    fn write(&self, action: &str, server: &str, status: AuditStatus, detail: &str) {
        let entry = AuditEntry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            action,
            server,
            status,
            detail,
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!("Failed to write audit entry for {}: {}", server, e);
        }
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<(String, String, AuditStatus, String)>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, String, AuditStatus, String)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Entries recorded for one action, as (server, status) pairs.
    pub fn for_action(&self, action: &str) -> Vec<(String, AuditStatus)> {
        self.entries()
            .into_iter()
            .filter(|(a, _, _, _)| a == action)
            .map(|(_, server, status, _)| (server, status))
            .collect()
    }
}

impl AuditSink for MemoryAudit {
    fn write(&self, action: &str, server: &str, status: AuditStatus, detail: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((
                action.to_string(),
                server.to_string(),
                status,
                detail.to_string(),
            ));
    }
}
