//! Process supervision engine for a fleet of game dedicated servers.
//!
//! One supervisor owns the live-process table and serializes lifecycle
//! operations per server; a background monitor handles crash restarts
//! and daily scheduled stop/update windows; the update engine drives
//! steamcmd installs with single-flight per server. State that must
//! survive a daemon restart (last-known pids) lives in a small JSON
//! cache and is re-adopted by the recovery bootstrap.

pub mod audit;
pub mod config;
pub mod error;
pub mod monitor;
pub mod pidcache;
pub mod process;
pub mod recovery;
pub mod status;
pub mod supervisor;
pub mod update;

pub use audit::{AuditSink, AuditStatus, FileAudit, MemoryAudit};
pub use config::{ConfigStore, FleetConfig, ServerEntry, ServerSettings};
pub use error::{Result, ServmanError};
pub use monitor::Monitor;
pub use pidcache::PidCache;
pub use process::terminator::{ProcessInspector, ProcessProbe};
pub use status::{OperationState, StatusTracker};
pub use supervisor::{LiveState, StartOutcome, Supervisor};
pub use update::{UpdateEngine, UpdateReport};
