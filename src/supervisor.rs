use crate::audit::{AuditSink, AuditStatus};
use crate::config::ConfigStore;
use crate::error::{Result, ServmanError};
use crate::pidcache::PidCache;
use crate::process::resolver;
use crate::process::spawner::spawn_server;
use crate::process::terminator::{terminate_tree, verify_clean, ProcessInspector, ProcessProbe};
use crate::status::{OperationState, StatusTracker};
use crate::update::{UpdateEngine, UpdateReport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

/// Result of a start request.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    /// The server was already up; callers treat this as success
    AlreadyRunning(u32),
}

/// Liveness of a tracked server.
#[derive(Debug, PartialEq, Eq)]
pub enum LiveState {
    NotTracked,
    Running(u32),
    /// Tracked but the process is gone; awaiting crash handling
    Dead(u32),
}

/// A server under supervision. `child` is None for processes adopted
/// from the PID cache after a daemon restart.
struct LiveProcess {
    pid: u32,
    child: Option<Child>,
}

/// Builds one [`ProcessInspector`] per operation. Instances are never
/// shared, so a slow stop on one server cannot delay another.
type InspectorFactory = Box<dyn Fn() -> Box<dyn ProcessInspector> + Send + Sync>;

/// Owns the live-process table and serializes lifecycle operations.
///
/// Every start/stop/restart for one server runs under that server's
/// lock, so concurrent requests queue instead of double-spawning.
/// Operations on different servers proceed independently.
pub struct Supervisor {
    config: Arc<ConfigStore>,
    status: Arc<StatusTracker>,
    audit: Arc<dyn AuditSink>,
    update: UpdateEngine,
    pid_cache: PidCache,
    live: RwLock<HashMap<String, LiveProcess>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    inspector: InspectorFactory,
    notify: Option<mpsc::Sender<String>>,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigStore>, audit: Arc<dyn AuditSink>) -> Self {
        let status = Arc::new(StatusTracker::new());
        let update = UpdateEngine::new(Arc::clone(&status), Arc::clone(&audit));
        let pid_cache = PidCache::new(config.pid_cache_path());
        Self {
            config,
            status,
            audit,
            update,
            pid_cache,
            live: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            inspector: Box::new(|| {
                let probe: Box<dyn ProcessInspector> = Box::new(ProcessProbe::new());
                probe
            }),
            notify: None,
            stop_grace: Duration::from_secs(10),
        }
    }

    /// Bounded channel poked after every state change so front-ends can
    /// refresh. Sends never block; a full channel drops the poke.
    pub fn with_notify(mut self, sender: mpsc::Sender<String>) -> Self {
        self.notify = Some(sender);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Substitute the process inspection layer, mainly for tests.
    pub fn with_inspector<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ProcessInspector> + Send + Sync + 'static,
    {
        self.inspector = Box::new(factory);
        self
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn update_engine(&self) -> &UpdateEngine {
        &self.update
    }

    /// Start a declared server, updating it first when its settings ask
    /// for that. Starting an already-running server succeeds.
    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        self.config.reload();
        let entry = self
            .config
            .entry(name)
            .ok_or_else(|| ServmanError::NotConfigured(name.to_string()))?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.status.begin(name, "start");
        let result = self.start_inner(name, entry.executable.as_deref()).await;
        match &result {
            Ok(StartOutcome::Started(pid)) => {
                self.status.end_success(name);
                self.audit
                    .write("start", name, AuditStatus::Success, &format!("pid {}", pid));
            }
            Ok(StartOutcome::AlreadyRunning(pid)) => {
                self.status.end_success(name);
                tracing::info!("{} already running with PID {}", name, pid);
            }
            Err(e) => {
                self.status.end_failed(name, &e.to_string());
                self.audit
                    .write("start", name, AuditStatus::Failed, &e.to_string());
            }
        }
        self.poke(name);
        result
    }

    async fn start_inner(&self, name: &str, entry_exe: Option<&str>) -> Result<StartOutcome> {
        if let LiveState::Running(pid) = self.check_live(name).await {
            return Ok(StartOutcome::AlreadyRunning(pid));
        }

        let settings = self.config.settings(name);
        if settings.auto_update {
            // A failed pre-start update does not block the start; the
            // previously installed files are still launchable.
            let report = self
                .update
                .run_update_as(name, &self.config, "auto_update")
                .await;
            if !report.ok {
                tracing::warn!("Pre-start update for {} failed: {}", name, report.message);
            }
        }

        let install_root = self
            .config
            .install_root(name)
            .ok_or_else(|| ServmanError::NotConfigured(name.to_string()))?;
        let (executable, args) = resolver::server_command(
            &install_root,
            settings.executable.as_deref(),
            entry_exe,
            &settings.parameters,
        )
        .ok_or_else(|| ServmanError::ExecutableNotFound(name.to_string()))?;

        let spawned = spawn_server(&executable, &args, &install_root).await?;
        let pid = spawned.pid;
        self.live.write().await.insert(
            name.to_string(),
            LiveProcess {
                pid,
                child: Some(spawned.child),
            },
        );
        self.flush_pid_cache().await;
        tracing::info!("Started {} with PID {}", name, pid);
        Ok(StartOutcome::Started(pid))
    }

    /// Stop a server and everything else living under its install root.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.status.begin(name, "stop");
        let result = self.stop_inner(name).await;
        match &result {
            Ok(()) => {
                self.status.end_success(name);
                self.audit.write("stop", name, AuditStatus::Success, "");
            }
            Err(e) => {
                self.status.end_failed(name, &e.to_string());
                self.audit
                    .write("stop", name, AuditStatus::Failed, &e.to_string());
            }
        }
        self.poke(name);
        result
    }

    async fn stop_inner(&self, name: &str) -> Result<()> {
        let tracked = self.live.write().await.remove(name);
        let install_root = self.config.install_root(name);

        let mut probe = (self.inspector)();
        let mut related = match &install_root {
            Some(root) => probe.discover_related(root),
            None => Vec::new(),
        };

        if tracked.is_none() && related.is_empty() {
            return Err(ServmanError::NotRunning(name.to_string()));
        }

        let tracked_pid = tracked.as_ref().map(|lp| lp.pid);
        if let Some(mut lp) = tracked {
            related.retain(|&pid| pid != lp.pid);
            if let Some(mut child) = lp.child.take() {
                probe.signal(lp.pid, false);
                if timeout(self.stop_grace, child.wait()).await.is_err() {
                    tracing::warn!("{} ignored polite stop, killing PID {}", name, lp.pid);
                    child.kill().await.ok();
                    child.wait().await.ok();
                }
            } else {
                // Adopted process, no handle to wait on
                terminate_tree(&mut *probe, &[lp.pid]).await;
            }
        }

        terminate_tree(&mut *probe, &related).await;

        if let Some(root) = &install_root {
            let survivors = verify_clean(&mut *probe, root, tracked_pid);
            if !survivors.is_empty() {
                // Keep tracking the main process if it is among them so
                // a later stop can try again
                if let Some(pid) = tracked_pid.filter(|p| survivors.contains(p)) {
                    self.live
                        .write()
                        .await
                        .insert(name.to_string(), LiveProcess { pid, child: None });
                }
                return Err(ServmanError::ProcessesRemaining {
                    server: name.to_string(),
                    remaining: survivors.len(),
                });
            }
        }

        self.flush_pid_cache().await;
        tracing::info!("Stopped {}", name);
        Ok(())
    }

    /// Stop (when tracked as running) then start. A failed stop aborts
    /// the restart.
    pub async fn restart(&self, name: &str) -> Result<StartOutcome> {
        if matches!(self.check_live(name).await, LiveState::Running(_)) {
            self.stop(name).await?;
        }
        self.start(name).await
    }

    /// Best-effort shutdown sweep; per-server failures are logged and
    /// do not stop the sweep.
    pub async fn stop_all(&self) {
        for name in self.tracked_names().await {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!("Shutdown stop of {} failed: {}", name, e);
            }
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        matches!(self.check_live(name).await, LiveState::Running(_))
    }

    pub async fn running_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for name in self.tracked_names().await {
            if self.is_running(&name).await {
                names.push(name);
            }
        }
        names
    }

    pub async fn tracked_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Liveness of a tracked entry. Spawned children are checked via
    /// wait status (which also reaps them); adopted pids via the OS.
    pub async fn check_live(&self, name: &str) -> LiveState {
        let adopted_pid;
        {
            let mut live = self.live.write().await;
            let Some(lp) = live.get_mut(name) else {
                return LiveState::NotTracked;
            };
            let pid = lp.pid;
            if let Some(child) = lp.child.as_mut() {
                return match child.try_wait() {
                    Ok(None) => LiveState::Running(pid),
                    _ => LiveState::Dead(pid),
                };
            }
            adopted_pid = pid;
        }
        // Adopted process, no wait handle; ask the OS
        if (self.inspector)().is_alive(adopted_pid) {
            LiveState::Running(adopted_pid)
        } else {
            LiveState::Dead(adopted_pid)
        }
    }

    /// Drop a tracked entry whose process died on its own.
    pub async fn reap_crashed(&self, name: &str) {
        if let Some(mut lp) = self.live.write().await.remove(name) {
            if let Some(child) = lp.child.as_mut() {
                child.try_wait().ok();
            }
            self.audit.write(
                "crash-detected",
                name,
                AuditStatus::Warning,
                &format!("pid {} exited unexpectedly", lp.pid),
            );
        }
        self.flush_pid_cache().await;
        self.poke(name);
    }

    /// Track an externally started process (recovery bootstrap).
    pub async fn adopt(&self, name: &str, pid: u32) {
        self.live
            .write()
            .await
            .insert(name.to_string(), LiveProcess { pid, child: None });
        self.poke(name);
    }

    /// Forget a server entirely: live entry, status record, cached pid.
    /// The process itself is left alone.
    pub async fn remove_server(&self, name: &str) {
        self.live.write().await.remove(name);
        self.status.clear(name);
        self.flush_pid_cache().await;
        self.audit.write("remove", name, AuditStatus::Success, "");
        self.poke(name);
    }

    pub async fn run_update(&self, name: &str) -> UpdateReport {
        self.update.run_update(name, &self.config).await
    }

    pub async fn run_update_with_credentials(
        &self,
        name: &str,
        username: &str,
        password: &str,
    ) -> UpdateReport {
        self.update
            .run_update_with_credentials(name, username, password, &self.config)
            .await
    }

    /// First-time install: licensed update, falling back to an
    /// anonymous retry when the account has no license for the app.
    pub async fn install_server(&self, name: &str) -> UpdateReport {
        let report = self.update.run_update(name, &self.config).await;
        if report.ok || !report.message.contains("no license") {
            return report;
        }
        let has_credentials = self
            .config
            .entry(name)
            .is_some_and(|e| e.username.is_some());
        if !has_credentials {
            return report;
        }
        tracing::warn!("{}: licensed install rejected, retrying anonymously", name);
        self.update.run_update_anonymous(name, &self.config).await
    }

    /// Coarse state string for front-ends.
    pub async fn display_state(&self, name: &str) -> &'static str {
        match self.status.status(name) {
            OperationState::Busy(label) => match label.as_str() {
                "start" => "STARTING",
                "stop" => "STOPPING",
                _ => "UPDATING",
            },
            OperationState::Failed(_) => "FAILED",
            OperationState::Idle => {
                if self.is_running(name).await {
                    "RUNNING"
                } else {
                    "STOPPED"
                }
            }
        }
    }

    pub fn operation_state(&self, name: &str) -> OperationState {
        self.status.status(name)
    }

    pub fn probe_is_alive(&self, pid: u32) -> bool {
        (self.inspector)().is_alive(pid)
    }

    /// Rewrite the PID cache from the live table.
    pub async fn flush_pid_cache(&self) {
        let entries: HashMap<String, u32> = self
            .live
            .read()
            .await
            .iter()
            .map(|(name, lp)| (name.clone(), lp.pid))
            .collect();
        if let Err(e) = self.pid_cache.save(&entries) {
            tracing::warn!("PID cache write failed: {}", e);
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn poke(&self, name: &str) {
        if let Some(sender) = &self.notify {
            sender.try_send(name.to_string()).ok();
        }
    }
}
