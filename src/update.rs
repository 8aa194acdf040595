use crate::audit::{AuditSink, AuditStatus};
use crate::config::ConfigStore;
use crate::error::ServmanError;
use crate::process::resolver;
use crate::status::StatusTracker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Marker steamcmd prints on a fully applied app_update.
const SUCCESS_MARKER: &str = "Success!";

/// Known steamcmd failure substrings mapped to operator-readable reasons.
/// Matching any of these makes the failure authoritative even when the
/// install tree looks complete.
const FAILURE_REASONS: &[(&str, &str)] = &[
    ("no subscription", "account has no license for this app (No subscription)"),
    ("steam guard", "Steam Guard code required (2FA)"),
    ("invalid password", "invalid password"),
    ("not logged in", "not logged in"),
    ("0x202", "connection problem while downloading (0x202)"),
    ("app not released", "app not released for this platform or account"),
    ("invalid platform", "invalid platform"),
    ("missing dependency", "missing dependency"),
    ("access denied", "access denied"),
    ("disk write failure", "disk write failure"),
];

/// Outcome of one update run. Never an Err: callers decide what a
/// failed update means for them (a scheduled update is logged, a manual
/// install is reported back to the operator).
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub ok: bool,
    /// Success with caveats (timeout or nonzero exit, install verified)
    pub warning: bool,
    pub message: String,
}

impl UpdateReport {
    fn success(message: String) -> Self {
        Self {
            ok: true,
            warning: false,
            message,
        }
    }

    fn warned(message: String) -> Self {
        Self {
            ok: true,
            warning: true,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            ok: false,
            warning: false,
            message,
        }
    }
}

/// Runs steamcmd installs and updates, one at a time per server.
///
/// A second update for the same server is rejected immediately instead
/// of queued: the caller that lost the race has nothing useful to do
/// but report "already running". Different servers update concurrently.
pub struct UpdateEngine {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    status: Arc<StatusTracker>,
    audit: Arc<dyn AuditSink>,
}

impl UpdateEngine {
    pub fn new(status: Arc<StatusTracker>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            status,
            audit,
        }
    }

    /// Update using the credentials declared in the fleet entry
    /// (anonymous when none). Audited under the given action name so
    /// scheduled runs are distinguishable from operator-driven ones.
    pub async fn run_update_as(
        &self,
        name: &str,
        config: &ConfigStore,
        action: &str,
    ) -> UpdateReport {
        let Some(entry) = config.entry(name) else {
            return UpdateReport::failed(ServmanError::NotConfigured(name.to_string()).to_string());
        };
        let login = match (entry.username.as_deref(), entry.password.as_deref()) {
            (Some(user), Some(pass)) => Login::Account {
                username: user.to_string(),
                password: pass.to_string(),
            },
            _ => Login::Anonymous,
        };
        self.run_locked(name, &entry.app_id, login, config, action)
            .await
    }

    pub async fn run_update(&self, name: &str, config: &ConfigStore) -> UpdateReport {
        self.run_update_as(name, config, "update").await
    }

    /// Anonymous-login retry used when a licensed install is rejected
    /// for lack of a subscription.
    pub async fn run_update_anonymous(&self, name: &str, config: &ConfigStore) -> UpdateReport {
        let Some(entry) = config.entry(name) else {
            return UpdateReport::failed(ServmanError::NotConfigured(name.to_string()).to_string());
        };
        self.run_locked(name, &entry.app_id, Login::Anonymous, config, "update")
            .await
    }

    /// Explicit-login variant for operator-driven installs.
    pub async fn run_update_with_credentials(
        &self,
        name: &str,
        username: &str,
        password: &str,
        config: &ConfigStore,
    ) -> UpdateReport {
        let Some(entry) = config.entry(name) else {
            return UpdateReport::failed(ServmanError::NotConfigured(name.to_string()).to_string());
        };
        let login = Login::Account {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.run_locked(name, &entry.app_id, login, config, "update")
            .await
    }

    async fn run_locked(
        &self,
        name: &str,
        app_id: &str,
        login: Login,
        config: &ConfigStore,
        action: &str,
    ) -> UpdateReport {
        let lock = self.lock_for(name);
        let Ok(_guard) = lock.try_lock_owned() else {
            return UpdateReport::failed(
                ServmanError::UpdateInProgress(name.to_string()).to_string(),
            );
        };

        self.status.begin(name, "update");
        let report = self.execute(name, app_id, login, config).await;
        if report.ok {
            self.status.end_success(name);
            let status = if report.warning {
                AuditStatus::Warning
            } else {
                AuditStatus::Success
            };
            self.audit.write(action, name, status, &report.message);
        } else {
            self.status.end_failed(name, &report.message);
            self.audit.write(action, name, AuditStatus::Failed, &report.message);
        }
        report
    }

    async fn execute(
        &self,
        name: &str,
        app_id: &str,
        login: Login,
        config: &ConfigStore,
    ) -> UpdateReport {
        let steam_dir = config.steam_dir();
        let tool = steamcmd_path(&steam_dir);
        if !tool.is_file() {
            return UpdateReport::failed(
                ServmanError::UpdateToolMissing(tool.display().to_string()).to_string(),
            );
        }

        let Some(install_root) = config.install_root(name) else {
            return UpdateReport::failed(ServmanError::NotConfigured(name.to_string()).to_string());
        };
        if let Err(e) = std::fs::create_dir_all(&install_root) {
            return UpdateReport::failed(format!(
                "Cannot create install dir {}: {}",
                install_root.display(),
                e
            ));
        }

        let session_dir = config.sessions_dir().join(name);
        copy_session_files(&session_dir, &steam_dir);

        let mut args: Vec<String> = vec![
            "+force_install_dir".into(),
            install_root.display().to_string(),
            "+login".into(),
        ];
        match &login {
            Login::Anonymous => args.push("anonymous".into()),
            Login::Account { username, password } => {
                args.push(username.clone());
                args.push(password.clone());
            }
        }
        args.extend([
            "+app_update".into(),
            app_id.to_string(),
            "validate".into(),
            "+quit".into(),
        ]);

        tracing::info!(
            "Updating {} (app {}) via {} as {}",
            name,
            app_id,
            tool.display(),
            login.display_user()
        );

        let started = Instant::now();
        let mut child = match Command::new(&tool)
            .args(&args)
            .current_dir(&steam_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return UpdateReport::failed(format!("Failed to launch update tool: {}", e))
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout));
        let stderr_task = tokio::spawn(read_stream(stderr));

        let wait = timeout(config.update_timeout(), child.wait()).await;

        let timed_out = wait.is_err();
        let exit_code = match wait {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                return UpdateReport::failed(format!("Update tool wait failed: {}", e));
            }
            Err(_) => {
                child.start_kill().ok();
                child.wait().await.ok();
                None
            }
        };

        let mut output = stdout_task.await.unwrap_or_default();
        output.push_str(&stderr_task.await.unwrap_or_default());

        let settings = config.settings(name);
        let entry = config.entry(name);
        let looks_good = install_looks_good(
            &install_root,
            settings.executable.as_deref(),
            entry.and_then(|e| e.executable).as_deref(),
        );

        let report = if timed_out {
            if looks_good {
                tracing::warn!("Update for {} timed out but the install verifies", name);
                UpdateReport::warned("timed out, but the installed files verify as complete".into())
            } else {
                let minutes = config.update_timeout().as_secs() / 60;
                UpdateReport::failed(ServmanError::UpdateTimeout(minutes).to_string())
            }
        } else if exit_code == Some(0) {
            UpdateReport::success(format!(
                "installed in {:.1}s",
                started.elapsed().as_secs_f64()
            ))
        } else {
            classify_failure(exit_code, &output, looks_good)
        };

        // Keep login and app-manifest artifacts for the next run
        if report.ok {
            save_session_files(&steam_dir, &session_dir);
        }
        report
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

enum Login {
    Anonymous,
    Account { username: String, password: String },
}

impl Login {
    fn display_user(&self) -> &str {
        match self {
            Login::Anonymous => "anonymous",
            Login::Account { username, .. } => username,
        }
    }
}

fn steamcmd_path(steam_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        steam_dir.join("steamcmd.exe")
    } else {
        steam_dir.join("steamcmd.sh")
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.ok();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Map a nonzero steamcmd exit to a report. A known failure reason in
/// the output is authoritative; otherwise a verified install tree plus
/// the success marker counts as success with a warning, since steamcmd
/// often exits nonzero on cleanup after a completed update.
fn classify_failure(exit_code: Option<i32>, output: &str, looks_good: bool) -> UpdateReport {
    let lowered = output.to_lowercase();
    for (needle, reason) in FAILURE_REASONS {
        if lowered.contains(needle) {
            return UpdateReport::failed((*reason).to_string());
        }
    }

    if looks_good && output.contains(SUCCESS_MARKER) {
        return UpdateReport::warned(
            "update tool exited nonzero, but the install verifies as complete".into(),
        );
    }

    let excerpt: String = output.chars().take(1000).collect();
    let code = exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".into());
    UpdateReport::failed(format!("update tool exit code {}: {}", code, excerpt))
}

/// A plausible finished install: more than 10 files on disk and a
/// resolvable server executable.
fn install_looks_good(
    install_root: &Path,
    settings_exe: Option<&str>,
    entry_exe: Option<&str>,
) -> bool {
    count_files(install_root, 11) > 10
        && resolver::resolve_executable(install_root, settings_exe, entry_exe).is_some()
}

fn count_files(dir: &Path, cap: usize) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                count += 1;
                if count >= cap {
                    return count;
                }
            }
        }
    }
    count
}

/// Login/session artifacts steamcmd keeps between runs. Preserving them
/// per server avoids re-prompting Steam Guard on every licensed update.
fn copy_session_files(from: &Path, to: &Path) {
    if !from.is_dir() {
        return;
    }

    let mut relative: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(from) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("ssfn") && entry.path().is_file() {
                relative.push(PathBuf::from(name));
            }
        }
    }
    relative.push(PathBuf::from("config").join("config.vdf"));
    relative.push(PathBuf::from("appcache").join("appinfo.vdf"));
    if let Ok(entries) = std::fs::read_dir(from.join("steamapps")) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "vdf") {
                relative.push(PathBuf::from("steamapps").join(entry.file_name()));
            }
        }
    }

    for rel in relative {
        let src = from.join(&rel);
        if !src.is_file() {
            continue;
        }
        let dst = to.join(&rel);
        if let Some(parent) = dst.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::debug!("Session copy mkdir {} failed: {}", parent.display(), e);
                continue;
            }
        }
        if let Err(e) = std::fs::copy(&src, &dst) {
            tracing::debug!("Session copy {} failed: {}", rel.display(), e);
        }
    }
}

/// Persist the session artifacts produced by a successful licensed run.
pub fn save_session_files(steam_dir: &Path, session_dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(session_dir) {
        tracing::debug!("Session dir create failed: {}", e);
        return;
    }
    copy_session_files(steam_dir, session_dir);
}
