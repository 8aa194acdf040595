#![cfg(unix)]

use servman::audit::{AuditStatus, MemoryAudit};
use servman::config::ConfigStore;
use servman::error::ServmanError;
use servman::process::terminator::ProcessInspector;
use servman::status::OperationState;
use servman::supervisor::{LiveState, StartOutcome, Supervisor};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const APP_ID: &str = "896660";

/// Fleet with one server whose "executable" is a shell script that
/// sleeps, standing in for a game server process.
fn fixture(dir: &TempDir) -> (Arc<ConfigStore>, PathBuf) {
    let config_path = dir.path().join("fleet.toml");
    fs::write(
        &config_path,
        format!("[servers.alpha]\napp_id = \"{}\"\n", APP_ID),
    )
    .unwrap();

    let install_root = dir
        .path()
        .join("servers")
        .join(APP_ID)
        .join("serverfiles");
    fs::create_dir_all(&install_root).unwrap();

    let script = install_root.join("run.sh");
    fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    fs::write(
        install_root.join("server_settings.json"),
        r#"{"executable": "run.sh", "auto_update": false, "auto_restart": true}"#,
    )
    .unwrap();

    (Arc::new(ConfigStore::new(&config_path, dir.path())), install_root)
}

fn build(config: Arc<ConfigStore>) -> (Arc<Supervisor>, Arc<MemoryAudit>) {
    let audit = Arc::new(MemoryAudit::new());
    let supervisor = Arc::new(
        Supervisor::new(config, audit.clone()).with_stop_grace(Duration::from_secs(3)),
    );
    (supervisor, audit)
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let cache_path = config.pid_cache_path();
    let (supervisor, audit) = build(config);

    let StartOutcome::Started(pid) = supervisor.start("alpha").await.unwrap() else {
        panic!("expected a fresh start");
    };
    assert!(supervisor.is_running("alpha").await);
    assert_eq!(supervisor.display_state("alpha").await, "RUNNING");

    let cached: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
    assert_eq!(cached["alpha"], pid);

    // Starting again is a no-op success
    assert_eq!(
        supervisor.start("alpha").await.unwrap(),
        StartOutcome::AlreadyRunning(pid)
    );

    supervisor.stop("alpha").await.unwrap();
    assert!(!supervisor.is_running("alpha").await);
    assert_eq!(supervisor.display_state("alpha").await, "STOPPED");

    let cached: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
    assert!(cached.as_object().unwrap().is_empty());

    assert_eq!(
        audit.for_action("start"),
        vec![("alpha".to_string(), AuditStatus::Success)]
    );
    assert_eq!(
        audit.for_action("stop"),
        vec![("alpha".to_string(), AuditStatus::Success)]
    );
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let (supervisor, audit) = build(config);

    let (a, b) = tokio::join!(supervisor.start("alpha"), supervisor.start("alpha"));
    let outcomes = [a.unwrap(), b.unwrap()];

    let started: Vec<u32> = outcomes
        .iter()
        .filter_map(|o| match o {
            StartOutcome::Started(pid) => Some(*pid),
            StartOutcome::AlreadyRunning(_) => None,
        })
        .collect();
    assert_eq!(started.len(), 1, "exactly one caller spawns");
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, StartOutcome::Started(p) | StartOutcome::AlreadyRunning(p) if *p == started[0])));
    assert_eq!(audit.for_action("start").len(), 1);

    supervisor.stop("alpha").await.unwrap();
}

#[tokio::test]
async fn test_stop_with_nothing_running_fails() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let (supervisor, audit) = build(config);

    let err = supervisor.stop("alpha").await.unwrap_err();
    assert!(matches!(err, ServmanError::NotRunning(_)));
    assert!(matches!(
        supervisor.operation_state("alpha"),
        OperationState::Failed(_)
    ));
    assert_eq!(
        audit.for_action("stop"),
        vec![("alpha".to_string(), AuditStatus::Failed)]
    );
}

#[tokio::test]
async fn test_start_unknown_server_fails() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let (supervisor, _) = build(config);

    let err = supervisor.start("ghost").await.unwrap_err();
    assert!(matches!(err, ServmanError::NotConfigured(_)));
}

#[tokio::test]
async fn test_start_without_executable_fails() {
    let dir = TempDir::new().unwrap();
    let (config, install_root) = fixture(&dir);
    fs::remove_file(install_root.join("run.sh")).unwrap();
    let (supervisor, audit) = build(config);

    let err = supervisor.start("alpha").await.unwrap_err();
    assert!(matches!(err, ServmanError::ExecutableNotFound(_)));
    assert_eq!(
        audit.for_action("start"),
        vec![("alpha".to_string(), AuditStatus::Failed)]
    );
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let (supervisor, _) = build(config);

    let StartOutcome::Started(first) = supervisor.start("alpha").await.unwrap() else {
        panic!("expected a fresh start");
    };
    let StartOutcome::Started(second) = supervisor.restart("alpha").await.unwrap() else {
        panic!("restart should spawn anew");
    };
    assert_ne!(first, second);
    assert!(supervisor.is_running("alpha").await);

    supervisor.stop("alpha").await.unwrap();
}

#[tokio::test]
async fn test_crash_detection_and_reap() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let (supervisor, audit) = build(config);

    let StartOutcome::Started(pid) = supervisor.start("alpha").await.unwrap() else {
        panic!("expected a fresh start");
    };

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(supervisor.check_live("alpha").await, LiveState::Dead(pid));
    supervisor.reap_crashed("alpha").await;
    assert_eq!(supervisor.check_live("alpha").await, LiveState::NotTracked);
    assert_eq!(
        audit.for_action("crash-detected"),
        vec![("alpha".to_string(), AuditStatus::Warning)]
    );
}

/// Two servers whose scripts ignore SIGTERM, so each stop waits out the
/// full grace period before escalating.
fn stubborn_fixture(dir: &TempDir) -> Arc<ConfigStore> {
    let config_path = dir.path().join("fleet.toml");
    fs::write(
        &config_path,
        "[servers.alpha]\napp_id = \"896660\"\n\n[servers.beta]\napp_id = \"896661\"\n",
    )
    .unwrap();

    for app_id in ["896660", "896661"] {
        let install_root = dir.path().join("servers").join(app_id).join("serverfiles");
        fs::create_dir_all(&install_root).unwrap();

        let script = install_root.join("run.sh");
        fs::write(&script, "#!/bin/sh\ntrap '' TERM\nexec sleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        fs::write(
            install_root.join("server_settings.json"),
            r#"{"executable": "run.sh", "auto_update": false, "auto_restart": false}"#,
        )
        .unwrap();
    }

    Arc::new(ConfigStore::new(&config_path, dir.path()))
}

#[tokio::test]
async fn test_stops_of_distinct_servers_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    let config = stubborn_fixture(&dir);
    let audit = Arc::new(MemoryAudit::new());
    let supervisor = Arc::new(
        Supervisor::new(config, audit.clone()).with_stop_grace(Duration::from_secs(2)),
    );

    supervisor.start("alpha").await.unwrap();
    supervisor.start("beta").await.unwrap();

    let begun = std::time::Instant::now();
    let (a, b) = tokio::join!(supervisor.stop("alpha"), supervisor.stop("beta"));
    a.unwrap();
    b.unwrap();
    let elapsed = begun.elapsed();

    // Both stops wait out the grace concurrently; back-to-back would
    // take at least twice the grace period.
    assert!(
        elapsed < Duration::from_millis(3500),
        "stops of distinct servers serialized: {:?}",
        elapsed
    );
    assert!(!supervisor.is_running("alpha").await);
    assert!(!supervisor.is_running("beta").await);
}

/// Inspector claiming one pid can never be killed.
struct ImmortalInspector {
    pid: Arc<AtomicU32>,
}

impl ProcessInspector for ImmortalInspector {
    fn is_alive(&mut self, pid: u32) -> bool {
        pid != 0 && pid == self.pid.load(Ordering::SeqCst)
    }

    fn discover_related(&mut self, _install_root: &std::path::Path) -> Vec<u32> {
        Vec::new()
    }

    fn signal(&mut self, _pid: u32, _force: bool) {}
}

#[tokio::test]
async fn test_failed_stop_keeps_tracking_the_survivor() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let audit = Arc::new(MemoryAudit::new());

    let immortal = Arc::new(AtomicU32::new(0));
    let supervisor = {
        let immortal = Arc::clone(&immortal);
        Arc::new(
            Supervisor::new(config, audit.clone())
                .with_stop_grace(Duration::from_millis(200))
                .with_inspector(move || {
                    Box::new(ImmortalInspector {
                        pid: Arc::clone(&immortal),
                    })
                }),
        )
    };

    let StartOutcome::Started(pid) = supervisor.start("alpha").await.unwrap() else {
        panic!("expected a fresh start");
    };
    immortal.store(pid, Ordering::SeqCst);

    let err = supervisor.stop("alpha").await.unwrap_err();
    assert!(matches!(
        err,
        ServmanError::ProcessesRemaining { remaining: 1, .. }
    ));
    assert_eq!(err.to_string(), "1 processes remaining under alpha");

    // The survivor stays tracked so a later stop can try again
    assert_eq!(supervisor.check_live("alpha").await, LiveState::Running(pid));
    assert!(matches!(
        supervisor.operation_state("alpha"),
        OperationState::Failed(_)
    ));
    assert_eq!(
        audit.for_action("stop"),
        vec![("alpha".to_string(), AuditStatus::Failed)]
    );
}

fn license_rejecting_tool(base: &std::path::Path) {
    let steam = base.join("steam");
    fs::create_dir_all(&steam).unwrap();
    let tool = steam.join("steamcmd.sh");
    fs::write(&tool, "#!/bin/sh\necho 'ERROR! No subscription'\nexit 8\n").unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_install_retries_anonymously_without_license() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("fleet.toml");
    fs::write(
        &config_path,
        "[servers.alpha]\napp_id = \"896660\"\nusername = \"steamuser\"\npassword = \"pw\"\n",
    )
    .unwrap();
    license_rejecting_tool(dir.path());

    let config = Arc::new(ConfigStore::new(&config_path, dir.path()));
    let (supervisor, audit) = build(config);

    let report = supervisor.install_server("alpha").await;
    assert!(!report.ok);
    assert!(report.message.contains("no license"));
    // The licensed attempt plus the anonymous retry
    assert_eq!(audit.for_action("update").len(), 2);
}

#[tokio::test]
async fn test_install_without_credentials_does_not_retry() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("fleet.toml");
    fs::write(&config_path, "[servers.alpha]\napp_id = \"896660\"\n").unwrap();
    license_rejecting_tool(dir.path());

    let config = Arc::new(ConfigStore::new(&config_path, dir.path()));
    let (supervisor, audit) = build(config);

    let report = supervisor.install_server("alpha").await;
    assert!(!report.ok);
    assert_eq!(audit.for_action("update").len(), 1);
}

#[tokio::test]
async fn test_remove_server_forgets_everything() {
    let dir = TempDir::new().unwrap();
    let (config, _) = fixture(&dir);
    let cache_path = config.pid_cache_path();
    let (supervisor, _) = build(config);

    let StartOutcome::Started(pid) = supervisor.start("alpha").await.unwrap() else {
        panic!("expected a fresh start");
    };

    supervisor.remove_server("alpha").await;
    assert!(!supervisor.is_running("alpha").await);
    assert_eq!(supervisor.operation_state("alpha"), OperationState::Idle);

    let cached: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
    assert!(cached.as_object().unwrap().is_empty());

    // The process itself is deliberately left alone; clean it up here
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .ok();
}
