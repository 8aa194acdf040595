use crate::audit::AuditStatus;
use crate::pidcache::PidCache;
use crate::supervisor::Supervisor;

/// Re-adopt servers that kept running across a daemon restart.
///
/// Reads the PID cache once and adopts every entry whose pid is still
/// alive and whose name is still declared in the fleet. Everything else
/// is recorded as a failed recovery and dropped. Nothing is started or
/// stopped here.
pub async fn recover_running(supervisor: &Supervisor) -> usize {
    let cached = PidCache::new(supervisor.config().pid_cache_path()).load();
    if cached.is_empty() {
        return 0;
    }

    let mut adopted = 0;
    let mut names: Vec<&String> = cached.keys().collect();
    names.sort();

    for name in names {
        let pid = cached[name];
        let declared = supervisor.config().entry(name).is_some();
        let alive = supervisor.probe_is_alive(pid);

        if declared && alive {
            supervisor.adopt(name, pid).await;
            supervisor.audit().write(
                "recovery",
                name,
                AuditStatus::Success,
                &format!("re-adopted pid {}", pid),
            );
            tracing::info!("Recovered {} (PID {})", name, pid);
            adopted += 1;
        } else {
            let reason = if !declared {
                "no longer declared"
            } else {
                "cached pid is stale"
            };
            supervisor
                .audit()
                .write("recovery", name, AuditStatus::Failed, reason);
            tracing::warn!("Not recovering {} (pid {}): {}", name, pid, reason);
        }
    }

    // Rewrite the cache so stale entries disappear
    supervisor.flush_pid_cache().await;
    adopted
}
