use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Grace between a force-kill and any rescan of the process table.
const KILL_SETTLE: Duration = Duration::from_millis(200);

/// True when `path` sits inside `root`.
///
/// Comparison is component-wise, so `/srv/app-10` is never treated as
/// inside `/srv/app-1`.
pub fn path_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Platform process access: liveness, install-root discovery, and raw
/// signalling. Production code uses [`ProcessProbe`]; tests substitute
/// scripted implementations to exercise survivor handling.
pub trait ProcessInspector: Send {
    /// Whether a process with this pid is currently running. Zombies
    /// count as dead; they only await a reap.
    fn is_alive(&mut self, pid: u32) -> bool;

    /// Every running process whose executable path or cwd is contained
    /// in `install_root`, excluding the daemon itself.
    fn discover_related(&mut self, install_root: &Path) -> Vec<u32>;

    /// Polite termination request, or a hard kill when `force` is set.
    fn signal(&mut self, pid: u32, force: bool);
}

/// OS-backed inspector over `sysinfo`.
///
/// Game servers fork launchers, anti-cheat helpers, and crash handlers,
/// so stopping "the server" means finding every process whose executable
/// or working directory lives under the install root and taking the
/// whole set down. Instances are cheap; callers create one per
/// operation rather than sharing one behind a lock.
pub struct ProcessProbe {
    system: System,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for ProcessProbe {
    fn is_alive(&mut self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );
        match self.system.process(target) {
            Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            None => false,
        }
    }

    fn discover_related(&mut self, install_root: &Path) -> Vec<u32> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let own_pid = std::process::id();
        let mut found = Vec::new();
        for (pid, process) in self.system.processes() {
            let pid = pid.as_u32();
            if pid == own_pid {
                continue;
            }
            if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
                continue;
            }
            let by_exe = process.exe().is_some_and(|exe| path_within(exe, install_root));
            let by_cwd = process.cwd().is_some_and(|cwd| path_within(cwd, install_root));
            if by_exe || by_cwd {
                found.push(pid);
            }
        }
        found.sort_unstable();
        found
    }

    fn signal(&mut self, pid: u32, force: bool) {
        signal_pid(pid, force);
    }
}

/// Terminate a set of pids: polite signal first, a short grace period,
/// then force-kill the survivors. After a force-kill the OS gets a
/// moment to tear the processes down before anyone rescans.
pub async fn terminate_tree<I: ProcessInspector + ?Sized>(probe: &mut I, pids: &[u32]) {
    if pids.is_empty() {
        return;
    }
    for &pid in pids {
        probe.signal(pid, false);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut forced = false;
    for &pid in pids {
        if probe.is_alive(pid) {
            tracing::warn!("PID {} survived polite termination, force-killing", pid);
            probe.signal(pid, true);
            forced = true;
        }
    }
    if forced {
        tokio::time::sleep(KILL_SETTLE).await;
    }
}

/// Survivors after a stop: anything still discoverable under the
/// install root, plus the tracked main pid if it is still alive.
/// Discovery can briefly enumerate a just-killed process, so every
/// candidate is re-checked for liveness before it counts.
pub fn verify_clean<I: ProcessInspector + ?Sized>(
    probe: &mut I,
    install_root: &Path,
    tracked: Option<u32>,
) -> Vec<u32> {
    let discovered = probe.discover_related(install_root);
    let mut survivors: Vec<u32> = discovered
        .into_iter()
        .filter(|&pid| probe.is_alive(pid))
        .collect();
    if let Some(pid) = tracked {
        if !survivors.contains(&pid) && probe.is_alive(pid) {
            survivors.push(pid);
        }
    }
    survivors
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = kill(nix::unistd::Pid::from_raw(pid as i32), signal) {
        tracing::debug!("Signal {} to PID {} failed: {}", signal, pid, e);
    }
}

#[cfg(windows)]
fn signal_pid(pid: u32, force: bool) {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    if let Err(e) = command.output() {
        tracing::debug!("taskkill for PID {} failed: {}", pid, e);
    }
}
