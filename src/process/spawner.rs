use crate::error::{Result, ServmanError};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A freshly spawned server process.
pub struct SpawnedServer {
    pub child: Child,
    pub pid: u32,
}

/// Spawn a game server detached from the daemon.
///
/// The child gets its own process group so daemon signals (ctrl-c) do
/// not propagate into it, its cwd is the install root, and its stdio is
/// discarded since game servers keep their own log files.
pub async fn spawn_server(program: &Path, args: &[String], cwd: &Path) -> Result<SpawnedServer> {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    #[cfg(unix)]
    command.process_group(0);

    #[cfg(windows)]
    command.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP

    let child = command.spawn().map_err(|e| {
        ServmanError::SpawnError(format!("{}: {}", program.display(), e))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| ServmanError::SpawnError("process exited before pid was read".into()))?;

    tracing::info!("Spawned {} with PID {}", program.display(), pid);
    Ok(SpawnedServer { child, pid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = TempDir::new().unwrap();
        let result = spawn_server(
            Path::new("/nonexistent/GameServer.exe"),
            &[],
            dir.path(),
        )
        .await;
        assert!(matches!(result, Err(ServmanError::SpawnError(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_returns_live_pid() {
        let dir = TempDir::new().unwrap();
        let spawned = spawn_server(
            Path::new("/bin/sleep"),
            &["5".to_string()],
            dir.path(),
        )
        .await
        .unwrap();

        assert!(spawned.pid > 0);

        let mut child = spawned.child;
        child.kill().await.unwrap();
        child.wait().await.unwrap();
    }
}
