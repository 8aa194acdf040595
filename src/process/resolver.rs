use std::path::{Path, PathBuf};

/// Locate the server executable inside an install root.
///
/// Resolution order: the settings-file executable, then the fleet-entry
/// executable, then a heuristic scan of the install tree. Explicit
/// entries are only honored when the file actually exists under the
/// install root, so a stale setting falls through to the scan.
pub fn resolve_executable(
    install_root: &Path,
    settings_exe: Option<&str>,
    entry_exe: Option<&str>,
) -> Option<PathBuf> {
    for declared in [settings_exe, entry_exe].into_iter().flatten() {
        let candidate = install_root.join(declared);
        if candidate.is_file() && candidate.starts_with(install_root) {
            return Some(candidate);
        }
    }
    scan_for_executable(install_root)
}

/// Heuristic scan: any `.exe` under the install root, preferring names
/// containing "server", then "dedicated", then the shallowest and
/// shortest path. Game dedicated servers almost always follow one of
/// these naming patterns.
fn scan_for_executable(install_root: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    collect_exe_files(install_root, &mut candidates);

    candidates.sort_by_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        (
            !name.contains("server"),
            !name.contains("dedicated"),
            path.components().count(),
            path.as_os_str().len(),
        )
    });
    candidates.into_iter().next()
}

fn collect_exe_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_exe_files(&path, out);
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
        {
            out.push(path);
        }
    }
}

/// Full launch command for a server, or None when no executable can be
/// resolved.
pub fn server_command(
    install_root: &Path,
    settings_exe: Option<&str>,
    entry_exe: Option<&str>,
    parameters: &[String],
) -> Option<(PathBuf, Vec<String>)> {
    let executable = resolve_executable(install_root, settings_exe, entry_exe)?;
    Some((executable, parameters.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_settings_executable_wins_when_present() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("Configured.exe"));
        touch(&dir.path().join("OtherServer.exe"));

        let resolved =
            resolve_executable(dir.path(), Some("Configured.exe"), Some("OtherServer.exe"));
        assert_eq!(resolved.unwrap(), dir.path().join("Configured.exe"));
    }

    #[test]
    fn test_missing_settings_executable_falls_through() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("Fallback.exe"));

        let resolved = resolve_executable(dir.path(), Some("gone.exe"), None);
        assert_eq!(resolved.unwrap(), dir.path().join("Fallback.exe"));
    }

    #[test]
    fn test_entry_executable_used_after_settings() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("bin").join("FromEntry.exe"));

        let resolved = resolve_executable(dir.path(), None, Some("bin/FromEntry.exe"));
        assert_eq!(resolved.unwrap(), dir.path().join("bin").join("FromEntry.exe"));
    }

    #[test]
    fn test_scan_prefers_server_named_exe() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("Launcher.exe"));
        touch(&dir.path().join("GameServer.exe"));
        touch(&dir.path().join("UnityCrashHandler64.exe"));

        let resolved = resolve_executable(dir.path(), None, None);
        assert_eq!(resolved.unwrap(), dir.path().join("GameServer.exe"));
    }

    #[test]
    fn test_scan_prefers_dedicated_over_plain() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("Game.exe"));
        touch(&dir.path().join("DedicatedHost.exe"));

        let resolved = resolve_executable(dir.path(), None, None);
        assert_eq!(resolved.unwrap(), dir.path().join("DedicatedHost.exe"));
    }

    #[test]
    fn test_scan_prefers_shallow_path() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("deep").join("nested").join("a.exe"));
        touch(&dir.path().join("top.exe"));

        let resolved = resolve_executable(dir.path(), None, None);
        assert_eq!(resolved.unwrap(), dir.path().join("top.exe"));
    }

    #[test]
    fn test_scan_is_case_insensitive_on_extension() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("SERVER.EXE"));

        let resolved = resolve_executable(dir.path(), None, None);
        assert_eq!(resolved.unwrap(), dir.path().join("SERVER.EXE"));
    }

    #[test]
    fn test_no_executable_resolves_none() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("readme.txt"));

        assert!(resolve_executable(dir.path(), None, None).is_none());
        assert!(server_command(dir.path(), None, None, &[]).is_none());
    }

    #[test]
    fn test_server_command_carries_parameters() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("GameServer.exe"));

        let params = vec!["-port=2456".to_string(), "-public".to_string()];
        let (exe, args) = server_command(dir.path(), None, None, &params).unwrap();
        assert_eq!(exe, dir.path().join("GameServer.exe"));
        assert_eq!(args, params);
    }
}
