use crate::error::{Result, ServmanError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// On-disk map of server name to last-known main pid.
///
/// The cache exists solely so a restarted daemon can re-adopt servers
/// that kept running across the outage. It is rewritten wholesale after
/// every start and stop; readers treat a missing or corrupt file as
/// empty because a bad cache only costs one recovery pass.
pub struct PidCache {
    path: PathBuf,
}

impl PidCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> HashMap<String, u32> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("PID cache unreadable, starting empty: {}", e);
                HashMap::new()
            }
        }
    }

    /// Replace the cache contents. Writes to a temp file in the same
    /// directory and renames over the target so readers never observe a
    /// half-written file.
    pub fn save(&self, entries: &HashMap<String, u32>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ServmanError::CacheError(format!("Failed to serialize PID cache: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
