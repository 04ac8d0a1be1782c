//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use dactyl_core::DEFAULT_IDLE_TIMEOUT_SECS;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Base directory for stored templates
    pub storage_path: PathBuf,

    /// Unix socket path for IPC
    pub socket_path: PathBuf,

    /// Seconds of full idleness before the daemon exits
    pub idle_timeout_secs: u64,

    /// Disable the idle timeout entirely
    pub no_timeout: bool,

    /// Number of simulated scanners to publish in development mode
    pub simulated_devices: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_path: Self::default_storage_path(),
            socket_path: Self::default_socket_path(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            no_timeout: false,
            simulated_devices: 0,
        }
    }
}

impl DaemonConfig {
    fn default_socket_path() -> PathBuf {
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("dactyl.sock"))
            .unwrap_or_else(|| PathBuf::from("/run/dactyl.sock"))
    }

    fn default_storage_path() -> PathBuf {
        // systemd >= 240 sets this to an absolute path derived from the
        // StateDirectory unit setting
        if let Some(dir) = std::env::var_os("STATE_DIRECTORY") {
            return PathBuf::from(dir);
        }

        PathBuf::from("/var/lib/dactyl")
    }

    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.storage_path)?;

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        if self.no_timeout {
            None
        } else {
            Some(std::time::Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");

        let mut config = DaemonConfig::default();
        config.no_timeout = true;
        config.simulated_devices = 2;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert!(loaded.no_timeout);
        assert_eq!(loaded.simulated_devices, 2);
        assert_eq!(loaded.idle_timeout(), None);
    }
}
