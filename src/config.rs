//! Daemon-wide configuration resolved once at startup from environment
//! variables: an unadorned struct rather than a layered config crate
//! like `config`/`figment`.

use std::path::PathBuf;

/// Default directory for the control socket and pid-lock file when
/// `ILM_RUN_DIR` is unset.
pub const DEFAULT_RUN_DIR: &str = "/run/ilm";
/// Default directory for the daemon's log file when `ILM_LOG_DIR` is
/// unset.
pub const DEFAULT_LOG_DIR: &str = "/var/log/ilm";

pub const SOCKET_FILE: &str = "main.sock";
pub const PID_LOCK_FILE: &str = "ilm.pid";
pub const LOG_FILE: &str = "ilm.log";

/// Resolved daemon configuration (spec section 6 "Environment").
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonConfig {
    /// Reads `ILM_RUN_DIR`/`ILM_LOG_DIR`, falling back to the compiled
    /// defaults.
    pub fn from_env() -> Self {
        let run_dir = std::env::var_os("ILM_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_DIR));
        let log_dir = std::env::var_os("ILM_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        DaemonConfig { run_dir, log_dir }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.run_dir.join(SOCKET_FILE)
    }

    pub fn pid_lock_path(&self) -> PathBuf {
        self.run_dir.join(PID_LOCK_FILE)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("ILM_RUN_DIR");
        std::env::remove_var("ILM_LOG_DIR");
        let cfg = DaemonConfig::from_env();
        assert_eq!(cfg.run_dir, PathBuf::from(DEFAULT_RUN_DIR));
        assert_eq!(cfg.socket_path(), PathBuf::from(DEFAULT_RUN_DIR).join("main.sock"));
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("ILM_RUN_DIR", "/tmp/ilm-run");
        std::env::set_var("ILM_LOG_DIR", "/tmp/ilm-log");
        let cfg = DaemonConfig::from_env();
        assert_eq!(cfg.run_dir, PathBuf::from("/tmp/ilm-run"));
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/ilm-log"));
        std::env::remove_var("ILM_RUN_DIR");
        std::env::remove_var("ILM_LOG_DIR");
    }
}
