//! Environment configuration for the bridge.
//!
//! Everything is read from the process environment. Parsing goes through a
//! lookup function so it can be exercised without touching the real
//! environment.

use std::env;
use std::path::{Path, PathBuf};

use lsw_lsp::BackendConfig;

/// Path to the backend language-server entry script. Required.
pub const SERVER_SCRIPT_VAR: &str = "ETS_LANG_SERVER";
/// Truthy value enables diagnostic logging to a file.
pub const LOG_TOGGLE_VAR: &str = "ZED_ETS_LANG_SERVER_LOG";
/// Overrides the log file location.
pub const LOG_FILE_VAR: &str = "ETS_LANG_SERVER_LOG_FILE";
/// JavaScript runtime used to launch the backend.
pub const RUNTIME_VAR: &str = "ETS_NODE_PATH";

pub const DEFAULT_RUNTIME: &str = "node";
pub const DEFAULT_LOG_FILE_NAME: &str = "arkts-lsw.log";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set; it must point at the ETS language server entry script")]
    MissingVar(&'static str),
    #[error("cannot determine the current directory")]
    CurrentDir(#[source] std::io::Error),
}

/// Diagnostic log file settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    server_script: PathBuf,
    runtime: String,
    log: LogConfig,
}

impl BridgeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cwd = env::current_dir().map_err(ConfigError::CurrentDir)?;
        Self::from_lookup(|key| env::var(key).ok(), &cwd, &default_log_dir())
    }

    /// Read the configuration through `lookup`.
    ///
    /// A relative server script is resolved against `cwd`. Without an explicit
    /// log file the log goes to [`DEFAULT_LOG_FILE_NAME`] in `log_dir`.
    pub fn from_lookup<F>(lookup: F, cwd: &Path, log_dir: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let script = non_empty(SERVER_SCRIPT_VAR).ok_or(ConfigError::MissingVar(SERVER_SCRIPT_VAR))?;
        let server_script = cwd.join(script);

        let runtime = non_empty(RUNTIME_VAR).unwrap_or_else(|| DEFAULT_RUNTIME.to_string());

        let log = LogConfig {
            enabled: lookup(LOG_TOGGLE_VAR).is_some_and(|raw| is_truthy(&raw)),
            path: non_empty(LOG_FILE_VAR)
                .map_or_else(|| log_dir.join(DEFAULT_LOG_FILE_NAME), PathBuf::from),
        };

        Ok(Self {
            server_script,
            runtime,
            log,
        })
    }

    #[must_use]
    pub fn server_script(&self) -> &Path {
        &self.server_script
    }

    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    #[must_use]
    pub fn log(&self) -> &LogConfig {
        &self.log
    }

    /// How to launch the backend.
    #[must_use]
    pub fn backend(&self) -> BackendConfig {
        BackendConfig::new(self.runtime.clone(), self.server_script.clone())
    }
}

/// `1`, `true` and `yes` in any case, surrounding whitespace ignored.
#[must_use]
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Directory of the running executable, falling back to the temp dir.
fn default_log_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(env::temp_dir)
}
