//! Public types shared by the bridge and its callers.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::mpsc;

/// Flags selecting the backend's IPC-channel transport and server operating mode.
pub const BACKEND_ARGS: [&str; 2] = ["--node-ipc", "--server-mode"];

/// How to launch the backend language server.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// JavaScript runtime (e.g. "node"), resolved through `PATH` when not absolute.
    runtime: String,
    /// Entry script of the language server.
    script: PathBuf,
    args: Vec<String>,
}

impl BackendConfig {
    /// Launch `script` with `runtime` and the fixed [`BACKEND_ARGS`].
    #[must_use]
    pub fn new(runtime: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            script: script.into(),
            args: BACKEND_ARGS.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    #[must_use]
    pub fn script(&self) -> &Path {
        &self.script
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Failures that prevent the backend from ever being spawned.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(
        "language server does not exist, please build the language server first: {}",
        path.display()
    )]
    ScriptMissing { path: PathBuf },
    #[error("runtime '{runtime}' not found in PATH")]
    RuntimeNotFound {
        runtime: String,
        #[source]
        source: which::Error,
    },
    #[error("the backend IPC channel is only supported on Unix platforms")]
    Unsupported,
}

/// In-memory endpoints of the backend channel.
///
/// `outbound` carries whole messages to the backend; `inbound` yields whole
/// messages from it. Message boundaries are preserved on both sides.
#[derive(Debug)]
pub struct BackendLink {
    pub outbound: mpsc::Sender<Value>,
    pub inbound: mpsc::Receiver<Value>,
}
