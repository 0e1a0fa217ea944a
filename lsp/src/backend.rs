//! Backend handle: owns the language-server child process and its IPC channel.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ipc::{self, IpcReceiver, IpcSender};
use crate::types::{BackendConfig, BackendError, BackendLink};

/// Grace period between SIGTERM and SIGKILL.
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const LINK_CHANNEL_CAPACITY: usize = 64;

/// A spawned backend whose channel has not been linked yet.
pub struct Backend {
    pid: Option<u32>,
    sender: IpcSender,
    receiver: IpcReceiver,
    process: BackendProcess,
}

impl Backend {
    /// Spawn the backend described by `config`.
    ///
    /// Fails with [`BackendError::ScriptMissing`] or
    /// [`BackendError::RuntimeNotFound`] before anything is started.
    pub fn spawn(config: &BackendConfig) -> Result<Self> {
        if !config.script().exists() {
            return Err(BackendError::ScriptMissing {
                path: config.script().to_path_buf(),
            }
            .into());
        }

        let runtime =
            which::which(config.runtime()).map_err(|source| BackendError::RuntimeNotFound {
                runtime: config.runtime().to_string(),
                source,
            })?;

        let mut cmd = Command::new(&runtime);
        cmd.arg(config.script())
            .args(config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let pending = ipc::attach(&mut cmd).context("creating IPC channel")?;

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", runtime.display()))?;
        let (sender, receiver) = pending
            .into_channel()
            .context("opening parent end of IPC channel")?;

        let pid = child.id();
        tracing::info!(
            pid,
            runtime = %runtime.display(),
            script = %config.script().display(),
            "Language server started"
        );

        let mut pumps = Vec::with_capacity(4);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(stdout, OutputStream::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(stderr, OutputStream::Stderr)));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, pid, kill_rx));

        Ok(Self {
            pid,
            sender,
            receiver,
            process: BackendProcess {
                pid,
                kill_tx: Some(kill_tx),
                supervisor,
                pumps,
            },
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Start relaying the IPC channel through in-memory queues.
    pub fn link(self) -> (BackendLink, BackendProcess) {
        let Self {
            mut sender,
            mut receiver,
            mut process,
            ..
        } = self;

        let (outbound, mut outbound_rx) = mpsc::channel::<Value>(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<Value>(LINK_CHANNEL_CAPACITY);

        process.pumps.push(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sender.send(&message).await {
                    tracing::warn!("Language server IPC write error: {e:#}");
                    break;
                }
            }
        }));

        process.pumps.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Some(message)) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Language server closed the IPC channel");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Language server IPC read error: {e:#}");
                        break;
                    }
                }
            }
        }));

        (BackendLink { outbound, inbound }, process)
    }
}

/// Lifecycle half of a linked backend.
///
/// Dropping it also asks the supervisor to terminate the child.
pub struct BackendProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<Option<ExitStatus>>,
    pumps: Vec<JoinHandle<()>>,
}

impl BackendProcess {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has already been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Terminate the child (SIGTERM, then SIGKILL after a grace period) and
    /// wait for it to be reaped.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        let status = match (&mut self.supervisor).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Language server supervisor failed: {e}");
                None
            }
        };

        for pump in &self.pumps {
            pump.abort();
        }
        status
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Reap the child, terminating it first when asked to.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            tracing::debug!(pid, "Terminating language server");
            send_sigterm(pid);
            match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::debug!(pid, "Language server didn't exit in time, killing");
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => {
            log_exit(pid, status);
            Some(status)
        }
        Err(e) => {
            tracing::warn!(pid, "Failed to wait for language server: {e}");
            None
        }
    }
}

fn send_sigterm(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) with a pid we spawned and have not reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        tracing::debug!(
            pid,
            "SIGTERM failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn log_exit(pid: Option<u32>, status: ExitStatus) {
    match (status.code(), status.signal()) {
        (Some(0), _) => tracing::info!(pid, "Language server exited"),
        (Some(code), _) => tracing::warn!(pid, code, "Language server exited with error"),
        (None, Some(signal)) => tracing::warn!(pid, signal, "Language server killed by signal"),
        (None, None) => tracing::warn!(pid, "Language server exited: {status}"),
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward the child's plain output streams into the log, line by line.
async fn pump_output<R: AsyncRead + Unpin>(stream: R, kind: OutputStream) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match kind {
                OutputStream::Stdout => tracing::debug!(target: "backend::stdout", "{line}"),
                OutputStream::Stderr => tracing::warn!(target: "backend::stderr", "{line}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Language server {kind:?} read error: {e}");
                break;
            }
        }
    }
}
