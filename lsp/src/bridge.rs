//! Transport bridge: editor stdio on one side, the backend channel on the other.

use std::fmt;
use std::future::Future;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::{FrameParser, FrameWriter};
use crate::protocol;
use crate::types::BackendLink;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Lifecycle of one bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        })
    }
}

/// Why a relay ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The host asked the bridge to stop.
    Signal,
    /// The editor closed its input and every parsed message was forwarded.
    InputClosed,
}

/// Relay between an editor transport and a backend link until `shutdown`
/// resolves, the editor input ends, or a fault occurs.
///
/// Editor input is framed by a [`FrameParser`] and queued in arrival order.
/// The forwarder drains that queue one message at a time, so the messages
/// produced by an `initialize` interception reach the backend before anything
/// the editor sent after it. Backend messages are framed onto `output` as they
/// arrive.
pub async fn relay<R, W, S>(
    input: R,
    output: W,
    link: BackendLink,
    shutdown: S,
) -> Result<StopReason>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let BackendLink { outbound, inbound } = link;
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();

    let mut reader = tokio::spawn(read_editor(input, queue_tx));
    let mut forwarder = tokio::spawn(forward_to_backend(queue_rx, outbound));
    let mut writer = tokio::spawn(write_editor(inbound, output));
    let mut writer_done = false;

    let mut shutdown = std::pin::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            biased;

            () = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break Ok(StopReason::Signal);
            }
            joined = &mut forwarder => {
                if let Err(e) = joined {
                    break Err(anyhow!("forwarder task failed: {e}"));
                }
                // The queue only closes once the reader has returned.
                break match (&mut reader).await {
                    Ok(Ok(())) => Ok(StopReason::InputClosed),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(anyhow!("editor reader task failed: {e}")),
                };
            }
            joined = &mut writer, if !writer_done => {
                writer_done = true;
                match joined {
                    Ok(Ok(())) => {
                        tracing::warn!(
                            state = %BridgeState::Running,
                            backend = "gone",
                            "Language server channel closed; relay degraded, editor requests will go unanswered"
                        );
                    }
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(anyhow!("editor writer task failed: {e}")),
                }
            }
        }
    };

    reader.abort();
    forwarder.abort();
    writer.abort();
    outcome
}

/// Feed editor bytes through the frame parser into the ordered queue.
async fn read_editor<R>(mut input: R, queue: mpsc::UnboundedSender<Value>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut parser = FrameParser::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = input
            .read(&mut chunk)
            .await
            .context("reading editor input")?;
        if n == 0 {
            if parser.buffered_len() > 0 {
                tracing::warn!(
                    len = parser.buffered_len(),
                    "Editor input closed mid-frame; discarding partial data"
                );
            }
            tracing::info!(
                malformed = parser.malformed_frames(),
                "Editor input closed"
            );
            return Ok(());
        }

        parser.feed(&chunk[..n], |message| {
            // The forwarder only goes away when the relay is being torn down.
            let _ = queue.send(message);
        });
    }
}

/// Forward queued editor messages to the backend, strictly in order.
async fn forward_to_backend(
    mut queue: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::Sender<Value>,
) {
    while let Some(message) = queue.recv().await {
        let batch = if protocol::is_initialize(&message) {
            protocol::intercept_initialize(message).await
        } else {
            vec![message]
        };

        for message in batch {
            let method = protocol::method_of(&message).map(ToString::to_string);
            tracing::trace!(method = method.as_deref(), "Editor -> language server");
            if outbound.send(message).await.is_err() {
                tracing::warn!(
                    method = method.as_deref(),
                    "Language server is gone; dropping message"
                );
            }
        }
    }
}

/// Frame every backend message onto the editor output.
async fn write_editor<W>(mut inbound: mpsc::Receiver<Value>, output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(output);
    while let Some(message) = inbound.recv().await {
        tracing::trace!(
            method = protocol::method_of(&message),
            "Language server -> editor"
        );
        writer
            .write_frame(&message)
            .await
            .context("writing to editor output")?;
    }
    Ok(())
}

#[cfg(unix)]
pub use self::process::Bridge;

#[cfg(unix)]
mod process {
    use std::future::Future;

    use anyhow::{Result, bail};
    use tokio::io::{AsyncRead, AsyncWrite};

    use super::{BridgeState, StopReason, relay};
    use crate::backend::{Backend, BackendProcess};
    use crate::types::{BackendConfig, BackendLink};

    /// One bridge instance: a spawned backend plus the relay that serves it.
    pub struct Bridge {
        link: Option<BackendLink>,
        process: Option<BackendProcess>,
        state: BridgeState,
    }

    impl Bridge {
        /// Spawn the backend. A missing backend ends the bridge before any relay.
        pub fn start(config: &BackendConfig) -> Result<Self> {
            tracing::info!(state = %BridgeState::Starting, "Bridge starting");
            match Backend::spawn(config) {
                Ok(backend) => {
                    let (link, process) = backend.link();
                    Ok(Self {
                        link: Some(link),
                        process: Some(process),
                        state: BridgeState::Starting,
                    })
                }
                Err(e) => {
                    tracing::info!(
                        from = %BridgeState::Starting,
                        to = %BridgeState::Terminated,
                        "Bridge state"
                    );
                    Err(e)
                }
            }
        }

        #[must_use]
        pub fn state(&self) -> BridgeState {
            self.state
        }

        #[must_use]
        pub fn backend_pid(&self) -> Option<u32> {
            self.process.as_ref().and_then(BackendProcess::pid)
        }

        /// Relay until stopped, then terminate the backend.
        pub async fn run<R, W, S>(&mut self, input: R, output: W, shutdown: S) -> Result<StopReason>
        where
            R: AsyncRead + Unpin + Send + 'static,
            W: AsyncWrite + Unpin + Send + 'static,
            S: Future<Output = ()>,
        {
            let Some(link) = self.link.take() else {
                bail!("bridge is {}; it cannot run again", self.state);
            };

            self.transition(BridgeState::Running);
            let outcome = relay(input, output, link, shutdown).await;

            self.transition(BridgeState::ShuttingDown);
            if let Some(process) = self.process.take() {
                process.terminate().await;
            }
            self.transition(BridgeState::Terminated);

            outcome
        }

        fn transition(&mut self, next: BridgeState) {
            tracing::info!(from = %self.state, to = %next, "Bridge state");
            self.state = next;
        }
    }
}
