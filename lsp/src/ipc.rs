//! Node.js child-process IPC channel.
//!
//! A Node process started with `NODE_CHANNEL_FD` set talks over that file
//! descriptor with `process.send()` / `process.on('message')`. In `json`
//! serialization mode every message is one compact JSON value followed by a
//! newline, so the channel preserves message boundaries and callers only ever
//! deal in whole [`Value`]s.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::CommandExt;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;

/// Descriptor number the child finds its end of the channel on.
pub const CHILD_CHANNEL_FD: RawFd = 3;

const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";
const SERIALIZATION_ENV: &str = "NODE_CHANNEL_SERIALIZATION_MODE";

/// Prefix of Node's own control messages (`{"cmd": "NODE_..."}`).
const INTERNAL_CMD_PREFIX: &str = "NODE_";

/// Sending half of the channel.
pub struct IpcSender<W = OwnedWriteHalf> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> IpcSender<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send one whole message.
    pub async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("serializing IPC message")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .context("writing IPC message")?;
        self.writer.flush().await.context("flushing IPC message")?;
        Ok(())
    }
}

/// Receiving half of the channel.
pub struct IpcReceiver<R = OwnedReadHalf> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> IpcReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Receive the next whole message.
    ///
    /// Returns `Ok(None)` once the peer has closed the channel. Lines that are
    /// not JSON and Node-internal control messages are skipped.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await
                .context("reading IPC message")?;
            if read == 0 {
                return Ok(None);
            }

            let text = self.line.trim_ascii();
            if text.is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_slice(text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        len = text.len(),
                        "Dropping undecodable IPC message from language server: {e}"
                    );
                    continue;
                }
            };

            if is_internal(&message) {
                tracing::trace!("Ignoring Node internal IPC message");
                continue;
            }
            return Ok(Some(message));
        }
    }
}

fn is_internal(message: &Value) -> bool {
    message
        .get("cmd")
        .and_then(Value::as_str)
        .is_some_and(|cmd| cmd.starts_with(INTERNAL_CMD_PREFIX))
}

/// Split a connected socket into channel halves.
pub fn channel(stream: UnixStream) -> (IpcSender, IpcReceiver) {
    let (read, write) = stream.into_split();
    (IpcSender::new(write), IpcReceiver::new(read))
}

/// A socket pair whose child end has been scheduled for installation in a child.
pub(crate) struct PendingChannel {
    parent: StdUnixStream,
    child: StdUnixStream,
}

impl PendingChannel {
    /// Close the parent's copy of the child end and open the parent end.
    ///
    /// Must be called after the command was spawned.
    pub fn into_channel(self) -> io::Result<(IpcSender, IpcReceiver)> {
        drop(self.child);
        self.parent.set_nonblocking(true)?;
        let stream = UnixStream::from_std(self.parent)?;
        Ok(channel(stream))
    }
}

/// Arrange for `cmd` to inherit one end of a fresh socket pair as
/// [`CHILD_CHANNEL_FD`] and advertise it the way Node expects.
pub(crate) fn attach(cmd: &mut Command) -> io::Result<PendingChannel> {
    let (parent, child) = StdUnixStream::pair()?;
    let fd = child.as_raw_fd();

    cmd.env(CHANNEL_FD_ENV, CHILD_CHANNEL_FD.to_string())
        .env(SERIALIZATION_ENV, "json");

    // SAFETY: the hook runs between fork and exec and only calls fcntl/dup2,
    // which are async-signal-safe. It captures nothing but a Copy fd.
    unsafe {
        cmd.as_std_mut().pre_exec(move || install_channel_fd(fd));
    }

    Ok(PendingChannel { parent, child })
}

/// Make `fd` available as [`CHILD_CHANNEL_FD`] across `exec`.
fn install_channel_fd(fd: RawFd) -> io::Result<()> {
    if fd == CHILD_CHANNEL_FD {
        // dup2 onto itself is a no-op that keeps FD_CLOEXEC, so clear it by hand.
        // SAFETY: fcntl on a descriptor this process owns.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    // SAFETY: dup2 between descriptors this process owns; the copy has no FD_CLOEXEC.
    if unsafe { libc::dup2(fd, CHILD_CHANNEL_FD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_writes_one_json_line() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let (mut sender, _receiver) = channel(ours);

        let message = json!({"jsonrpc": "2.0", "method": "initialized", "params": {"text": "多\n行"}});
        sender.send(&message).await.unwrap();
        drop(sender);

        let mut buf = vec![0u8; 256];
        let n = theirs.read(&mut buf).await.unwrap();
        let line = &buf[..n];
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        let parsed: Value = serde_json::from_slice(line).unwrap();
        assert_eq!(parsed, message);
    }

    #[tokio::test]
    async fn test_recv_yields_whole_messages_in_order() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let (_sender, mut receiver) = channel(ours);

        theirs
            .write_all(b"{\"id\":1,\"result\":null}\n{\"id\":2,\"res")
            .await
            .unwrap();
        assert_eq!(
            receiver.recv().await.unwrap(),
            Some(json!({"id": 1, "result": null}))
        );

        theirs.write_all(b"ult\":\"\xe6\xb5\x8b\"}\n").await.unwrap();
        assert_eq!(
            receiver.recv().await.unwrap(),
            Some(json!({"id": 2, "result": "测"}))
        );

        drop(theirs);
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_skips_internal_and_undecodable_lines() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let (_sender, mut receiver) = channel(ours);

        theirs
            .write_all(
                b"{\"cmd\":\"NODE_HANDLE_ACK\"}\nnot json\n\n{\"method\":\"window/logMessage\"}\n",
            )
            .await
            .unwrap();

        assert_eq!(
            receiver.recv().await.unwrap(),
            Some(json!({"method": "window/logMessage"}))
        );
    }

    #[tokio::test]
    async fn test_recv_accepts_final_line_without_newline() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let (_sender, mut receiver) = channel(ours);

        theirs.write_all(b"{\"id\":9}").await.unwrap();
        drop(theirs);

        assert_eq!(receiver.recv().await.unwrap(), Some(json!({"id": 9})));
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[test]
    fn test_user_cmd_field_is_not_internal() {
        assert!(is_internal(&json!({"cmd": "NODE_CLUSTER"})));
        assert!(!is_internal(&json!({"cmd": "rename"})));
        assert!(!is_internal(&json!({"method": "x"})));
    }
}
