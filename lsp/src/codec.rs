//! JSON-RPC framing codec for the editor-facing stdio transport.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing, where `N` counts bytes of
//! the UTF-8 body. [`FrameParser`] turns an arbitrarily fragmented byte stream
//! into whole messages; [`FrameWriter`] frames outgoing messages.
//!
//! The parser buffers raw bytes and decodes only complete bodies, so a chunk
//! boundary that falls inside a multi-byte character cannot corrupt a message.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum body size (64 MiB); larger declared lengths are treated as malformed.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum bytes buffered while looking for the end of a header block.
const MAX_HEADER_BYTES: usize = 64 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum HeaderError {
    #[error("missing Content-Length header")]
    Missing,
    #[error("invalid Content-Length value {0:?}")]
    Invalid(String),
    #[error("Content-Length {0} exceeds maximum {max}", max = MAX_FRAME_BYTES)]
    TooLarge(usize),
}

/// Outcome of one extraction attempt.
enum Step {
    Message(Value),
    /// Bytes were consumed without producing a message.
    Skipped,
    /// No complete frame is buffered.
    Blocked,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Offset of the first `Content-Length` header key at or after `from`.
fn find_content_length(haystack: &[u8], from: usize) -> Option<usize> {
    let needle = CONTENT_LENGTH.as_bytes();
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|pos| pos + from)
}

/// Extract `Content-Length` from a header block (without the trailing separator).
///
/// Other headers are ignored regardless of order.
fn content_length(header: &[u8]) -> Result<usize, HeaderError> {
    let header = String::from_utf8_lossy(header);
    for line in header.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        let value = value.trim();
        let len: usize = value
            .parse()
            .map_err(|_| HeaderError::Invalid(value.to_string()))?;
        if len > MAX_FRAME_BYTES {
            return Err(HeaderError::TooLarge(len));
        }
        return Ok(len);
    }
    Err(HeaderError::Missing)
}

/// Incremental `Content-Length` frame parser.
///
/// Owns the receive buffer exclusively. Between calls to [`feed`](Self::feed)
/// the buffer holds only the prefix of a frame that is not yet complete.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    malformed: usize,
}

impl FrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and deliver every complete message to `on_message`, in order.
    ///
    /// Returns the number of messages delivered by this call.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_message: F) -> usize
    where
        F: FnMut(Value),
    {
        self.buffer.extend_from_slice(chunk);

        let mut delivered = 0;
        loop {
            match self.next_frame() {
                Step::Message(message) => {
                    on_message(message);
                    delivered += 1;
                }
                Step::Skipped => {}
                Step::Blocked => break,
            }
        }
        delivered
    }

    /// Discard all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered for an incomplete frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Frames dropped so far because of a bad header or an unparseable body.
    #[must_use]
    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    fn next_frame(&mut self) -> Step {
        let Some(header_end) = find(&self.buffer, HEADER_SEPARATOR) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "No header terminator within {MAX_HEADER_BYTES} bytes; resetting buffer"
                );
                self.malformed += 1;
                self.reset();
            }
            return Step::Blocked;
        };

        let body_start = header_end + HEADER_SEPARATOR.len();
        let length = match content_length(&self.buffer[..header_end]) {
            Ok(length) => length,
            Err(e) => {
                self.malformed += 1;
                self.resync(e);
                return Step::Skipped;
            }
        };

        if length == 0 {
            tracing::debug!("Ignoring empty frame");
            self.buffer.drain(..body_start);
            return Step::Skipped;
        }

        let body_end = body_start + length;
        if self.buffer.len() < body_end {
            return Step::Blocked;
        }

        let parsed = serde_json::from_slice::<Value>(&self.buffer[body_start..body_end]);
        if let Err(e) = &parsed {
            let body = &self.buffer[body_start..body_end];
            tracing::error!(
                len = length,
                available = body.len(),
                body = %String::from_utf8_lossy(body),
                "Failed to parse message from stdin: {e}"
            );
            self.malformed += 1;
        }
        self.buffer.drain(..body_end);

        match parsed {
            Ok(message) => Step::Message(message),
            Err(_) => Step::Skipped,
        }
    }

    /// Drop a header block that can never be satisfied.
    ///
    /// Skips to the next `Content-Length` key after the start of the bad block,
    /// or clears the buffer when none is buffered.
    fn resync(&mut self, reason: HeaderError) {
        match find_content_length(&self.buffer, 1) {
            Some(next) => {
                tracing::warn!(skipped = next, "Dropping malformed frame header: {reason}");
                self.buffer.drain(..next);
            }
            None => {
                tracing::warn!(
                    skipped = self.buffer.len(),
                    "Dropping malformed frame header: {reason}; resetting buffer"
                );
                self.reset();
            }
        }
    }
}

/// Frame a message: `Content-Length` is the UTF-8 byte length of the compact JSON.
pub fn encode_frame(message: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).context("serializing JSON-RPC frame")?;
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes JSON-RPC frames to an async writer.
///
/// Each call produces exactly one framed write followed by a flush.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, message: &Value) -> Result<()> {
        let frame = encode_frame(message)?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(message: &Value) -> Vec<u8> {
        encode_frame(message).unwrap()
    }

    fn collect(parser: &mut FrameParser, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        parser.feed(chunk, |m| out.push(m));
        out
    }

    fn cjk_message() -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": "file:///测试文件.ets",
                    "languageId": "arkts",
                    "text": "// 简单的ETS示例 - 基础语法演示\nconst APP_NAME: string = 'ETS应用';"
                }
            }
        })
    }

    fn emoji_message() -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": "file:///test.ets",
                "diagnostics": [{ "message": "测试消息 with émojis 🚀🎯💻👩‍💻" }]
            }
        })
    }

    #[test]
    fn test_minimal_frame() {
        let mut parser = FrameParser::new();
        let out = collect(&mut parser, b"Content-Length: 2\r\n\r\n{}");
        assert_eq!(out, vec![json!({})]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_split_inside_separator() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Content-Length: 2\r\n\r").is_empty());
        assert_eq!(collect(&mut parser, b"\n{}"), vec![json!({})]);
    }

    #[test]
    fn test_pipelined_frames_in_one_feed() {
        let first = json!({"jsonrpc": "2.0", "method": "initialize", "id": 1});
        let second = json!({"jsonrpc": "2.0", "method": "initialized"});
        let mut bytes = frame(&first);
        bytes.extend(frame(&second));

        let mut parser = FrameParser::new();
        let mut seen = Vec::new();
        let delivered = parser.feed(&bytes, |m| seen.push(m));

        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![first, second]);
    }

    #[test]
    fn test_zero_length_frame_is_ignored() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Content-Length: 0\r\n\r\n").is_empty());
        assert_eq!(parser.buffered_len(), 0);
        assert_eq!(parser.malformed_frames(), 0);

        // The stream continues normally afterwards.
        assert_eq!(
            collect(&mut parser, b"Content-Length: 2\r\n\r\n{}"),
            vec![json!({})]
        );
    }

    #[test]
    fn test_waits_for_declared_body() {
        let body = format!(r#"{{"jsonrpc":"2.0","method":"x","params":"{}"}}"#, "a".repeat(58));
        assert_eq!(body.len(), 100);
        let bytes = format!("Content-Length: 100\r\n\r\n{body}").into_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 90);

        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, head).is_empty());
        assert_eq!(collect(&mut parser, &tail[..89]), Vec::<Value>::new());
        let out = collect(&mut parser, &tail[89..]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["method"], "x");
    }

    #[test]
    fn test_round_trip_preserves_messages() {
        let messages = vec![
            json!({"jsonrpc": "2.0", "id": 7, "result": {"capabilities": {"hoverProvider": true}}}),
            json!({"jsonrpc": "2.0", "id": "abc", "error": {"code": -32601, "message": "nope"}}),
            cjk_message(),
            emoji_message(),
        ];
        let bytes: Vec<u8> = messages.iter().flat_map(frame).collect();

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, &bytes), messages);
    }

    #[test]
    fn test_fragmentation_invariance_at_every_split() {
        let messages = vec![cjk_message(), emoji_message(), json!({"jsonrpc": "2.0", "id": 2})];
        let bytes: Vec<u8> = messages.iter().flat_map(frame).collect();

        for split in 0..=bytes.len() {
            let mut parser = FrameParser::new();
            let mut out = collect(&mut parser, &bytes[..split]);
            out.extend(collect(&mut parser, &bytes[split..]));
            assert_eq!(out, messages, "split at byte {split}");
            assert_eq!(parser.buffered_len(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let messages = vec![emoji_message(), cjk_message()];
        let bytes: Vec<u8> = messages.iter().flat_map(frame).collect();

        let mut parser = FrameParser::new();
        let mut out = Vec::new();
        for byte in &bytes {
            parser.feed(std::slice::from_ref(byte), |m| out.push(m));
        }
        assert_eq!(out, messages);
    }

    #[test]
    fn test_split_inside_multibyte_character() {
        let message = json!({"jsonrpc": "2.0", "method": "test", "params": {"text": "测试中文字符"}});
        let bytes = frame(&message);
        let split = find(&bytes, "测试".as_bytes()).unwrap() + 1;

        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, &bytes[..split]).is_empty());
        assert_eq!(collect(&mut parser, &bytes[split..]), vec![message]);
    }

    #[test]
    fn test_character_count_header_fails_to_extract() {
        let message = cjk_message();
        let body = serde_json::to_string(&message).unwrap();
        let chars = body.chars().count();
        assert!(chars < body.len());

        let bytes = format!("Content-Length: {chars}\r\n\r\n{body}");
        let mut parser = FrameParser::new();
        let out = collect(&mut parser, bytes.as_bytes());

        assert!(out.is_empty());
        assert_eq!(parser.malformed_frames(), 1);
    }

    #[test]
    fn test_writer_uses_byte_length() {
        let message = emoji_message();
        let body = serde_json::to_string(&message).unwrap();
        assert!(body.len() > body.chars().count());

        let bytes = frame(&message);
        let expected = format!("Content-Length: {}\r\n\r\n{body}", body.len());
        assert_eq!(bytes, expected.into_bytes());
    }

    #[test]
    fn test_extra_headers_are_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let bytes = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );

        let mut parser = FrameParser::new();
        let out = collect(&mut parser, bytes.as_bytes());
        assert_eq!(out, vec![json!({"jsonrpc": "2.0", "id": 1})]);
    }

    #[test]
    fn test_case_insensitive_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let bytes = format!("content-length: {}\r\n\r\n{body}", body.len());

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, bytes.as_bytes()).len(), 1);
    }

    #[test]
    fn test_data_without_headers_waits() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Some random data without proper headers").is_empty());
        assert_eq!(parser.malformed_frames(), 0);
    }

    #[test]
    fn test_header_without_terminator_waits() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Content-Length: 2\r\n").is_empty());
        assert_eq!(collect(&mut parser, b"\r\n{}"), vec![json!({})]);
    }

    #[test]
    fn test_missing_content_length_then_valid_frame() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Content-Type: application/json\r\n\r\n{}").is_empty());
        assert_eq!(parser.malformed_frames(), 1);

        assert_eq!(
            collect(&mut parser, b"Content-Length: 2\r\n\r\n{}"),
            vec![json!({})]
        );
    }

    #[test]
    fn test_invalid_and_negative_content_length() {
        for bad in [
            &b"Content-Length: invalid\r\n\r\n{}"[..],
            &b"Content-Length: -10\r\n\r\n{}"[..],
        ] {
            let mut parser = FrameParser::new();
            assert!(collect(&mut parser, bad).is_empty());
            assert_eq!(parser.malformed_frames(), 1);
            assert_eq!(parser.buffered_len(), 0);
        }
    }

    #[test]
    fn test_bad_header_resyncs_to_next_frame_in_same_chunk() {
        let good = json!({"jsonrpc": "2.0", "method": "initialized"});
        let mut bytes = b"Content-Length: abc\r\n\r\n{}".to_vec();
        bytes.extend(frame(&good));

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, &bytes), vec![good]);
        assert_eq!(parser.malformed_frames(), 1);
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let good = json!({"jsonrpc": "2.0", "id": 3, "result": null});
        let mut bytes = b"garbage".to_vec();
        bytes.extend(frame(&good));

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, &bytes), vec![good]);
    }

    #[test]
    fn test_oversized_content_length_is_malformed() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, header.as_bytes()).is_empty());
        assert_eq!(parser.malformed_frames(), 1);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_unterminated_header_flood_resets_buffer() {
        let mut parser = FrameParser::new();
        let flood = vec![b'x'; MAX_HEADER_BYTES + 1];
        assert!(collect(&mut parser, &flood).is_empty());
        assert_eq!(parser.buffered_len(), 0);
        assert_eq!(parser.malformed_frames(), 1);
    }

    #[test]
    fn test_corrupt_body_is_skipped_and_next_frame_parses() {
        let invalid = "{ invalid json }";
        let good = json!({"jsonrpc": "2.0", "method": "initialize", "id": 1});
        let mut bytes = format!("Content-Length: {}\r\n\r\n{invalid}", invalid.len()).into_bytes();
        bytes.extend(frame(&good));

        let mut parser = FrameParser::new();
        let out = collect(&mut parser, &bytes);

        assert_eq!(out, vec![good]);
        assert_eq!(parser.malformed_frames(), 1);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_invalid_utf8_body_is_skipped() {
        let mut bytes = b"Content-Length: 4\r\n\r\n\"\xff\xfe\"".to_vec();
        bytes.extend(b"Content-Length: 2\r\n\r\n{}");

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, &bytes), vec![json!({})]);
        assert_eq!(parser.malformed_frames(), 1);
    }

    #[test]
    fn test_reset_discards_partial_data() {
        let mut parser = FrameParser::new();
        assert!(collect(&mut parser, b"Content-Length: 50\r\n").is_empty());
        parser.reset();
        assert_eq!(parser.buffered_len(), 0);

        let message = json!({"jsonrpc": "2.0", "method": "initialize", "id": 1});
        let body = serde_json::to_string(&message).unwrap();
        let tail = format!("\r\n\r\n{body}");
        assert!(collect(&mut parser, tail.as_bytes()).is_empty());

        parser.reset();
        assert_eq!(collect(&mut parser, &frame(&message)), vec![message]);
    }

    #[test]
    fn test_content_length_lookup() {
        assert_eq!(content_length(b"Content-Length: 12"), Ok(12));
        assert_eq!(content_length(b"X-A: 1\r\ncontent-length:  7 "), Ok(7));
        assert_eq!(content_length(b"Content-Type: x"), Err(HeaderError::Missing));
        assert_eq!(
            content_length(b"Content-Length: 1.5"),
            Err(HeaderError::Invalid("1.5".to_string()))
        );
    }

    #[tokio::test]
    async fn test_frame_writer_output_parses_back() {
        let first = cjk_message();
        let second = json!({"jsonrpc": "2.0", "id": 1, "result": []});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&first).await.unwrap();
        writer.write_frame(&second).await.unwrap();

        let mut parser = FrameParser::new();
        assert_eq!(collect(&mut parser, &buf), vec![first, second]);
    }
}
