//! Incremental JSON framing for backend stdout.
//!
//! Backends write newline-delimited JSON-RPC, but some pretty-print their
//! responses across several lines and others mix plain log lines into stdout.
//! `FrameBuffer` accepts arbitrary byte chunks and yields every complete JSON
//! value in arrival order.

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    discarded_lines: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Removes and returns every complete value currently buffered.
    ///
    /// A value cut off by the end of the buffer stays buffered. Bytes that can
    /// never start a JSON value are dropped one line at a time; a broken line
    /// without its newline yet is kept until the newline arrives.
    pub fn drain_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        let mut consumed = 0_usize;
        loop {
            consumed += self.buffer[consumed..]
                .iter()
                .take_while(|byte| byte.is_ascii_whitespace())
                .count();
            if consumed >= self.buffer.len() {
                break;
            }

            let remaining = &self.buffer[consumed..];
            let mut stream = serde_json::Deserializer::from_slice(remaining).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    consumed += stream.byte_offset();
                    frames.push(value);
                }
                Some(Err(error)) if error.is_eof() => break,
                Some(Err(error)) => {
                    let Some(newline) = remaining.iter().position(|byte| *byte == b'\n') else {
                        break;
                    };
                    warn!(
                        error = %error,
                        line = %String::from_utf8_lossy(&remaining[..newline]),
                        "discarding non-JSON backend output"
                    );
                    self.discarded_lines = self.discarded_lines.saturating_add(1);
                    consumed += newline + 1;
                }
                None => break,
            }
        }
        self.buffer.drain(..consumed);
        frames
    }

    /// True when non-whitespace bytes are waiting for the rest of a value.
    pub fn has_partial(&self) -> bool {
        self.buffer.iter().any(|byte| !byte.is_ascii_whitespace())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn discarded_lines(&self) -> u64 {
        self.discarded_lines
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::FrameBuffer;

    #[test]
    fn unit_drain_frames_yields_complete_lines_in_order() {
        let mut frames = FrameBuffer::new();
        frames.push(b"{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(frames.drain_frames(), vec![json!({"id": 1}), json!({"id": 2})]);
        assert!(!frames.has_partial());
        assert_eq!(frames.buffered_len(), 0);
    }

    #[test]
    fn functional_drain_frames_reassembles_value_split_across_chunks() {
        let mut frames = FrameBuffer::new();
        frames.push(b"{\n  \"jsonrpc\": \"2.0\",\n  \"id\"");
        assert!(frames.drain_frames().is_empty());
        assert!(frames.has_partial());

        frames.push(b": 7,\n  \"result\": {\"ok\": true}\n}\n");
        assert_eq!(
            frames.drain_frames(),
            vec![json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}})]
        );
        assert!(!frames.has_partial());
    }

    #[test]
    fn regression_drain_frames_skips_log_lines_mixed_into_stdout() {
        let mut frames = FrameBuffer::new();
        frames.push(b"Starting server on stdio\n{\"id\":1,\"result\":{}}\n[info] ready\n");
        assert_eq!(frames.drain_frames(), vec![json!({"id": 1, "result": {}})]);
        assert_eq!(frames.discarded_lines(), 2);
    }

    #[test]
    fn regression_drain_frames_waits_for_newline_before_dropping_garbage() {
        let mut frames = FrameBuffer::new();
        frames.push(b"booting");
        assert!(frames.drain_frames().is_empty());
        assert_eq!(frames.discarded_lines(), 0);

        frames.push(b"...\n{\"id\":3}\n");
        assert_eq!(frames.drain_frames(), vec![json!({"id": 3})]);
        assert_eq!(frames.discarded_lines(), 1);
    }

    #[test]
    fn unit_clear_drops_partial_value() {
        let mut frames = FrameBuffer::new();
        frames.push(b"{\"id\":");
        assert!(frames.drain_frames().is_empty());
        frames.clear();
        assert!(!frames.has_partial());
        frames.push(b"{\"id\":4}\n");
        assert_eq!(frames.drain_frames(), vec![json!({"id": 4})]);
    }
}
