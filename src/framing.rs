//! Newline-delimited JSON-RPC framing.
//!
//! Byte-stream MCP peers exchange one JSON record per line. A [`Framer`]
//! accumulates arbitrary chunks (as they come off a pipe) and hands back
//! complete records in order, no matter where the chunk boundaries fall.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{JsonRpcMessage, Result, TransportError};

/// Incremental decoder for newline-delimited JSON-RPC records.
#[derive(Debug, Default)]
pub struct Framer {
    // ---
    buf: BytesMut,
}

impl Framer {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn append(&mut self, chunk: &[u8]) {
        // ---
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as records.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete record.
    ///
    /// Returns `None` when no full line is buffered. A line that is not a
    /// valid JSON-RPC record yields `Some(Err(_))`; the line is consumed and
    /// the following lines are unaffected. Empty lines are skipped.
    pub fn next_message(&mut self) -> Option<Result<JsonRpcMessage>> {
        // ---
        loop {
            let newline = self.buf.iter().position(|b| *b == b'\n')?;

            let mut line = self.buf.split_to(newline);
            self.buf.advance(1);

            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                continue;
            }

            return Some(decode_line(&line));
        }
    }

    /// Iterate over every record that is complete right now.
    pub fn drain(&mut self) -> impl Iterator<Item = Result<JsonRpcMessage>> + '_ {
        // ---
        std::iter::from_fn(move || self.next_message())
    }

    /// Render `message` as one line, terminated by `\n`.
    pub fn encode(message: &JsonRpcMessage) -> Result<Bytes> {
        // ---
        let body = message.to_bytes()?;
        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_slice(&body);
        out.put_u8(b'\n');
        Ok(out.freeze())
    }
}

fn decode_line(line: &[u8]) -> Result<JsonRpcMessage> {
    // ---
    let text = std::str::from_utf8(line)
        .map_err(|e| TransportError::message("line is not valid UTF-8", e))?;
    JsonRpcMessage::parse(text)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::RequestId;

    const LINES: &str = concat!(
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        "\n",
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        "\r\n",
        r#"{"jsonrpc":"2.0","id":"x","result":{"ok":true}}"#,
        "\n",
    );

    fn expected() -> Vec<JsonRpcMessage> {
        // ---
        LINES
            .lines()
            .map(|l| JsonRpcMessage::parse(l.trim_end_matches('\r')).unwrap())
            .collect()
    }

    #[test]
    fn test_whole_buffer() {
        // ---
        let mut framer = Framer::new();
        framer.append(LINES.as_bytes());

        let got: Vec<_> = framer.drain().map(|r| r.unwrap()).collect();
        assert_eq!(got, expected());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_every_split_point() {
        // ---
        let bytes = LINES.as_bytes();

        for split in 0..=bytes.len() {
            let mut framer = Framer::new();
            let mut got = Vec::new();

            framer.append(&bytes[..split]);
            got.extend(framer.drain().map(|r| r.unwrap()));
            framer.append(&bytes[split..]);
            got.extend(framer.drain().map(|r| r.unwrap()));

            assert_eq!(got, expected(), "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        // ---
        let mut framer = Framer::new();
        let mut got = Vec::new();

        for b in LINES.as_bytes() {
            framer.append(std::slice::from_ref(b));
            got.extend(framer.drain().map(|r| r.unwrap()));
        }

        assert_eq!(got, expected());
    }

    #[test]
    fn test_partial_line_waits() {
        // ---
        let mut framer = Framer::new();
        framer.append(br#"{"jsonrpc":"2.0","id":1,"#);

        assert!(framer.next_message().is_none());
        assert!(framer.buffered() > 0);

        framer.append(b"\"result\":null}\n");
        let msg = framer.next_message().unwrap().unwrap();
        assert_eq!(msg.id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn test_bad_line_does_not_poison_stream() {
        // ---
        let mut framer = Framer::new();
        framer.append(b"{\"id\":1,\"method\":\"a\"}\nnot json\n{\"id\":2,\"method\":\"b\"}\n");

        let first = framer.next_message().unwrap().unwrap();
        assert_eq!(first.method(), Some("a"));

        let bad = framer.next_message().unwrap();
        assert!(matches!(bad, Err(TransportError::Message { .. })));

        let third = framer.next_message().unwrap().unwrap();
        assert_eq!(third.method(), Some("b"));

        assert!(framer.next_message().is_none());
    }

    #[test]
    fn test_blank_lines_skipped() {
        // ---
        let mut framer = Framer::new();
        framer.append(b"\n\r\n{\"method\":\"ping\"}\n");

        let msg = framer.next_message().unwrap().unwrap();
        assert!(msg.is_notification());
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn test_encode_is_one_line() {
        // ---
        let msg = JsonRpcMessage::notification("ping", None);
        let line = Framer::encode(&msg).unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let mut framer = Framer::new();
        framer.append(&line);
        assert_eq!(framer.next_message().unwrap().unwrap(), msg);
    }
}
