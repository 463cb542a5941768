//! Decoder for the engine's 8-byte multiplexed log framing.
//!
//! Frame layout: byte 0 is the stream type (0, 1 or 2), bytes 1–3 are
//! zero, bytes 4–7 are a big-endian payload length. The engine may also
//! deliver unframed bytes in non-multiplexed mode, so a structurally
//! invalid header demotes the remaining buffer to raw UTF-8.

pub struct LogParser {
    buf: Vec<u8>,
    text: String,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            text: String::new(),
        }
    }

    /// Feed one chunk; returns the lines completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        self.decode();
        self.drain_lines()
    }

    /// The trailing incomplete line, if any.
    pub fn pending(&self) -> &str {
        &self.text
    }

    fn decode(&mut self) {
        loop {
            if self.buf.is_empty() {
                return;
            }

            // validate as much of the header as has arrived
            let seen = self.buf.len().min(4);
            let header_ok = self.buf[0] <= 2 && self.buf[1..seen].iter().all(|&b| b == 0);

            if !header_ok {
                let bytes = std::mem::take(&mut self.buf);
                self.text.push_str(&String::from_utf8_lossy(&bytes));
                return;
            }

            if self.buf.len() < 8 {
                // incomplete header, reassemble on the next chunk
                return;
            }

            let len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if self.buf.len() < 8 + len {
                // incomplete payload, reassemble on the next chunk
                return;
            }

            self.text
                .push_str(&String::from_utf8_lossy(&self.buf[8..8 + len]));
            self.buf.drain(..8 + len);
        }
    }

    // split on `\r?\n`, keeping the trailing incomplete line
    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();

        while let Some(pos) = self.text.find('\n') {
            let mut line: String = self.text.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    // reference splitter: `\r?\n` separators, last piece left pending
    fn reference_split(text: &str) -> (Vec<String>, String) {
        let mut pieces: Vec<String> = text.split('\n').map(str::to_owned).collect();
        let pending = pieces.pop().unwrap_or_default();
        for piece in &mut pieces {
            if piece.ends_with('\r') {
                piece.pop();
            }
        }
        (pieces, pending)
    }

    #[test]
    fn decodes_a_single_frame() {
        let mut parser = LogParser::new();
        let lines = parser.push(&frame(1, b"hello world\n"));
        assert_eq!(lines, vec!["hello world"]);
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let bytes = frame(1, b"split line\n");
        let mut parser = LogParser::new();

        assert!(parser.push(&bytes[..3]).is_empty());
        assert!(parser.push(&bytes[3..9]).is_empty());
        let lines = parser.push(&bytes[9..]);
        assert_eq!(lines, vec!["split line"]);
    }

    #[test]
    fn invalid_header_falls_back_to_raw_utf8() {
        let mut parser = LogParser::new();
        let lines = parser.push(b"[Server] listening on 25565\n");
        assert_eq!(lines, vec!["[Server] listening on 25565"]);
    }

    #[test]
    fn nonzero_padding_bytes_invalidate_the_header() {
        let mut parser = LogParser::new();
        // byte 0 is in range but byte 2 is not zero
        let lines = parser.push(b"\x01a line of text\n");
        assert_eq!(lines, vec!["\u{1}a line of text"]);
    }

    #[test]
    fn splits_on_both_line_ending_styles() {
        let mut parser = LogParser::new();
        let lines = parser.push(&frame(1, b"one\r\ntwo\nthr"));
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(parser.pending(), "thr");
    }

    #[test]
    fn keeps_the_trailing_incomplete_line() {
        let mut parser = LogParser::new();
        assert!(parser.push(&frame(1, b"partial")).is_empty());
        assert_eq!(parser.pending(), "partial");
        let lines = parser.push(&frame(1, b" done\n"));
        assert_eq!(lines, vec!["partial done"]);
    }

    proptest! {
        #[test]
        fn framed_records_yield_exactly_their_payload_concatenation(
            payloads in proptest::collection::vec("[a-z ]{0,16}", 1..8),
            stream_types in proptest::collection::vec(0u8..3, 1..8),
        ) {
            let mut bytes = Vec::new();
            for (i, payload) in payloads.iter().enumerate() {
                let ty = stream_types[i % stream_types.len()];
                bytes.extend_from_slice(&frame(ty, payload.as_bytes()));
            }

            let mut parser = LogParser::new();
            let lines = parser.push(&bytes);
            // payloads carry no newlines, so everything stays pending
            prop_assert!(lines.is_empty());
            prop_assert_eq!(parser.pending(), payloads.concat());
        }

        #[test]
        fn invalid_first_header_yields_the_whole_sequence(
            first in 3u8..=255,
            rest in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut bytes = vec![first];
            bytes.extend_from_slice(&rest);

            let mut parser = LogParser::new();
            let lines = parser.push(&bytes);

            let (expected_lines, expected_pending) =
                reference_split(&String::from_utf8_lossy(&bytes));
            prop_assert_eq!(lines, expected_lines);
            prop_assert_eq!(parser.pending(), expected_pending);
        }
    }
}
