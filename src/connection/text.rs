//! Incremental UTF-8 decoding of inbound chunks
//!
//! The transport hands over whatever bytes a read produced, so a multi-byte
//! character may straddle two reads. The decoder holds back an incomplete
//! trailing sequence until the next chunk completes it.

/// Stateful chunk decoder, one per client
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, returning all text that is complete so far
    ///
    /// Invalid sequences become U+FFFD. An incomplete sequence at the end of
    /// the chunk is kept for the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));

                    match e.error_len() {
                        Some(invalid_len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + invalid_len..];
                        }
                        None => {
                            // truncated sequence, wait for more bytes
                            rest = &rest[valid_up_to..];
                            break;
                        }
                    }
                }
            }
        }

        let carry = rest.to_vec();
        self.pending = carry;
        text
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.decode(b"w"), "w");
        assert_eq!(decoder.decode(b"asd\n"), "asd\n");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut decoder = TextDecoder::new();
        let snake = "🐍".as_bytes();

        assert_eq!(decoder.decode(&snake[..2]), "");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&snake[2..]), "🐍");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_finish_flushes_truncated_tail() {
        let mut decoder = TextDecoder::new();
        assert_eq!(decoder.decode(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(!decoder.has_pending());
    }
}
