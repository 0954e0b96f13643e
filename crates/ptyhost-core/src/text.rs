use bytes::{Bytes, BytesMut};
use ptyhost_common::types::Encoding;

/// Re-chunks the data stream so no chunk ends inside a character.
#[derive(Debug, Default)]
pub struct TextBoundary {
    encoding: Option<Encoding>,
    carry: BytesMut,
}

impl TextBoundary {
    pub fn new(encoding: Option<Encoding>) -> Self {
        Self {
            encoding,
            carry: BytesMut::new(),
        }
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Switch encodings, returning any bytes held back under the old one.
    pub fn set_encoding(&mut self, encoding: Option<Encoding>) -> Option<Bytes> {
        let rest = self.finish();
        self.encoding = encoding;
        rest
    }

    /// Returns the part of `chunk` (plus earlier carry) that ends on a
    /// character boundary.
    pub fn push(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.encoding != Some(Encoding::Utf8) {
            return non_empty(chunk);
        }
        let mut buf = if self.carry.is_empty() {
            BytesMut::from(&chunk[..])
        } else {
            let mut buf = std::mem::take(&mut self.carry);
            buf.extend_from_slice(&chunk);
            buf
        };
        let tail = incomplete_utf8_tail(&buf);
        self.carry = buf.split_off(buf.len() - tail);
        non_empty(buf.freeze())
    }

    /// Flush whatever is held back.
    pub fn finish(&mut self) -> Option<Bytes> {
        non_empty(std::mem::take(&mut self.carry).freeze())
    }
}

fn non_empty(bytes: Bytes) -> Option<Bytes> {
    (!bytes.is_empty()).then_some(bytes)
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_without_encoding() {
        let mut text = TextBoundary::new(None);
        let chunk = Bytes::from_static(&[0xE2, 0x82]);
        assert_eq!(text.push(chunk.clone()), Some(chunk));
    }

    #[test]
    fn test_split_character_is_carried() {
        let euro = "€".as_bytes();
        let mut text = TextBoundary::new(Some(Encoding::Utf8));

        let mut first = b"a".to_vec();
        first.extend_from_slice(&euro[..2]);
        assert_eq!(text.push(Bytes::from(first)), Some(Bytes::from_static(b"a")));

        let mut second = euro[2..].to_vec();
        second.push(b'b');
        assert_eq!(text.push(Bytes::from(second)).unwrap(), "€b".as_bytes());
        assert_eq!(text.finish(), None);
    }

    #[test]
    fn test_lone_lead_byte_is_held() {
        let mut text = TextBoundary::new(Some(Encoding::Utf8));
        assert_eq!(text.push(Bytes::from_static(&[0xF0])), None);
        assert_eq!(text.set_encoding(None), Some(Bytes::from_static(&[0xF0])));
    }

    #[test]
    fn test_complete_sequences_pass() {
        assert_eq!(incomplete_utf8_tail("héllo😀".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(&"😀".as_bytes()[..3]), 3);
        assert_eq!(incomplete_utf8_tail(b""), 0);
    }
}
