//! Ciphertext framing: message prefixes, fragmentation and reassembly.
//!
//! A protocol message is `?TLP:<base64>`. When the encoding is longer than the
//! fragment size it is sent as a sequence of `?TLP,<k>,<n>,<chunk>,` pieces,
//! `k` counting from 1. Pieces must arrive in order; the receiver rebuilds
//! the original message before decoding it.

use crate::channel::ChannelError;

/// Prefix of a complete protocol message.
pub const MESSAGE_PREFIX: &str = "?TLP:";

/// Prefix of one fragment of a protocol message.
pub const FRAGMENT_PREFIX: &str = "?TLP,";

/// Largest message the reassembler will rebuild (64 KB).
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// An inbound transport message, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Piece<'a> {
    /// A complete message; the body follows [`MESSAGE_PREFIX`].
    Whole(&'a str),
    /// One fragment of a longer message.
    Fragment {
        index: usize,
        total: usize,
        chunk: &'a str,
    },
}

/// Classify a raw transport message.
pub fn classify(message: &str) -> Result<Piece<'_>, ChannelError> {
    if let Some(body) = message.strip_prefix(MESSAGE_PREFIX) {
        return Ok(Piece::Whole(body));
    }
    let Some(rest) = message.strip_prefix(FRAGMENT_PREFIX) else {
        return Err(ChannelError::Unencrypted);
    };
    let mut parts = rest.splitn(3, ',');
    let index = parse_count(parts.next())?;
    let total = parse_count(parts.next())?;
    let chunk = parts
        .next()
        .and_then(|c| c.strip_suffix(','))
        .ok_or_else(|| ChannelError::Malformed("fragment is not comma-terminated".into()))?;
    if index == 0 || total == 0 || index > total {
        return Err(ChannelError::Malformed(format!(
            "fragment index {index} of {total}"
        )));
    }
    Ok(Piece::Fragment {
        index,
        total,
        chunk,
    })
}

fn parse_count(part: Option<&str>) -> Result<usize, ChannelError> {
    part.and_then(|p| p.parse::<usize>().ok())
        .ok_or_else(|| ChannelError::Malformed("bad fragment header".into()))
}

/// Split a complete message into transport-sized pieces.
///
/// Messages that already fit are returned unchanged as a single piece.
pub fn fragment(message: &str, max_size: usize) -> Vec<String> {
    if message.len() <= max_size {
        return vec![message.to_string()];
    }

    // Header is "?TLP,k,n," plus the trailing ','; its width depends on n.
    let mut digits = 1;
    let (chunk_size, total) = loop {
        let overhead = FRAGMENT_PREFIX.len() + 2 * digits + 3;
        let chunk_size = max_size.saturating_sub(overhead).max(1);
        let total = message.len().div_ceil(chunk_size);
        let needed = total.to_string().len();
        if needed <= digits {
            break (chunk_size, total);
        }
        digits = needed;
    };

    chunks(message, chunk_size)
        .enumerate()
        .map(|(i, chunk)| format!("{FRAGMENT_PREFIX}{},{total},{chunk},", i + 1))
        .collect()
}

/// Split on char boundaries into pieces of at most `size` bytes.
fn chunks(s: &str, size: usize) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}

/// Rebuilds fragmented messages. Any gap resets it.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: String,
    total: usize,
    next: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the complete message after the last piece.
    pub fn push(
        &mut self,
        index: usize,
        total: usize,
        chunk: &str,
    ) -> Result<Option<String>, ChannelError> {
        if index == 1 {
            self.buffer.clear();
            self.total = total;
            self.next = 1;
        } else if index != self.next || total != self.total {
            let expected = self.next.max(1);
            self.reset();
            return Err(ChannelError::FragmentOrder {
                got: index,
                total,
                expected,
            });
        }

        if self.buffer.len() + chunk.len() > MAX_MESSAGE_LEN {
            let size = self.buffer.len() + chunk.len();
            self.reset();
            return Err(ChannelError::TooLarge {
                size,
                max: MAX_MESSAGE_LEN,
            });
        }

        self.buffer.push_str(chunk);
        self.next += 1;

        if index == total {
            let whole = std::mem::take(&mut self.buffer);
            self.reset();
            Ok(Some(whole))
        } else {
            Ok(None)
        }
    }

    /// Whether a partial message is buffered.
    pub fn is_pending(&self) -> bool {
        self.next > 0
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.total = 0;
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(pieces: &[String]) -> String {
        let mut r = Reassembler::new();
        let mut out = None;
        for piece in pieces {
            match classify(piece).unwrap() {
                Piece::Fragment {
                    index,
                    total,
                    chunk,
                } => out = r.push(index, total, chunk).unwrap(),
                Piece::Whole(_) => panic!("expected fragment"),
            }
        }
        out.expect("message incomplete")
    }

    #[test]
    fn test_short_message_is_not_fragmented() {
        let pieces = fragment("?TLP:abc", 140);
        assert_eq!(pieces, vec!["?TLP:abc".to_string()]);
        assert_eq!(classify(&pieces[0]).unwrap(), Piece::Whole("abc"));
    }

    #[test]
    fn test_long_message_respects_fragment_size() {
        let message = format!("?TLP:{}", "A".repeat(1000));
        let pieces = fragment(&message, 140);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.len() <= 140, "piece too long: {}", piece.len());
        }
        assert_eq!(reassemble(&pieces), message);
    }

    #[test]
    fn test_many_fragments_widen_header() {
        let message = format!("?TLP:{}", "B".repeat(5000));
        let pieces = fragment(&message, 20);
        assert!(pieces.len() >= 100);
        for piece in &pieces {
            assert!(piece.len() <= 20);
        }
        assert_eq!(reassemble(&pieces), message);
    }

    #[test]
    fn test_out_of_order_fragment_resets() {
        let message = format!("?TLP:{}", "C".repeat(400));
        let pieces = fragment(&message, 140);
        assert!(pieces.len() >= 3);

        let mut r = Reassembler::new();
        let Piece::Fragment { index, total, chunk } = classify(&pieces[0]).unwrap() else {
            panic!("expected fragment");
        };
        assert_eq!(r.push(index, total, chunk).unwrap(), None);
        assert!(r.is_pending());

        let Piece::Fragment { index, total, chunk } = classify(&pieces[2]).unwrap() else {
            panic!("expected fragment");
        };
        assert!(matches!(
            r.push(index, total, chunk),
            Err(ChannelError::FragmentOrder { got: 3, expected: 2, .. })
        ));
        assert!(!r.is_pending());
    }

    #[test]
    fn test_classify_rejects_plaintext_and_garbage() {
        assert!(matches!(classify("hello"), Err(ChannelError::Unencrypted)));
        assert!(matches!(
            classify("?TLP,x,2,abc,"),
            Err(ChannelError::Malformed(_))
        ));
        assert!(matches!(
            classify("?TLP,3,2,abc,"),
            Err(ChannelError::Malformed(_))
        ));
        assert!(matches!(
            classify("?TLP,1,2,abc"),
            Err(ChannelError::Malformed(_))
        ));
    }
}
