//! Byte-marker framing for the replication protocol.
//!
//! Every logical message travels as `<TAG>payload</TAG>`: a 5-byte opening
//! marker and a 6-byte closing marker formed by inserting `/` after the
//! first byte. Acknowledgements use the bare `<ACK>` token with no payload
//! or closing marker.
//!
//! Extraction is a naive unescaped substring scan, kept that way for wire
//! compatibility with existing nodes. Payloads must never contain a marker
//! byte sequence; there is no escaping.

/// Logical message kinds multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Node identity exchange.
    Sid,
    /// Challenge/response authentication payloads.
    Aut,
    /// Replication batch payload.
    Rep,
}

impl Tag {
    /// The 5-byte opening marker, e.g. `<SID>`.
    pub fn open(self) -> &'static [u8] {
        match self {
            Tag::Sid => b"<SID>",
            Tag::Aut => b"<AUT>",
            Tag::Rep => b"<REP>",
        }
    }

    /// The 6-byte closing marker, e.g. `</SID>`.
    pub fn close(self) -> &'static [u8] {
        match self {
            Tag::Sid => b"</SID>",
            Tag::Aut => b"</AUT>",
            Tag::Rep => b"</REP>",
        }
    }
}

/// Bare acknowledgement token, sent unwrapped.
pub const ACK: &[u8] = b"<ACK>";

/// Errors when extracting a framed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The opening marker was not found.
    MissingOpen(Tag),
    /// The closing marker was not found.
    MissingClose(Tag),
    /// The opening marker occurs at or after the closing marker.
    OutOfOrder(Tag),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MissingOpen(tag) => write!(f, "missing opening marker for {:?}", tag),
            FrameError::MissingClose(tag) => write!(f, "missing closing marker for {:?}", tag),
            FrameError::OutOfOrder(tag) => write!(f, "markers out of order for {:?}", tag),
        }
    }
}

impl std::error::Error for FrameError {}

/// Wrap `payload` in the opening and closing markers of `tag`.
pub fn wrap(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let open = tag.open();
    let close = tag.close();
    let mut out = Vec::with_capacity(open.len() + payload.len() + close.len());
    out.extend_from_slice(open);
    out.extend_from_slice(payload);
    out.extend_from_slice(close);
    out
}

/// Extract the bytes strictly between the markers of `tag`.
pub fn unwrap(tag: Tag, buf: &[u8]) -> Result<Vec<u8>, FrameError> {
    let open = tag.open();
    let close = tag.close();
    let start = find(buf, open).ok_or(FrameError::MissingOpen(tag))?;
    let end = find(buf, close).ok_or(FrameError::MissingClose(tag))?;
    if start >= end {
        return Err(FrameError::OutOfOrder(tag));
    }
    Ok(buf[start + open.len()..end].to_vec())
}

/// True when `buf` contains `needle` anywhere.
pub fn contains(buf: &[u8], needle: &[u8]) -> bool {
    find(buf, needle).is_some()
}

fn find(buf: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || buf.len() < needle.len() {
        return None;
    }
    buf.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers() {
        assert_eq!(Tag::Rep.open(), b"<REP>");
        assert_eq!(Tag::Rep.close(), b"</REP>");
        assert_eq!(Tag::Aut.open().len(), 5);
        assert_eq!(Tag::Aut.close().len(), 6);
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        for tag in [Tag::Sid, Tag::Aut, Tag::Rep] {
            let payload = b"some payload \x00\xff bytes";
            let framed = wrap(tag, payload);
            assert_eq!(unwrap(tag, &framed).unwrap(), payload);
        }
    }

    #[test]
    fn test_unwrap_empty_payload() {
        let framed = wrap(Tag::Aut, b"");
        assert_eq!(unwrap(Tag::Aut, &framed).unwrap(), b"");
    }

    #[test]
    fn test_unwrap_ignores_surrounding_bytes() {
        let mut buf = b"garbage".to_vec();
        buf.extend_from_slice(&wrap(Tag::Sid, b"sv1"));
        buf.extend_from_slice(b"trailing");
        assert_eq!(unwrap(Tag::Sid, &buf).unwrap(), b"sv1");
    }

    #[test]
    fn test_unwrap_missing_markers() {
        assert_eq!(
            unwrap(Tag::Rep, b"<REP>data"),
            Err(FrameError::MissingClose(Tag::Rep))
        );
        assert_eq!(
            unwrap(Tag::Rep, b"data</REP>"),
            Err(FrameError::MissingOpen(Tag::Rep))
        );
        assert_eq!(
            unwrap(Tag::Rep, b"nothing here"),
            Err(FrameError::MissingOpen(Tag::Rep))
        );
    }

    #[test]
    fn test_unwrap_out_of_order() {
        let mut buf = Tag::Rep.close().to_vec();
        buf.extend_from_slice(Tag::Rep.open());
        assert_eq!(unwrap(Tag::Rep, &buf), Err(FrameError::OutOfOrder(Tag::Rep)));
    }

    #[test]
    fn test_ack_detection() {
        assert!(contains(b"junk<ACK>junk", ACK));
        assert!(!contains(b"<AC K>", ACK));
    }
}
