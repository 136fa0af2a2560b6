use thiserror::Error;

/// ID reserved for "sender just (re)started, reset your dedup window".
pub const RESTART_ID: u8 = 0;
/// Highest allocatable message ID.
pub const MAX_ID: u8 = 0xff;

const HEX: &[u8; 16] = b"0123456789abcdef";

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame not newline terminated")]
    Unterminated,
    #[error("frame too short for an id")]
    Truncated,
    #[error("invalid message id bytes {0:?}")]
    BadId([u8; 2]),
}

/// One parsed wire frame.
///
/// Data payloads are handed to applications verbatim, trailing newline
/// included.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Bare `\n`. Resets the receiver's read deadline.
    Keepalive,
    /// `HH\n`: the peer acknowledges data frame `mid`.
    Ack { mid: u8 },
    /// `HH<payload>\n`.
    Data { mid: u8, payload: &'a [u8] },
}

/// Parses one complete line, terminator included.
pub fn parse(line: &[u8]) -> Result<Frame<'_>, FrameError> {
    if line.last() != Some(&b'\n') {
        return Err(FrameError::Unterminated);
    }
    if line.len() == 1 {
        return Ok(Frame::Keepalive);
    }
    if line.len() < 3 {
        return Err(FrameError::Truncated);
    }
    let mid = parse_id(line[0], line[1])?;
    if line.len() == 3 {
        Ok(Frame::Ack { mid })
    } else {
        Ok(Frame::Data { mid, payload: &line[2..] })
    }
}

/// Appends `HH<payload>\n` to `out`, adding the terminator only if `payload`
/// does not already carry one.
pub fn encode_data(mid: u8, payload: &[u8], out: &mut Vec<u8>) {
    push_id(mid, out);
    out.extend_from_slice(payload);
    if payload.last() != Some(&b'\n') {
        out.push(b'\n');
    }
}

/// Appends the 3-byte ACK frame for `mid` to `out`.
pub fn encode_ack(mid: u8, out: &mut Vec<u8>) {
    push_id(mid, out);
    out.push(b'\n');
}

#[inline]
fn push_id(mid: u8, out: &mut Vec<u8>) {
    out.push(HEX[(mid >> 4) as usize]);
    out.push(HEX[(mid & 0xf) as usize]);
}

// IDs are emitted lowercase; accept either case on the way in.
#[inline]
fn parse_id(hi: u8, lo: u8) -> Result<u8, FrameError> {
    match (hex_val(hi), hex_val(lo)) {
        (Some(h), Some(l)) => Ok((h << 4) | l),
        _ => Err(FrameError::BadId([hi, lo])),
    }
}

#[inline]
fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive() {
        assert_eq!(parse(b"\n"), Ok(Frame::Keepalive));
    }

    #[test]
    fn test_ack() {
        assert_eq!(parse(b"2a\n"), Ok(Frame::Ack { mid: 0x2a }));
        assert_eq!(parse(b"FF\n"), Ok(Frame::Ack { mid: 0xff }));
    }

    #[test]
    fn test_data_roundtrip() {
        let mut out = Vec::new();
        encode_data(0x03, b"hello", &mut out);
        assert_eq!(out, b"03hello\n");
        match parse(&out).unwrap() {
            Frame::Data { mid, payload } => {
                assert_eq!(mid, 3);
                assert_eq!(payload, b"hello\n");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_data_keeps_existing_terminator() {
        let mut out = Vec::new();
        encode_data(0xab, b"x\n", &mut out);
        assert_eq!(out, b"abx\n");
    }

    #[test]
    fn test_ack_encoding() {
        let mut out = Vec::new();
        encode_ack(0x01, &mut out);
        assert_eq!(out, b"01\n");
    }

    #[test]
    fn test_bad_id_rejected() {
        assert_eq!(parse(b"zz\n"), Err(FrameError::BadId([b'z', b'z'])));
        assert_eq!(parse(b"0g!\n"), Err(FrameError::BadId([b'0', b'g'])));
    }

    #[test]
    fn test_unterminated_rejected() {
        assert_eq!(parse(b"01abc"), Err(FrameError::Unterminated));
        assert_eq!(parse(b""), Err(FrameError::Unterminated));
    }

    #[test]
    fn test_two_byte_line_rejected() {
        assert_eq!(parse(b"a\n"), Err(FrameError::Truncated));
    }
}
