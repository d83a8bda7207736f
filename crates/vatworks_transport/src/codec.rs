//! Netstring framing for the worker pipe.
//!
//! Each message is `<decimal length>:<bytes>,`. The first byte of a message
//! says what it is:
//!
//! | prefix | direction | meaning |
//! |---|---|---|
//! | `?` | manager to worker | command (`setBundle`, `deliver`, `snapshot`) |
//! | `/` | manager to worker | answer to the worker's syscall |
//! | `?` | worker to manager | syscall |
//! | `.` | worker to manager | command reply, optionally `<meter json>\x01<reply>` |
//! | `!` | worker to manager | uncaught worker exception |

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted by default (heap snapshots travel in one frame)
pub const DEFAULT_MAX_FRAME: usize = 1 << 30;

/// Separator between meter usage and reply in a `.` frame
pub const METER_SEPARATOR: u8 = 0x01;

/// Netstring encoder/decoder
#[derive(Debug, Clone)]
pub struct NetstringCodec {
    max_frame: usize,
}

impl NetstringCodec {
    /// Create a codec with the default frame limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Set the frame limit
    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        let Some(colon) = src.iter().position(|b| *b == b':') else {
            // 10 digits is enough for any length we accept
            if src.len() > 10 || src.iter().any(|b| !b.is_ascii_digit()) {
                return Err(TransportError::Protocol {
                    reason: "netstring length prefix is not decimal".to_string(),
                });
            }
            return Ok(None);
        };
        let digits = &src[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(TransportError::Protocol {
                reason: "netstring length prefix is not decimal".to_string(),
            });
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::Protocol {
                reason: "netstring length overflow".to_string(),
            })?;
        if len > self.max_frame {
            return Err(TransportError::Protocol {
                reason: format!("frame of {} bytes exceeds limit {}", len, self.max_frame),
            });
        }
        let total = colon + 1 + len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        if src[total - 1] != b',' {
            return Err(TransportError::Protocol {
                reason: "netstring missing trailing comma".to_string(),
            });
        }
        src.advance(colon + 1);
        let payload = src.split_to(len).freeze();
        src.advance(1);
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        let header = format!("{}:", item.len());
        dst.reserve(header.len() + item.len() + 1);
        dst.put_slice(header.as_bytes());
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}

/// A decoded message, classified by its prefix byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `?`: command (to worker) or syscall (from worker)
    Request(Bytes),
    /// `/`: syscall answer
    SyscallResponse(Bytes),
    /// `.`: command reply
    Reply(Bytes),
    /// `!`: worker exception
    Exception(Bytes),
}

impl Frame {
    /// Classify a raw message
    ///
    /// # Errors
    ///
    /// Returns error on an empty message or unknown prefix
    pub fn parse(mut raw: Bytes) -> Result<Self, TransportError> {
        if raw.is_empty() {
            return Err(TransportError::Protocol {
                reason: "empty frame".to_string(),
            });
        }
        let prefix = raw[0];
        raw.advance(1);
        match prefix {
            b'?' => Ok(Self::Request(raw)),
            b'/' => Ok(Self::SyscallResponse(raw)),
            b'.' => Ok(Self::Reply(raw)),
            b'!' => Ok(Self::Exception(raw)),
            other => Err(TransportError::Protocol {
                reason: format!("unknown frame prefix {:?}", other as char),
            }),
        }
    }

    /// Encode with its prefix byte
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        let (prefix, body) = match self {
            Self::Request(b) => (b'?', b),
            Self::SyscallResponse(b) => (b'/', b),
            Self::Reply(b) => (b'.', b),
            Self::Exception(b) => (b'!', b),
        };
        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_u8(prefix);
        out.put_slice(&body);
        out.freeze()
    }
}

/// Split a reply into optional meter JSON and the reply proper
///
/// The meter part is only recognised when it is a JSON object ahead of the
/// first separator byte.
#[must_use]
pub fn split_meter(reply: &Bytes) -> (Option<Bytes>, Bytes) {
    if reply.first() == Some(&b'{') {
        if let Some(pos) = reply.iter().position(|b| *b == METER_SEPARATOR) {
            return (Some(reply.slice(..pos)), reply.slice(pos + 1..));
        }
    }
    (None, reply.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<Vec<Bytes>, TransportError> {
        let mut codec = NetstringCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn test_decode_multiple() {
        let frames = decode_all(b"5:hello,0:,3:abc,").unwrap();
        assert_eq!(frames, vec![Bytes::from("hello"), Bytes::new(), Bytes::from("abc")]);
    }

    #[test]
    fn test_decode_partial() {
        let mut codec = NetstringCodec::new();
        let mut buf = BytesMut::from(&b"11:hello"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b" world,");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from("hello world")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_all(b"x5:hello,").is_err());
        assert!(decode_all(b"5:hello;").is_err());
        assert!(decode_all(b"abc").is_err());
    }

    #[test]
    fn test_frame_limit() {
        let mut codec = NetstringCodec::new().with_max_frame(4);
        let mut buf = BytesMut::from(&b"5:hello,"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode() {
        let mut codec = NetstringCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::Request(Bytes::from("[\"snapshot\"]")).into_bytes(), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"13:?[\"snapshot\"],");
    }

    #[test]
    fn test_frame_prefixes() {
        assert_eq!(
            Frame::parse(Bytes::from("!boom")).unwrap(),
            Frame::Exception(Bytes::from("boom"))
        );
        assert_eq!(
            Frame::parse(Bytes::from("/[\"ok\",null]")).unwrap(),
            Frame::SyscallResponse(Bytes::from("[\"ok\",null]"))
        );
        assert!(Frame::parse(Bytes::new()).is_err());
        assert!(Frame::parse(Bytes::from("#x")).is_err());
    }

    #[test]
    fn test_split_meter() {
        let reply = Bytes::from(&b"{\"compute\":7}\x01[\"ok\",null,null]"[..]);
        let (meter, body) = split_meter(&reply);
        assert_eq!(meter, Some(Bytes::from("{\"compute\":7}")));
        assert_eq!(body, Bytes::from("[\"ok\",null,null]"));

        let plain = Bytes::from("[\"ok\",null,null]");
        assert_eq!(split_meter(&plain), (None, plain.clone()));
    }
}
