//! The control-channel handshake: one request, one reply, then the
//! connection closes.
//!
//! ```text
//! request:  01 00 <identifier> 00
//! reply:    01 00 <token> 00 <ingest host> 00 <ingest port> 00
//! ```
//!
//! The handshake is the only point where the peer's source address carries
//! meaning (it is checked against the whitelist before the first read);
//! afterwards a transmitter is known purely by its token, because its
//! network identity may change mid-feed.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{Parser, bytes::complete::tag};

use super::{NUL, WireError, ascii_u16, nul_text, valid_identifier};

/// Opcode of the only request the control channel understands.
pub const OPCODE_AUTH: [u8; 2] = [0x01, 0x00];

/// A transmitter announcing itself under a feed identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub identifier: String,
}

impl HandshakeRequest {
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let rest = strip_opcode(input)?;
        let (rest, raw) = nul_text(rest).map_err(|_| WireError::InvalidIdentifier)?;
        if !rest.is_empty() {
            return Err(WireError::Malformed("trailing bytes"));
        }

        let identifier = String::from_utf8_lossy(raw).into_owned();
        if !valid_identifier(&identifier) {
            return Err(WireError::InvalidIdentifier);
        }
        Ok(Self { identifier })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.identifier.len() + 3);
        buf.put_slice(&OPCODE_AUTH);
        buf.put_slice(self.identifier.as_bytes());
        buf.put_u8(NUL);
        buf.freeze()
    }
}

/// The server's answer: the challenge token plus the ingest endpoint the
/// transmitter should send frames to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub token: String,
    pub ingest_host: String,
    pub ingest_port: u16,
}

impl HandshakeReply {
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let rest = strip_opcode(input)?;
        let (rest, token) = nul_text(rest).map_err(|_| WireError::Malformed("token"))?;
        let (rest, host) = nul_text(rest).map_err(|_| WireError::Malformed("ingest host"))?;
        let (rest, port) = ascii_u16(rest).map_err(|_| WireError::Malformed("ingest port"))?;
        if !rest.is_empty() {
            return Err(WireError::Malformed("trailing bytes"));
        }

        Ok(Self {
            token: String::from_utf8_lossy(token).into_owned(),
            ingest_host: String::from_utf8_lossy(host).into_owned(),
            ingest_port: port,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(self.token.len() + self.ingest_host.len() + 16);
        buf.put_slice(&OPCODE_AUTH);
        buf.put_slice(self.token.as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(self.ingest_host.as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(self.ingest_port.to_string().as_bytes());
        buf.put_u8(NUL);
        buf.freeze()
    }
}

fn strip_opcode(input: &[u8]) -> Result<&[u8], WireError> {
    match tag::<_, _, nom::error::Error<&[u8]>>(&OPCODE_AUTH[..]).parse(input) {
        Ok((rest, _)) => Ok(rest),
        Err(_) => match input {
            [a, b, ..] => Err(WireError::UnknownOpcode([*a, *b])),
            _ => Err(WireError::Truncated),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = HandshakeRequest {
            identifier: "TEST_STREAM".to_string(),
        };
        let wire = request.encode();
        assert_eq!(wire.as_ref(), b"\x01\x00TEST_STREAM\x00");
        assert_eq!(HandshakeRequest::decode(&wire).unwrap(), request);
    }

    #[test]
    fn reply_round_trip() {
        let reply = HandshakeReply {
            token: "48230917".to_string(),
            ingest_host: "192.168.101.129".to_string(),
            ingest_port: 56790,
        };
        let wire = reply.encode();
        assert_eq!(
            wire.as_ref(),
            b"\x01\x0048230917\x00192.168.101.129\x0056790\x00"
        );
        assert_eq!(HandshakeReply::decode(&wire).unwrap(), reply);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert_eq!(
            HandshakeRequest::decode(b"\x02\x00oops\x00"),
            Err(WireError::UnknownOpcode([0x02, 0x00]))
        );
    }

    #[test]
    fn truncated_request() {
        assert_eq!(HandshakeRequest::decode(b"\x01"), Err(WireError::Truncated));
    }

    #[test]
    fn identifier_must_be_well_formed() {
        assert_eq!(
            HandshakeRequest::decode(b"\x01\x00bad stream\x00"),
            Err(WireError::InvalidIdentifier)
        );
    }
}
