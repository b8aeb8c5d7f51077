//! The ingest datagram: one frame fragment per UDP packet.
//!
//! Layout, all fields NUL-terminated, numbers as ASCII decimal:
//!
//! ```text
//! <token> 00 <sequence> 00 <fragment total> 00 <fragment index> 00 <payload> 00
//! ```
//!
//! The payload is raw JPEG data and may legally contain NUL bytes, so the
//! decoder locates the four leading delimiters and the single trailing one;
//! it never splits the whole packet on NUL.

use bytes::{BufMut, Bytes, BytesMut};

use super::{NUL, WireError, ascii_u32, ascii_u64, nul_text};
use crate::token;

/// Hard upper bound on an ingest datagram. Payloads sized for a ~4 KiB path
/// MTU fit comfortably; anything larger than this is dropped unread.
pub const MAX_DATAGRAM_LEN: usize = 8 * 1024;

/// A decoded ingest datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDatagram {
    pub token: String,
    pub sequence: u64,
    pub total_fragments: u32,
    pub fragment_index: u32,
    pub payload: Bytes,
}

impl FeedDatagram {
    /// Decode one datagram. Malformed input yields an error the caller is
    /// expected to drop silently; an ingest socket never answers.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        if input.len() > MAX_DATAGRAM_LEN {
            return Err(WireError::Malformed("datagram length"));
        }

        let (rest, raw_token) = nul_text(input).map_err(|_| WireError::Malformed("token"))?;
        if raw_token.len() > token::MAX_LENGTH || !raw_token.iter().all(u8::is_ascii_graphic) {
            return Err(WireError::Malformed("token"));
        }

        let (rest, sequence) = ascii_u64(rest).map_err(|_| WireError::Malformed("sequence"))?;
        let (rest, total_fragments) =
            ascii_u32(rest).map_err(|_| WireError::Malformed("fragment total"))?;
        if total_fragments == 0 {
            return Err(WireError::Malformed("fragment total"));
        }
        let (rest, fragment_index) =
            ascii_u32(rest).map_err(|_| WireError::Malformed("fragment index"))?;

        // Everything between the fourth delimiter and the trailing NUL is
        // payload, NULs included.
        let payload = match rest.split_last() {
            Some((&NUL, payload)) => payload,
            Some(_) => return Err(WireError::Malformed("trailing delimiter")),
            None => return Err(WireError::Truncated),
        };

        Ok(Self {
            token: String::from_utf8_lossy(raw_token).into_owned(),
            sequence,
            total_fragments,
            fragment_index,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Encode for transmission. Used by the transmitter client and tests.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.token.len() + self.payload.len() + 72);
        buf.put_slice(self.token.as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(self.sequence.to_string().as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(self.total_fragments.to_string().as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(self.fragment_index.to_string().as_bytes());
        buf.put_u8(NUL);
        buf.put_slice(&self.payload);
        buf.put_u8(NUL);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FeedDatagram {
        FeedDatagram {
            token: "53289164".to_string(),
            sequence: 7,
            total_fragments: 3,
            fragment_index: 2,
            payload: Bytes::from_static(b"\xff\xd8jpeg data\xff\xd9"),
        }
    }

    #[test]
    fn round_trip() {
        let datagram = sample();
        assert_eq!(FeedDatagram::decode(&datagram.encode()).unwrap(), datagram);
    }

    #[test]
    fn payload_may_contain_nul_bytes() {
        let wire = b"12345678\x000\x001\x000\x00ab\x00cd\x00ef\x00";
        let datagram = FeedDatagram::decode(wire).unwrap();
        assert_eq!(datagram.payload.as_ref(), b"ab\x00cd\x00ef");
    }

    #[test]
    fn empty_payload_is_accepted() {
        let wire = b"12345678\x004\x001\x000\x00\x00";
        let datagram = FeedDatagram::decode(wire).unwrap();
        assert!(datagram.payload.is_empty());
        assert_eq!(datagram.sequence, 4);
    }

    #[test]
    fn rejects_missing_trailing_delimiter() {
        let wire = b"12345678\x000\x001\x000\x00payload";
        assert_eq!(
            FeedDatagram::decode(wire),
            Err(WireError::Malformed("trailing delimiter"))
        );
    }

    #[test]
    fn rejects_zero_fragment_total() {
        let wire = b"12345678\x000\x000\x000\x00x\x00";
        assert_eq!(
            FeedDatagram::decode(wire),
            Err(WireError::Malformed("fragment total"))
        );
    }

    #[test]
    fn rejects_non_numeric_sequence() {
        let wire = b"12345678\x00seven\x001\x000\x00x\x00";
        assert_eq!(
            FeedDatagram::decode(wire),
            Err(WireError::Malformed("sequence"))
        );
    }

    #[test]
    fn rejects_oversized_datagram() {
        let datagram = FeedDatagram {
            payload: Bytes::from(vec![0xAB; MAX_DATAGRAM_LEN]),
            ..sample()
        };
        assert!(FeedDatagram::decode(&datagram.encode()).is_err());
    }
}
