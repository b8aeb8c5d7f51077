//! Wire formats of the two transmitter-facing channels.
//!
//! Both channels speak NUL-delimited ASCII fields. The control handshake is
//! a single framed exchange over a reliable stream; the ingest datagram
//! carries one frame fragment and is parsed with the caveat that the
//! payload itself may contain NUL bytes, so only the leading delimiters and
//! the trailing one are structural.

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_while1},
    combinator::map_res,
    sequence::terminated,
};

mod datagram;
mod handshake;

pub use datagram::{FeedDatagram, MAX_DATAGRAM_LEN};
pub use handshake::{HandshakeReply, HandshakeRequest, OPCODE_AUTH};

/// The field delimiter on both channels.
pub const NUL: u8 = 0x00;

/// Feed identifiers are short labels viewers type into a URL.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Decode failure on either channel.
///
/// Parse errors carry the offending field, not the input: malformed traffic
/// is attacker-controlled and is only ever logged at low severity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message is truncated")]
    Truncated,
    #[error("unknown opcode {0:02x?}")]
    UnknownOpcode([u8; 2]),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("invalid feed identifier")]
    InvalidIdentifier,
}

/// True iff `identifier` may name a feed: non-empty, at most
/// [`MAX_IDENTIFIER_LEN`] bytes, word characters only. The same rule gates
/// the handshake and the viewer URL.
pub fn valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier.len() <= MAX_IDENTIFIER_LEN
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// One NUL-terminated run of non-NUL bytes.
fn nul_text(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_while1(|b| b != NUL), tag(&[NUL][..])).parse(input)
}

/// One NUL-terminated run of ASCII decimal digits.
fn ascii_u64(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(
        terminated(take_while1(|b: u8| b.is_ascii_digit()), tag(&[NUL][..])),
        |digits: &[u8]| String::from_utf8_lossy(digits).parse::<u64>(),
    )
    .parse(input)
}

fn ascii_u32(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(
        terminated(take_while1(|b: u8| b.is_ascii_digit()), tag(&[NUL][..])),
        |digits: &[u8]| String::from_utf8_lossy(digits).parse::<u32>(),
    )
    .parse(input)
}

fn ascii_u16(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        terminated(take_while1(|b: u8| b.is_ascii_digit()), tag(&[NUL][..])),
        |digits: &[u8]| String::from_utf8_lossy(digits).parse::<u16>(),
    )
    .parse(input)
}
