//! Challenge tokens issued to transmitters at handshake time.
//!
//! A token is prepended to every frame datagram, so it has to be short, yet
//! hard enough to guess that nobody can inject frames into a feed while the
//! feed is live. The alphabet and length are configurable; the default is
//! eight decimal digits to keep per-datagram overhead low on links where
//! the handshake channel is already source-whitelisted.

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

/// Default token alphabet: decimal digits, the bandwidth-conservative choice.
pub const DEFAULT_ALPHABET: &str = "0123456789";

/// Default token length in characters.
pub const DEFAULT_LENGTH: usize = 8;

/// Tokens longer than this are rejected by the datagram parser outright.
pub const MAX_LENGTH: usize = 32;

/// How tokens are generated: which characters, and how many of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub alphabet: String,
    pub length: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            length: DEFAULT_LENGTH,
        }
    }
}

/// An opaque credential bound to one authenticated transmitter.
///
/// Tokens are plain printable strings on the wire; the newtype exists so a
/// token cannot be confused with a feed identifier at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChallengeToken(String);

impl ChallengeToken {
    /// Draw a fresh token from an OS-seeded CSPRNG.
    ///
    /// The generator is seeded per call; token issuance happens once per
    /// handshake, never on the datagram path.
    pub fn generate(config: &TokenConfig) -> Self {
        let alphabet: Vec<char> = config.alphabet.chars().collect();
        debug_assert!(!alphabet.is_empty(), "token alphabet must not be empty");

        let mut rng = StdRng::from_os_rng();
        let token = (0..config.length.max(1))
            .map(|_| alphabet[rng.random_range(0..alphabet.len())])
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChallengeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChallengeToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for ChallengeToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl AsRef<str> for ChallengeToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
