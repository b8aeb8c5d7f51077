//! Core structures of the lampyre live-feed daemon.
//!
//! This crate holds everything the servers above it share: the wire codecs
//! for the control handshake and the ingest datagram, challenge-token
//! generation, the registry of authenticated transmitters, and the
//! configuration model. It deliberately contains no sockets and no tasks,
//! so every piece can be exercised directly in tests.

pub mod auth;
pub mod config;
pub mod token;
pub mod wire;

pub use auth::{AuthError, AuthenticatedClient, Authenticator, ClientId};
pub use config::Config;
pub use token::ChallengeToken;
