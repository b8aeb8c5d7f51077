//! The lampyre daemon: ingest, cache and republish live MJPEG feeds.
//!
//! A transmitter authenticates once over the whitelisted control channel
//! and receives a challenge token; it then streams JPEG frames, fragmented
//! into UDP datagrams, at the ingest listener. Reassembled frames land in a
//! per-feed cache, from which any number of HTTP viewers are served a
//! `multipart/x-mixed-replace` stream, while the storage flusher appends
//! the same frames to a per-feed video file on disk.
//!
//! The servers share three pieces of state: the [`Authenticator`]
//! (token → client), the [`FeedRegistry`] (client → frame cache) and the
//! caches themselves. Each is individually locked for short, I/O-free
//! critical sections; nothing on the ingest path can block the control or
//! viewer paths.
//!
//! [`Authenticator`]: lbase::Authenticator
//! [`FeedRegistry`]: lcache::FeedRegistry

pub mod control;
pub mod daemon;
pub mod ingest;
pub mod storage;
pub mod transmitter;
pub mod viewer;

pub use daemon::{Daemon, DaemonError};
pub use transmitter::{FeedTransmitter, TransmitError};
