//! Frame reassembly and per-feed caching.
//!
//! Datagrams arrive as fragments, out of order and lossy; viewers and the
//! storage flusher want whole frames in sequence order. The types here sit
//! between the two: a [`FragmentBuffer`] accumulates one frame, a
//! [`FrameCache`] keeps the most recent whole frames of one feed, and the
//! [`FeedRegistry`] maps authenticated clients (and their human-readable
//! identifiers) to caches.

mod feed;
mod fragment;
mod registry;

pub use feed::{CacheConfig, CachedFrame, FrameCache, SubmitOutcome};
pub use fragment::FragmentBuffer;
pub use registry::{FeedRegistry, RegistryError};
