//! The per-feed frame cache.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use lbase::ClientId;

use crate::fragment::FragmentBuffer;

/// Trailing bytes of a well-formed JPEG image.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Sizing and timing of one frame cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whole frames retained per feed.
    pub capacity: usize,
    /// Partially reassembled frames tolerated before the lowest-sequence
    /// one is dropped. Bounds memory under sustained fragment loss.
    pub max_pending: usize,
    /// A feed with no complete frame for this long is finished.
    pub liveness_window: Duration,
    /// Estimate reported before two frames have arrived.
    pub initial_framerate: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_pending: 16,
            liveness_window: Duration::from_secs(10),
            initial_framerate: 30.0,
        }
    }
}

/// A whole frame as consumers see it. Cloning is cheap; the payload is a
/// reference-counted handle.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub data: Bytes,
    pub arrived_at: Instant,
    pub sequence: u64,
}

/// What became of a submitted fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored; the frame is still missing fragments.
    Buffered,
    /// The fragment completed its frame and the frame entered the ring.
    Completed,
    /// The fragment (or its whole frame) was dropped.
    Discarded,
}

struct Inner {
    ring: VecDeque<CachedFrame>,
    pending: BTreeMap<u64, FragmentBuffer>,
    framerate: f64,
    last_frame_at: Instant,
}

/// Bounded ring of the most recent whole frames of one feed, plus the
/// fragment buffers still being filled.
///
/// Producers (ingest tasks) and consumers (viewers, the storage flusher)
/// share a cache; one lock covers the ring and the fragment buffers, and is
/// held only to mutate them or to copy a frame handle out. Sequence numbers
/// in the ring strictly increase in insertion order, so a consumer that
/// remembers the last sequence it saw can always resume, even after the
/// ring has evicted past it.
pub struct FrameCache {
    client_id: ClientId,
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl FrameCache {
    pub fn new(client_id: ClientId, config: CacheConfig) -> Self {
        let initial_framerate = config.initial_framerate;
        Self {
            client_id,
            config,
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                pending: BTreeMap::new(),
                framerate: initial_framerate,
                last_frame_at: Instant::now(),
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Submit one fragment. When the fragment completes its frame, the frame
    /// is appended to the ring (evicting the oldest beyond capacity) and the
    /// liveness clock and framerate estimate are refreshed.
    pub fn submit_fragment(
        &self,
        sequence: u64,
        total_fragments: u32,
        fragment_index: u32,
        payload: Bytes,
    ) -> SubmitOutcome {
        if fragment_index >= total_fragments {
            tracing::warn!(
                client = %self.client_id,
                sequence,
                fragment_index,
                total_fragments,
                "fragment index out of range"
            );
            return SubmitOutcome::Discarded;
        }

        let mut inner = self.inner.lock().unwrap();

        // A frame at or below the newest cached sequence can no longer be
        // delivered in order; don't waste a buffer slot on it.
        if let Some(newest) = inner.ring.back() {
            if sequence <= newest.sequence {
                tracing::debug!(client = %self.client_id, sequence, "stale fragment dropped");
                return SubmitOutcome::Discarded;
            }
        }

        if let Some(expected) = inner.pending.get(&sequence).map(FragmentBuffer::total) {
            if expected != total_fragments {
                tracing::warn!(
                    client = %self.client_id,
                    sequence,
                    expected,
                    got = total_fragments,
                    "fragment total mismatch, dropping frame"
                );
                inner.pending.remove(&sequence);
                return SubmitOutcome::Discarded;
            }
        } else {
            inner
                .pending
                .insert(sequence, FragmentBuffer::new(sequence, total_fragments));
            if inner.pending.len() > self.config.max_pending {
                if let Some((evicted, _)) = inner.pending.pop_first() {
                    tracing::warn!(
                        client = %self.client_id,
                        sequence = evicted,
                        "dropping incomplete frame, too many outstanding"
                    );
                    if evicted == sequence {
                        return SubmitOutcome::Discarded;
                    }
                }
            }
        }

        let complete = match inner.pending.get_mut(&sequence) {
            Some(buffer) => {
                if !buffer.insert(fragment_index, payload) {
                    tracing::debug!(
                        client = %self.client_id,
                        sequence,
                        fragment_index,
                        "duplicate fragment ignored"
                    );
                }
                buffer.is_complete()
            }
            None => return SubmitOutcome::Discarded,
        };
        if !complete {
            return SubmitOutcome::Buffered;
        }

        let Some(buffer) = inner.pending.remove(&sequence) else {
            return SubmitOutcome::Discarded;
        };
        let frame = buffer.assemble();
        if !frame.ends_with(&JPEG_EOI) {
            tracing::warn!(
                client = %self.client_id,
                sequence,
                len = frame.len(),
                "frame does not end with the JPEG end-of-image marker"
            );
        }

        let now = Instant::now();
        inner.ring.push_back(CachedFrame {
            data: frame,
            arrived_at: now,
            sequence,
        });
        if inner.ring.len() > self.config.capacity {
            inner.ring.pop_front();
        }
        inner.last_frame_at = now;
        self.refresh_framerate(&mut inner);

        SubmitOutcome::Completed
    }

    /// Oldest cached frame with a sequence strictly greater than `last`;
    /// `None` in `last` means "from the beginning".
    pub fn get_after(&self, last: Option<u64>) -> Option<CachedFrame> {
        let inner = self.inner.lock().unwrap();
        inner
            .ring
            .iter()
            .find(|frame| last.map_or(true, |seq| frame.sequence > seq))
            .cloned()
    }

    /// True once the feed has gone quiet for the configured window.
    pub fn timed_out(&self) -> bool {
        self.inner.lock().unwrap().last_frame_at.elapsed() > self.config.liveness_window
    }

    /// Current framerate estimate; viewers pace their poll loops by it.
    pub fn framerate(&self) -> f64 {
        self.inner.lock().unwrap().framerate
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mean of the previous estimate and the rate observed across the ring,
    /// so a burst or a stall moves the estimate but does not whipsaw it.
    fn refresh_framerate(&self, inner: &mut Inner) {
        let n = inner.ring.len();
        if n < 2 {
            return;
        }
        let (Some(oldest), Some(newest)) = (inner.ring.front(), inner.ring.back()) else {
            return;
        };
        let span = newest
            .arrived_at
            .duration_since(oldest.arrived_at)
            .max(Duration::from_millis(1));
        let instant = n as f64 / span.as_secs_f64();
        inner.framerate = (inner.framerate + instant) / 2.0;
    }
}

#[cfg(test)]
impl FrameCache {
    fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(config: CacheConfig) -> FrameCache {
        // The id value is arbitrary; caches only carry it for logging and
        // registry bookkeeping.
        let id = test_client_id();
        FrameCache::new(id, config)
    }

    fn test_client_id() -> ClientId {
        use lbase::{Authenticator, token::TokenConfig};
        let auth = Authenticator::new(TokenConfig::default(), None);
        auth.register([127, 0, 0, 1].into(), "cache_test")
            .unwrap()
            .id()
    }

    fn jpeg(len: usize) -> Bytes {
        let mut data = vec![0xAB; len];
        data[0] = 0xFF;
        data[1] = 0xD8;
        data[len - 2] = 0xFF;
        data[len - 1] = 0xD9;
        Bytes::from(data)
    }

    fn submit_whole(cache: &FrameCache, sequence: u64, data: Bytes) -> SubmitOutcome {
        cache.submit_fragment(sequence, 1, 0, data)
    }

    #[test]
    fn single_fragment_frame_is_served() {
        let cache = cache(CacheConfig::default());
        let frame = jpeg(64);
        assert_eq!(
            submit_whole(&cache, 0, frame.clone()),
            SubmitOutcome::Completed
        );

        let served = cache.get_after(None).unwrap();
        assert_eq!(served.sequence, 0);
        assert_eq!(served.data, frame);
    }

    #[test]
    fn fragments_reassemble_in_any_order() {
        let cache = cache(CacheConfig::default());
        let frame = jpeg(9000);
        let parts: Vec<Bytes> = frame.chunks(3000).map(Bytes::copy_from_slice).collect();

        assert_eq!(
            cache.submit_fragment(7, 3, 2, parts[2].clone()),
            SubmitOutcome::Buffered
        );
        assert_eq!(
            cache.submit_fragment(7, 3, 0, parts[0].clone()),
            SubmitOutcome::Buffered
        );
        assert_eq!(
            cache.submit_fragment(7, 3, 1, parts[1].clone()),
            SubmitOutcome::Completed
        );

        let served = cache.get_after(Some(6)).unwrap();
        assert_eq!(served.sequence, 7);
        assert_eq!(served.data, frame);
    }

    #[test]
    fn lost_fragment_never_yields_a_frame() {
        let cache = cache(CacheConfig::default());
        cache.submit_fragment(8, 3, 0, Bytes::from_static(b"aa"));
        cache.submit_fragment(8, 3, 2, Bytes::from_static(b"cc"));
        assert!(cache.get_after(Some(7)).is_none());

        // The next frame is unaffected by the hole.
        submit_whole(&cache, 9, jpeg(32));
        assert_eq!(cache.get_after(Some(7)).unwrap().sequence, 9);
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let cache = cache(CacheConfig {
            capacity: 3,
            ..CacheConfig::default()
        });
        for sequence in 0..5 {
            submit_whole(&cache, sequence, jpeg(32));
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_after(None).unwrap().sequence, 2);
    }

    #[test]
    fn consumers_resume_across_evictions() {
        let cache = cache(CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        });
        for sequence in 0..6 {
            submit_whole(&cache, sequence, jpeg(32));
        }
        // Sequence 1 is long gone; the consumer lands on the oldest retained.
        assert_eq!(cache.get_after(Some(1)).unwrap().sequence, 4);
    }

    #[test]
    fn late_lower_sequences_are_discarded() {
        let cache = cache(CacheConfig::default());
        submit_whole(&cache, 5, jpeg(32));
        assert_eq!(submit_whole(&cache, 3, jpeg(32)), SubmitOutcome::Discarded);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fragment_total_mismatch_drops_the_frame() {
        let cache = cache(CacheConfig::default());
        cache.submit_fragment(4, 3, 0, Bytes::from_static(b"aa"));
        assert_eq!(
            cache.submit_fragment(4, 2, 1, Bytes::from_static(b"bb")),
            SubmitOutcome::Discarded
        );
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn outstanding_buffers_are_bounded() {
        let cache = cache(CacheConfig {
            max_pending: 2,
            ..CacheConfig::default()
        });
        for sequence in [10, 11, 12, 13] {
            cache.submit_fragment(sequence, 2, 0, Bytes::from_static(b"aa"));
        }
        assert_eq!(cache.pending_len(), 2);

        // The survivors are the highest sequences and still complete fine.
        assert_eq!(
            cache.submit_fragment(13, 2, 1, jpeg(32)),
            SubmitOutcome::Completed
        );
    }

    #[test]
    fn framerate_stays_positive() {
        let cache = cache(CacheConfig::default());
        assert_eq!(cache.framerate(), 30.0);

        for sequence in 0..4 {
            submit_whole(&cache, sequence, jpeg(32));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.framerate() > 0.0);
    }

    #[test]
    fn liveness_window_marks_a_quiet_feed() {
        let cache = cache(CacheConfig {
            liveness_window: Duration::from_millis(50),
            ..CacheConfig::default()
        });
        assert!(!cache.timed_out());

        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.timed_out());

        submit_whole(&cache, 0, jpeg(32));
        assert!(!cache.timed_out());
    }
}
