//! Cache-to-disk flushing.
//!
//! A dedicated thread wakes on a fixed period and appends every newly
//! cached frame to a per-feed video sink. The flusher is the one consumer
//! that sees a feed end: once a feed has timed out and a pass finds nothing
//! left to drain, it closes the sink and retires the client everywhere.

use std::{
    collections::{HashMap, hash_map::Entry},
    fs::File,
    io,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use lbase::{AuthenticatedClient, Authenticator, ClientId, config::StorageConfig};
use lcache::FeedRegistry;
use tracing::{debug, info, warn};

/// Where flushed frames go. The daemon ships a raw sequential-JPEG file
/// sink; the codec/container choice stays behind this trait.
pub trait VideoSink: Send {
    fn append(&mut self, frame: &[u8]) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

/// Opens the sink for a newly seen feed.
pub type SinkFactory = Box<dyn Fn(&AuthenticatedClient) -> io::Result<Box<dyn VideoSink>> + Send>;

/// Appends raw JPEG frames to `<identifier>_<YYYY-MM-DD-HH-MM>.mjpeg`
/// under the storage directory, one file per feed session.
pub struct MjpegFileSink {
    path: PathBuf,
    file: BufWriter<File>,
}

impl MjpegFileSink {
    pub fn create(dir: &Path, identifier: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M");
        let path = dir.join(format!("{identifier}_{stamp}.mjpeg"));
        let file = BufWriter::new(File::create(&path)?);
        info!(path = %path.display(), "opened video file");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSink for MjpegFileSink {
    fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct FeedWriter {
    sink: Box<dyn VideoSink>,
    last_flushed: Option<u64>,
    draining: bool,
}

/// The periodic cache drainer.
///
/// Single-threaded with respect to itself; it only ever reads from caches,
/// and never under a cache lock while touching disk (frames come out of
/// `get_after` as owned handles).
pub struct StorageFlusher {
    authenticator: Arc<Authenticator>,
    registry: Arc<FeedRegistry>,
    period: Duration,
    factory: SinkFactory,
    feeds: HashMap<ClientId, FeedWriter>,
}

/// Stops the flusher thread and joins it. The final pass closes all sinks.
pub struct FlusherHandle {
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

impl FlusherHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.join.join().is_err() {
            warn!("storage flusher panicked");
        }
    }
}

impl StorageFlusher {
    pub fn new(
        config: &StorageConfig,
        authenticator: Arc<Authenticator>,
        registry: Arc<FeedRegistry>,
    ) -> Self {
        let dir = config.dir.clone();
        Self::with_sink_factory(
            config.flush_period(),
            authenticator,
            registry,
            Box::new(move |client| {
                MjpegFileSink::create(&dir, client.identifier())
                    .map(|sink| Box::new(sink) as Box<dyn VideoSink>)
            }),
        )
    }

    pub fn with_sink_factory(
        period: Duration,
        authenticator: Arc<Authenticator>,
        registry: Arc<FeedRegistry>,
        factory: SinkFactory,
    ) -> Self {
        Self {
            authenticator,
            registry,
            period,
            factory,
            feeds: HashMap::new(),
        }
    }

    /// Start the flusher on its own thread.
    pub fn spawn(mut self) -> io::Result<FlusherHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let join = thread::Builder::new()
            .name("storage-flusher".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    self.flush_all();
                    // Sleep in slices so shutdown does not wait a full period.
                    let mut slept = Duration::ZERO;
                    while slept < self.period && !stop_flag.load(Ordering::Relaxed) {
                        let nap = (self.period - slept).min(Duration::from_millis(50));
                        thread::sleep(nap);
                        slept += nap;
                    }
                }
                self.close_all();
            })?;

        Ok(FlusherHandle { stop, join })
    }

    /// One flush pass over every registered client.
    fn flush_all(&mut self) {
        for client in self.authenticator.clients() {
            // A client that authenticated but has not sent a frame yet has
            // no cache; it is not the flusher's business yet.
            let Some(cache) = self.registry.get(client.id()) else {
                continue;
            };

            let writer = match self.feeds.entry(client.id()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(slot) => {
                    match (self.factory)(&client) {
                        Ok(sink) => slot.insert(FeedWriter {
                            sink,
                            last_flushed: None,
                            draining: false,
                        }),
                        Err(error) => {
                            // Retried on the next pass; frames wait in cache.
                            warn!(
                                client = %client.id(),
                                identifier = client.identifier(),
                                %error,
                                "failed to open video sink"
                            );
                            continue;
                        }
                    }
                }
            };

            let mut flushed = 0usize;
            while let Some(frame) = cache.get_after(writer.last_flushed) {
                // Advance first so a failed write can never repeat a frame.
                writer.last_flushed = Some(frame.sequence);
                flushed += 1;
                if let Err(error) = writer.sink.append(&frame.data) {
                    warn!(client = %client.id(), %error, "failed to append frame");
                    break;
                }
            }

            if !cache.timed_out() {
                writer.draining = false;
            } else if writer.draining && flushed == 0 {
                self.close_feed(&client);
            } else {
                writer.draining = true;
            }
        }
    }

    /// The feed is over: release the sink and retire the client everywhere.
    fn close_feed(&mut self, client: &AuthenticatedClient) {
        if let Some(mut writer) = self.feeds.remove(&client.id()) {
            if let Err(error) = writer.sink.finish() {
                warn!(client = %client.id(), %error, "failed to finish video sink");
            }
        }
        self.registry.remove(client);
        self.authenticator.evict(client.id());
        info!(
            client = %client.id(),
            identifier = client.identifier(),
            "feed drained and closed"
        );
    }

    fn close_all(&mut self) {
        for (client_id, writer) in self.feeds.iter_mut() {
            if let Err(error) = writer.sink.finish() {
                warn!(client = %client_id, %error, "failed to finish video sink");
            }
        }
        self.feeds.clear();
        debug!("storage flusher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lbase::token::TokenConfig;
    use lcache::CacheConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SinkLog {
        frames: Vec<Vec<u8>>,
        finished: bool,
    }

    struct MemorySink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl VideoSink for MemorySink {
        fn append(&mut self, frame: &[u8]) -> io::Result<()> {
            self.log.lock().unwrap().frames.push(frame.to_vec());
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().finished = true;
            Ok(())
        }
    }

    struct Rig {
        authenticator: Arc<Authenticator>,
        registry: Arc<FeedRegistry>,
        flusher: StorageFlusher,
        log: Arc<Mutex<SinkLog>>,
    }

    fn rig(cache_config: CacheConfig) -> Rig {
        let authenticator = Arc::new(Authenticator::new(TokenConfig::default(), None));
        let registry = Arc::new(FeedRegistry::new(cache_config));
        let log = Arc::new(Mutex::new(SinkLog::default()));

        let sink_log = log.clone();
        let flusher = StorageFlusher::with_sink_factory(
            Duration::from_millis(10),
            authenticator.clone(),
            registry.clone(),
            Box::new(move |_| {
                Ok(Box::new(MemorySink {
                    log: sink_log.clone(),
                }) as Box<dyn VideoSink>)
            }),
        );

        Rig {
            authenticator,
            registry,
            flusher,
            log,
        }
    }

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    #[test]
    fn flushes_new_frames_once_in_order() {
        let mut rig = rig(CacheConfig::default());
        let client = rig
            .authenticator
            .register([127, 0, 0, 1].into(), "TEST_STREAM")
            .unwrap();
        let cache = rig.registry.get_or_create(&client);

        for sequence in 0..3u64 {
            cache.submit_fragment(sequence, 1, 0, jpeg(sequence as u8));
        }
        rig.flusher.flush_all();
        rig.flusher.flush_all();

        let log = rig.log.lock().unwrap();
        assert_eq!(log.frames.len(), 3);
        assert_eq!(log.frames[0][2], 0);
        assert_eq!(log.frames[2][2], 2);
    }

    #[test]
    fn frames_arriving_between_passes_are_picked_up() {
        let mut rig = rig(CacheConfig::default());
        let client = rig
            .authenticator
            .register([127, 0, 0, 1].into(), "TEST_STREAM")
            .unwrap();
        let cache = rig.registry.get_or_create(&client);

        cache.submit_fragment(0, 1, 0, jpeg(0));
        rig.flusher.flush_all();
        cache.submit_fragment(1, 1, 0, jpeg(1));
        rig.flusher.flush_all();

        assert_eq!(rig.log.lock().unwrap().frames.len(), 2);
    }

    #[test]
    fn timed_out_feed_is_drained_then_retired() {
        let mut rig = rig(CacheConfig {
            liveness_window: Duration::from_millis(20),
            ..CacheConfig::default()
        });
        let client = rig
            .authenticator
            .register([127, 0, 0, 1].into(), "TEST_STREAM")
            .unwrap();
        let cache = rig.registry.get_or_create(&client);

        cache.submit_fragment(0, 1, 0, jpeg(0));
        cache.submit_fragment(1, 1, 0, jpeg(1));
        thread::sleep(Duration::from_millis(40));

        // Pass 1 drains the leftovers, pass 2 finds nothing and closes.
        rig.flusher.flush_all();
        rig.flusher.flush_all();

        let log = rig.log.lock().unwrap();
        assert_eq!(log.frames.len(), 2);
        assert!(log.finished);
        drop(log);

        assert!(rig.registry.is_empty());
        assert!(rig
            .authenticator
            .resolve(client.token().as_str())
            .is_err());
    }

    #[test]
    fn live_feed_is_never_closed() {
        let mut rig = rig(CacheConfig::default());
        let client = rig
            .authenticator
            .register([127, 0, 0, 1].into(), "TEST_STREAM")
            .unwrap();
        let cache = rig.registry.get_or_create(&client);

        cache.submit_fragment(0, 1, 0, jpeg(0));
        for _ in 0..5 {
            rig.flusher.flush_all();
        }

        assert!(!rig.log.lock().unwrap().finished);
        assert_eq!(rig.registry.len(), 1);
    }

    #[test]
    fn file_sink_names_carry_identifier_and_stamp() {
        let dir = std::env::temp_dir().join(format!("lampyre_storage_{}", std::process::id()));
        let mut sink = MjpegFileSink::create(&dir, "TEST_STREAM").unwrap();
        sink.append(&jpeg(7)).unwrap();
        sink.finish().unwrap();

        let name = sink.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("TEST_STREAM_"));
        assert!(name.ends_with(".mjpeg"));
        assert_eq!(std::fs::read(sink.path()).unwrap(), jpeg(7).to_vec());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
