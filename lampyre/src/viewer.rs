//! The viewer server: an HTTP front that republishes each feed as a
//! `multipart/x-mixed-replace` MJPEG stream.
//!
//! Every accepted viewer is pumped by its own worker task drawing on a
//! bounded permit pool, so a slow client stalls only its own stream; when
//! the pool is exhausted new viewers are turned away with `503` instead of
//! queueing behind it.

use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration, time::Instant};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::{Bytes, BytesMut};
use lcache::{FeedRegistry, FrameCache};
use tokio::{
    net::TcpListener,
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch},
};
use tracing::{debug, info};

/// A viewer that has seen no frame for this long is cut loose.
const VIEWER_STALL: Duration = Duration::from_secs(10);

/// Poll-loop sleep bounds. The framerate estimate is always positive, but a
/// wild estimate must not turn the loop into a busy spin or a coma.
const MIN_FRAME_DELAY: Duration = Duration::from_millis(1);
const MAX_FRAME_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct ViewerState {
    registry: Arc<FeedRegistry>,
    permits: Arc<Semaphore>,
    /// Streams are unbounded; each pump watches this so daemon shutdown is
    /// not held hostage by connected viewers.
    shutdown: watch::Receiver<bool>,
}

/// Serves the stream index and the per-feed MJPEG endpoint.
pub struct ViewerServer {
    listener: TcpListener,
    registry: Arc<FeedRegistry>,
    pool_size: usize,
}

impl ViewerServer {
    pub async fn bind(
        addr: &str,
        registry: Arc<FeedRegistry>,
        pool_size: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            pool_size: pool_size.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let state = ViewerState {
            registry: self.registry,
            permits: Arc::new(Semaphore::new(self.pool_size)),
            shutdown: shutdown.clone(),
        };
        let app = Router::new()
            .route("/", get(index))
            .route("/feed/{identifier}", get(stream_feed))
            .with_state(state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    }
}

/// `GET /` — the currently available feed identifiers, one per line.
async fn index(State(state): State<ViewerState>) -> String {
    let mut listing = state.registry.identifiers().join("\n");
    if !listing.is_empty() {
        listing.push('\n');
    }
    listing
}

/// `GET /feed/{identifier}` — the MJPEG stream of one feed.
async fn stream_feed(
    Path(identifier): Path<String>,
    State(state): State<ViewerState>,
) -> Response {
    let cache = match state.registry.lookup_identifier(&identifier) {
        Ok(cache) => cache,
        Err(error) => {
            debug!(identifier, "viewer asked for unknown feed");
            return (StatusCode::BAD_REQUEST, format!("{error}\n")).into_response();
        }
    };

    let permit = match state.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            info!(identifier, "viewer pool exhausted, turning viewer away");
            return (StatusCode::SERVICE_UNAVAILABLE, "viewer pool exhausted\n").into_response();
        }
    };

    info!(identifier, client = %cache.client_id(), "viewer attached");

    // The worker owns the poll loop and the permit; the response body only
    // relays what the worker sends. Dropping the body (client gone) closes
    // the channel, which stops the worker before its next cache read.
    let (tx, mut rx) = mpsc::channel::<Bytes>(4);
    tokio::spawn(stream_frames(cache, tx, permit, state.shutdown.clone()));

    let body = Body::from_stream(async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, Infallible>(chunk);
        }
    });

    (
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
        .into_response()
}

/// Per-viewer pump: sleep one frame period, deliver whatever is newer than
/// the last frame this viewer saw, stop when the feed dies, the viewer
/// stalls out, the viewer disconnects, or the daemon shuts down.
async fn stream_frames(
    cache: Arc<FrameCache>,
    tx: mpsc::Sender<Bytes>,
    permit: OwnedSemaphorePermit,
    shutdown: watch::Receiver<bool>,
) {
    let _permit = permit;
    let mut last_sequence: Option<u64> = None;
    let mut last_progress = Instant::now();

    loop {
        let delay = Duration::from_secs_f64(1.0 / cache.framerate())
            .clamp(MIN_FRAME_DELAY, MAX_FRAME_DELAY);
        tokio::time::sleep(delay).await;

        if *shutdown.borrow() {
            break;
        }
        if cache.timed_out() {
            debug!(client = %cache.client_id(), "feed timed out, ending stream");
            break;
        }

        match cache.get_after(last_sequence) {
            Some(frame) => {
                if tx.send(mjpeg_part(&frame.data)).await.is_err() {
                    debug!(client = %cache.client_id(), "viewer disconnected");
                    break;
                }
                last_sequence = Some(frame.sequence);
                last_progress = Instant::now();
            }
            None => {
                if last_progress.elapsed() > VIEWER_STALL {
                    debug!(client = %cache.client_id(), "viewer made no progress, ending stream");
                    break;
                }
            }
        }
    }
}

/// One multipart body part wrapping one JPEG frame.
fn mjpeg_part(frame: &Bytes) -> Bytes {
    let mut part = BytesMut::with_capacity(frame.len() + 48);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}
