//! The ingest server: the datagram listener frames arrive on.
//!
//! Ingest is lossy by design and never answers. A malformed datagram or an
//! unknown token is dropped without a response; answering would hand an
//! attacker an amplification primitive, and the transmitter could not act
//! on an error anyway.

use std::{io, net::SocketAddr, net::ToSocketAddrs, sync::Arc};

use lbase::{Authenticator, wire::FeedDatagram, wire::MAX_DATAGRAM_LEN};
use lcache::{FeedRegistry, SubmitOutcome};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::watch, task::JoinSet};
use tracing::{debug, trace, warn};

/// Kernel receive buffer on the ingest socket. Frames burst at MTU-sized
/// datagrams; a generous buffer rides out scheduling hiccups.
const RECV_BUFFER_SIZE: usize = 1 << 20;

/// Receives frame datagrams and routes them into per-feed caches.
///
/// A fixed pool of worker tasks shares the socket, so datagrams from one
/// transmitter may be handled on any worker in any order; reassembly order
/// is the cache's problem, not the socket's.
pub struct IngestServer {
    socket: Arc<UdpSocket>,
    authenticator: Arc<Authenticator>,
    registry: Arc<FeedRegistry>,
    workers: usize,
}

impl IngestServer {
    pub fn bind(
        addr: &str,
        authenticator: Arc<Authenticator>,
        registry: Arc<FeedRegistry>,
        workers: usize,
    ) -> io::Result<Self> {
        let addr = resolve(addr)?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket: Arc::new(socket),
            authenticator,
            registry,
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let socket = self.socket.clone();
            let authenticator = self.authenticator.clone();
            let registry = self.registry.clone();
            let shutdown = shutdown.clone();
            pool.spawn(receive_loop(worker, socket, authenticator, registry, shutdown));
        }

        while pool.join_next().await.is_some() {}
        debug!("ingest server stopped");
    }
}

async fn receive_loop(
    worker: usize,
    socket: Arc<UdpSocket>,
    authenticator: Arc<Authenticator>,
    registry: Arc<FeedRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    // One spare byte so a datagram over the limit is detectable rather than
    // silently truncated into something that might still parse.
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        handle_datagram(&buf[..len], peer, &authenticator, &registry);
                    }
                    Err(error) => {
                        warn!(worker, %error, "ingest receive failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    trace!(worker, "ingest worker stopped");
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    authenticator: &Authenticator,
    registry: &FeedRegistry,
) {
    let datagram = match FeedDatagram::decode(datagram) {
        Ok(datagram) => datagram,
        Err(error) => {
            trace!(%peer, %error, "dropped malformed datagram");
            return;
        }
    };

    let client = match authenticator.resolve(&datagram.token) {
        Ok(client) => client,
        Err(_) => {
            debug!(%peer, "dropped datagram with unknown token");
            return;
        }
    };

    let cache = registry.get_or_create(&client);
    let outcome = cache.submit_fragment(
        datagram.sequence,
        datagram.total_fragments,
        datagram.fragment_index,
        datagram.payload,
    );
    if outcome == SubmitOutcome::Completed {
        client.mark_frame();
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} resolved to no address"),
        )
    })
}
