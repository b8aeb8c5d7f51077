//! The control server: a stream listener that performs the authentication
//! handshake, one short-lived connection per handshake.

use std::{collections::HashSet, io, net::IpAddr, net::SocketAddr, sync::Arc};

use lbase::{
    Authenticator,
    wire::{HandshakeReply, HandshakeRequest, WireError},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, warn};

/// A handshake request is an opcode plus a short identifier; anything
/// longer is not a handshake.
const MAX_REQUEST_LEN: usize = 128;

/// Accepts handshakes from whitelisted transmitters and hands out tokens.
///
/// The source-address check happens before the first read: a peer outside
/// the whitelist has its connection closed without a byte in either
/// direction. Each accepted connection is served by its own task; a
/// handshake is one read, one write, close.
pub struct ControlServer {
    listener: TcpListener,
    authenticator: Arc<Authenticator>,
    whitelist: Arc<HashSet<IpAddr>>,
    ingest_addr: SocketAddr,
}

impl ControlServer {
    /// Bind the control listener. `ingest_addr` is the datagram endpoint
    /// advertised to every successfully authenticated transmitter.
    pub async fn bind(
        addr: &str,
        authenticator: Arc<Authenticator>,
        whitelist: impl IntoIterator<Item = IpAddr>,
        ingest_addr: SocketAddr,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            authenticator,
            whitelist: Arc::new(whitelist.into_iter().collect()),
            ingest_addr,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            warn!(%error, "control accept failed");
                            continue;
                        }
                    };

                    if !self.whitelist.contains(&peer.ip()) {
                        debug!(%peer, "rejected handshake from unlisted address");
                        continue;
                    }

                    let authenticator = self.authenticator.clone();
                    let ingest_addr = self.ingest_addr;
                    tokio::spawn(async move {
                        serve_handshake(stream, peer, authenticator, ingest_addr).await;
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("control server stopped");
    }
}

async fn serve_handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    authenticator: Arc<Authenticator>,
    ingest_addr: SocketAddr,
) {
    let mut buf = [0u8; MAX_REQUEST_LEN];
    let read = match stream.read(&mut buf).await {
        Ok(0) => return,
        Ok(read) => read,
        Err(error) => {
            debug!(%peer, %error, "handshake read failed");
            return;
        }
    };

    let request = match HandshakeRequest::decode(&buf[..read]) {
        Ok(request) => request,
        Err(WireError::UnknownOpcode(opcode)) => {
            info!(%peer, ?opcode, "unknown control request");
            return;
        }
        Err(error) => {
            info!(%peer, %error, "malformed handshake");
            return;
        }
    };

    // Close without a response on failure; the transmitter will retry.
    let client = match authenticator.register(peer.ip(), &request.identifier) {
        Ok(client) => client,
        Err(error) => {
            warn!(%peer, identifier = request.identifier, %error, "registration failed");
            return;
        }
    };

    let reply = HandshakeReply {
        token: client.token().as_str().to_string(),
        ingest_host: ingest_addr.ip().to_string(),
        ingest_port: ingest_addr.port(),
    };
    if let Err(error) = stream.write_all(&reply.encode()).await {
        debug!(%peer, %error, "handshake reply write failed");
        return;
    }

    info!(
        %peer,
        identifier = request.identifier,
        id = %client.id(),
        "handshake complete"
    );
}
