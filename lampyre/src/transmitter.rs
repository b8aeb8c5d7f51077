//! Transmitter-side client: handshake once, then fragment and send frames.
//!
//! The daemon's tools and tests speak the same wire formats as a real
//! mobile transmitter, so this client is the reference for both.

use std::{io, net::IpAddr, net::SocketAddr};

use lbase::wire::{FeedDatagram, HandshakeReply, HandshakeRequest, WireError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("control channel i/o failed")]
    Io(#[from] io::Error),
    #[error("handshake reply could not be decoded")]
    Wire(#[from] WireError),
    #[error("server closed the control channel without a reply")]
    Rejected,
}

/// An authenticated frame sender for one feed.
pub struct FeedTransmitter {
    identifier: String,
    token: String,
    ingest_addr: SocketAddr,
    socket: UdpSocket,
    next_sequence: u64,
    fragment_size: usize,
}

impl FeedTransmitter {
    /// Fragment payload size: leaves comfortable headroom under a ~4 KiB
    /// path MTU once the datagram header fields are added.
    pub const DEFAULT_FRAGMENT_SIZE: usize = 3000;

    /// Handshake with the control server and bind a datagram socket aimed
    /// at the ingest endpoint the server advertised.
    pub async fn handshake(
        control_addr: SocketAddr,
        identifier: &str,
    ) -> Result<Self, TransmitError> {
        let mut stream = TcpStream::connect(control_addr).await?;
        let request = HandshakeRequest {
            identifier: identifier.to_string(),
        };
        stream.write_all(&request.encode()).await?;

        let mut buf = [0u8; 128];
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Err(TransmitError::Rejected);
        }
        let reply = HandshakeReply::decode(&buf[..read])?;

        let mut ingest_ip: IpAddr = reply
            .ingest_host
            .parse()
            .map_err(|_| WireError::Malformed("ingest host"))?;
        // A daemon bound to the wildcard address advertises it verbatim;
        // aim datagrams at the host we just handshook with instead.
        if ingest_ip.is_unspecified() {
            ingest_ip = control_addr.ip();
        }
        let ingest_addr = SocketAddr::new(ingest_ip, reply.ingest_port);

        let bind_addr: SocketAddr = if ingest_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        debug!(identifier, %ingest_addr, "transmitter authenticated");
        Ok(Self {
            identifier: identifier.to_string(),
            token: reply.token,
            ingest_addr,
            socket,
            next_sequence: 0,
            fragment_size: Self::DEFAULT_FRAGMENT_SIZE,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn set_fragment_size(&mut self, fragment_size: usize) {
        self.fragment_size = fragment_size.max(1);
    }

    /// Send one frame, fragmented; returns the sequence number it went out
    /// under. Delivery is fire-and-forget, like the transport underneath.
    pub async fn send_frame(&mut self, frame: &[u8]) -> io::Result<u64> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let chunks: Vec<&[u8]> = if frame.is_empty() {
            vec![&[]]
        } else {
            frame.chunks(self.fragment_size).collect()
        };

        let total = chunks.len() as u32;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let datagram = FeedDatagram {
                token: self.token.clone(),
                sequence,
                total_fragments: total,
                fragment_index: index as u32,
                payload: bytes::Bytes::copy_from_slice(chunk),
            };
            self.socket
                .send_to(&datagram.encode(), self.ingest_addr)
                .await?;
        }
        Ok(sequence)
    }
}
