//! Wires the servers, the flusher and the shared state together.

use std::{io, net::SocketAddr, sync::Arc};

use lbase::{Authenticator, Config};
use lcache::{CacheConfig, FeedRegistry};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    control::ControlServer,
    ingest::IngestServer,
    storage::StorageFlusher,
    viewer::ViewerServer,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to bind {what} on {addr}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start the storage flusher")]
    Flusher(#[source] io::Error),
}

/// The whole daemon, bound but not yet serving.
///
/// Binding and serving are separate steps so a caller knows every listener's
/// real address (ports may be configured as 0) before traffic starts.
pub struct Daemon {
    control: ControlServer,
    ingest: IngestServer,
    viewer: ViewerServer,
    flusher: StorageFlusher,
    control_addr: SocketAddr,
    ingest_addr: SocketAddr,
    viewer_addr: SocketAddr,
}

impl Daemon {
    pub async fn bind(config: Config) -> Result<Self, DaemonError> {
        if config.control.whitelist.is_empty() {
            warn!("control whitelist is empty; no transmitter can authenticate");
        }

        let authenticator = Arc::new(Authenticator::new(
            config.control.token.clone(),
            config.control.token_ttl(),
        ));
        let registry = Arc::new(FeedRegistry::new(CacheConfig {
            capacity: config.ingest.cache_size,
            max_pending: config.ingest.max_pending_frames,
            liveness_window: config.ingest.liveness_window(),
            initial_framerate: config.ingest.initial_framerate,
        }));

        let ingest = IngestServer::bind(
            &config.ingest.bind_addr(),
            authenticator.clone(),
            registry.clone(),
            config.ingest.workers,
        )
        .map_err(|source| DaemonError::Bind {
            what: "ingest listener",
            addr: config.ingest.bind_addr(),
            source,
        })?;
        let ingest_addr = ingest.local_addr().map_err(|source| DaemonError::Bind {
            what: "ingest listener",
            addr: config.ingest.bind_addr(),
            source,
        })?;

        let control = ControlServer::bind(
            &config.control.bind_addr(),
            authenticator.clone(),
            config.control.whitelist.iter().copied(),
            ingest_addr,
        )
        .await
        .map_err(|source| DaemonError::Bind {
            what: "control listener",
            addr: config.control.bind_addr(),
            source,
        })?;
        let control_addr = control.local_addr().map_err(|source| DaemonError::Bind {
            what: "control listener",
            addr: config.control.bind_addr(),
            source,
        })?;

        let viewer = ViewerServer::bind(
            &config.viewer.bind_addr(),
            registry.clone(),
            config.viewer.pool_size,
        )
        .await
        .map_err(|source| DaemonError::Bind {
            what: "viewer listener",
            addr: config.viewer.bind_addr(),
            source,
        })?;
        let viewer_addr = viewer.local_addr().map_err(|source| DaemonError::Bind {
            what: "viewer listener",
            addr: config.viewer.bind_addr(),
            source,
        })?;

        let flusher = StorageFlusher::new(&config.storage, authenticator, registry);

        info!(%control_addr, %ingest_addr, %viewer_addr, "lampyre bound");
        Ok(Self {
            control,
            ingest,
            viewer,
            flusher,
            control_addr,
            ingest_addr,
            viewer_addr,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn viewer_addr(&self) -> SocketAddr {
        self.viewer_addr
    }

    /// Serve until `shutdown` fires (or its sender is dropped).
    ///
    /// All listeners stop accepting, in-flight handshakes finish, and the
    /// flusher runs one last pass and closes its sinks before this returns.
    /// A server exiting on its own is treated as fatal and pulls the other
    /// servers down with it.
    pub async fn serve(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DaemonError> {
        let flusher = self.flusher.spawn().map_err(DaemonError::Flusher)?;

        let (signal, servers_shutdown) = watch::channel(false);
        let signal = Arc::new(signal);

        let mut servers = JoinSet::new();
        {
            let control = self.control;
            let rx = servers_shutdown.clone();
            servers.spawn(async move { control.run(rx).await });
        }
        {
            let ingest = self.ingest;
            let rx = servers_shutdown.clone();
            servers.spawn(async move { ingest.run(rx).await });
        }
        {
            let viewer = self.viewer;
            let rx = servers_shutdown;
            servers.spawn(async move {
                if let Err(error) = viewer.run(rx).await {
                    error!(%error, "viewer server failed");
                }
            });
        }

        let forwarder = tokio::spawn({
            let signal = signal.clone();
            async move {
                let _ = shutdown.changed().await;
                let _ = signal.send(true);
            }
        });

        while servers.join_next().await.is_some() {
            if !*signal.borrow() {
                error!("server exited unexpectedly, shutting the daemon down");
                let _ = signal.send(true);
            }
        }
        forwarder.abort();

        let _ = tokio::task::spawn_blocking(move || flusher.stop()).await;
        info!("lampyre stopped");
        Ok(())
    }

    /// Serve until ctrl-c.
    pub async fn run(self) -> Result<(), DaemonError> {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(error) => error!(%error, "failed to listen for the shutdown signal"),
            }
            let _ = tx.send(true);
        });
        self.serve(rx).await
    }
}
