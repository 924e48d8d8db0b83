//! TCP server that dispatches framed requests to registered services.
//!
//! Each accepted connection is served by its own task, which handles one
//! request at a time: receive, dispatch, send. Dispatch failures are answered
//! like any other response. Only a codec failure ends the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::codec::{Codec, CodecFactory, JsonCodecFactory};
use super::registry::{Registry, Service};
use crate::error::{Error, Result};

/// RPC server bound to one address.
pub struct Server<F: CodecFactory = JsonCodecFactory> {
    addr: String,
    registry: Arc<Registry<F::Codec>>,
    codec_factory: Arc<F>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server<JsonCodecFactory> {
    /// Create a server speaking the JSON codec.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_codec(addr, JsonCodecFactory)
    }
}

impl<F: CodecFactory> Server<F> {
    /// Create a server that builds its codecs with `codec_factory`.
    pub fn with_codec(addr: impl Into<String>, codec_factory: F) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            registry: Arc::new(Registry::new()),
            codec_factory: Arc::new(codec_factory),
            shutdown_tx,
        }
    }

    /// Register a service. Allowed while serving; only later requests see it.
    pub async fn register<S: Service>(&self, receiver: S) -> Result<String> {
        self.registry.register(receiver).await
    }

    pub fn registry(&self) -> &Arc<Registry<F::Codec>> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve_on(listener).await
    }

    /// Serve connections accepted from `listener`.
    ///
    /// Returns `Ok` after [`shutdown`](Self::shutdown) and the accept error
    /// if accepting fails.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "RPC server listening");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, peer_addr) = accept_result.map_err(|e| {
                        error!(error = %e, "Failed to accept connection");
                        Error::Io(e)
                    })?;
                    debug!(peer = %peer_addr, "Client connected");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let codec = self.codec_factory.build(stream);
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(codec, peer_addr, registry).await {
                            debug!(peer = %peer_addr, error = %e, "Connection error");
                        }
                        debug!(peer = %peer_addr, "Client disconnected");
                    });
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("RPC server shutting down");
        Ok(())
    }

    /// Signal the accept loop to stop. Open connections are left to finish.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Serve one connection until the peer leaves or the codec fails.
async fn handle_connection<C: Codec>(
    mut codec: C,
    peer_addr: SocketAddr,
    registry: Arc<Registry<C>>,
) -> Result<()> {
    let result = serve_requests(&mut codec, peer_addr, &registry).await;
    if let Err(e) = codec.shutdown().await {
        debug!(peer = %peer_addr, error = %e, "Failed to close stream");
    }
    result
}

async fn serve_requests<C: Codec>(
    codec: &mut C,
    peer_addr: SocketAddr,
    registry: &Registry<C>,
) -> Result<()> {
    loop {
        let request = match codec.recv().await {
            Ok(request) => request,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        debug!(peer = %peer_addr, method = %request.method, "Request received");
        let response = registry.dispatch(&request.method, request.content).await;
        codec.send(&response).await?;
    }
}
