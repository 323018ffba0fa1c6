//! The server: TCP accept loop and per-connection wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::compression::CompressionRegistry;
use crate::error::{Result, RpcError};
use crate::handler::{RpcServiceHandler, ServiceRouter};
use crate::http2::connection;
use crate::http2::multiplexer::{ListenerFactory, StreamMultiplexer};
use crate::status::RpcCode;
use crate::triple::stream::server::ServerTransportListener;

/// Configures and starts a [`Server`].
pub struct ServerBuilder {
    address: String,
    services: Vec<RpcServiceHandler>,
    registry: CompressionRegistry,
    response_compression: Option<String>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            address: "0.0.0.0:50051".to_owned(),
            services: Vec::new(),
            registry: CompressionRegistry::new(),
            response_compression: None,
        }
    }

    /// Listen address, `host:port`. Use port `0` for an ephemeral port.
    pub fn bind(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Expose a service.
    pub fn register(mut self, service: RpcServiceHandler) -> Self {
        self.services.push(service);
        self
    }

    /// Replace the compression registry.
    pub fn compression_registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Compress every response with the named encoding.
    pub fn response_compression(mut self, encoding: impl Into<String>) -> Self {
        self.response_compression = Some(encoding.into());
        self
    }

    /// Bind the listener and start accepting connections.
    pub fn start(self) -> Result<Server> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("trirpc-server")
            .enable_all()
            .build()
            .map_err(|err| RpcError::new(RpcCode::Internal, err.to_string()))?;

        let listener = runtime
            .block_on(TcpListener::bind(&self.address))
            .map_err(|err| {
                RpcError::new(
                    RpcCode::Unavailable,
                    format!("failed to bind {}: {err}", self.address),
                )
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| RpcError::new(RpcCode::Internal, err.to_string()))?;

        let router = Arc::new(ServiceRouter::new(self.services));
        let registry = Arc::new(self.registry);
        let response_compression = self.response_compression;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = runtime.handle().clone();

        runtime.spawn(async move {
            tracing::info!(%local_addr, "server started");
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!(%peer, "accepted connection");
                            let router = router.clone();
                            let registry = registry.clone();
                            let conn_handle = handle.clone();
                            let response_compression = response_compression.clone();
                            let factory: ListenerFactory = Box::new(move || {
                                Box::new(ServerTransportListener::new(
                                    router.clone(),
                                    registry.clone(),
                                    conn_handle.clone(),
                                    response_compression.clone(),
                                ))
                            });
                            let multiplexer = StreamMultiplexer::server(factory);
                            connection::spawn(socket, multiplexer, false, handle.clone());
                        }
                        Err(err) => {
                            tracing::warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("server stopped accepting connections");
        });

        Ok(Server {
            runtime: Some(runtime),
            shutdown: shutdown_tx,
            local_addr,
        })
    }
}

/// A running Triple server.
pub struct Server {
    runtime: Option<Runtime>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The bound address, useful with ephemeral ports.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and shut down, waiting briefly for
    /// in-flight work.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = self.shutdown.send(true);
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
