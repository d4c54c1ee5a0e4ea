//! Main network handler

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::Result;

use super::connection_pool::ConnectionPool;
use super::upgrade::Upgrader;

/// Accepts connections and routes every request to the upgrade handshake
pub struct NetworkHandler {
    config: Arc<Config>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a new network handler
    #[must_use]
    pub fn new(config: Config) -> Self {
        let connection_pool = ConnectionPool::new(config.limits.max_connections);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: Arc::new(config),
            connection_pool,
            shutdown_tx,
        }
    }

    /// Sender that stops the accept loop when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Pool tracking live relay connections
    #[must_use]
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    /// Bind the configured listener
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(self) -> Result<BoundHandler> {
        let listener = TcpListener::bind(self.config.server.socket_addr()).await?;
        Ok(BoundHandler {
            handler: self,
            listener,
        })
    }

    /// Bind and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run().await
    }
}

/// Network handler with a bound listener
pub struct BoundHandler {
    handler: NetworkHandler,
    listener: TcpListener,
}

impl BoundHandler {
    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until Ctrl-C or a shutdown signal
    ///
    /// Stops accepting new connections; connections already relaying keep
    /// running until their own loops exit.
    ///
    /// # Errors
    ///
    /// Returns error if the local address cannot be read
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let upgrader = Arc::new(Upgrader::new(
            &self.handler.config,
            self.handler.connection_pool.clone(),
        ));

        info!(
            "Listening on {} (max {} connections)",
            addr,
            self.handler.connection_pool.max_connections()
        );

        let mut shutdown_rx = self.handler.shutdown_tx.subscribe();
        let shutdown_signal = async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
            }
        };
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                () = &mut shutdown_signal => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let upgrader = Arc::clone(&upgrader);
                            tokio::spawn(serve_connection(stream, peer_addr, upgrader));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        info!(
            "Listener {} closed ({} connections still active)",
            addr,
            self.handler.connection_pool.active_connections()
        );
        Ok(())
    }
}

/// Serve one TCP connection as HTTP/1.1 with upgrades enabled
async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, upgrader: Arc<Upgrader>) {
    debug!("Accepted TCP connection from {}", peer_addr);

    let service = service_fn(move |request: Request<Incoming>| {
        let upgrader = Arc::clone(&upgrader);
        async move { Ok::<_, Infallible>(upgrader.upgrade(request)) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("HTTP connection from {} ended: {}", peer_addr, e);
    }
}
