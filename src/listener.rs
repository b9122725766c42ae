//! TCP listener that gates every accepted socket through admission.
//!
//! Rejected sockets are closed before any bytes are read. Admitted sockets
//! are held open in their own task until the peer disconnects, at which point
//! the permit is dropped and the slot returns to the register. Forwarding to
//! the database is not this module's job.

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::error::{GateError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Listener that accepts connections and applies admission control.
///
/// # Example
///
/// ```no_run
/// use dbfw_admission::admission::AdmissionController;
/// use dbfw_admission::config::ConnectionConfig;
/// use dbfw_admission::listener::Listener;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let controller = AdmissionController::from_config(&ConnectionConfig::default(), None);
///     let listener = Listener::bind("127.0.0.1:5433", Arc::new(controller)).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener {
    tcp_listener: TcpListener,
    controller: Arc<AdmissionController>,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `GateError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(controller))]
    pub async fn bind(addr: &str, controller: Arc<AdmissionController>) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GateError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| GateError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            controller,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the admission controller.
    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Serves incoming connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            match self.controller.try_admit(peer_addr.ip()) {
                                Ok(permit) => {
                                    tokio::spawn(Self::hold_connection(stream, peer_addr, permit));
                                }
                                Err(reason) => {
                                    debug!("closing {} ({})", peer_addr, reason);
                                    drop(stream);
                                }
                            }
                        }
                        Err(e) => {
                            warn!("{}", GateError::AcceptConnection(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Keeps an admitted connection open until the peer closes it.
    async fn hold_connection(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        permit: AdmissionPermit,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("connection error from {}: {}", peer_addr, e);
                    break;
                }
            }
        }

        debug!("connection from {} closed", peer_addr);
        drop(permit);
    }
}
