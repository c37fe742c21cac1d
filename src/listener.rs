//! Inbound connection listener.
//!
//! One accept loop per process.  Every accepted connection gets one frame
//! decoded and handed to a [`ConnectionHandler`] on its own task.  At most
//! `max_connections` handlers run at once; connections beyond that are
//! closed immediately instead of queueing.  Decode failures are logged and
//! the connection dropped, the loop itself never stops on a bad peer.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::errors::GroupError;
use crate::metrics;
use crate::protocol::{self, Envelope};

/// Receives each decoded envelope together with its connection, so join
/// requests can reply on the same stream.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        envelope: Envelope,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    max_connections: usize,
    max_frame_bytes: usize,
    io_timeout: Duration,
}

impl Listener {
    /// Bind `addr`.  Any bind failure is reported as `PortUnavailable`.
    pub async fn bind(addr: &str, network: &NetworkConfig) -> Result<Self, GroupError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| GroupError::port_unavailable(addr, e))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| GroupError::port_unavailable(addr, e))?;
        info!("listening on {}", local_addr);

        Ok(Self {
            inner,
            local_addr,
            max_connections: network.max_connections.max(1),
            max_frame_bytes: network.max_frame_bytes,
            io_timeout: network.io_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` flips or its sender goes away, then close
    /// the socket.  Handlers already running are left to finish.
    pub async fn serve(
        self,
        handler: Arc<dyn ConnectionHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.max_connections));

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = self.inner.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!("accept failed: {}", e);
                                continue;
                            }
                        };

                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            metrics::connection_rejected();
                            warn!(peer = %peer, "connection limit reached, refusing");
                            continue;
                        };

                        let handler = handler.clone();
                        let max_frame_bytes = self.max_frame_bytes;
                        let io_timeout = self.io_timeout;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, handler, max_frame_bytes, io_timeout).await;
                            drop(permit);
                        });
                    }
                }
            }
        }

        info!("listener on {} stopped", self.local_addr);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
    max_frame_bytes: usize,
    io_timeout: Duration,
) {
    match protocol::read_envelope(&mut stream, max_frame_bytes, io_timeout).await {
        Ok(None) => trace!(peer = %peer, "probe"),
        Ok(Some(envelope)) => {
            metrics::frame_received(envelope.kind());
            debug!(peer = %peer, kind = envelope.kind(), "frame received");
            if let Err(e) = handler.handle(envelope, stream, peer).await {
                warn!(peer = %peer, error = %e, "handler failed");
            }
        }
        Err(e) => warn!(peer = %peer, error = %e, "dropping malformed connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, DEFAULT_MAX_FRAME_BYTES};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, Notify};

    struct Recording {
        seen: mpsc::UnboundedSender<Envelope>,
    }

    impl ConnectionHandler for Recording {
        fn handle(
            &self,
            envelope: Envelope,
            _stream: TcpStream,
            _peer: SocketAddr,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                let _ = self.seen.send(envelope);
                Ok(())
            })
        }
    }

    /// Holds every connection until released.
    struct Stalling {
        release: Arc<Notify>,
    }

    impl ConnectionHandler for Stalling {
        fn handle(
            &self,
            _envelope: Envelope,
            _stream: TcpStream,
            _peer: SocketAddr,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.release.notified().await;
                Ok(())
            })
        }
    }

    fn network(max_connections: usize) -> NetworkConfig {
        NetworkConfig {
            max_connections,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            ..NetworkConfig::default()
        }
    }

    async fn send(addr: SocketAddr, envelope: &Envelope) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        protocol::send_envelope(&mut stream, envelope, Duration::from_secs(1))
            .await
            .unwrap();
    }

    async fn start(
        handler: Arc<dyn ConnectionHandler>,
        max_connections: usize,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let listener = Listener::bind("127.0.0.1:0", &network(max_connections))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(listener.serve(handler, rx));
        (addr, tx, task)
    }

    #[tokio::test]
    async fn test_bind_taken_port_is_port_unavailable() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = Listener::bind(&addr, &network(4)).await.err().unwrap();
        assert_eq!(err.code(), "PortUnavailable");
    }

    #[tokio::test]
    async fn test_survives_probe_and_garbage() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (addr, _shutdown, _task) = start(Arc::new(Recording { seen: tx }), 8).await;

        // Probe: connect and close.
        drop(TcpStream::connect(addr).await.unwrap());

        // Garbage body.
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&5u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"junk!").await.unwrap();
        drop(raw);

        let env = Envelope::command(Command::RemoveMember(2));
        send(addr, &env).await;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, env);
    }

    #[tokio::test]
    async fn test_shutdown_closes_socket() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (addr, shutdown, task) = start(Arc::new(Recording { seen: tx }), 8).await;

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_refuses_beyond_capacity() {
        let release = Arc::new(Notify::new());
        let handler = Arc::new(Stalling {
            release: release.clone(),
        });
        let (addr, _shutdown, _task) = start(handler, 1).await;

        // Occupies the only slot.
        let env = Envelope::command(Command::Unreachable(1));
        send(addr, &env).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Refused: the listener closes it without reading.
        let mut extra = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), extra.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        release.notify_waiters();
    }
}
