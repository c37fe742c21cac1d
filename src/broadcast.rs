//! Outbound delivery to peers.
//!
//! Every peer send opens its own connection, writes one frame and closes.
//! A broadcast fans out one task per peer so a dead or slow peer costs at
//! most one connect/write timeout and never delays the others.  Failed
//! sends are not retried; the peer is reported to the coordinator monitor,
//! which decides whether it is really gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::errors::ProtocolError;
use crate::member::Member;
use crate::metrics;
use crate::monitor::Suspicion;
use crate::protocol::{self, Envelope};

#[derive(Clone)]
pub struct Broadcaster {
    connect_timeout: Duration,
    io_timeout: Duration,
    suspicions: mpsc::UnboundedSender<Suspicion>,
}

/// Handle to a running broadcast.  Dropping it lets the sends finish in
/// the background.
pub struct BroadcastHandle {
    task: JoinHandle<Vec<Member>>,
}

impl BroadcastHandle {
    /// Wait for every peer send and return the peers that failed.
    pub async fn finished(self) -> Vec<Member> {
        self.task.await.unwrap_or_else(|e| {
            warn!("broadcast task failed: {}", e);
            Vec::new()
        })
    }
}

impl Broadcaster {
    pub fn new(network: &NetworkConfig, suspicions: mpsc::UnboundedSender<Suspicion>) -> Self {
        Self {
            connect_timeout: network.connect_timeout(),
            io_timeout: network.io_timeout(),
            suspicions,
        }
    }

    /// Feed a suspected-dead member into the liveness pipeline.
    /// `forwarded` marks suspicions that arrived over the network.
    pub fn report_unreachable(&self, member: Member, forwarded: bool) {
        let _ = self.suspicions.send(Suspicion { member, forwarded });
    }

    async fn connect(&self, member: &Member) -> Result<TcpStream, ProtocolError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(member.socket_addr()))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::Timeout(self.connect_timeout.as_millis() as u64)),
        }
    }

    /// Open and immediately close a connection.  `true` means alive.
    pub async fn probe(&self, member: &Member) -> bool {
        match self.connect(member).await {
            Ok(_) => true,
            Err(e) => {
                debug!(member = %member, error = %e, "probe failed");
                false
            }
        }
    }

    async fn deliver(&self, member: &Member, frame: &[u8]) -> Result<(), ProtocolError> {
        let mut stream = self.connect(member).await?;
        protocol::write_frame(&mut stream, frame, self.io_timeout).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Send one envelope to one member.  Failures are returned, not
    /// reported.
    pub async fn send_to(&self, member: &Member, envelope: &Envelope) -> Result<(), ProtocolError> {
        let frame = protocol::encode(envelope)?;
        self.deliver(member, &frame).await
    }

    /// Send `envelope` to every member of `audience` concurrently.
    pub fn broadcast(
        &self,
        envelope: Envelope,
        audience: Vec<Member>,
    ) -> Result<BroadcastHandle, ProtocolError> {
        self.broadcast_batch(vec![envelope], audience)
    }

    /// Send several envelopes to every member of `audience`.  Each peer
    /// receives them in order, one connection per envelope; the first
    /// failure ends that peer's batch.
    pub fn broadcast_batch(
        &self,
        envelopes: Vec<Envelope>,
        audience: Vec<Member>,
    ) -> Result<BroadcastHandle, ProtocolError> {
        let frames: Arc<Vec<Vec<u8>>> = Arc::new(
            envelopes
                .iter()
                .map(protocol::encode)
                .collect::<Result<_, _>>()?,
        );
        let this = self.clone();

        let task = tokio::spawn(async move {
            let mut sends = JoinSet::new();
            for member in audience {
                let this = this.clone();
                let frames = frames.clone();
                sends.spawn(async move {
                    for frame in frames.iter() {
                        if let Err(e) = this.deliver(&member, frame).await {
                            return (member, Err(e));
                        }
                    }
                    (member, Ok(()))
                });
            }

            let mut unreachable = Vec::new();
            while let Some(joined) = sends.join_next().await {
                match joined {
                    Ok((member, Ok(()))) => {
                        metrics::send_finished(true);
                        debug!(member = %member, "delivered");
                    }
                    Ok((member, Err(e))) => {
                        metrics::send_finished(false);
                        warn!(member = %member, error = %e, "member unreachable");
                        this.report_unreachable(member.clone(), false);
                        unreachable.push(member);
                    }
                    Err(e) => warn!("send task failed: {}", e),
                }
            }
            unreachable
        });

        Ok(BroadcastHandle { task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_envelope, Command, DEFAULT_MAX_FRAME_BYTES};
    use tokio::net::TcpListener;

    fn broadcaster() -> (Broadcaster, mpsc::UnboundedReceiver<Suspicion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let network = NetworkConfig {
            connect_timeout_ms: 300,
            io_timeout_ms: 300,
            ..NetworkConfig::default()
        };
        (Broadcaster::new(&network, tx), rx)
    }

    async fn live_peer(name: &str, id: i64) -> (Member, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (Member::with_id(name, id, "127.0.0.1", port), listener)
    }

    async fn dead_peer(name: &str, id: i64) -> Member {
        let (member, listener) = live_peer(name, id).await;
        drop(listener);
        member
    }

    async fn accept_envelope(listener: &TcpListener) -> Envelope {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_envelope(&mut stream, DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("expected a frame")
    }

    #[tokio::test]
    async fn test_probe_live_and_dead() {
        let (b, _rx) = broadcaster();
        let (alive, _listener) = live_peer("alive", 1).await;
        let dead = dead_peer("dead", 2).await;
        assert!(b.probe(&alive).await);
        assert!(!b.probe(&dead).await);
    }

    #[tokio::test]
    async fn test_broadcast_reports_only_dead_peer() {
        let (b, mut rx) = broadcaster();
        let (alive, listener) = live_peer("alive", 1).await;
        let dead = dead_peer("dead", 2).await;

        let env = Envelope::command(Command::RemoveMember(7));
        let handle = b.broadcast(env.clone(), vec![alive, dead.clone()]).unwrap();

        assert_eq!(accept_envelope(&listener).await, env);
        let unreachable = handle.finished().await;
        assert_eq!(unreachable, vec![dead.clone()]);

        let suspicion = rx.recv().await.unwrap();
        assert_eq!(suspicion.member, dead);
        assert!(!suspicion.forwarded);
    }

    #[tokio::test]
    async fn test_batch_arrives_in_order() {
        let (b, _rx) = broadcaster();
        let (peer, listener) = live_peer("peer", 1).await;

        let first = Envelope::command(Command::RemoveMember(0));
        let second = Envelope::command(Command::NewCoordinator(1));
        let handle = b
            .broadcast_batch(vec![first.clone(), second.clone()], vec![peer])
            .unwrap();

        assert_eq!(accept_envelope(&listener).await, first);
        assert_eq!(accept_envelope(&listener).await, second);
        assert!(handle.finished().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_audience_finishes() {
        let (b, _rx) = broadcaster();
        let handle = b
            .broadcast(Envelope::command(Command::RemoveMember(1)), Vec::new())
            .unwrap();
        assert!(handle.finished().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_dead_peer_is_error_without_report() {
        let (b, mut rx) = broadcaster();
        let dead = dead_peer("dead", 3).await;
        let err = b
            .send_to(&dead, &Envelope::command(Command::Unreachable(3)))
            .await;
        assert!(err.is_err());
        assert!(rx.try_recv().is_err());
    }
}
