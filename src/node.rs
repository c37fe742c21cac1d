//! Node runtime: wires the roster, listener, join manager, broadcaster
//! and coordinator monitor into one running group member.
//!
//! [`Node::start`] binds the listener, joins (or founds) a group and spawns
//! the background tasks.  The presentation layer talks to it through
//! [`Node::submit`] and the [`GroupEvent`] receiver returned at startup.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::admin;
use crate::broadcast::{BroadcastHandle, Broadcaster};
use crate::config::Config;
use crate::errors::GroupError;
use crate::event::{EventBus, GroupEvent};
use crate::join::{self, JoinApprover, JoinOutcome};
use crate::listener::{ConnectionHandler, Listener};
use crate::member::{validate_username, Member};
use crate::metrics;
use crate::monitor::{Monitor, Role, Suspicion};
use crate::protocol::{Command, Envelope, TextMessage};
use crate::roster::Roster;

/// State shared by every task of one node.
pub struct NodeContext {
    pub config: Config,
    pub roster: Roster,
    pub broadcaster: Broadcaster,
    pub events: EventBus,
    pub approver: Arc<dyn JoinApprover>,
    transcript: RwLock<Vec<TextMessage>>,
}

impl NodeContext {
    /// Build the shared state.  Also returns the receiving ends the
    /// monitor and the presentation layer consume.
    pub fn new(
        config: Config,
        me: Member,
        approver: Arc<dyn JoinApprover>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<Suspicion>,
        mpsc::UnboundedReceiver<GroupEvent>,
    ) {
        let (suspicion_tx, suspicion_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = EventBus::new();
        let broadcaster = Broadcaster::new(&config.network, suspicion_tx);
        let ctx = Arc::new(Self {
            roster: Roster::new(me),
            broadcaster,
            events,
            approver,
            transcript: RwLock::new(Vec::new()),
            config,
        });
        (ctx, suspicion_rx, event_rx)
    }

    pub fn role(&self) -> Role {
        let (me, others) = self.roster.view();
        Role::evaluate(&me, &others)
    }

    /// Every text message sent or received, oldest first.
    pub fn transcript(&self) -> Vec<TextMessage> {
        self.transcript.read().expect("rwlock poisoned").clone()
    }

    pub(crate) fn record(&self, message: TextMessage) {
        self.transcript
            .write()
            .expect("rwlock poisoned")
            .push(message);
    }

    /// Send `envelopes` in order to everyone currently in the roster.
    pub(crate) fn broadcast_to_roster(&self, envelopes: Vec<Envelope>) -> Option<BroadcastHandle> {
        match self
            .broadcaster
            .broadcast_batch(envelopes, self.roster.snapshot())
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not encode broadcast");
                None
            }
        }
    }

    /// Apply a membership command received from another member.
    pub fn apply_command(&self, command: Command) {
        let me = self.roster.me();
        debug!(command = command.name(), "applying command");
        match command {
            Command::NewMember(member) => {
                if self.roster.insert_announced(member.clone()) {
                    info!(member = %member, "member announced");
                    self.events.post(GroupEvent::MemberJoined(member));
                } else {
                    debug!(member = %member, "ignoring announcement of known member");
                }
            }
            Command::RemoveMember(id) if id == me.id => {
                warn!("ignoring removal of this node, still alive");
            }
            Command::RemoveMember(id) => {
                if let Some(member) = self.roster.remove(id) {
                    metrics::member_removed("announced");
                    info!(member = %member, "member removed");
                    self.events.post(GroupEvent::MemberLeft(member));
                }
            }
            Command::NewCoordinator(id) => {
                if self.roster.coordinator().is_some_and(|c| c.id == id) {
                    debug!(id, "coordinator already known");
                    return;
                }
                let Some(change) = self.roster.set_coordinator(id) else {
                    debug!(id, "ignoring coordinator announcement");
                    return;
                };
                for old in change.superseded {
                    metrics::member_removed("superseded");
                    info!(member = %old, "dropping superseded coordinator");
                    self.events.post(GroupEvent::MemberLeft(old));
                }
                info!(coordinator = %change.coordinator, "new coordinator");
                self.events
                    .post(GroupEvent::CoordinatorChanged(change.coordinator));
            }
            Command::Unreachable(id) => match self.roster.get(id) {
                Some(member) => self.broadcaster.report_unreachable(member, true),
                None => debug!(id, "unreachable report for unknown member"),
            },
        }
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        match envelope {
            Envelope::Join { member } => {
                join::handle_join_request(self, member, &mut stream).await?;
            }
            Envelope::Text(message) => {
                self.record(message.clone());
                self.events.post(GroupEvent::MessageReceived(message));
            }
            Envelope::Command { command } => self.apply_command(command),
            Envelope::Roster { .. } => {
                warn!(peer = %peer, "unsolicited roster, ignoring");
            }
        }
        Ok(())
    }
}

impl ConnectionHandler for NodeContext {
    fn handle(
        &self,
        envelope: Envelope,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(self.dispatch(envelope, stream, peer))
    }
}

/// A running group member.
pub struct Node {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Node {
    /// Bind, join or found a group, and start the background tasks.
    pub async fn start(
        config: Config,
        approver: Arc<dyn JoinApprover>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<GroupEvent>), GroupError> {
        validate_username(&config.node.username)?;

        let listener = Listener::bind(&config.node.bind_addr(), &config.network).await?;
        let local_addr = listener.local_addr();
        let me = Member::new(
            &config.node.username,
            &config.node.advertised_host(),
            local_addr.port(),
        )?;

        let (ctx, suspicions, events) = NodeContext::new(config.clone(), me.clone(), approver);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let handler: Arc<dyn ConnectionHandler> = ctx.clone();
        tasks.spawn(listener.serve(handler, shutdown_rx.clone()));

        let mut node = Node {
            ctx: ctx.clone(),
            local_addr,
            shutdown,
            tasks,
        };

        // Dropping `node` on error stops the listener.
        match join::request_join(config.group.join_target(), &me, &config.network).await? {
            JoinOutcome::Founded => {
                let me = ctx.roster.found();
                info!(me = %me, "founded new group");
                ctx.events
                    .notice(format!("Started a new group as {}.", me.username));
            }
            JoinOutcome::Joined {
                roster,
                assigned_id,
            } => {
                ctx.roster.assign_my_id(assigned_id);
                ctx.roster.install(roster);
                let me = ctx.roster.me();
                info!(me = %me, members = ctx.roster.len(), "joined group");
                ctx.events.notice(format!(
                    "Joined the group as {} with {} other member(s).",
                    me.username,
                    ctx.roster.len()
                ));
            }
        }

        if let Some(addr) = config.observability.admin_addr.as_deref() {
            let admin_listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| GroupError::port_unavailable(addr, e))?;
            info!("admin endpoint on {}", addr);
            node.tasks
                .spawn(admin::serve(admin_listener, ctx.clone(), shutdown_rx.clone()));
        }

        let monitor = Monitor::new(ctx.clone(), suspicions);
        node.tasks.spawn(monitor.run(shutdown_rx));

        Ok((node, events))
    }

    pub fn me(&self) -> Member {
        self.ctx.roster.me()
    }

    /// Every other member, in admission order.
    pub fn roster(&self) -> Vec<Member> {
        self.ctx.roster.snapshot()
    }

    pub fn role(&self) -> Role {
        self.ctx.role()
    }

    pub fn transcript(&self) -> Vec<TextMessage> {
        self.ctx.transcript()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Broadcast a user-authored message to the group.  Delivery happens
    /// in the background; the message is returned for local display.
    pub fn submit(&self, text: &str) -> Result<TextMessage, GroupError> {
        let me = self.ctx.roster.me();
        let message = TextMessage::chat(&me.username, text);
        self.ctx.broadcaster.broadcast(
            Envelope::Text(message.clone()),
            self.ctx.roster.snapshot(),
        )?;
        self.ctx.record(message.clone());
        Ok(message)
    }

    /// Announce departure, wait for the announcement to be delivered, then
    /// stop.
    pub async fn leave(self) {
        let me = self.ctx.roster.me();
        if me.is_assigned() {
            if let Some(handle) =
                self.ctx
                    .broadcast_to_roster(vec![Envelope::command(Command::RemoveMember(me.id))])
            {
                let missed = handle.finished().await;
                if !missed.is_empty() {
                    debug!(missed = missed.len(), "departure not delivered everywhere");
                }
            }
        }
        info!(me = %me, "left group");
        self.shutdown().await;
    }

    /// Stop the listener and monitor without telling anyone.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("node task failed: {}", e);
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::AutoApprove;

    fn peer(name: &str, id: i64) -> Member {
        Member::with_id(name, id, "127.0.0.1", 1)
    }

    fn context(
        name: &str,
        id: i64,
    ) -> (
        Arc<NodeContext>,
        mpsc::UnboundedReceiver<Suspicion>,
        mpsc::UnboundedReceiver<GroupEvent>,
    ) {
        let mut me = Member::new(name, "127.0.0.1", 7000).unwrap();
        me.assign_id(id);
        NodeContext::new(Config::default(), me, Arc::new(AutoApprove))
    }

    #[tokio::test]
    async fn test_new_member_announcement_of_self_is_ignored() {
        let (ctx, _s, mut events) = context("m2", 1);
        ctx.apply_command(Command::NewMember(peer("m2", 1)));
        assert!(ctx.roster.is_empty());

        ctx.apply_command(Command::NewMember(peer("m3", 2)));
        assert_eq!(ctx.roster.len(), 1);
        assert!(matches!(events.recv().await, Some(GroupEvent::MemberJoined(m)) if m.id == 2));
    }

    #[tokio::test]
    async fn test_remove_of_self_is_ignored() {
        let (ctx, _s, _e) = context("m2", 1);
        ctx.roster.add(peer("m1", 0));
        ctx.apply_command(Command::RemoveMember(1));
        ctx.apply_command(Command::RemoveMember(0));
        ctx.apply_command(Command::RemoveMember(0));
        assert!(ctx.roster.is_empty());
        assert_eq!(ctx.roster.me().id, 1);
    }

    #[tokio::test]
    async fn test_new_coordinator_drops_superseded() {
        let (ctx, _s, mut events) = context("m3", 2);
        let mut old = peer("m1", 0);
        old.promote();
        ctx.roster.add(old);
        ctx.roster.add(peer("m2", 1));

        ctx.apply_command(Command::NewCoordinator(1));
        assert_eq!(ctx.roster.coordinator().unwrap().id, 1);
        assert!(ctx.roster.get(0).is_none());
        assert!(matches!(events.recv().await, Some(GroupEvent::MemberLeft(m)) if m.id == 0));
        assert!(
            matches!(events.recv().await, Some(GroupEvent::CoordinatorChanged(m)) if m.id == 1)
        );

        // A repeated announcement changes nothing.
        ctx.apply_command(Command::NewCoordinator(1));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_is_forwarded_to_monitor() {
        let (ctx, mut suspicions, _e) = context("m1", 0);
        ctx.roster.add(peer("m2", 1));
        ctx.apply_command(Command::Unreachable(1));
        ctx.apply_command(Command::Unreachable(9));

        let suspicion = suspicions.recv().await.unwrap();
        assert_eq!(suspicion.member.id, 1);
        assert!(suspicion.forwarded);
        assert!(suspicions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_username() {
        let mut config = Config::default();
        config.node.username = "two words".to_string();
        config.node.port = 0;
        let err = Node::start(config, Arc::new(AutoApprove)).await.err().unwrap();
        assert_eq!(err.code(), "InvalidUsername");
    }

    #[tokio::test]
    async fn test_founder_submit_records_transcript() {
        let mut config = Config::default();
        config.node.username = "solo".to_string();
        config.node.port = 0;
        let (node, _events) = Node::start(config, Arc::new(AutoApprove)).await.unwrap();
        assert_eq!(node.role(), Role::Coordinator);
        assert_eq!(node.me().id, 0);

        let sent = node.submit("hello").unwrap();
        let transcript = node.transcript();
        assert_eq!(transcript, vec![sent]);
        node.leave().await;
    }
}
