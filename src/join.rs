//! Join manager: entering a group and admitting newcomers.
//!
//! The outbound side dials any existing member, sends `Join(me)` and waits
//! for the roster reply.  The inbound side runs on the admitting member
//! when such a request arrives: it checks the username, optionally asks the
//! operator, assigns the next id and tells the rest of the group.

use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::errors::{GroupError, ProtocolError};
use crate::event::GroupEvent;
use crate::member::{validate_username, Member};
use crate::node::NodeContext;
use crate::protocol::{self, Command, Envelope};
use crate::roster::Admission;

/// Operator hook consulted before a newcomer is admitted.
pub trait JoinApprover: Send + Sync + 'static {
    /// Resolve to `true` to admit `candidate`.
    fn approve(&self, candidate: Member) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Admits everyone whose username is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl JoinApprover for AutoApprove {
    fn approve(&self, _candidate: Member) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// No target was given; this process starts a new group.
    Founded,
    /// Admitted by the target.
    Joined {
        /// The group as of admission, admitter included.
        roster: Vec<Member>,
        assigned_id: i64,
    },
}

/// Id the admitter assigned, derived from its reply: one past the largest
/// id in the list, whatever order it came in.
pub fn assigned_id(roster: &[Member]) -> i64 {
    roster.iter().map(|m| m.id).max().map_or(0, |max| max + 1)
}

/// Validate a `host:port` join target and return a dialable form.
pub fn parse_target(raw: &str) -> Result<String, GroupError> {
    let raw = raw.trim();
    let invalid = || GroupError::InvalidTarget {
        target: raw.to_string(),
    };

    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match port.parse::<u16>() {
        Ok(port) if port != 0 && !host.is_empty() => {
            if host.contains(':') {
                Ok(format!("[{host}]:{port}"))
            } else {
                Ok(format!("{host}:{port}"))
            }
        }
        _ => Err(invalid()),
    }
}

/// Ask the member at `target` to admit `me`.  Without a target nothing is
/// sent and the caller founds a new group.
pub async fn request_join(
    target: Option<&str>,
    me: &Member,
    network: &NetworkConfig,
) -> Result<JoinOutcome, GroupError> {
    let Some(raw) = target else {
        return Ok(JoinOutcome::Founded);
    };
    let target = parse_target(raw)?;
    let unknown = |reason: String| GroupError::UnknownMember {
        target: target.clone(),
        reason,
    };

    let join_timeout = network.join_timeout();
    let mut stream = match tokio::time::timeout(join_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(unknown(e.to_string())),
        Err(_) => return Err(unknown(ProtocolError::Timeout(network.join_timeout_ms).to_string())),
    };
    debug!(target = %target, "connected, requesting admission");

    let request = Envelope::Join { member: me.clone() };
    protocol::send_envelope(&mut stream, &request, network.io_timeout())
        .await
        .map_err(|e| unknown(e.to_string()))?;

    let reply = protocol::read_envelope(&mut stream, network.max_frame_bytes, join_timeout).await;
    match reply {
        Ok(Some(Envelope::Roster { members })) if members.is_empty() => {
            Err(GroupError::DuplicateUsername {
                username: me.username.clone(),
            })
        }
        Ok(Some(Envelope::Roster { members })) => {
            let assigned_id = assigned_id(&members);
            info!(target = %target, assigned_id, members = members.len(), "admitted to group");
            Ok(JoinOutcome::Joined {
                roster: members,
                assigned_id,
            })
        }
        Ok(Some(other)) => Err(ProtocolError::Unexpected {
            expected: "roster",
            got: other.kind(),
        }
        .into()),
        Ok(None) => Err(unknown("connection closed without a reply".to_string())),
        Err(e @ ProtocolError::Malformed(_)) => Err(e.into()),
        Err(e) => Err(unknown(e.to_string())),
    }
}

async fn reject<S>(ctx: &NodeContext, stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = Envelope::Roster {
        members: Vec::new(),
    };
    protocol::send_envelope(stream, &reply, ctx.config.network.io_timeout()).await?;
    Ok(())
}

/// Admit or reject `candidate`, replying on `stream`.
pub async fn handle_join_request<S>(
    ctx: &NodeContext,
    candidate: Member,
    stream: &mut S,
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if !ctx.roster.me().is_assigned() {
        info!(candidate = %candidate.username, "not admitted to a group yet, rejecting join");
        return reject(ctx, stream).await;
    }
    if let Err(e) = validate_username(&candidate.username) {
        warn!(candidate = %candidate.username, error = %e, "rejecting join");
        return reject(ctx, stream).await;
    }
    if let Some(existing) = ctx.roster.find_by_username(&candidate.username) {
        info!(candidate = %candidate.username, existing = %existing, "username taken, rejecting join");
        return reject(ctx, stream).await;
    }
    if !ctx.approver.approve(candidate.clone()).await {
        info!(candidate = %candidate.username, "join declined by operator");
        ctx.events
            .notice(format!("Declined join request from {}.", candidate.username));
        return reject(ctx, stream).await;
    }

    // The username may have been taken while the operator was deciding.
    let (member, reply, audience) = match ctx.roster.admit(candidate) {
        Admission::Admitted {
            member,
            reply,
            audience,
        } => (member, reply, audience),
        Admission::Collision { existing } => {
            info!(existing = %existing, "username taken during approval, rejecting join");
            return reject(ctx, stream).await;
        }
    };

    let envelope = Envelope::Roster { members: reply };
    if let Err(e) =
        protocol::send_envelope(stream, &envelope, ctx.config.network.io_timeout()).await
    {
        ctx.roster.remove(member.id);
        warn!(member = %member, error = %e, "join reply failed, admission rolled back");
        return Err(e.into());
    }

    info!(member = %member, "admitted new member");
    ctx.broadcaster
        .broadcast(Envelope::command(Command::NewMember(member.clone())), audience)?;
    ctx.events.post(GroupEvent::MemberJoined(member));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::{read_envelope, DEFAULT_MAX_FRAME_BYTES};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Decline;

    impl JoinApprover for Decline {
        fn approve(&self, _candidate: Member) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async { false })
        }
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            join_timeout_ms: 1000,
            ..NetworkConfig::default()
        }
    }

    fn founder_context(approver: Arc<dyn JoinApprover>) -> Arc<NodeContext> {
        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let (ctx, _suspicions, _events) = NodeContext::new(Config::default(), me, approver);
        ctx.roster.found();
        ctx
    }

    async fn reply_of(ctx: &NodeContext, candidate: Member) -> Vec<Member> {
        let (mut ours, mut theirs) = tokio::io::duplex(4096);
        handle_join_request(ctx, candidate, &mut ours).await.unwrap();
        match read_envelope(&mut theirs, DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1))
            .await
            .unwrap()
        {
            Some(Envelope::Roster { members }) => members,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_assigned_id_scans_all_ids() {
        let roster = vec![
            Member::with_id("c", 4, "h", 1),
            Member::with_id("a", 0, "h", 1),
            Member::with_id("b", 2, "h", 1),
        ];
        assert_eq!(assigned_id(&roster), 5);
        assert_eq!(assigned_id(&[]), 0);
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("10.0.0.1:7100").unwrap(), "10.0.0.1:7100");
        assert_eq!(parse_target(" host:80 ").unwrap(), "host:80");
        assert_eq!(parse_target("[::1]:7100").unwrap(), "[::1]:7100");
        assert_eq!(parse_target("::1:7100").unwrap(), "[::1]:7100");
        for bad in ["host", "host:", ":80", "host:0", "host:http", "host:70000"] {
            assert!(
                matches!(parse_target(bad), Err(GroupError::InvalidTarget { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_no_target_founds_group() {
        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let outcome = request_join(None, &me, &network()).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Founded);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_unknown_member() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let err = request_join(Some(&target), &me, &network()).await.unwrap_err();
        assert_eq!(err.code(), "UnknownMember");
    }

    #[tokio::test]
    async fn test_empty_reply_is_duplicate_username() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_envelope(&mut stream, DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1)).await;
            let reply = Envelope::Roster {
                members: Vec::new(),
            };
            protocol::send_envelope(&mut stream, &reply, Duration::from_secs(1))
                .await
                .unwrap();
        });

        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let err = request_join(Some(&target), &me, &network()).await.unwrap_err();
        assert!(matches!(err, GroupError::DuplicateUsername { username } if username == "alice"));
    }

    #[tokio::test]
    async fn test_non_roster_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_envelope(&mut stream, DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1)).await;
            let reply = Envelope::command(Command::RemoveMember(0));
            protocol::send_envelope(&mut stream, &reply, Duration::from_secs(1))
                .await
                .unwrap();
        });

        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let err = request_join(Some(&target), &me, &network()).await.unwrap_err();
        assert!(matches!(
            err,
            GroupError::Protocol(ProtocolError::Unexpected { expected: "roster", got: "command" })
        ));
    }

    #[tokio::test]
    async fn test_inbound_join_assigns_next_id() {
        let ctx = founder_context(Arc::new(AutoApprove));
        let reply = reply_of(&ctx, Member::new("bob", "127.0.0.1", 7001).unwrap()).await;

        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].username, "alice");
        assert!(reply[0].is_coordinator);
        assert_eq!(assigned_id(&reply), 1);
        assert_eq!(ctx.roster.get(1).unwrap().username, "bob");
    }

    #[tokio::test]
    async fn test_inbound_join_rejects_taken_username() {
        let ctx = founder_context(Arc::new(AutoApprove));
        let reply = reply_of(&ctx, Member::new("ALICE", "127.0.0.1", 7001).unwrap()).await;
        assert!(reply.is_empty());
        assert!(ctx.roster.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_join_declined_by_operator() {
        let ctx = founder_context(Arc::new(Decline));
        let reply = reply_of(&ctx, Member::new("bob", "127.0.0.1", 7001).unwrap()).await;
        assert!(reply.is_empty());
        assert!(ctx.roster.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_join_rejected_while_own_join_pending() {
        let me = Member::new("pending", "127.0.0.1", 7000).unwrap();
        let (ctx, _suspicions, _events) =
            NodeContext::new(Config::default(), me, Arc::new(AutoApprove));

        let reply = reply_of(&ctx, Member::new("bob", "127.0.0.1", 7001).unwrap()).await;
        assert!(reply.is_empty());
        assert!(ctx.roster.is_empty());
        assert!(!ctx.roster.me().is_assigned());
    }

    #[tokio::test]
    async fn test_inbound_join_rolls_back_when_reply_fails() {
        let ctx = founder_context(Arc::new(AutoApprove));
        let (mut ours, theirs) = tokio::io::duplex(16);
        drop(theirs);
        let result =
            handle_join_request(&ctx, Member::new("bob", "127.0.0.1", 7001).unwrap(), &mut ours)
                .await;
        assert!(result.is_err());
        assert!(ctx.roster.is_empty());
    }
}
