//! Wire protocol: envelopes, commands and framing.
//!
//! Every TCP connection carries exactly one frame from the dialer (plus a
//! single reply frame for joins).  A frame is a 4-byte big-endian length
//! followed by a JSON-encoded [`Envelope`].  A connection that closes
//! before sending a length prefix is a liveness probe, not an error.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::ProtocolError;
use crate::member::Member;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Everything that can travel over one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A newcomer asking to be admitted.
    Join { member: Member },
    /// Reply to a join; empty means rejected.
    Roster { members: Vec<Member> },
    /// A chat or system message.
    Text(TextMessage),
    /// A membership command, carried in its colon-delimited form.
    Command {
        #[serde(with = "command_string")]
        command: Command,
    },
}

impl Envelope {
    pub fn command(command: Command) -> Self {
        Envelope::Command { command }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Join { .. } => "join",
            Envelope::Roster { .. } => "roster",
            Envelope::Text(_) => "text",
            Envelope::Command { .. } => "command",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Authored by a user.
    #[default]
    Chat,
    /// Notice sent on behalf of the group (member left, coordinator changed).
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: Uuid,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl TextMessage {
    pub fn chat(sender: &str, content: &str) -> Self {
        Self::build(sender, content, MessageKind::Chat)
    }

    pub fn system(sender: &str, content: &str) -> Self {
        Self::build(sender, content, MessageKind::System)
    }

    fn build(sender: &str, content: &str, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

impl fmt::Display for TextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.timestamp.format("%H:%M:%S");
        match self.kind {
            MessageKind::Chat => write!(f, "[{time}] {}: {}", self.sender, self.content),
            MessageKind::System => write!(f, "[{time}] * {}", self.content),
        }
    }
}

/// Roster-mutating commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `newMember:<username>:<id>:<address>:<port>`
    NewMember(Member),
    /// `removeMember:<id>`
    RemoveMember(i64),
    /// `newCoordinator:<id>`
    NewCoordinator(i64),
    /// `unreachable:<id>`
    Unreachable(i64),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::NewMember(_) => "newMember",
            Command::RemoveMember(_) => "removeMember",
            Command::NewCoordinator(_) => "newCoordinator",
            Command::Unreachable(_) => "unreachable",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::NewMember(m) => write!(
                f,
                "newMember:{}:{}:{}:{}",
                m.username, m.id, m.address, m.port
            ),
            Command::RemoveMember(id) => write!(f, "removeMember:{id}"),
            Command::NewCoordinator(id) => write!(f, "newCoordinator:{id}"),
            Command::Unreachable(id) => write!(f, "unreachable:{id}"),
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidCommand(s.to_string());
        let (name, params) = s.split_once(':').ok_or_else(invalid)?;
        let parse_id = |p: &str| p.parse::<i64>().map_err(|_| invalid());

        match name {
            "newMember" => {
                // Address may itself contain ':' (IPv6), so anchor on both ends.
                let (username, rest) = params.split_once(':').ok_or_else(invalid)?;
                let (id, rest) = rest.split_once(':').ok_or_else(invalid)?;
                let (address, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                if username.is_empty() || address.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Command::NewMember(Member::with_id(
                    username,
                    parse_id(id)?,
                    address,
                    port,
                )))
            }
            "removeMember" => Ok(Command::RemoveMember(parse_id(params)?)),
            "newCoordinator" => Ok(Command::NewCoordinator(parse_id(params)?)),
            "unreachable" => Ok(Command::Unreachable(parse_id(params)?)),
            _ => Err(invalid()),
        }
    }
}

mod command_string {
    use super::Command;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(command: &Command, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(command)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Command, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// -- Framing -----------------------------------------------------------------

/// Encode `envelope` as a complete frame (length prefix included).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write an already encoded frame, bounded by `timeout`.
pub async fn write_frame<S>(stream: &mut S, frame: &[u8], timeout: Duration) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Encode and write `envelope`.
pub async fn send_envelope<S>(
    stream: &mut S,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    write_frame(stream, &frame, timeout).await
}

/// Read one frame.  `Ok(None)` means the peer closed without sending
/// anything, which is how liveness probes look.
pub async fn read_envelope<S>(
    stream: &mut S,
    max_frame_bytes: usize,
    timeout: Duration,
) -> Result<Option<Envelope>, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let timed_out = || ProtocolError::Timeout(timeout.as_millis() as u64);

    let mut len_buf = [0u8; 4];
    match tokio::time::timeout(timeout, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(timed_out()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }

    let mut buffer = BytesMut::zeroed(len);
    match tokio::time::timeout(timeout, stream.read_exact(&mut buffer)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(timed_out()),
    }

    Ok(Some(serde_json::from_slice(&buffer)?))
}
