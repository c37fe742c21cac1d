//! huddle — serverless peer-to-peer group membership and chat.
//!
//! Any number of processes form one group over TCP without a central
//! server.  Each keeps its own copy of the membership roster, one member
//! acts as coordinator and removes dead peers, and the member with the
//! lowest id among the rest takes over when the coordinator disappears.
//!
//! [`node::Node`] is the entry point; everything else is the machinery it
//! wires together.

pub mod admin;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod event;
pub mod join;
pub mod listener;
pub mod member;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod protocol;
pub mod roster;

pub use errors::{GroupError, ProtocolError};
pub use event::GroupEvent;
pub use join::{AutoApprove, JoinApprover};
pub use member::Member;
pub use monitor::Role;
pub use node::Node;
pub use protocol::TextMessage;
