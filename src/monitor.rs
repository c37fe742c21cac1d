//! Coordinator election and liveness monitoring.
//!
//! Each process runs one monitor task.  Its behaviour depends on the
//! process's [`Role`], recomputed whenever the roster changes:
//!
//! - `Coordinator` drains the unreachable set every tick, probes each
//!   suspect once and removes the ones that stay silent.  Every
//!   `sweep_every` ticks it also verifies the whole roster.
//! - `HeirApparent` (lowest id among non-coordinators) probes the
//!   coordinator every tick and takes over when the probe fails.
//! - `Member` does no probing and forwards its suspicions to the
//!   coordinator, the only member allowed to declare someone dead.  If the
//!   coordinator cannot be reached either, it drops any dead members
//!   ranked ahead of it so a live member inherits the coordinator role.
//!
//! Coordinator status is sticky: once a process is coordinator it never
//! returns to another role.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::event::GroupEvent;
use crate::member::Member;
use crate::metrics;
use crate::node::NodeContext;
use crate::protocol::{Command, Envelope, TextMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    HeirApparent,
    Coordinator,
}

impl Role {
    /// Role of `me` given the other members.
    pub fn evaluate(me: &Member, others: &[Member]) -> Role {
        if me.is_coordinator {
            return Role::Coordinator;
        }
        if !me.is_assigned() {
            return Role::Member;
        }
        let lowest_other = others
            .iter()
            .filter(|m| !m.is_coordinator)
            .map(|m| m.id)
            .min();
        match lowest_other {
            Some(id) if id < me.id => Role::Member,
            _ => Role::HeirApparent,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Member => "member",
            Role::HeirApparent => "heir-apparent",
            Role::Coordinator => "coordinator",
        };
        f.write_str(name)
    }
}

/// A member some send failed to reach.
#[derive(Debug, Clone)]
pub struct Suspicion {
    pub member: Member,
    /// Arrived as an `unreachable` command rather than a local failure.
    pub forwarded: bool,
}

/// Ids the coordinator still has to verify.
#[derive(Debug, Default)]
pub struct UnreachableSet {
    ids: BTreeSet<i64>,
}

impl UnreachableSet {
    pub fn insert(&mut self, id: i64) -> bool {
        self.ids.insert(id)
    }

    pub fn drain(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.ids).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct Monitor {
    ctx: Arc<NodeContext>,
    suspicions: mpsc::UnboundedReceiver<Suspicion>,
    unreachable: UnreachableSet,
    role: Role,
    ticks: u64,
}

impl Monitor {
    pub fn new(ctx: Arc<NodeContext>, suspicions: mpsc::UnboundedReceiver<Suspicion>) -> Self {
        let (me, others) = ctx.roster.view();
        let role = Role::evaluate(&me, &others);
        metrics::set_role(role);
        Self {
            ctx,
            suspicions,
            unreachable: UnreachableSet::default(),
            role,
            ticks: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run until `shutdown` flips (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.monitor.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(role = %self.role, "coordinator monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(suspicion) = self.suspicions.recv() => self.on_suspicion(suspicion).await,
                _ = self.ctx.roster.changed() => {
                    self.refresh_role();
                }
                _ = ticker.tick() => {
                    self.refresh_role();
                    self.tick().await;
                }
            }
        }

        info!("coordinator monitor stopped");
    }

    fn refresh_role(&mut self) -> Role {
        let (me, others) = self.ctx.roster.view();
        let next = Role::evaluate(&me, &others);
        if next != self.role {
            info!(from = %self.role, to = %next, "role transition");
            self.role = next;
            metrics::set_role(next);
        }
        next
    }

    /// One monitor interval's worth of work for the current role.
    pub async fn tick(&mut self) {
        self.ticks += 1;
        match self.role {
            Role::Coordinator => {
                let sweep_every = u64::from(self.ctx.config.monitor.sweep_every);
                if sweep_every > 0 && self.ticks % sweep_every == 0 {
                    for member in self.ctx.roster.snapshot() {
                        self.unreachable.insert(member.id);
                    }
                }
                self.verify_suspects().await;
            }
            Role::HeirApparent => self.watch_coordinator().await,
            Role::Member => {}
        }
    }

    /// Route a suspicion according to the current role.
    pub async fn on_suspicion(&mut self, suspicion: Suspicion) {
        let role = self.refresh_role();
        let me = self.ctx.roster.me();
        let id = suspicion.member.id;

        if role == Role::Coordinator {
            if id != me.id && self.unreachable.insert(id) {
                debug!(suspect = %suspicion.member, "queued for verification");
            }
            return;
        }
        if suspicion.forwarded {
            debug!(suspect = %suspicion.member, "not coordinator, dropping forwarded suspicion");
            return;
        }

        match self.ctx.roster.coordinator() {
            Some(coordinator) if coordinator.id != id => {
                let envelope = Envelope::command(Command::Unreachable(id));
                if let Err(e) = self.ctx.broadcaster.send_to(&coordinator, &envelope).await {
                    warn!(coordinator = %coordinator, error = %e, "could not forward suspicion");
                    self.drop_dead_heirs().await;
                }
            }
            _ => debug!(suspect = %suspicion.member, "suspect is the coordinator, left to the heir"),
        }
    }

    /// The coordinator did not take a forwarded suspicion.  Whoever ranks
    /// ahead of `me` for succession must be alive to replace it; drop the
    /// ones that are not so `me` can move up.
    async fn drop_dead_heirs(&mut self) {
        let me = self.ctx.roster.me();
        let mut ahead: Vec<Member> = self
            .ctx
            .roster
            .snapshot()
            .into_iter()
            .filter(|m| !m.is_coordinator && m.id < me.id)
            .collect();
        ahead.sort_by_key(|m| m.id);

        for heir in ahead {
            if self.ctx.broadcaster.probe(&heir).await {
                break;
            }
            if self.ctx.roster.remove(heir.id).is_some() {
                metrics::member_removed("heir_unreachable");
                warn!(heir = %heir, "heir unreachable along with the coordinator, dropping");
                self.ctx.events.post(GroupEvent::MemberLeft(heir));
            }
        }
        self.refresh_role();
    }

    async fn verify_suspects(&mut self) {
        let suspects = self.unreachable.drain();
        if suspects.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for id in suspects {
            let Some(member) = self.ctx.roster.get(id) else {
                continue;
            };
            let broadcaster = self.ctx.broadcaster.clone();
            probes.spawn(async move {
                let alive = broadcaster.probe(&member).await;
                (member, alive)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((member, true)) => debug!(member = %member, "suspect answered, keeping"),
                Ok((member, false)) => self.declare_dead(member),
                Err(e) => warn!("probe task failed: {}", e),
            }
        }
    }

    fn declare_dead(&self, member: Member) {
        if self.ctx.roster.remove(member.id).is_none() {
            return;
        }
        metrics::member_removed("unreachable");
        info!(member = %member, "member confirmed dead, removing");

        let me = self.ctx.roster.me();
        let notice = TextMessage::system(&me.username, &format!("{} left.", member.username));
        self.ctx.record(notice.clone());
        self.ctx.broadcast_to_roster(vec![
            Envelope::command(Command::RemoveMember(member.id)),
            Envelope::Text(notice),
        ]);
        self.ctx.events.post(GroupEvent::MemberLeft(member));
    }

    async fn watch_coordinator(&mut self) {
        match self.ctx.roster.coordinator() {
            None => {
                warn!("no coordinator known, taking over");
                self.take_over(None);
            }
            Some(coordinator) => {
                if !self.ctx.broadcaster.probe(&coordinator).await {
                    warn!(coordinator = %coordinator, "coordinator unreachable, taking over");
                    self.take_over(Some(coordinator));
                }
            }
        }
    }

    fn take_over(&mut self, dead: Option<Member>) {
        if !self.ctx.roster.promote_me() {
            return;
        }
        metrics::failover();
        let me = self.ctx.roster.me();
        let mut batch = Vec::new();

        let text = match dead {
            Some(dead) => {
                if self.ctx.roster.remove(dead.id).is_some() {
                    metrics::member_removed("coordinator_failed");
                    self.ctx.events.post(GroupEvent::MemberLeft(dead.clone()));
                }
                batch.push(Envelope::command(Command::RemoveMember(dead.id)));
                format!("{} left, {} is the coordinator now.", dead.username, me.username)
            }
            None => format!("{} is the coordinator now.", me.username),
        };

        let notice = TextMessage::system(&me.username, &text);
        self.ctx.record(notice.clone());
        batch.push(Envelope::command(Command::NewCoordinator(me.id)));
        batch.push(Envelope::Text(notice));
        self.ctx.broadcast_to_roster(batch);

        info!(me = %me, "promoted to coordinator");
        self.ctx.events.post(GroupEvent::CoordinatorChanged(me));
        self.refresh_role();
    }
}
