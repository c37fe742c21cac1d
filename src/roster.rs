//! The shared membership roster.
//!
//! Holds every *other* known member plus this process's own identity
//! ("me", never inside the member list).  All state sits behind one
//! `RwLock`, so every operation is atomic with respect to every other and
//! callers only ever receive owned copies.  Each mutation wakes the
//! coordinator monitor through a [`Notify`] so roles are re-evaluated
//! as soon as the roster changes.

use std::sync::RwLock;

use tokio::sync::Notify;

use crate::member::Member;
use crate::metrics;

#[derive(Debug)]
struct Inner {
    me: Member,
    members: Vec<Member>,
}

impl Inner {
    fn contains_id(&self, id: i64) -> bool {
        self.me.id == id || self.members.iter().any(|m| m.id == id)
    }

    fn find_username(&self, name: &str) -> Option<&Member> {
        if self.me.has_username(name) {
            return Some(&self.me);
        }
        self.members.iter().find(|m| m.has_username(name))
    }

    fn next_id(&self) -> i64 {
        self.members
            .iter()
            .map(|m| m.id)
            .fold(self.me.id, i64::max)
            + 1
    }
}

/// Result of [`Roster::admit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// The candidate received `member.id` and was appended.
    Admitted {
        /// The candidate with its assigned id.
        member: Member,
        /// Everyone known before admission, `me` included.  The candidate
        /// derives its id from this list, so `max(id) + 1 == member.id`.
        reply: Vec<Member>,
        /// Existing members (without `me`) that must hear `newMember`.
        audience: Vec<Member>,
    },
    /// The username collides (case-insensitively) with `existing`.
    Collision { existing: Member },
}

/// Outcome of applying a `newCoordinator` announcement.
#[derive(Debug, Clone)]
pub struct CoordinatorChange {
    pub coordinator: Member,
    /// Previous coordinators dropped because they were superseded.
    pub superseded: Vec<Member>,
}

pub struct Roster {
    inner: RwLock<Inner>,
    changed: Notify,
}

impl Roster {
    pub fn new(me: Member) -> Self {
        Self {
            inner: RwLock::new(Inner {
                me,
                members: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }

    fn touch(&self, inner: &Inner) {
        metrics::set_roster_size(inner.members.len());
        self.changed.notify_one();
    }

    /// Wait until the next mutation.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    pub fn me(&self) -> Member {
        self.inner.read().expect("rwlock poisoned").me.clone()
    }

    /// `me` and a snapshot of the others, taken atomically.
    pub fn view(&self) -> (Member, Vec<Member>) {
        let inner = self.inner.read().expect("rwlock poisoned");
        (inner.me.clone(), inner.members.clone())
    }

    /// Become the first member of a new group: id 0 and coordinator.
    pub fn found(&self) -> Member {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        inner.me.assign_id(0);
        inner.me.promote();
        self.touch(&inner);
        inner.me.clone()
    }

    /// Set `me.id` once.  Returns `false` if it was already assigned.
    pub fn assign_my_id(&self, id: i64) -> bool {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        let assigned = inner.me.assign_id(id);
        self.touch(&inner);
        assigned
    }

    /// Mark `me` as coordinator.  Returns `false` if it already was.
    pub fn promote_me(&self) -> bool {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if inner.me.is_coordinator {
            return false;
        }
        inner.me.promote();
        self.touch(&inner);
        true
    }

    /// Append a member whose uniqueness the caller already verified.
    ///
    /// # Panics
    ///
    /// Panics if the id or (case-insensitive) username is already known.
    /// Network-facing paths use [`Roster::admit`] or
    /// [`Roster::insert_announced`] instead.
    pub fn add(&self, member: Member) {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        assert!(
            !inner.contains_id(member.id),
            "duplicate member id {}",
            member.id
        );
        assert!(
            inner.find_username(&member.username).is_none(),
            "duplicate username {}",
            member.username
        );
        inner.members.push(member);
        self.touch(&inner);
    }

    /// Remove the member with `id`.  Removing an absent id is a no-op.
    pub fn remove(&self, id: i64) -> Option<Member> {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        let pos = inner.members.iter().position(|m| m.id == id)?;
        let removed = inner.members.remove(pos);
        self.touch(&inner);
        Some(removed)
    }

    /// Ordered copy of every other member.
    pub fn snapshot(&self) -> Vec<Member> {
        self.inner.read().expect("rwlock poisoned").members.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("rwlock poisoned").members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: i64) -> Option<Member> {
        let inner = self.inner.read().expect("rwlock poisoned");
        inner.members.iter().find(|m| m.id == id).cloned()
    }

    /// Case-insensitive lookup over the others and `me`.
    pub fn find_by_username(&self, name: &str) -> Option<Member> {
        let inner = self.inner.read().expect("rwlock poisoned");
        inner.find_username(name).cloned()
    }

    /// One past the largest known id, `me` included.
    pub fn next_id(&self) -> i64 {
        self.inner.read().expect("rwlock poisoned").next_id()
    }

    /// Check, id-assign and append a join candidate in one step.
    pub fn admit(&self, mut candidate: Member) -> Admission {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if let Some(existing) = inner.find_username(&candidate.username) {
            return Admission::Collision {
                existing: existing.clone(),
            };
        }

        let audience = inner.members.clone();
        let mut reply = audience.clone();
        reply.push(inner.me.clone());

        candidate.id = inner.next_id();
        candidate.is_coordinator = false;
        inner.members.push(candidate.clone());
        self.touch(&inner);

        Admission::Admitted {
            member: candidate,
            reply,
            audience,
        }
    }

    /// Add a member announced over the network.  Announcements of `me`,
    /// of a known id, or of a taken username are ignored (`false`).
    pub fn insert_announced(&self, member: Member) -> bool {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if inner.contains_id(member.id) || inner.find_username(&member.username).is_some() {
            return false;
        }
        inner.members.push(member);
        self.touch(&inner);
        true
    }

    /// Merge the roster received in a join reply.  Returns how many
    /// members were new.
    pub fn install(&self, members: Vec<Member>) -> usize {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        let mut added = 0;
        for member in members {
            if inner.contains_id(member.id) || inner.find_username(&member.username).is_some() {
                continue;
            }
            inner.members.push(member);
            added += 1;
        }
        self.touch(&inner);
        added
    }

    /// The member (possibly `me`) currently flagged coordinator.
    pub fn coordinator(&self) -> Option<Member> {
        let inner = self.inner.read().expect("rwlock poisoned");
        if inner.me.is_coordinator {
            return Some(inner.me.clone());
        }
        inner.members.iter().find(|m| m.is_coordinator).cloned()
    }

    /// Apply `newCoordinator:<id>`.
    ///
    /// Other records flagged coordinator are dropped: the announcement
    /// means they were declared dead, and `removeMember` may still be in
    /// flight.  `me` never steps down, so an announcement naming someone
    /// else while `me` is coordinator is ignored.
    pub fn set_coordinator(&self, id: i64) -> Option<CoordinatorChange> {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if inner.me.id == id {
            inner.me.promote();
            self.touch(&inner);
            return Some(CoordinatorChange {
                coordinator: inner.me.clone(),
                superseded: Vec::new(),
            });
        }
        if inner.me.is_coordinator {
            return None;
        }

        let pos = inner.members.iter().position(|m| m.id == id)?;
        inner.members[pos].promote();
        let coordinator = inner.members[pos].clone();

        let (superseded, kept): (Vec<Member>, Vec<Member>) = inner
            .members
            .drain(..)
            .partition(|m| m.is_coordinator && m.id != id);
        inner.members = kept;
        self.touch(&inner);

        Some(CoordinatorChange {
            coordinator,
            superseded,
        })
    }

    /// Lowest id among non-coordinators, `me` included.
    pub fn heir_id(&self) -> Option<i64> {
        let inner = self.inner.read().expect("rwlock poisoned");
        std::iter::once(&inner.me)
            .chain(inner.members.iter())
            .filter(|m| m.is_assigned() && !m.is_coordinator)
            .map(|m| m.id)
            .min()
    }
}
