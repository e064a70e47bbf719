//! In-flight delta accounting.
//!
//! Dispatched creates and removes complete asynchronously and possibly
//! out of order. Each dispatched replica id is held here until a fresh
//! listing confirms it, so the same load burst is never dispatched
//! twice and an offsetting create/remove pair cannot hide behind an
//! unchanged count.

use std::collections::HashSet;

use surge_state::ReplicaId;

/// Dispatched-but-unconfirmed replica deltas for one target.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    /// Ids dispatched for create, not yet seen in a listing.
    creating: HashSet<ReplicaId>,
    /// Ids dispatched for remove, still seen in a listing.
    removing: HashSet<ReplicaId>,
    /// Replica count seen at the last settle.
    observed: u32,
}

/// Operations confirmed by one settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub confirmed_creates: u32,
    pub confirmed_removes: u32,
}

impl InFlight {
    pub fn new(observed: u32) -> Self {
        Self {
            creating: HashSet::new(),
            removing: HashSet::new(),
            observed,
        }
    }

    pub fn dispatched_create(&mut self, id: &str) {
        self.creating.insert(id.to_string());
    }

    pub fn dispatched_remove(&mut self, id: &str) {
        self.removing.insert(id.to_string());
    }

    /// Reconcile against the ids of a fresh replica listing.
    ///
    /// A create is confirmed when its id appears, a remove when its id
    /// no longer does. Confirmation is by identity, never by count
    /// movement, so a create and a remove that both land between two
    /// listings each settle even though the count is unchanged.
    pub fn settle<'a>(&mut self, listing: impl IntoIterator<Item = &'a str>) -> Settlement {
        let present: HashSet<&str> = listing.into_iter().collect();

        let before = self.creating.len();
        self.creating.retain(|id| !present.contains(id.as_str()));
        let confirmed_creates = (before - self.creating.len()) as u32;

        let before = self.removing.len();
        self.removing.retain(|id| present.contains(id.as_str()));
        let confirmed_removes = (before - self.removing.len()) as u32;

        self.observed = present.len() as u32;
        Settlement {
            confirmed_creates,
            confirmed_removes,
        }
    }

    /// The replica count the policy should treat as current: the last
    /// settled listing plus what is still on the way.
    pub fn effective(&self) -> u32 {
        (self.observed + self.creating.len() as u32).saturating_sub(self.removing.len() as u32)
    }

    pub fn is_settled(&self) -> bool {
        self.creating.is_empty() && self.removing.is_empty()
    }

    pub fn creates(&self) -> u32 {
        self.creating.len() as u32
    }

    pub fn removes(&self) -> u32 {
        self.removing.len() as u32
    }
}
