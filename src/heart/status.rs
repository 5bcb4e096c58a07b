//! Liveness bookkeeping for expected heartbeat tokens.
//!
//! Entries are process-local; two managers may legitimately disagree about
//! the same token, which is what the plan's `is_dead_for` sets reconcile.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// What this process knows about one expected token.
///
/// The liveness anchor is the last beat, or the creation instant while no
/// beat has arrived yet (the grace period). An entry that was planned but
/// whose VM has not been created is neither alive nor dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub planned_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_beat_at: Option<DateTime<Utc>>,
    pub dead_since: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    /// A token the plan promises but whose guest does not exist yet.
    pub fn planned(now: DateTime<Utc>) -> Self {
        Self {
            planned_at: now,
            created_at: None,
            last_beat_at: None,
            dead_since: None,
        }
    }

    /// A token whose party already exists; the grace period starts now.
    pub fn created(now: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(now),
            ..Self::planned(now)
        }
    }

    /// Recompute `dead_since` from the anchor. A beat after a dead period
    /// clears it; silence past `max_inactive` sets it to the instant the
    /// grace ran out.
    pub fn refresh(&mut self, now: DateTime<Utc>, max_inactive: TimeDelta) {
        self.dead_since = match self.last_beat_at.or(self.created_at) {
            Some(anchor) if anchor + max_inactive < now => Some(anchor + max_inactive),
            _ => None,
        };
    }

    pub fn is_dead(&self) -> bool {
        self.dead_since.is_some()
    }

    pub fn last_beat_before(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.last_beat_at.map(|at| now - at)
    }
}

/// `token → ConnectionStatus` for every party this manager expects beats
/// from: every other manager, plus every VM it owns in the plan.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: DashMap<Uuid, ConnectionStatus>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a beat. Returns false for tokens this manager does not
    /// expect; the caller closes the connection.
    pub fn heartbeat(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(&token) {
            Some(mut entry) => {
                entry.last_beat_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Reconcile the expected-token set after a config or plan change.
    ///
    /// Existing entries are kept untouched; entries for tokens no longer
    /// expected are dropped. Fresh peer entries start their grace period
    /// immediately, fresh VM entries only once [`mark_created`] runs.
    ///
    /// [`mark_created`]: StatusTable::mark_created
    pub fn sync(&self, peers: &HashSet<Uuid>, vms: &HashSet<Uuid>, now: DateTime<Utc>) {
        self.entries
            .retain(|token, _| peers.contains(token) || vms.contains(token));
        for &token in peers {
            self.entries
                .entry(token)
                .or_insert_with(|| ConnectionStatus::created(now));
        }
        for &token in vms {
            self.entries
                .entry(token)
                .or_insert_with(|| ConnectionStatus::planned(now));
        }
    }

    /// Start the grace period for a token whose guest now exists.
    pub fn mark_created(&self, token: Uuid, now: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(&token) {
            if entry.created_at.is_none() {
                entry.created_at = Some(now);
            }
        }
    }

    pub fn status_of(
        &self,
        token: Uuid,
        now: DateTime<Utc>,
        max_inactive: TimeDelta,
    ) -> Option<ConnectionStatus> {
        let mut entry = self.entries.get_mut(&token)?;
        entry.refresh(now, max_inactive);
        Some(*entry)
    }

    /// Every expected token currently considered dead.
    pub fn dead_tokens(&self, now: DateTime<Utc>, max_inactive: TimeDelta) -> HashSet<Uuid> {
        self.entries
            .iter_mut()
            .filter_map(|mut entry| {
                entry.refresh(now, max_inactive);
                entry.is_dead().then(|| *entry.key())
            })
            .collect()
    }

    pub fn contains(&self, token: Uuid) -> bool {
        self.entries.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
