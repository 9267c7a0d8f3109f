//! Bounded, TTL-limited session cache held by one worker.
//!
//! Eviction is least-recently-used: every successful lookup refreshes an
//! entry. Lifetime is counted from creation, so use extends recency but
//! never the deadline. The store hands back evicted and expired sessions
//! instead of dropping them; the caller releases their interpreter state
//! and workspace.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::worker::engine::StateHandle;
use crate::worker::sandbox::SessionWorkspace;

/// A live session: its interpreter state and host workspace.
#[derive(Debug)]
pub struct Session {
    /// Opaque session id assigned by the scheduler.
    pub id: String,
    /// Interpreter global state bound to this session.
    pub state: StateHandle,
    /// Host directory exposed at `/workspace` while the session runs.
    pub workspace: SessionWorkspace,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    session: Session,
    inserted: Instant,
    last_used: u64,
}

/// LRU + TTL cache of sessions keyed by id.
#[derive(Debug)]
pub struct SessionStore {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl SessionStore {
    /// Store holding at most `capacity` sessions, each living `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    /// Live session count, including not-yet-purged expired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a session id is present and unexpired at `now`.
    #[must_use]
    pub fn contains(&self, id: &str, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| !self.is_expired(entry, now))
    }

    /// Insert a session, returning every session displaced to make room:
    /// an older entry with the same id, expired entries, then LRU victims.
    pub fn insert(&mut self, session: Session, now: Instant) -> Vec<Session> {
        let mut displaced = Vec::new();
        if let Some(old) = self.entries.remove(&session.id) {
            displaced.push(old.session);
        }
        displaced.extend(self.purge_expired(now));

        while self.entries.len() >= self.capacity {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                displaced.push(entry.session);
            }
        }

        let last_used = self.tick();
        self.entries.insert(
            session.id.clone(),
            Entry {
                session,
                inserted: now,
                last_used,
            },
        );
        displaced
    }

    /// Look up a session and mark it most recently used. Expired entries
    /// are treated as absent.
    pub fn get(&mut self, id: &str, now: Instant) -> Option<&Session> {
        let expired = self.entries.get(id).map(|entry| self.is_expired(entry, now))?;
        if expired {
            return None;
        }
        let tick = self.tick();
        let entry = self.entries.get_mut(id)?;
        entry.last_used = tick;
        Some(&entry.session)
    }

    /// Remove one session.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.entries.remove(id).map(|entry| entry.session)
    }

    /// Remove and return every session whose lifetime ended at `now`.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Session> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| entry.session))
            .collect()
    }

    /// Remove and return every session.
    pub fn drain(&mut self) -> Vec<Session> {
        self.entries.drain().map(|(_, entry)| entry.session).collect()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted) >= self.ttl
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
