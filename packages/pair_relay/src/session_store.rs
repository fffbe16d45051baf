//! Session Store
//!
//! Semi-durable table of sessions keyed by UID. A session outlives the
//! connection that created it and stays resumable until `last_seen + ttl`.
//! Expiry is advisory: lookups still return stale sessions until the purge
//! sweep removes them, and only the reconnect path asks `is_resumable`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::registry::ConnectionId;

/// Default session time-to-live (30 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// The two peer roles a session can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Asker,
    Helper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Asker => "asker",
            Role::Helper => "helper",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asker" => Ok(Role::Asker),
            "helper" => Ok(Role::Helper),
            other => Err(other.to_string()),
        }
    }
}

/// Server-side record of one peer's role and pairing.
#[derive(Debug, Clone)]
pub struct Session {
    pub uid: String,
    pub role: Option<Role>,
    pub paired_with: Option<String>,
    pub last_seen: Instant,
    /// Connection currently bound to this UID, if any. Back-reference only.
    pub connection: Option<ConnectionId>,
}

impl Session {
    fn new(uid: String, connection: Option<ConnectionId>, now: Instant) -> Self {
        Self {
            uid,
            role: None,
            paired_with: None,
            last_seen: now,
            connection,
        }
    }
}

pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert a fresh session, overwriting any previous holder of `uid`.
    pub fn create(&mut self, uid: &str, connection: Option<ConnectionId>, now: Instant) -> &Session {
        if self.sessions.contains_key(uid) {
            debug!(uid = %uid, "UID collision, overwriting existing session");
            self.unpair(uid);
        }
        self.sessions
            .entry(uid.to_string())
            .insert_entry(Session::new(uid.to_string(), connection, now))
            .into_mut()
    }

    pub fn get(&self, uid: &str) -> Option<&Session> {
        self.sessions.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut Session> {
        self.sessions.get_mut(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.sessions.contains_key(uid)
    }

    /// Refresh `last_seen`. Returns false if the session does not exist.
    pub fn touch(&mut self, uid: &str, now: Instant) -> bool {
        match self.sessions.get_mut(uid) {
            Some(session) => {
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn set_role(&mut self, uid: &str, role: Role, now: Instant) -> bool {
        match self.sessions.get_mut(uid) {
            Some(session) => {
                session.role = Some(role);
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Pair two sessions mutually. Any previous partner of either side is
    /// unlinked first so the relation stays symmetric.
    pub fn set_pairing(&mut self, uid_a: &str, uid_b: &str, now: Instant) -> bool {
        if uid_a == uid_b || !self.contains(uid_a) || !self.contains(uid_b) {
            return false;
        }
        self.unpair(uid_a);
        self.unpair(uid_b);
        for (this, other) in [(uid_a, uid_b), (uid_b, uid_a)] {
            if let Some(session) = self.sessions.get_mut(this) {
                session.paired_with = Some(other.to_string());
                session.last_seen = now;
            }
        }
        true
    }

    /// Clear `uid`'s pairing and the partner's back-link if it points here.
    /// Returns the former partner.
    pub fn unpair(&mut self, uid: &str) -> Option<String> {
        let partner = self.sessions.get_mut(uid)?.paired_with.take()?;
        if let Some(other) = self.sessions.get_mut(&partner) {
            if other.paired_with.as_deref() == Some(uid) {
                other.paired_with = None;
            }
        }
        Some(partner)
    }

    /// A session can be resumed only while strictly inside its TTL window.
    pub fn is_resumable(&self, uid: &str, now: Instant) -> bool {
        self.sessions
            .get(uid)
            .is_some_and(|s| now.saturating_duration_since(s.last_seen) < self.ttl)
    }

    /// Time left before `uid` becomes purge-eligible.
    pub fn remaining_window(&self, uid: &str, now: Instant) -> Duration {
        self.sessions
            .get(uid)
            .map(|s| self.ttl.saturating_sub(now.saturating_duration_since(s.last_seen)))
            .unwrap_or_default()
    }

    /// Remove sessions unseen for more than the TTL. Pairings that name a
    /// removed session are cleared. Returns the purged UIDs.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > ttl)
            .map(|s| s.uid.clone())
            .collect();

        for uid in &expired {
            self.unpair(uid);
            self.sessions.remove(uid);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn create_starts_unset() {
        let mut store = SessionStore::default();
        let now = Instant::now();
        let session = store.create("A1B2C3D4", None, now);
        assert_eq!(session.uid, "A1B2C3D4");
        assert!(session.role.is_none());
        assert!(session.paired_with.is_none());
        assert_eq!(session.last_seen, now);
    }

    #[test]
    fn set_role_updates_last_seen() {
        let mut store = SessionStore::default();
        let t0 = Instant::now();
        store.create("A1B2C3D4", None, t0);
        let t1 = t0 + Duration::from_secs(5);
        assert!(store.set_role("A1B2C3D4", Role::Asker, t1));
        let s = store.get("A1B2C3D4").unwrap();
        assert_eq!(s.role, Some(Role::Asker));
        assert_eq!(s.last_seen, t1);
        assert!(!store.set_role("FFFFFFFF", Role::Asker, t1));
    }

    #[test]
    fn pairing_is_symmetric() {
        let mut store = SessionStore::default();
        let now = Instant::now();
        store.create("AAAAAAAA", None, now);
        store.create("BBBBBBBB", None, now);
        assert!(store.set_pairing("BBBBBBBB", "AAAAAAAA", now));
        assert_eq!(
            store.get("AAAAAAAA").unwrap().paired_with.as_deref(),
            Some("BBBBBBBB")
        );
        assert_eq!(
            store.get("BBBBBBBB").unwrap().paired_with.as_deref(),
            Some("AAAAAAAA")
        );
    }

    #[test]
    fn repairing_unlinks_previous_partner() {
        let mut store = SessionStore::default();
        let now = Instant::now();
        for uid in ["ASKER001", "HELPER01", "HELPER02"] {
            store.create(uid, None, now);
        }
        store.set_pairing("HELPER01", "ASKER001", now);
        store.set_pairing("HELPER02", "ASKER001", now);

        assert!(store.get("HELPER01").unwrap().paired_with.is_none());
        assert_eq!(
            store.get("ASKER001").unwrap().paired_with.as_deref(),
            Some("HELPER02")
        );
    }

    #[test]
    fn pairing_rejects_self_and_unknown() {
        let mut store = SessionStore::default();
        let now = Instant::now();
        store.create("AAAAAAAA", None, now);
        assert!(!store.set_pairing("AAAAAAAA", "AAAAAAAA", now));
        assert!(!store.set_pairing("AAAAAAAA", "CCCCCCCC", now));
        assert!(store.get("AAAAAAAA").unwrap().paired_with.is_none());
    }

    #[test]
    fn resumable_only_inside_ttl() {
        let mut store = SessionStore::new(minutes(30));
        let t0 = Instant::now();
        store.create("AAAAAAAA", None, t0);
        assert!(store.is_resumable("AAAAAAAA", t0 + minutes(29)));
        assert!(!store.is_resumable("AAAAAAAA", t0 + minutes(30)));
        assert!(!store.is_resumable("AAAAAAAA", t0 + minutes(31)));
        assert!(!store.is_resumable("BBBBBBBB", t0));
    }

    #[test]
    fn purge_removes_only_expired_and_clears_dangling_pairing() {
        let mut store = SessionStore::new(minutes(30));
        let t0 = Instant::now();
        store.create("OLDASKER", None, t0);
        store.create("NEWHELPR", None, t0);
        store.set_pairing("NEWHELPR", "OLDASKER", t0);
        store.touch("NEWHELPR", t0 + minutes(20));

        let purged = store.purge_expired(t0 + minutes(31));
        assert_eq!(purged, vec!["OLDASKER".to_string()]);
        assert!(!store.contains("OLDASKER"));
        let helper = store.get("NEWHELPR").unwrap();
        assert!(helper.paired_with.is_none());
    }

    #[test]
    fn purge_keeps_sessions_exactly_at_ttl() {
        let mut store = SessionStore::new(minutes(30));
        let t0 = Instant::now();
        store.create("AAAAAAAA", None, t0);
        assert!(store.purge_expired(t0 + minutes(30)).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remaining_window_counts_down() {
        let mut store = SessionStore::new(minutes(30));
        let t0 = Instant::now();
        store.create("AAAAAAAA", None, t0);
        assert_eq!(store.remaining_window("AAAAAAAA", t0), minutes(30));
        assert_eq!(store.remaining_window("AAAAAAAA", t0 + minutes(10)), minutes(20));
        assert_eq!(store.remaining_window("AAAAAAAA", t0 + minutes(40)), Duration::ZERO);
    }

    #[test]
    fn role_parses_only_known_values() {
        assert_eq!("asker".parse::<Role>(), Ok(Role::Asker));
        assert_eq!("helper".parse::<Role>(), Ok(Role::Helper));
        assert!("Helper".parse::<Role>().is_err());
        assert!("observer".parse::<Role>().is_err());
    }
}
