pub mod typing;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use super::MemberId;
use super::error::{read, write};

// --- Snapshot ---

/// One connection's presence record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceRecord {
    pub nickname: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    at: Option<f64>,
}

impl From<RawRecord> for PresenceRecord {
    fn from(raw: RawRecord) -> Self {
        Self {
            nickname: raw.nickname,
            at: raw
                .at
                .filter(|millis| millis.is_finite())
                .and_then(|millis| DateTime::from_timestamp_millis(millis as i64)),
        }
    }
}

/// Full presence state of a room: member id -> one record per live connection.
///
/// Always a replacement, never a delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    members: HashMap<MemberId, Vec<PresenceRecord>>,
}

impl PresenceSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a transport `sync` payload.
    ///
    /// The payload comes from other clients, so any shape violation yields an
    /// empty snapshot ("nobody online") instead of an error.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value::<HashMap<String, Vec<RawRecord>>>(value.clone()) {
            Ok(raw) => Self::from_records(raw.into_iter().map(|(id, records)| {
                (id, records.into_iter().map(PresenceRecord::from).collect())
            })),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed presence snapshot, treating as empty");
                Self::empty()
            }
        }
    }

    /// Builds a snapshot from `(member, records)` pairs. Members without a
    /// single record are not present and are dropped.
    pub fn from_records<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<PresenceRecord>)>,
        K: Into<MemberId>,
    {
        let members = entries
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(id, records)| (id.into(), records))
            .collect();
        Self { members }
    }

    /// Snapshot where each listed member has one bare connection.
    pub fn with_members<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<MemberId>,
    {
        Self::from_records(
            members
                .into_iter()
                .map(|id| (id, vec![PresenceRecord::default()])),
        )
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &MemberId> {
        self.members.keys()
    }

    pub fn records(&self, member_id: &str) -> Option<&[PresenceRecord]> {
        self.members.get(member_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// --- Tracker ---

/// A present member as shown in the room roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OnlineMember {
    pub member_id: MemberId,
    /// Nickname from the member's most recent record.
    pub nickname: Option<String>,
    /// Timestamp of the most recent record; a record without one counts as
    /// active now.
    pub last_active_at: DateTime<Utc>,
    /// Number of simultaneous connections (tabs) the member holds.
    pub connections: usize,
}

impl OnlineMember {
    fn from_records(member_id: &MemberId, records: &[PresenceRecord], now: DateTime<Utc>) -> Self {
        let last = records.last();
        Self {
            member_id: member_id.clone(),
            nickname: last.and_then(|r| r.nickname.clone()),
            last_active_at: last.and_then(|r| r.at).unwrap_or(now),
            connections: records.len(),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    online: HashMap<MemberId, OnlineMember>,
    disposed: bool,
}

/// Authoritative "who is online" set for one room.
#[derive(Debug)]
pub struct PresenceTracker {
    local_member: MemberId,
    state: RwLock<TrackerState>,
}

impl PresenceTracker {
    pub fn new(local_member: MemberId) -> Self {
        Self {
            local_member,
            state: RwLock::new(TrackerState::default()),
        }
    }

    /// Replaces the online set with the members of `snapshot`.
    pub fn on_snapshot(&self, snapshot: &PresenceSnapshot) {
        let mut state = write(&self.state);
        if state.disposed {
            tracing::trace!(member_id = %self.local_member, "Snapshot after dispose ignored");
            return;
        }
        let now = Utc::now();
        state.online = snapshot
            .members
            .iter()
            .map(|(id, records)| (id.clone(), OnlineMember::from_records(id, records, now)))
            .collect();
        tracing::debug!(
            member_id = %self.local_member,
            online = state.online.len(),
            "Applied presence snapshot"
        );
    }

    pub fn is_online(&self, member_id: &str) -> bool {
        read(&self.state).online.contains_key(member_id)
    }

    pub fn online_members(&self) -> HashSet<MemberId> {
        read(&self.state).online.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        read(&self.state).online.len()
    }

    /// Whether the local member's own connection shows up in the last snapshot.
    pub fn includes_self(&self) -> bool {
        self.is_online(self.local_member.as_str())
    }

    /// Present members, most recently active first.
    pub fn roster(&self) -> Vec<OnlineMember> {
        let mut roster: Vec<OnlineMember> = read(&self.state).online.values().cloned().collect();
        roster.sort_by(|a, b| {
            b.last_active_at
                .cmp(&a.last_active_at)
                .then_with(|| a.member_id.cmp(&b.member_id))
        });
        roster
    }

    /// Clears the online set. Snapshots delivered afterwards are ignored.
    pub fn dispose(&self) {
        let mut state = write(&self.state);
        state.disposed = true;
        state.online.clear();
    }

    pub fn is_disposed(&self) -> bool {
        read(&self.state).disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(tracker: &PresenceTracker) -> Vec<String> {
        let mut ids: Vec<String> = tracker
            .online_members()
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn snapshot_replaces_instead_of_merging() {
        let tracker = PresenceTracker::new("me".into());
        tracker.on_snapshot(&PresenceSnapshot::with_members(["a", "b", "c"]));
        tracker.on_snapshot(&PresenceSnapshot::with_members(["c", "d"]));
        assert_eq!(ids(&tracker), vec!["c", "d"]);
    }

    #[test]
    fn empty_snapshot_clears_everyone() {
        let tracker = PresenceTracker::new("me".into());
        tracker.on_snapshot(&PresenceSnapshot::with_members(["a"]));
        tracker.on_snapshot(&PresenceSnapshot::empty());
        assert!(tracker.online_members().is_empty());
        assert!(!tracker.is_online("a"));
    }

    #[test]
    fn repeated_snapshot_is_idempotent() {
        let tracker = PresenceTracker::new("me".into());
        let snapshot = PresenceSnapshot::with_members(["a", "me"]);
        tracker.on_snapshot(&snapshot);
        tracker.on_snapshot(&snapshot);
        assert_eq!(ids(&tracker), vec!["a", "me"]);
        assert!(tracker.includes_self());
    }

    #[test]
    fn sync_payload_is_flattened_by_key() {
        let snapshot = PresenceSnapshot::from_value(&json!({
            "alice": [{ "nickname": "Al", "at": 1_000 }, { "nickname": "Alice", "at": 2_000 }],
            "bob": [{ "at": 1_500, "presence_ref": "x" }],
            "ghost": []
        }));
        let tracker = PresenceTracker::new("me".into());
        tracker.on_snapshot(&snapshot);

        assert_eq!(ids(&tracker), vec!["alice", "bob"]);
        let roster = tracker.roster();
        assert_eq!(roster[0].member_id.as_str(), "alice");
        assert_eq!(roster[0].nickname.as_deref(), Some("Alice"));
        assert_eq!(roster[0].connections, 2);
        assert_eq!(roster[1].member_id.as_str(), "bob");
        assert_eq!(roster[1].nickname, None);
    }

    #[test]
    fn record_without_timestamp_counts_as_active_now() {
        let snapshot = PresenceSnapshot::from_value(&json!({
            "old": [{ "at": 1_000 }],
            "fresh": [{ "nickname": "F" }]
        }));
        let tracker = PresenceTracker::new("me".into());
        let before = Utc::now();
        tracker.on_snapshot(&snapshot);

        let roster = tracker.roster();
        assert_eq!(roster[0].member_id.as_str(), "fresh");
        assert!(roster[0].last_active_at >= before);
        assert_eq!(roster[1].member_id.as_str(), "old");
    }

    #[test]
    fn malformed_payload_means_nobody_online() {
        let tracker = PresenceTracker::new("me".into());
        tracker.on_snapshot(&PresenceSnapshot::with_members(["a"]));

        for payload in [json!(null), json!([1, 2]), json!({ "a": "not-a-list" }), json!({ "a": [3] })] {
            let snapshot = PresenceSnapshot::from_value(&payload);
            assert!(snapshot.is_empty(), "{payload} should parse as empty");
            tracker.on_snapshot(&snapshot);
            assert!(tracker.online_members().is_empty());
        }
    }

    #[test]
    fn snapshot_after_dispose_is_ignored() {
        let tracker = PresenceTracker::new("me".into());
        tracker.on_snapshot(&PresenceSnapshot::with_members(["a"]));
        tracker.dispose();
        tracker.on_snapshot(&PresenceSnapshot::with_members(["b"]));
        assert!(tracker.online_members().is_empty());
        assert!(tracker.is_disposed());
    }
}
