use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use teloxide::types::{ChatId, UserId};

/// What to do to a user once some rule trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModAction {
    Warn,
    Mute,
    Kick,
    Ban,
    Report,
}

impl ModAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ModAction::Warn => "warn",
            ModAction::Mute => "mute",
            ModAction::Kick => "kick",
            ModAction::Ban => "ban",
            ModAction::Report => "report",
        }
    }
}

impl Display for ModAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions for the banned words filter. Same as [`ModAction`], except
/// deleting the message may be the whole punishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordFilterAction {
    Delete,
    Warn,
    Mute,
    Kick,
    Ban,
}

/// A group registered into a community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub chat_id: ChatId,
    pub community_id: String,
    pub chat_name: String,
    pub is_active: bool,
}

/// One group a user recently joined, as remembered by a [`JoinTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJoin {
    pub group_id: ChatId,
    pub group_name: String,
    pub joined_at: DateTime<Utc>,
}

/// Accumulates one user's recent joins across the groups of one community.
///
/// The in-memory bookkeeping lives here; loading and storing is the
/// database's business. Callers are expected to hold the per-user lock
/// while mutating and persisting one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTracker {
    pub user_id: UserId,
    pub community_id: String,
    pub joins: Vec<TrackedJoin>,
    pub is_reported: bool,
    pub is_suspicious: bool,
}

impl JoinTracker {
    pub fn new(user_id: UserId, community_id: impl Into<String>) -> Self {
        JoinTracker {
            user_id,
            community_id: community_id.into(),
            joins: Vec::new(),
            is_reported: false,
            is_suspicious: false,
        }
    }

    /// Drop every join older than `window_secs` before `now`.
    /// Must run before any threshold check, so that stale joins
    /// never count toward a violation.
    pub fn prune(&mut self, now: DateTime<Utc>, window_secs: u32) {
        let cutoff = now - TimeDelta::seconds(i64::from(window_secs));
        self.joins.retain(|join| join.joined_at > cutoff);
    }

    /// Record a join into a group. Returns `false` if the group is already
    /// in the list; Telegram happily delivers duplicate membership updates,
    /// and one group must never count twice.
    pub fn record_join(
        &mut self,
        group_id: ChatId,
        group_name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if self.joins.iter().any(|join| join.group_id == group_id) {
            return false;
        }
        self.joins.push(TrackedJoin {
            group_id,
            group_name: group_name.to_string(),
            joined_at: now,
        });
        true
    }

    /// Remove every entry for this group. All of them, not just the first;
    /// trackers written before the dedup guard existed may hold duplicates,
    /// and cleanup has to cope with that. Returns how many were dropped.
    pub fn remove_group(&mut self, group_id: ChatId) -> usize {
        let before = self.joins.len();
        self.joins.retain(|join| join.group_id != group_id);
        before - self.joins.len()
    }

    /// A tracker with nothing in it carries no meaning and should be
    /// deleted from the database.
    pub fn is_drained(&self) -> bool {
        self.joins.is_empty()
    }
}
