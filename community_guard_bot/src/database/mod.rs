use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
pub use sqlx::Error;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Row, Sqlite,
};
use teloxide::types::{ChatId, MessageId, UserId};

use crate::{
    settings::ModerationSettings,
    types::{GroupEntry, JoinTracker, TrackedJoin},
};

type Pool = sqlx::Pool<Sqlite>;
const DB_PATH: &str = "sqlite:community_guard.sqlite";

/// How many messages per (user, chat) the message log keeps around.
/// Anti-spam and anti-flood only ever look at the tail.
const MESSAGE_LOG_DEPTH: u32 = 20;

pub struct Database {
    pool: Pool,
}

impl Database {
    pub async fn new() -> Result<Arc<Database>, Error> {
        let options = SqliteConnectOptions::from_str(DB_PATH)
            .map_err(|e| Error::Configuration(Box::new(e)))?
            .create_if_missing(true)
            .pragma("cache_size", "-32768")
            .busy_timeout(std::time::Duration::from_secs(600));

        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// An isolated throwaway database, for tests.
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Arc<Database>, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Configuration(Box::new(e)))?;

        // One connection, or every connection gets its own empty memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool) -> Result<Arc<Database>, Error> {
        // Do some init. Create the tables...

        // GROUPS: the registry mapping a chat to its owning community.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS groups (
                    chat_id INTEGER PRIMARY KEY NOT NULL,
                    community_id TEXT NOT NULL,
                    chat_name TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1
                ) STRICT;",
        ))
        .await?;

        // SETTINGS: one JSON document per community. Typed structs with
        // defaults on the Rust side; see `crate::settings`.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS settings (
                    community_id TEXT PRIMARY KEY NOT NULL,
                    document TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        // JOIN TRACKERS: one row per (user, community), with the joined
        // groups as child rows.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS join_trackers (
                    user_id INTEGER NOT NULL,
                    community_id TEXT NOT NULL,
                    is_reported INTEGER NOT NULL DEFAULT 0,
                    is_suspicious INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (user_id, community_id)
                ) STRICT;",
        ))
        .await?;

        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS tracker_joins (
                    user_id INTEGER NOT NULL,
                    community_id TEXT NOT NULL,
                    group_id INTEGER NOT NULL,
                    group_name TEXT NOT NULL,
                    joined_at TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        // WARNINGS: append-only; expiry is applied at query time.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS warnings (
                    community_id TEXT NOT NULL,
                    user_id INTEGER NOT NULL,
                    reason TEXT NOT NULL,
                    issued_by INTEGER NOT NULL,
                    group_id INTEGER NOT NULL,
                    issued_at TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        // MESSAGE LOG: recent messages per (user, chat), trimmed on insert.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS message_log (
                    user_id INTEGER NOT NULL,
                    chat_id INTEGER NOT NULL,
                    community_id TEXT NOT NULL,
                    message_id INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    sent_at TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        // AUTO-DELETE QUEUE: drained by the sweeper task.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS auto_delete_queue (
                    community_id TEXT NOT NULL,
                    chat_id INTEGER NOT NULL,
                    message_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    delete_at TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        Ok(Arc::new(Database { pool }))
    }

    // ------------------------------------------------------------------
    // Group registry
    // ------------------------------------------------------------------

    /// Register a group into a community, or re-point it if it's already
    /// registered.
    pub async fn register_group(
        &self,
        chat_id: ChatId,
        community_id: &str,
        chat_name: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO groups(chat_id, community_id, chat_name, is_active)
            VALUES (?, ?, ?, 1)
        ON CONFLICT DO
            UPDATE SET community_id=?, chat_name=?, is_active=1;",
        )
        .bind(chat_id.0)
        .bind(community_id)
        .bind(chat_name)
        .bind(community_id)
        .bind(chat_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deactivate a group. Kept around rather than deleted so that
    /// re-registering restores it.
    pub async fn unregister_group(&self, chat_id: ChatId) -> Result<(), Error> {
        sqlx::query("UPDATE groups SET is_active=0 WHERE chat_id=?;")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Look up the group entry for a chat, active or not.
    pub async fn get_group(&self, chat_id: ChatId) -> Result<Option<GroupEntry>, Error> {
        sqlx::query("SELECT chat_id, community_id, chat_name, is_active FROM groups WHERE chat_id=?;")
            .bind(chat_id.0)
            .map(group_from_row)
            .fetch_optional(&self.pool)
            .await
    }

    /// All active groups of a community.
    pub async fn community_groups(&self, community_id: &str) -> Result<Vec<GroupEntry>, Error> {
        sqlx::query(
            "SELECT chat_id, community_id, chat_name, is_active FROM groups
            WHERE community_id=? AND is_active=1;",
        )
        .bind(community_id)
        .map(group_from_row)
        .fetch_all(&self.pool)
        .await
    }

    // ------------------------------------------------------------------
    // Moderation settings
    // ------------------------------------------------------------------

    /// Fetch a community's settings. A missing row means defaults; a row
    /// that no longer parses also falls back to defaults, loudly.
    pub async fn get_settings(&self, community_id: &str) -> Result<ModerationSettings, Error> {
        let document: Option<String> =
            sqlx::query("SELECT document FROM settings WHERE community_id=?;")
                .bind(community_id)
                .map(|row: SqliteRow| row.get("document"))
                .fetch_optional(&self.pool)
                .await?;

        let Some(document) = document else {
            return Ok(ModerationSettings::default());
        };

        match serde_json::from_str(&document) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::error!("Unreadable settings for community {community_id}: {e}");
                Ok(ModerationSettings::default())
            }
        }
    }

    pub async fn set_settings(
        &self,
        community_id: &str,
        settings: &ModerationSettings,
    ) -> Result<(), Error> {
        let document =
            serde_json::to_string(settings).map_err(|e| Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO settings(community_id, document)
            VALUES (?, ?)
        ON CONFLICT DO
            UPDATE SET document=?;",
        )
        .bind(community_id)
        .bind(&document)
        .bind(&document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Join trackers
    // ------------------------------------------------------------------

    pub async fn get_tracker(
        &self,
        user_id: UserId,
        community_id: &str,
    ) -> Result<Option<JoinTracker>, Error> {
        let flags: Option<(bool, bool)> = sqlx::query(
            "SELECT is_reported, is_suspicious FROM join_trackers
            WHERE user_id=? AND community_id=?;",
        )
        .bind(user_id.0 as i64)
        .bind(community_id)
        .map(|row: SqliteRow| (row.get("is_reported"), row.get("is_suspicious")))
        .fetch_optional(&self.pool)
        .await?;

        let Some((is_reported, is_suspicious)) = flags else {
            return Ok(None);
        };

        let joins = sqlx::query(
            "SELECT group_id, group_name, joined_at FROM tracker_joins
            WHERE user_id=? AND community_id=? ORDER BY joined_at;",
        )
        .bind(user_id.0 as i64)
        .bind(community_id)
        .map(|row: SqliteRow| TrackedJoin {
            group_id: ChatId(row.get("group_id")),
            group_name: row.get("group_name"),
            joined_at: row.get::<DateTime<Utc>, _>("joined_at"),
        })
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(JoinTracker {
            user_id,
            community_id: community_id.to_string(),
            joins,
            is_reported,
            is_suspicious,
        }))
    }

    /// Write a tracker back, joins and all. The caller holds the per-user
    /// lock, so blowing away the child rows and reinserting is safe.
    pub async fn save_tracker(&self, tracker: &JoinTracker) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO join_trackers(user_id, community_id, is_reported, is_suspicious)
            VALUES (?, ?, ?, ?)
        ON CONFLICT DO
            UPDATE SET is_reported=?, is_suspicious=?;",
        )
        .bind(tracker.user_id.0 as i64)
        .bind(&tracker.community_id)
        .bind(tracker.is_reported)
        .bind(tracker.is_suspicious)
        .bind(tracker.is_reported)
        .bind(tracker.is_suspicious)
        .execute(&mut *transaction)
        .await?;

        sqlx::query("DELETE FROM tracker_joins WHERE user_id=? AND community_id=?;")
            .bind(tracker.user_id.0 as i64)
            .bind(&tracker.community_id)
            .execute(&mut *transaction)
            .await?;

        for join in &tracker.joins {
            sqlx::query(
                "INSERT INTO tracker_joins(user_id, community_id, group_id, group_name, joined_at)
                VALUES (?, ?, ?, ?, ?);",
            )
            .bind(tracker.user_id.0 as i64)
            .bind(&tracker.community_id)
            .bind(join.group_id.0)
            .bind(&join.group_name)
            .bind(join.joined_at)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await
    }

    pub async fn delete_tracker(&self, user_id: UserId, community_id: &str) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query("DELETE FROM join_trackers WHERE user_id=? AND community_id=?;")
            .bind(user_id.0 as i64)
            .bind(community_id)
            .execute(&mut *transaction)
            .await?;
        sqlx::query("DELETE FROM tracker_joins WHERE user_id=? AND community_id=?;")
            .bind(user_id.0 as i64)
            .bind(community_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await
    }

    // ------------------------------------------------------------------
    // Warnings
    // ------------------------------------------------------------------

    pub async fn add_warning(
        &self,
        community_id: &str,
        user_id: UserId,
        reason: &str,
        issued_by: UserId,
        group_id: ChatId,
        issued_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO warnings(community_id, user_id, reason, issued_by, group_id, issued_at)
            VALUES (?, ?, ?, ?, ?, ?);",
        )
        .bind(community_id)
        .bind(user_id.0 as i64)
        .bind(reason)
        .bind(issued_by.0 as i64)
        .bind(group_id.0)
        .bind(issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// How many of a user's warnings still count, given the expiry window.
    pub async fn active_warning_count(
        &self,
        community_id: &str,
        user_id: UserId,
        expiry_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, Error> {
        let cutoff = now - TimeDelta::seconds(i64::from(expiry_secs));
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM warnings
            WHERE community_id=? AND user_id=? AND issued_at > ?;",
        )
        .bind(community_id)
        .bind(user_id.0 as i64)
        .bind(cutoff)
        .map(|row: SqliteRow| row.get("n"))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    /// Record a message and trim the per-(user, chat) log to its depth.
    pub async fn log_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        community_id: &str,
        message_id: MessageId,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO message_log(user_id, chat_id, community_id, message_id, body, sent_at)
            VALUES (?, ?, ?, ?, ?, ?);",
        )
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(community_id)
        .bind(message_id.0)
        .bind(body)
        .bind(sent_at)
        .execute(&mut *transaction)
        .await?;

        sqlx::query(
            "DELETE FROM message_log WHERE user_id=? AND chat_id=? AND rowid NOT IN (
                SELECT rowid FROM message_log WHERE user_id=? AND chat_id=?
                ORDER BY rowid DESC LIMIT ?
            );",
        )
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(MESSAGE_LOG_DEPTH)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await
    }

    /// How many logged messages a user sent in this chat within the window.
    pub async fn recent_message_count(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        window_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, Error> {
        let cutoff = now - TimeDelta::seconds(i64::from(window_secs));
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM message_log
            WHERE user_id=? AND chat_id=? AND sent_at > ?;",
        )
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(cutoff)
        .map(|row: SqliteRow| row.get("n"))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    /// The bodies of the user's most recent messages in this chat,
    /// newest first.
    pub async fn last_message_bodies(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        limit: u32,
    ) -> Result<Vec<String>, Error> {
        sqlx::query(
            "SELECT body FROM message_log WHERE user_id=? AND chat_id=?
            ORDER BY rowid DESC LIMIT ?;",
        )
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(limit)
        .map(|row: SqliteRow| row.get("body"))
        .fetch_all(&self.pool)
        .await
    }

    /// Message IDs of the user's most recent messages in this chat,
    /// newest first. Used to sweep up a spam burst.
    pub async fn last_message_ids(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        limit: u32,
    ) -> Result<Vec<MessageId>, Error> {
        sqlx::query(
            "SELECT message_id FROM message_log WHERE user_id=? AND chat_id=?
            ORDER BY rowid DESC LIMIT ?;",
        )
        .bind(user_id.0 as i64)
        .bind(chat_id.0)
        .bind(limit)
        .map(|row: SqliteRow| MessageId(row.get("message_id")))
        .fetch_all(&self.pool)
        .await
    }

    // ------------------------------------------------------------------
    // Auto-delete queue
    // ------------------------------------------------------------------

    pub async fn enqueue_deletion(
        &self,
        community_id: &str,
        chat_id: ChatId,
        message_id: MessageId,
        user_id: UserId,
        delete_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO auto_delete_queue(community_id, chat_id, message_id, user_id, delete_at)
            VALUES (?, ?, ?, ?, ?);",
        )
        .bind(community_id)
        .bind(chat_id.0)
        .bind(message_id.0)
        .bind(user_id.0 as i64)
        .bind(delete_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Everything whose time has come, as (queue row, chat, message).
    pub async fn due_deletions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(i64, ChatId, MessageId)>, Error> {
        sqlx::query(
            "SELECT rowid, chat_id, message_id FROM auto_delete_queue WHERE delete_at <= ?;",
        )
        .bind(now)
        .map(|row: SqliteRow| {
            (
                row.get::<i64, _>("rowid"),
                ChatId(row.get("chat_id")),
                MessageId(row.get("message_id")),
            )
        })
        .fetch_all(&self.pool)
        .await
    }

    pub async fn deletion_done(&self, rowid: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM auto_delete_queue WHERE rowid=?;")
            .bind(rowid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn group_from_row(row: SqliteRow) -> GroupEntry {
    GroupEntry {
        chat_id: ChatId(row.get("chat_id")),
        community_id: row.get("community_id"),
        chat_name: row.get("chat_name"),
        is_active: row.get("is_active"),
    }
}
