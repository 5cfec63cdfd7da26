use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use guard_bot_commons::BotGuardSendMsg;
use teloxide::{
    prelude::*,
    types::{ChatPermissions, MessageId, Recipient},
    Bot, RequestError,
};

use crate::{
    database::Database,
    misc::parse_report_destination,
    types::ModAction,
};

/// Pause between outbound calls when punishing a user across several
/// groups, so a big community doesn't trip Telegram's rate limiter.
pub const GROUP_CALL_PACING: Duration = Duration::from_secs(1);

/// How long a multi-join mute lasts. Far-future on purpose: an admin is
/// expected to review the report and lift it manually.
pub const VIOLATION_MUTE_DAYS: i64 = 20;

/// How long a bot notice that shouldn't linger stays up.
pub const EPHEMERAL_NOTICE_SECS: u32 = 5;

/// The few outbound Telegram calls moderation needs, as a seam so tests
/// can substitute a recording fake for the real [`Bot`].
pub trait ModerationApi: Send + Sync {
    /// Send an HTML-formatted message, returning the sent message's ID.
    fn send_html(
        &self,
        to_where: Recipient,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> impl Future<Output = Result<MessageId, RequestError>> + Send;

    fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;

    fn restrict_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        permissions: ChatPermissions,
        until: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;

    fn ban_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;

    fn unban_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}

impl ModerationApi for Bot {
    async fn send_html(
        &self,
        to_where: Recipient,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, RequestError> {
        self.guard_send_html(to_where, text, reply_to)
            .await
            .map(|message| message.id)
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), RequestError> {
        Requester::delete_message(self, chat_id, message_id).await?;
        Ok(())
    }

    async fn restrict_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        permissions: ChatPermissions,
        until: DateTime<Utc>,
    ) -> Result<(), RequestError> {
        use teloxide::payloads::RestrictChatMemberSetters;
        self.restrict_chat_member(chat_id, user_id, permissions)
            .until_date(until)
            .await?;
        Ok(())
    }

    async fn ban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), RequestError> {
        self.ban_chat_member(chat_id, user_id).await?;
        Ok(())
    }

    async fn unban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), RequestError> {
        self.unban_chat_member(chat_id, user_id).await?;
        Ok(())
    }
}

/// Mute a user (no sending anything) in one chat until the given time.
pub async fn mute_member(
    api: &impl ModerationApi,
    chat_id: ChatId,
    user_id: UserId,
    until: DateTime<Utc>,
) -> Result<(), RequestError> {
    api.restrict_member(chat_id, user_id, ChatPermissions::empty(), until)
        .await
}

/// Kick: a removal the user can recover from. Ban, then immediately lift
/// the ban so they may be re-invited.
pub async fn kick_member(
    api: &impl ModerationApi,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(), RequestError> {
    api.ban_member(chat_id, user_id).await?;
    api.unban_member(chat_id, user_id).await
}

/// Apply one action to one user in every listed group, pacing the calls
/// and isolating per-group failures: the bot not being admin in one group
/// must not spare the user in the rest.
///
/// `Warn` and `Report` involve no membership change and are the caller's
/// business; here they are no-ops.
pub async fn punish_across_groups(
    api: &impl ModerationApi,
    groups: &[(ChatId, String)],
    user_id: UserId,
    action: ModAction,
    mute_until: DateTime<Utc>,
) {
    if matches!(action, ModAction::Warn | ModAction::Report) {
        return;
    }

    let mut first = true;
    for (chat_id, group_name) in groups {
        if !first {
            tokio::time::sleep(GROUP_CALL_PACING).await;
        }
        first = false;

        let result = match action {
            ModAction::Mute => mute_member(api, *chat_id, user_id, mute_until).await,
            ModAction::Kick => kick_member(api, *chat_id, user_id).await,
            ModAction::Ban => api.ban_member(*chat_id, user_id).await,
            ModAction::Warn | ModAction::Report => unreachable!(),
        };

        if let Err(e) = result {
            // Probably missing rights there. Move on to the next group.
            log::warn!("Failed to {action} user {user_id} in {group_name} ({chat_id}): {e}");
        }
    }
}

/// Send an alert to the community's report channel, if one is configured.
/// Reporting is best-effort: failure to deliver is logged and swallowed,
/// and must never block the moderation action itself.
pub async fn send_report(api: &impl ModerationApi, report_channel: &str, text: &str) {
    let Some(destination) = parse_report_destination(report_channel) else {
        return;
    };

    if let Err(e) = api.send_html(destination, text, None).await {
        log::error!("Failed to deliver report: {e}");
    }
}

/// Post a notice that cleans itself up: sent now, queued for deletion a
/// few seconds later by the sweeper.
pub async fn send_ephemeral_notice(
    api: &impl ModerationApi,
    database: &Database,
    community_id: &str,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
) {
    let message_id = match api.send_html(Recipient::Id(chat_id), text, reply_to).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Failed to send notice in {chat_id}: {e}");
            return;
        }
    };

    let delete_at = Utc::now() + TimeDelta::seconds(i64::from(EPHEMERAL_NOTICE_SECS));
    if let Err(e) = database
        .enqueue_deletion(community_id, chat_id, message_id, UserId(0), delete_at)
        .await
    {
        log::error!("Database error queueing notice deletion: {e}");
    }
}

/// How often the auto-delete queue gets swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Delete everything in the queue that's overdue. Messages that are
/// already gone (or otherwise undeletable) still leave the queue, or
/// they'd clog it forever.
pub async fn sweep_due_deletions(api: &impl ModerationApi, database: &Database, now: DateTime<Utc>) {
    let due = match database.due_deletions(now).await {
        Ok(due) => due,
        Err(e) => {
            log::error!("Database error reading the auto-delete queue: {e}");
            return;
        }
    };

    for (rowid, chat_id, message_id) in due {
        if let Err(e) = api.delete_message(chat_id, message_id).await {
            log::debug!("Couldn't auto-delete {message_id:?} in {chat_id}: {e}");
        }
        if let Err(e) = database.deletion_done(rowid).await {
            log::error!("Database error dequeueing deletion: {e}");
            return;
        }
    }
}

pub async fn auto_delete_spinloop(bot: Bot, database: std::sync::Weak<Database>) {
    loop {
        let Some(database) = database.upgrade() else {
            // No more database!
            return;
        };

        sweep_due_deletions(&bot, &database, Utc::now()).await;

        drop(database);
        tokio::time::sleep(SWEEP_INTERVAL).await;
    }
}

#[cfg(test)]
pub(crate) mod test_api {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum ApiCall {
        SentHtml { to: Recipient, text: String },
        Deleted(ChatId, MessageId),
        Restricted { chat: ChatId, user: UserId, until: DateTime<Utc> },
        Banned(ChatId, UserId),
        Unbanned(ChatId, UserId),
    }

    /// A [`ModerationApi`] that records everything and can be told to
    /// fail membership calls for specific chats.
    #[derive(Default)]
    pub struct RecordingApi {
        pub calls: Mutex<Vec<ApiCall>>,
        pub fail_chats: Mutex<HashSet<ChatId>>,
    }

    impl RecordingApi {
        pub fn fail_in(&self, chat_id: ChatId) {
            self.fail_chats.lock().unwrap().insert(chat_id);
        }

        pub fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sent_texts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    ApiCall::SentHtml { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: ApiCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn check(&self, chat_id: ChatId) -> Result<(), RequestError> {
            if self.fail_chats.lock().unwrap().contains(&chat_id) {
                // Close enough to "bot has no rights there".
                Err(RequestError::Api(teloxide::ApiError::Unknown(
                    "Bad Request: not enough rights".to_string(),
                )))
            } else {
                Ok(())
            }
        }
    }

    impl ModerationApi for RecordingApi {
        async fn send_html(
            &self,
            to_where: Recipient,
            text: &str,
            _reply_to: Option<MessageId>,
        ) -> Result<MessageId, RequestError> {
            if let Recipient::Id(chat_id) = to_where {
                self.check(chat_id)?;
            }
            self.record(ApiCall::SentHtml {
                to: to_where,
                text: text.to_string(),
            });
            Ok(MessageId(1))
        }

        async fn delete_message(
            &self,
            chat_id: ChatId,
            message_id: MessageId,
        ) -> Result<(), RequestError> {
            self.check(chat_id)?;
            self.record(ApiCall::Deleted(chat_id, message_id));
            Ok(())
        }

        async fn restrict_member(
            &self,
            chat_id: ChatId,
            user_id: UserId,
            _permissions: ChatPermissions,
            until: DateTime<Utc>,
        ) -> Result<(), RequestError> {
            self.check(chat_id)?;
            self.record(ApiCall::Restricted {
                chat: chat_id,
                user: user_id,
                until,
            });
            Ok(())
        }

        async fn ban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), RequestError> {
            self.check(chat_id)?;
            self.record(ApiCall::Banned(chat_id, user_id));
            Ok(())
        }

        async fn unban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), RequestError> {
            self.check(chat_id)?;
            self.record(ApiCall::Unbanned(chat_id, user_id));
            Ok(())
        }
    }
}
