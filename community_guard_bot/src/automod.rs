//! The message-level auto-moderation engine: banned words, anti-spam,
//! anti-flood, media restrictions, the warning system, new-user
//! restrictions and the auto-delete queue. All of it is settings-driven
//! bookkeeping; the interesting ordering lives in [`moderate`].

use chrono::{DateTime, TimeDelta, Utc};
use teloxide::types::{
    ChatId, ChatPermissions, Message, MessageEntityKind, MessageId, Recipient, User, UserId,
};

use crate::{
    actions::{
        kick_member, mute_member, punish_across_groups, send_ephemeral_notice, send_report,
        ModerationApi,
    },
    database::Database,
    misc::user_name_prettyprint,
    settings::{MediaRestrictions, ModerationSettings, NewUserRestrictions},
    types::{ModAction, WordFilterAction},
};

/// How many of the offender's recent messages get swept up when a spam
/// burst is punished.
const SPAM_SWEEP_DEPTH: u32 = 5;

/// How far back anti-flood looks for repeats.
const FLOOD_LOOKBEHIND: u32 = 10;

/// Fallback mute length when an action needs one and no setting applies.
const DEFAULT_MUTE_SECS: u32 = 3600;

/// Mute length when the warning system escalates.
const WARNING_MUTE_SECS: u32 = 86400;

/// The parts of a [`Message`] the engine actually looks at, pulled out
/// so tests don't have to construct whole Telegram payloads.
pub struct MessageCtx {
    pub chat_id: ChatId,
    pub chat_name: String,
    pub message_id: MessageId,
    pub user: User,
    pub text: String,
    pub media: MediaTraits,
}

/// Which kinds of restrictable content a message carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaTraits {
    pub has_photo: bool,
    pub has_video: bool,
    pub has_sticker: bool,
    pub has_gif: bool,
    pub has_document: bool,
    pub has_links: bool,
}

impl MessageCtx {
    /// Distill a Telegram message. Returns `None` for messages with no
    /// sender (channel posts and the like).
    pub fn of(message: &Message) -> Option<MessageCtx> {
        let user = message.from.clone()?;

        let has_links = message
            .entities()
            .map(|entities| {
                entities.iter().any(|e| {
                    matches!(
                        e.kind,
                        MessageEntityKind::Url | MessageEntityKind::TextLink { .. }
                    )
                })
            })
            .unwrap_or(false);

        Some(MessageCtx {
            chat_id: message.chat.id,
            chat_name: message.chat.title().unwrap_or("Unknown").to_string(),
            message_id: message.id,
            user,
            text: message
                .text()
                .or_else(|| message.caption())
                .unwrap_or_default()
                .to_string(),
            media: MediaTraits {
                has_photo: message.photo().is_some(),
                has_video: message.video().is_some(),
                has_sticker: message.sticker().is_some(),
                has_gif: message.animation().is_some(),
                has_document: message.document().is_some(),
                has_links,
            },
        })
    }
}

/// Case-insensitive substring match against the banned list.
pub fn contains_banned_word(text: &str, words: &[String]) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    words.iter().any(|word| lowered.contains(word.as_str()))
}

/// True if `text` appears at least `max_repeats` times among the recent
/// bodies (which already include the current message).
pub fn is_flood(recent_bodies: &[String], text: &str, max_repeats: u32) -> bool {
    if text.is_empty() {
        return false;
    }
    let repeats = recent_bodies.iter().filter(|body| *body == text).count();
    repeats >= max_repeats as usize
}

impl MediaRestrictions {
    /// Does this message carry anything the settings forbid?
    pub fn blocks(&self, traits: &MediaTraits) -> bool {
        (self.block_photos && traits.has_photo)
            || (self.block_videos && traits.has_video)
            || (self.block_stickers && traits.has_sticker)
            || (self.block_gifs && traits.has_gif)
            || (self.block_documents && traits.has_document)
            || (self.block_links && traits.has_links)
    }
}

/// Run a group message through every enabled filter, in order: banned
/// words, then anti-spam, then anti-flood, then media restrictions, then
/// the auto-delete queue. The first filter that trips handles the message
/// and ends the run. Admins are exempt from filters but not necessarily
/// from auto-delete.
pub async fn moderate(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    is_admin: bool,
    now: DateTime<Utc>,
) {
    let group = match database.get_group(ctx.chat_id).await {
        Ok(Some(group)) if group.is_active => group,
        Ok(_) => return,
        Err(e) => {
            log::error!("Database error resolving group {}: {e}", ctx.chat_id);
            return;
        }
    };
    let community_id = group.community_id.as_str();

    let settings = match database.get_settings(community_id).await {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Database error loading settings: {e}");
            return;
        }
    };

    if !is_admin {
        if settings.banned_words.enabled
            && contains_banned_word(&ctx.text, &settings.banned_words.words)
        {
            handle_banned_word(api, database, ctx, community_id, &settings, now).await;
            return;
        }

        if let Err(e) = database
            .log_message(
                ctx.user.id,
                ctx.chat_id,
                community_id,
                ctx.message_id,
                &ctx.text,
                now,
            )
            .await
        {
            log::error!("Database error logging message: {e}");
            return;
        }

        if settings.anti_spam.enabled {
            let recent = match database
                .recent_message_count(ctx.user.id, ctx.chat_id, settings.anti_spam.time_window, now)
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    log::error!("Database error counting messages: {e}");
                    return;
                }
            };
            if recent >= settings.anti_spam.max_messages {
                handle_spam(api, database, ctx, community_id, &settings, now).await;
                return;
            }
        }

        if settings.anti_flood.enabled {
            let bodies = match database
                .last_message_bodies(ctx.user.id, ctx.chat_id, FLOOD_LOOKBEHIND)
                .await
            {
                Ok(bodies) => bodies,
                Err(e) => {
                    log::error!("Database error reading message log: {e}");
                    return;
                }
            };
            if is_flood(&bodies, &ctx.text, settings.anti_flood.max_repeats) {
                handle_flood(api, database, ctx, community_id, &settings, now).await;
                return;
            }
        }

        if settings.media_restrictions.enabled && settings.media_restrictions.blocks(&ctx.media) {
            handle_restricted_media(api, database, ctx, community_id).await;
            return;
        }
    }

    if settings.auto_delete.enabled {
        let excluded_admin = settings.auto_delete.exclude_admins && is_admin;
        let targeted = settings.auto_delete.specific_users.is_empty()
            || settings.auto_delete.specific_users.contains(&ctx.user.id.0);
        if !excluded_admin && targeted {
            let delete_at = now + TimeDelta::seconds(i64::from(settings.auto_delete.delete_after));
            if let Err(e) = database
                .enqueue_deletion(community_id, ctx.chat_id, ctx.message_id, ctx.user.id, delete_at)
                .await
            {
                log::error!("Database error queueing auto-delete: {e}");
            }
        }
    }
}

async fn handle_banned_word(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    community_id: &str,
    settings: &ModerationSettings,
    now: DateTime<Utc>,
) {
    if let Err(e) = api.delete_message(ctx.chat_id, ctx.message_id).await {
        log::warn!("Failed to delete banned-word message in {}: {e}", ctx.chat_id);
    }

    let name = html_escape::encode_text(&ctx.user.first_name);
    let limit = settings.banned_words.warnings_before_punish;

    match settings.banned_words.action {
        WordFilterAction::Delete => {
            // Already gone; nothing more to do.
        }
        WordFilterAction::Warn => {
            if let Err(e) = database
                .add_warning(
                    community_id,
                    ctx.user.id,
                    "Used banned word",
                    UserId(0),
                    ctx.chat_id,
                    now,
                )
                .await
            {
                log::error!("Database error adding warning: {e}");
            }

            let count = database
                .active_warning_count(
                    community_id,
                    ctx.user.id,
                    settings.warning_system.warning_expiry,
                    now,
                )
                .await
                .unwrap_or(1);

            let text =
                format!("⚠️ {name}, that word is not allowed!\nWarnings: {count}/{limit}");
            send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;

            if count >= limit {
                if let Err(e) =
                    mute_member(api, ctx.chat_id, ctx.user.id, mute_until(now, DEFAULT_MUTE_SECS))
                        .await
                {
                    log::warn!("Failed to mute {} in {}: {e}", ctx.user.id, ctx.chat_id);
                }
            }
        }
        WordFilterAction::Mute => {
            if let Err(e) =
                mute_member(api, ctx.chat_id, ctx.user.id, mute_until(now, DEFAULT_MUTE_SECS)).await
            {
                log::warn!("Failed to mute {} in {}: {e}", ctx.user.id, ctx.chat_id);
            }
            let text = format!("🔇 {name} has been muted for using banned words.");
            send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;
        }
        WordFilterAction::Kick => {
            if let Err(e) = kick_member(api, ctx.chat_id, ctx.user.id).await {
                log::warn!("Failed to kick {} from {}: {e}", ctx.user.id, ctx.chat_id);
            }
            let text = format!("👢 {name} has been kicked for using banned words.");
            send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;
        }
        WordFilterAction::Ban => {
            if let Err(e) = api.ban_member(ctx.chat_id, ctx.user.id).await {
                log::warn!("Failed to ban {} from {}: {e}", ctx.user.id, ctx.chat_id);
            }
            let text = format!("🚫 {name} has been banned for using banned words.");
            send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;
        }
    }

    if settings.report_settings.enabled && settings.report_settings.auto_report_banned_words {
        let report = auto_report_text(ctx, "Used banned word", &ctx.text, community_id, now);
        send_report(api, &settings.report_settings.report_channel, &report).await;
    }
}

async fn handle_spam(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    community_id: &str,
    settings: &ModerationSettings,
    now: DateTime<Utc>,
) {
    // Sweep up the burst itself first.
    match database
        .last_message_ids(ctx.user.id, ctx.chat_id, SPAM_SWEEP_DEPTH)
        .await
    {
        Ok(ids) => {
            for message_id in ids {
                if let Err(e) = api.delete_message(ctx.chat_id, message_id).await {
                    log::debug!("Couldn't delete spam message {message_id:?}: {e}");
                }
            }
        }
        Err(e) => log::error!("Database error reading message log: {e}"),
    }

    let action = settings.anti_spam.action;
    apply_action_in_chat(
        api,
        database,
        ctx,
        community_id,
        settings,
        action,
        settings.anti_spam.mute_duration,
        now,
    )
    .await;

    let name = html_escape::encode_text(&ctx.user.first_name);
    let text = format!(
        "⚠️ {name} was detected spamming. Action: {}",
        action.as_str().to_uppercase()
    );
    send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;

    if settings.report_settings.enabled && settings.report_settings.auto_report_spam {
        let report = auto_report_text(
            ctx,
            "Spamming",
            "Multiple messages in short time",
            community_id,
            now,
        );
        send_report(api, &settings.report_settings.report_channel, &report).await;
    }
}

async fn handle_flood(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    community_id: &str,
    settings: &ModerationSettings,
    now: DateTime<Utc>,
) {
    if let Err(e) = api.delete_message(ctx.chat_id, ctx.message_id).await {
        log::warn!("Failed to delete flood message in {}: {e}", ctx.chat_id);
    }

    apply_action_in_chat(
        api,
        database,
        ctx,
        community_id,
        settings,
        settings.anti_flood.action,
        DEFAULT_MUTE_SECS,
        now,
    )
    .await;

    let name = html_escape::encode_text(&ctx.user.first_name);
    let text = format!("⚠️ {name}, stop repeating the same message!");
    send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;
}

async fn handle_restricted_media(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    community_id: &str,
) {
    if let Err(e) = api.delete_message(ctx.chat_id, ctx.message_id).await {
        log::warn!("Failed to delete restricted media in {}: {e}", ctx.chat_id);
    }

    let name = html_escape::encode_text(&ctx.user.first_name);
    let text = format!("⚠️ {name}, that type of media is not allowed in this group!");
    send_ephemeral_notice(api, database, community_id, ctx.chat_id, &text, None).await;
}

/// Apply one action to the offender in the chat where the offence
/// happened. `Warn` goes through the warning system and may escalate.
#[allow(clippy::too_many_arguments)]
pub async fn apply_action_in_chat(
    api: &impl ModerationApi,
    database: &Database,
    ctx: &MessageCtx,
    community_id: &str,
    settings: &ModerationSettings,
    action: ModAction,
    mute_secs: u32,
    now: DateTime<Utc>,
) {
    match action {
        ModAction::Warn => {
            if let Err(e) = database
                .add_warning(
                    community_id,
                    ctx.user.id,
                    "Auto-moderation",
                    UserId(0),
                    ctx.chat_id,
                    now,
                )
                .await
            {
                log::error!("Database error adding warning: {e}");
                return;
            }
            maybe_escalate_warnings(api, database, community_id, ctx.chat_id, &ctx.user, settings, now)
                .await;
        }
        ModAction::Mute => {
            if let Err(e) =
                mute_member(api, ctx.chat_id, ctx.user.id, mute_until(now, mute_secs)).await
            {
                log::warn!("Failed to mute {} in {}: {e}", ctx.user.id, ctx.chat_id);
            }
        }
        ModAction::Kick => {
            if let Err(e) = kick_member(api, ctx.chat_id, ctx.user.id).await {
                log::warn!("Failed to kick {} from {}: {e}", ctx.user.id, ctx.chat_id);
            }
        }
        ModAction::Ban => {
            if let Err(e) = api.ban_member(ctx.chat_id, ctx.user.id).await {
                log::warn!("Failed to ban {} from {}: {e}", ctx.user.id, ctx.chat_id);
            }
        }
        ModAction::Report => {}
    }
}

/// If the user has hit the warning ceiling, apply the configured action
/// in every active group of the community and say so.
pub async fn maybe_escalate_warnings(
    api: &impl ModerationApi,
    database: &Database,
    community_id: &str,
    origin_chat: ChatId,
    user: &User,
    settings: &ModerationSettings,
    now: DateTime<Utc>,
) {
    if !settings.warning_system.enabled {
        return;
    }

    let count = match database
        .active_warning_count(
            community_id,
            user.id,
            settings.warning_system.warning_expiry,
            now,
        )
        .await
    {
        Ok(count) => count,
        Err(e) => {
            log::error!("Database error counting warnings: {e}");
            return;
        }
    };
    if count < settings.warning_system.max_warnings {
        return;
    }

    let groups = match database.community_groups(community_id).await {
        Ok(groups) => groups
            .into_iter()
            .map(|group| (group.chat_id, group.chat_name))
            .collect::<Vec<_>>(),
        Err(e) => {
            log::error!("Database error listing community groups: {e}");
            return;
        }
    };

    let action = settings.warning_system.action_on_max;
    punish_across_groups(api, &groups, user.id, action, mute_until(now, WARNING_MUTE_SECS)).await;

    let name = user_name_prettyprint(user, false, true);
    let text = format!(
        "⚠️ <b>Maximum warnings reached!</b>\n\n\
        👤 User: {name}\n\
        ⚡ Action: {}\n\
        📊 Applied to all community groups",
        action.as_str().to_uppercase()
    );
    if let Err(e) = api.send_html(Recipient::Id(origin_chat), &text, None).await {
        log::warn!("Failed to announce warning escalation in {origin_chat}: {e}");
    }
}

/// Restrict a freshly joined member according to the new-user policy.
pub async fn apply_new_user_restrictions(
    api: &impl ModerationApi,
    chat_id: ChatId,
    user: &User,
    restrictions: &NewUserRestrictions,
    now: DateTime<Utc>,
) {
    let mut permissions = ChatPermissions::empty();
    if restrictions.can_send_messages {
        permissions.insert(ChatPermissions::SEND_MESSAGES);
    }
    if restrictions.can_send_media {
        permissions.insert(ChatPermissions::SEND_MEDIA_MESSAGES);
    }
    if restrictions.can_send_stickers {
        permissions.insert(ChatPermissions::SEND_OTHER_MESSAGES);
    }
    if restrictions.can_send_polls {
        permissions.insert(ChatPermissions::SEND_POLLS);
    }

    let until = now + TimeDelta::seconds(i64::from(restrictions.restrict_duration));
    if let Err(e) = api.restrict_member(chat_id, user.id, permissions, until).await {
        log::warn!("Failed to restrict new user {} in {chat_id}: {e}", user.id);
    }
}

fn mute_until(now: DateTime<Utc>, secs: u32) -> DateTime<Utc> {
    now + TimeDelta::seconds(i64::from(secs))
}

fn auto_report_text(
    ctx: &MessageCtx,
    reason: &str,
    details: &str,
    community_id: &str,
    now: DateTime<Utc>,
) -> String {
    let name = html_escape::encode_text(&ctx.user.first_name);
    let chat_name = html_escape::encode_text(&ctx.chat_name);
    let details = html_escape::encode_text(details);
    format!(
        "🚨 <b>Auto-Moderation Report</b>\n\n\
        👤 <b>User:</b> {name} (<code>{}</code>)\n\
        📁 <b>Group:</b> {chat_name}\n\
        ⚠️ <b>Reason:</b> {reason}\n\n\
        📝 <b>Details:</b>\n{details}\n\n\
        🕐 <b>Time:</b> {}\n\
        🆔 <b>Community:</b> <code>{community_id}</code>",
        ctx.user.id,
        now.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_api::{ApiCall, RecordingApi};
    use teloxide::types::UserId;

    fn test_user(id: u64) -> User {
        User {
            id: UserId(id),
            is_bot: false,
            first_name: "Chatterbox".to_string(),
            last_name: None,
            username: None,
            language_code: None,
            is_premium: false,
            added_to_attachment_menu: false,
        }
    }

    fn ctx(chat: i64, message: i32, user: u64, text: &str) -> MessageCtx {
        MessageCtx {
            chat_id: ChatId(chat),
            chat_name: "Alpha".to_string(),
            message_id: MessageId(message),
            user: test_user(user),
            text: text.to_string(),
            media: MediaTraits::default(),
        }
    }

    async fn seed(db: &Database, settings: &ModerationSettings) {
        db.register_group(ChatId(-1), "comm", "Alpha").await.unwrap();
        db.register_group(ChatId(-2), "comm", "Beta").await.unwrap();
        db.set_settings("comm", settings).await.unwrap();
    }

    #[test]
    fn banned_word_matching_is_case_insensitive_substring() {
        let words = vec!["spamcoin".to_string(), "scam".to_string()];
        assert!(contains_banned_word("Buy SPAMCOIN now", &words));
        assert!(contains_banned_word("that's a scammer move", &words));
        assert!(!contains_banned_word("perfectly fine message", &words));
        assert!(!contains_banned_word("", &words));
    }

    #[test]
    fn flood_counts_exact_repeats_only() {
        let bodies = vec![
            "hello".to_string(),
            "hello".to_string(),
            "other".to_string(),
            "hello".to_string(),
        ];
        assert!(is_flood(&bodies, "hello", 3));
        assert!(!is_flood(&bodies, "hello", 4));
        assert!(!is_flood(&bodies, "other", 2));
        assert!(!is_flood(&bodies, "", 1));
    }

    #[test]
    fn media_restrictions_block_what_they_say() {
        let mut restrictions = MediaRestrictions::default();
        restrictions.block_stickers = true;
        restrictions.block_links = true;

        let sticker = MediaTraits {
            has_sticker: true,
            ..Default::default()
        };
        let photo = MediaTraits {
            has_photo: true,
            ..Default::default()
        };
        let linky = MediaTraits {
            has_links: true,
            ..Default::default()
        };
        assert!(restrictions.blocks(&sticker));
        assert!(restrictions.blocks(&linky));
        assert!(!restrictions.blocks(&photo));
    }

    #[tokio::test]
    async fn banned_word_deletes_and_warns() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.banned_words.enabled = true;
        settings.banned_words.words = vec!["forbidden".to_string()];
        settings.report_settings.report_channel = "@alerts".to_string();
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let ctx = ctx(-1, 42, 7, "this is forbidden content");
        moderate(&api, &db, &ctx, false, Utc::now()).await;

        let calls = api.calls();
        assert!(matches!(calls[0], ApiCall::Deleted(ChatId(-1), MessageId(42))));
        // In-chat warning notice plus the report to the channel.
        assert_eq!(
            calls
                .iter()
                .filter(|call| matches!(call, ApiCall::SentHtml { .. }))
                .count(),
            2
        );

        let warned = db
            .active_warning_count("comm", UserId(7), 86400, Utc::now())
            .await
            .unwrap();
        assert_eq!(warned, 1);
    }

    #[tokio::test]
    async fn admins_are_exempt_from_filters() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.banned_words.enabled = true;
        settings.banned_words.words = vec!["forbidden".to_string()];
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let ctx = ctx(-1, 42, 7, "forbidden but i run this place");
        moderate(&api, &db, &ctx, true, Utc::now()).await;

        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn spam_burst_sweeps_recent_messages_and_mutes() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.anti_spam.max_messages = 3;
        settings.anti_spam.time_window = 60;
        settings.anti_flood.enabled = false;
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let now = Utc::now();
        for i in 0..3 {
            let ctx = ctx(-1, i, 7, &format!("message {i}"));
            moderate(&api, &db, &ctx, false, now + TimeDelta::seconds(i64::from(i))).await;
        }

        let deleted: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::Deleted(..)))
            .collect();
        assert_eq!(deleted.len(), 3);

        let muted = api
            .calls()
            .into_iter()
            .any(|call| matches!(call, ApiCall::Restricted { user: UserId(7), .. }));
        assert!(muted);
    }

    #[tokio::test]
    async fn flood_of_identical_messages_trips_the_filter() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.anti_spam.enabled = false;
        settings.anti_flood.max_repeats = 3;
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let now = Utc::now();
        for i in 0..3 {
            let ctx = ctx(-1, i, 7, "same thing again");
            moderate(&api, &db, &ctx, false, now + TimeDelta::seconds(i64::from(i))).await;
        }

        // Only the third message trips it; the flood message gets deleted
        // and the user muted.
        assert!(api
            .calls()
            .iter()
            .any(|call| matches!(call, ApiCall::Deleted(ChatId(-1), MessageId(2)))));
        assert!(api
            .calls()
            .iter()
            .any(|call| matches!(call, ApiCall::Restricted { .. })));
    }

    #[tokio::test]
    async fn auto_delete_queues_everything_when_enabled() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.anti_spam.enabled = false;
        settings.anti_flood.enabled = false;
        settings.auto_delete.enabled = true;
        settings.auto_delete.delete_after = 100;
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let now = Utc::now();
        moderate(&api, &db, &ctx(-1, 1, 7, "hello"), false, now).await;
        // Admins excluded by default.
        moderate(&api, &db, &ctx(-1, 2, 8, "hi"), true, now).await;

        let due = db
            .due_deletions(now + TimeDelta::seconds(200))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].2, MessageId(1));
    }

    #[tokio::test]
    async fn warning_ceiling_escalates_across_all_groups() {
        let db = Database::new_in_memory().await.unwrap();
        let mut settings = ModerationSettings::default();
        settings.warning_system.max_warnings = 2;
        seed(&db, &settings).await;

        let api = RecordingApi::default();
        let user = test_user(7);
        let now = Utc::now();

        for _ in 0..2 {
            db.add_warning("comm", user.id, "manual", UserId(1), ChatId(-1), now)
                .await
                .unwrap();
        }
        maybe_escalate_warnings(&api, &db, "comm", ChatId(-1), &user, &settings, now).await;

        // Default escalation is a ban, in both registered groups.
        let bans: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::Banned(..)))
            .collect();
        assert_eq!(bans.len(), 2);
    }

    #[tokio::test]
    async fn new_user_restrictions_follow_the_toggles() {
        let api = RecordingApi::default();
        let user = test_user(7);
        let now = Utc::now();
        let restrictions = NewUserRestrictions {
            enabled: true,
            restrict_duration: 600,
            ..Default::default()
        };

        apply_new_user_restrictions(&api, ChatId(-1), &user, &restrictions, now).await;

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            ApiCall::Restricted { chat, user: uid, until } => {
                assert_eq!(*chat, ChatId(-1));
                assert_eq!(*uid, UserId(7));
                assert_eq!(*until, now + TimeDelta::seconds(600));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
}
