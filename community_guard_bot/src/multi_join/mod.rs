//! Detection of multi-join abuse: one user joining more community groups
//! than allowed within a sliding time window. The one subsystem here with
//! a real correctness concern: join callbacks for the same user arrive
//! concurrently from different groups, and the threshold check must
//! neither double-fire nor lose a join.

mod locks;

use chrono::{DateTime, TimeDelta, Utc};
use teloxide::types::{ChatId, ChatMemberStatus, ChatMemberUpdated, Recipient, User};

use crate::{
    actions::{punish_across_groups, send_report, ModerationApi, VIOLATION_MUTE_DAYS},
    database::Database,
    misc::{chat_name_prettyprint, format_duration, user_name_prettyprint},
    settings::ModerationSettings,
    types::{JoinTracker, ModAction},
};

use self::locks::KeyedLocks;

/// What a membership status transition means to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MembershipChange {
    Joined,
    Left,
}

/// A join is left → member/administrator; a leave is the reverse,
/// counting a ban as leaving. Everything else (promotions, restrictions)
/// is none of our business.
fn classify(old: ChatMemberStatus, new: ChatMemberStatus) -> Option<MembershipChange> {
    use ChatMemberStatus::*;

    let was_in = matches!(old, Member | Administrator);
    let is_in = matches!(new, Member | Administrator);

    match (was_in, is_in) {
        (false, true) if matches!(old, Left) => Some(MembershipChange::Joined),
        (true, false) if matches!(new, Left | Banned) => Some(MembershipChange::Left),
        _ => None,
    }
}

/// True if this update is someone freshly joining the chat.
pub fn is_fresh_join(update: &ChatMemberUpdated) -> bool {
    classify(
        update.old_chat_member.status(),
        update.new_chat_member.status(),
    ) == Some(MembershipChange::Joined)
}

pub struct MultiJoinDetector {
    locks: KeyedLocks,
}

impl MultiJoinDetector {
    pub fn new() -> Self {
        MultiJoinDetector {
            locks: KeyedLocks::new(),
        }
    }

    /// Entry point for `chat_member` updates from the dispatcher.
    pub async fn handle_update(
        &self,
        api: &impl ModerationApi,
        database: &Database,
        update: &ChatMemberUpdated,
    ) {
        let Some(change) = classify(
            update.old_chat_member.status(),
            update.new_chat_member.status(),
        ) else {
            return;
        };

        let user = &update.new_chat_member.user;
        if user.is_bot {
            return;
        }

        let chat_id = update.chat.id;
        let chat_name = chat_name_prettyprint(&update.chat);
        let now = Utc::now();

        match change {
            MembershipChange::Joined => {
                self.handle_join(api, database, chat_id, &chat_name, user, now)
                    .await;
            }
            MembershipChange::Left => {
                self.handle_leave(database, chat_id, user, now).await;
            }
        }
    }

    /// Record a join and fire the violation action if this join pushes the
    /// user's burst over the threshold.
    ///
    /// The whole read-prune-append-check-act sequence runs under the
    /// per-user locks. Every await in here is a suspension point where
    /// another join callback for the same user could otherwise slip in and
    /// either double-fire the violation or leave the count one short.
    pub(crate) async fn handle_join(
        &self,
        api: &impl ModerationApi,
        database: &Database,
        chat_id: ChatId,
        chat_name: &str,
        user: &User,
        now: DateTime<Utc>,
    ) {
        let group = match database.get_group(chat_id).await {
            Ok(Some(group)) if group.is_active => group,
            Ok(_) => return, // Unregistered chat; not ours to police.
            Err(e) => {
                log::error!("Database error resolving group {chat_id}: {e}");
                return;
            }
        };

        let settings = match database.get_settings(&group.community_id).await {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("Database error loading settings: {e}");
                return;
            }
        };
        if !settings.multi_join.enabled {
            return;
        }

        let _chat_guard = self
            .locks
            .acquire(format!("chat:{}:{}", chat_id, user.id))
            .await;
        let _community_guard = self
            .locks
            .acquire(format!("community:{}:{}", group.community_id, user.id))
            .await;

        let mut tracker = match database.get_tracker(user.id, &group.community_id).await {
            Ok(tracker) => {
                tracker.unwrap_or_else(|| JoinTracker::new(user.id, &group.community_id))
            }
            Err(e) => {
                log::error!("Database error loading tracker: {e}");
                return;
            }
        };

        tracker.prune(now, settings.multi_join.time_window);
        tracker.record_join(chat_id, chat_name, now);

        if let Err(e) = database.save_tracker(&tracker).await {
            log::error!("Database error saving tracker: {e}");
            return;
        }

        let threshold = settings.multi_join.max_groups_in_time as usize;
        if tracker.joins.len() >= threshold && !tracker.is_reported {
            tracker.is_reported = true;
            tracker.is_suspicious = true;
            if let Err(e) = database.save_tracker(&tracker).await {
                log::error!("Database error latching violation: {e}");
                return;
            }

            self.handle_violation(api, database, chat_id, user, &tracker, &settings, now)
                .await;
        }

        log::debug!("{} joined {} ({})", user.first_name, chat_name, chat_id);
    }

    /// Forget the left group. Draining the tracker deletes it; dropping
    /// back under the threshold re-arms detection for a future burst.
    pub(crate) async fn handle_leave(
        &self,
        database: &Database,
        chat_id: ChatId,
        user: &User,
        _now: DateTime<Utc>,
    ) {
        let group = match database.get_group(chat_id).await {
            Ok(Some(group)) if group.is_active => group,
            Ok(_) => return,
            Err(e) => {
                log::error!("Database error resolving group {chat_id}: {e}");
                return;
            }
        };

        let settings = match database.get_settings(&group.community_id).await {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("Database error loading settings: {e}");
                return;
            }
        };

        let _chat_guard = self
            .locks
            .acquire(format!("chat:{}:{}", chat_id, user.id))
            .await;
        let _community_guard = self
            .locks
            .acquire(format!("community:{}:{}", group.community_id, user.id))
            .await;

        let mut tracker = match database.get_tracker(user.id, &group.community_id).await {
            Ok(Some(tracker)) => tracker,
            Ok(None) => return,
            Err(e) => {
                log::error!("Database error loading tracker: {e}");
                return;
            }
        };

        tracker.remove_group(chat_id);

        if tracker.is_drained() {
            if let Err(e) = database.delete_tracker(user.id, &group.community_id).await {
                log::error!("Database error deleting drained tracker: {e}");
            }
            log::debug!("Tracker for {} drained and deleted", user.first_name);
            return;
        }

        let threshold = settings.multi_join.max_groups_in_time as usize;
        if tracker.joins.len() < threshold && tracker.is_reported {
            // Back under the limit; a future burst should be caught anew.
            tracker.is_reported = false;
            tracker.is_suspicious = false;
        }

        if let Err(e) = database.save_tracker(&tracker).await {
            log::error!("Database error saving tracker: {e}");
        }
    }

    /// Runs at most once per burst; the `is_reported` latch (flipped under
    /// the lock before we get here) is what guarantees that.
    #[allow(clippy::too_many_arguments)]
    async fn handle_violation(
        &self,
        api: &impl ModerationApi,
        database: &Database,
        origin_chat: ChatId,
        user: &User,
        tracker: &JoinTracker,
        settings: &ModerationSettings,
        now: DateTime<Utc>,
    ) {
        let config = &settings.multi_join;
        let action = config.action;

        if config.auto_report {
            let text = violation_report_text(user, tracker, config.time_window, action, now);
            send_report(api, &settings.report_settings.report_channel, &text).await;
        }

        let name = html_escape::encode_text(&user.first_name);
        let groups: Vec<(ChatId, String)> = tracker
            .joins
            .iter()
            .map(|join| (join.group_id, join.group_name.clone()))
            .collect();

        match action {
            ModAction::Warn => {
                let text = format!("⚠️ {name} joined multiple groups rapidly.");
                if let Err(e) = api.send_html(Recipient::Id(origin_chat), &text, None).await {
                    log::warn!("Failed to send multi-join warning in {origin_chat}: {e}");
                }
            }
            ModAction::Mute => {
                let until = now + TimeDelta::days(VIOLATION_MUTE_DAYS);
                punish_across_groups(api, &groups, user.id, ModAction::Mute, until).await;
            }
            ModAction::Kick | ModAction::Ban => {
                punish_across_groups(api, &groups, user.id, action, now).await;

                // The burst is resolved; the next join starts fresh.
                if let Err(e) = database
                    .delete_tracker(user.id, &tracker.community_id)
                    .await
                {
                    log::error!("Database error deleting tracker after {action}: {e}");
                }

                let text = match action {
                    ModAction::Kick => format!("🚫 {name} was kicked for rapid group joins."),
                    _ => format!("🔨 {name} was banned for rapid group joins."),
                };
                if let Err(e) = api.send_html(Recipient::Id(origin_chat), &text, None).await {
                    log::warn!("Failed to send multi-join notice in {origin_chat}: {e}");
                }
            }
            ModAction::Report => {
                // The report above is the whole effect.
            }
        }
    }
}

impl Default for MultiJoinDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn violation_report_text(
    user: &User,
    tracker: &JoinTracker,
    window_secs: u32,
    action: ModAction,
    now: DateTime<Utc>,
) -> String {
    use std::fmt::Write;

    let mut text = String::from("🚨 <b>Multi-Join Detection Alert</b>\n\n");
    let name = html_escape::encode_text(&user.first_name);
    let _ = writeln!(text, "<b>User:</b> {} ({})", name, user.id);
    let _ = writeln!(
        text,
        "<b>Username:</b> {}",
        user.username
            .as_deref()
            .map_or_else(|| "None".to_string(), |u| format!("@{u}"))
    );
    let _ = writeln!(
        text,
        "\n<b>Joined {} groups in {}:</b>",
        tracker.joins.len(),
        format_duration(window_secs)
    );
    for join in &tracker.joins {
        let _ = writeln!(text, "• {}", html_escape::encode_text(&join.group_name));
    }
    let _ = writeln!(
        text,
        "\n<b>Action taken:</b> {}",
        action.as_str().to_uppercase()
    );
    let _ = write!(text, "<b>Time:</b> {}", now.format("%Y-%m-%d %H:%M:%S UTC"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_api::{ApiCall, RecordingApi};
    use crate::settings::ModerationSettings;
    use std::sync::Arc;
    use teloxide::types::UserId;

    fn test_user(id: u64) -> User {
        User {
            id: UserId(id),
            is_bot: false,
            first_name: "Mallory".to_string(),
            last_name: None,
            username: Some("mallory".to_string()),
            language_code: None,
            is_premium: false,
            added_to_attachment_menu: false,
        }
    }

    async fn seed(
        db: &Database,
        threshold: u32,
        window: u32,
        action: ModAction,
        report_channel: &str,
    ) {
        for (id, name) in [(-1, "Alpha"), (-2, "Beta"), (-3, "Gamma"), (-4, "Delta")] {
            db.register_group(ChatId(id), "comm", name).await.unwrap();
        }
        let mut settings = ModerationSettings::default();
        settings.multi_join.max_groups_in_time = threshold;
        settings.multi_join.time_window = window;
        settings.multi_join.action = action;
        settings.report_settings.report_channel = report_channel.to_string();
        db.set_settings("comm", &settings).await.unwrap();
    }

    fn reports_sent(api: &RecordingApi) -> usize {
        api.calls()
            .iter()
            .filter(|call| {
                matches!(call, ApiCall::SentHtml { to, .. }
                    if *to == Recipient::ChannelUsername("@alerts".to_string()))
            })
            .count()
    }

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + TimeDelta::seconds(secs)
    }

    #[tokio::test]
    async fn burst_over_threshold_fires_exactly_once() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 3, 3600, ModAction::Report, "@alerts").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 10))
            .await;
        assert_eq!(reports_sent(&api), 0);

        detector
            .handle_join(&api, &db, ChatId(-3), "Gamma", &user, at(t0, 20))
            .await;
        assert_eq!(reports_sent(&api), 1);

        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 3);
        assert!(tracker.is_reported);
        assert!(tracker.is_suspicious);

        // A fourth join during the same burst must not re-fire.
        detector
            .handle_join(&api, &db, ChatId(-4), "Delta", &user, at(t0, 30))
            .await;
        assert_eq!(reports_sent(&api), 1);
    }

    #[tokio::test]
    async fn duplicate_join_callbacks_count_once() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Report, "@alerts").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 1))
            .await;

        assert_eq!(reports_sent(&api), 0);
        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 1);
    }

    #[tokio::test]
    async fn joins_outside_the_window_are_pruned_first() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 60, ModAction::Report, "@alerts").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        // 70 seconds later: Alpha has expired, so this is a burst of one.
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 70))
            .await;

        assert_eq!(reports_sent(&api), 0);
        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 1);
        assert_eq!(tracker.joins[0].group_id, ChatId(-2));
    }

    #[tokio::test]
    async fn unregistered_or_disabled_groups_are_ignored() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Report, "@alerts").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        // Not in the registry at all.
        detector
            .handle_join(&api, &db, ChatId(-999), "Elsewhere", &user, t0)
            .await;
        assert!(db.get_tracker(UserId(10), "comm").await.unwrap().is_none());

        // Registered, but the detector is switched off.
        let mut settings = db.get_settings("comm").await.unwrap();
        settings.multi_join.enabled = false;
        db.set_settings("comm", &settings).await.unwrap();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, t0)
            .await;
        assert!(db.get_tracker(UserId(10), "comm").await.unwrap().is_none());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn mute_action_restricts_every_group_until_far_future() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Mute, "").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 5))
            .await;

        let until = at(t0, 5) + TimeDelta::days(VIOLATION_MUTE_DAYS);
        let restrictions: Vec<_> = api
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Restricted { chat, until, .. } => Some((chat, until)),
                _ => None,
            })
            .collect();
        assert_eq!(restrictions, vec![(ChatId(-1), until), (ChatId(-2), until)]);

        // Muting keeps the tracker: the user is still in those groups.
        assert!(db.get_tracker(UserId(10), "comm").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kick_action_resolves_the_burst_and_deletes_the_tracker() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Kick, "").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 5))
            .await;

        let memberships: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::Banned(..) | ApiCall::Unbanned(..)))
            .collect();
        assert_eq!(memberships, vec![
            ApiCall::Banned(ChatId(-1), UserId(10)),
            ApiCall::Unbanned(ChatId(-1), UserId(10)),
            ApiCall::Banned(ChatId(-2), UserId(10)),
            ApiCall::Unbanned(ChatId(-2), UserId(10)),
        ]);
        assert!(db.get_tracker(UserId(10), "comm").await.unwrap().is_none());

        // A later join starts a fresh burst of one.
        detector
            .handle_join(&api, &db, ChatId(-3), "Gamma", &user, at(t0, 100))
            .await;
        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 1);
        assert!(!tracker.is_reported);
    }

    #[tokio::test]
    async fn ban_failure_in_one_group_does_not_spare_the_rest() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 3, 3600, ModAction::Ban, "-999").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        api.fail_in(ChatId(-2));
        // The report channel is down too; the action must still land.
        api.fail_in(ChatId(-999));
        let user = test_user(10);
        let t0 = Utc::now();

        for (n, (chat, name)) in [(-1, "Alpha"), (-2, "Beta"), (-3, "Gamma")]
            .into_iter()
            .enumerate()
        {
            detector
                .handle_join(&api, &db, ChatId(chat), name, &user, at(t0, n as i64 * 10))
                .await;
        }

        let bans: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::Banned(..)))
            .collect();
        assert_eq!(bans, vec![
            ApiCall::Banned(ChatId(-1), UserId(10)),
            ApiCall::Banned(ChatId(-3), UserId(10)),
        ]);
    }

    #[tokio::test]
    async fn leaving_re_arms_detection_and_draining_deletes() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Report, "@alerts").await;
        let detector = MultiJoinDetector::new();
        let api = RecordingApi::default();
        let user = test_user(10);
        let t0 = Utc::now();

        detector
            .handle_join(&api, &db, ChatId(-1), "Alpha", &user, at(t0, 0))
            .await;
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 5))
            .await;
        assert_eq!(reports_sent(&api), 1);

        detector
            .handle_leave(&db, ChatId(-2), &user, at(t0, 60))
            .await;
        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 1);
        assert!(!tracker.is_reported);
        assert!(!tracker.is_suspicious);

        // Rejoining can now trip the detector a second time.
        detector
            .handle_join(&api, &db, ChatId(-2), "Beta", &user, at(t0, 120))
            .await;
        assert_eq!(reports_sent(&api), 2);

        detector
            .handle_leave(&db, ChatId(-1), &user, at(t0, 200))
            .await;
        detector
            .handle_leave(&db, ChatId(-2), &user, at(t0, 201))
            .await;
        assert!(db.get_tracker(UserId(10), "comm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_joins_fire_the_violation_exactly_once() {
        let db = Database::new_in_memory().await.unwrap();
        seed(&db, 2, 3600, ModAction::Report, "@alerts").await;
        let detector = Arc::new(MultiJoinDetector::new());
        let api = Arc::new(RecordingApi::default());
        let user = test_user(10);
        let t0 = Utc::now();

        // Near-simultaneous joins to two different groups: without the
        // per-user lock, both could read a pre-increment count and either
        // both trigger or neither.
        let a = {
            let detector = detector.clone();
            let db = db.clone();
            let api = api.clone();
            let user = user.clone();
            tokio::spawn(async move {
                detector
                    .handle_join(&*api, &db, ChatId(-1), "Alpha", &user, t0)
                    .await;
            })
        };
        let b = {
            let detector = detector.clone();
            let db = db.clone();
            let api = api.clone();
            let user = user.clone();
            tokio::spawn(async move {
                detector
                    .handle_join(&*api, &db, ChatId(-2), "Beta", &user, t0)
                    .await;
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(reports_sent(&api), 1);
        let tracker = db.get_tracker(UserId(10), "comm").await.unwrap().unwrap();
        assert_eq!(tracker.joins.len(), 2);
        assert!(tracker.is_reported);
    }

    #[tokio::test]
    async fn bots_and_irrelevant_transitions_are_classified_away() {
        use ChatMemberStatus::*;
        assert_eq!(classify(Left, Member), Some(MembershipChange::Joined));
        assert_eq!(classify(Left, Administrator), Some(MembershipChange::Joined));
        assert_eq!(classify(Member, Left), Some(MembershipChange::Left));
        assert_eq!(classify(Administrator, Banned), Some(MembershipChange::Left));
        // Promotions, restrictions, unbans: not joins or leaves.
        assert_eq!(classify(Member, Administrator), None);
        assert_eq!(classify(Banned, Left), None);
        assert_eq!(classify(Restricted, Member), None);
        assert_eq!(classify(Left, Restricted), None);
    }

    #[tokio::test]
    async fn report_text_lists_groups_and_action() {
        let user = test_user(10);
        let mut tracker = JoinTracker::new(UserId(10), "comm");
        let now = Utc::now();
        tracker.record_join(ChatId(-1), "Alpha", now);
        tracker.record_join(ChatId(-2), "Beta & Co", now);

        let text = violation_report_text(&user, &tracker, 3600, ModAction::Kick, now);
        assert!(text.contains("@mallory"));
        assert!(text.contains("2 groups in 1 hour"));
        assert!(text.contains("• Alpha"));
        // User-supplied names get escaped for HTML.
        assert!(text.contains("• Beta &amp; Co"));
        assert!(text.contains("KICK"));
    }
}
