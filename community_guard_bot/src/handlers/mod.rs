//! Dispatcher endpoints. Everything here swallows its own failures;
//! a broken update must never take the dispatcher down with it.

use std::sync::Arc;

use chrono::Utc;
use guard_bot_commons::{get_admin_of, BotGuardSendMsg};
use teloxide::{
    prelude::*,
    types::{ChatMemberUpdated, Me},
    RequestError,
};

use crate::{
    automod::{self, MessageCtx},
    database::Database,
    multi_join::{is_fresh_join, MultiJoinDetector},
};

pub mod commands;

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    database: Arc<Database>,
) -> Result<(), RequestError> {
    if commands::handle_command(&bot, &me, &message, &database).await? {
        return Ok(());
    }

    if message.chat.is_private() {
        bot.guard_send_html(message.chat.id, &commands::intro_text(), None)
            .await?;
        return Ok(());
    }

    let Some(ctx) = MessageCtx::of(&message) else {
        // Channel post or some such. If it's posted by the chat itself,
        // it's probably an admin anyway.
        return Ok(());
    };
    if ctx.user.is_bot {
        return Ok(());
    }

    let is_admin = match get_admin_of(&bot, ctx.user.id, message.chat.id).await {
        Ok(member) => member.is_some(),
        Err(e) => {
            log::warn!("Couldn't check admin status in {}: {e}", message.chat.id);
            false
        }
    };

    automod::moderate(&bot, &database, &ctx, is_admin, Utc::now()).await;
    Ok(())
}

pub async fn handle_chat_member_update(
    bot: Bot,
    update: ChatMemberUpdated,
    database: Arc<Database>,
    detector: Arc<MultiJoinDetector>,
) -> Result<(), RequestError> {
    detector.handle_update(&bot, &database, &update).await;

    if is_fresh_join(&update) && !update.new_chat_member.user.is_bot {
        restrict_if_configured(&bot, &database, &update).await;
    }

    Ok(())
}

/// Apply the new-user restriction policy, if the group has one.
async fn restrict_if_configured(bot: &Bot, database: &Database, update: &ChatMemberUpdated) {
    let group = match database.get_group(update.chat.id).await {
        Ok(Some(group)) if group.is_active => group,
        Ok(_) => return,
        Err(e) => {
            log::error!("Database error resolving group {}: {e}", update.chat.id);
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
    if !settings.new_user_restrictions.enabled {
        return;
    }

    automod::apply_new_user_restrictions(
        bot,
        update.chat.id,
        &update.new_chat_member.user,
        &settings.new_user_restrictions,
        Utc::now(),
    )
    .await;
}
