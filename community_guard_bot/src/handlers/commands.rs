use std::{future::Future, pin::Pin};

use chrono::Utc;
use guard_bot_commons::{get_admin_of, BotGuardSendMsg};
use teloxide::{
    types::{BotCommand, Me, Message, User},
    Bot, RequestError,
};

use crate::{
    actions::{kick_member, mute_member, ModerationApi},
    automod::maybe_escalate_warnings,
    database::Database,
    misc::{format_duration, user_name_prettyprint},
    types::GroupEntry,
};

pub const COMMANDS: &[Command] = &[
    START,
    HELP,
    WARN,
    WARNINGS,
    MUTE,
    UNMUTE,
    KICK,
    BAN,
    REGISTER_GROUP,
    UNREGISTER_GROUP,
    AUTOMOD_STATUS,
    MULTIJOIN,
];

pub type Ret = Result<(), RequestError>;
pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Ret> + Send + 'a>>;

pub struct CommandParams<'a> {
    pub bot: &'a Bot,
    pub bot_me: &'a Me,
    pub message: &'a Message,
    pub database: &'a Database,
    pub message_text: &'a str,
    pub command_len: usize,
}

impl<'a> CommandParams<'a> {
    pub fn new<'new>(
        bot: &'new Bot,
        bot_me: &'new Me,
        message: &'new Message,
        database: &'new Database,
    ) -> Option<CommandParams<'new>> {
        let message_text = message.text()?;

        if !message_text.starts_with('/') {
            return None;
        }

        let command = message_text.split_whitespace().next()?;

        if !command.is_ascii() {
            // Telegram commands must be ASCII.
            // See https://core.telegram.org/bots/api#botcommand
            return None;
        }

        let command_len = command.len();

        Some(CommandParams {
            bot,
            bot_me,
            message,
            database,
            message_text,
            command_len,
        })
    }

    /// The command itself, `/warn` out of `/warn being rude`.
    #[inline]
    pub fn command(&self) -> &str {
        &self.message_text[..self.command_len]
    }

    /// Everything after the command, `being rude` out of `/warn being rude`.
    #[inline]
    pub fn get_params(&self) -> &str {
        self.message_text[self.command_len..].trim_start()
    }

    /// The user the command is aimed at: the sender of the replied-to
    /// message.
    fn target_user(&self) -> Option<&User> {
        self.message
            .reply_to_message()
            .and_then(|replied| replied.from.as_ref())
    }

    async fn reply(&self, text: &str) -> Ret {
        self.bot
            .guard_send_html(self.message.chat.id, text, self.message.id)
            .await?;
        Ok(())
    }

    /// The registered, active group entry for this chat, or a reply
    /// telling the admin to register first.
    async fn require_group(&self) -> Result<Option<GroupEntry>, RequestError> {
        match self.database.get_group(self.message.chat.id).await {
            Ok(Some(group)) if group.is_active => Ok(Some(group)),
            Ok(_) => {
                self.reply(
                    "This group is not registered. Use <code>/register_group &lt;community&gt;</code> first.",
                )
                .await?;
                Ok(None)
            }
            Err(e) => {
                log::error!("Database error resolving group: {e}");
                self.reply("Database error, try again later.").await?;
                Ok(None)
            }
        }
    }
}

pub struct Command {
    pub callname: &'static str,
    pub description: &'static str,
    pub function: fn(CommandParams) -> CommandFuture,
    /// Requires the sender to be an admin of a group chat.
    admin_only: bool,
    hidden: bool,
}

impl Command {
    pub fn is_matching_callname(&self, command: &str) -> bool {
        self.callname
            .split_ascii_whitespace()
            .next()
            .is_some_and(|x| x.eq_ignore_ascii_case(command))
    }

    pub fn generate_help() -> String {
        let mut response = String::from("COMMANDS:\n\n");
        for command in COMMANDS {
            if command.hidden {
                continue;
            }
            response += command.callname;
            if !command.description.is_empty() {
                response += " - ";
                response += command.description;
            }
            response += "\n\n";
        }
        response.pop();
        response.pop();
        response
    }

    pub fn generate_bot_commands() -> Vec<BotCommand> {
        let mut output = Vec::new();

        for command in COMMANDS {
            if command.hidden {
                continue;
            }
            let Some(callname) = command.callname.split_ascii_whitespace().next() else {
                continue;
            };

            // Cut off the /
            let callname = callname[1..].trim().to_string();
            let description = command
                .description
                .replace("&lt;", "<")
                .replace("&gt;", ">");

            output.push(BotCommand {
                command: callname,
                description,
            });
        }

        output
    }
}

/// Returns `true` if a command was parsed and responded to.
pub async fn handle_command(
    bot: &Bot,
    bot_me: &Me,
    message: &Message,
    database: &Database,
) -> Result<bool, RequestError> {
    let Some(params) = CommandParams::new(bot, bot_me, message, database) else {
        return Ok(false);
    };

    // Trim "@Bot_Username" off the command, and bail if it's somebody
    // else's username there.
    let callname = if let Some(username_start) = params.command().find('@') {
        if !params.command()[username_start + '@'.len_utf8()..]
            .eq_ignore_ascii_case(bot_me.username())
        {
            return Ok(false);
        }
        &params.command()[0..username_start]
    } else {
        params.command()
    };

    let Some(command) = COMMANDS.iter().find(|c| c.is_matching_callname(callname)) else {
        return Ok(false);
    };

    if command.admin_only {
        if message.chat.is_private() {
            params.reply("This command only works in groups.").await?;
            return Ok(true);
        }

        let Some(sender) = &message.from else {
            return Ok(true);
        };
        let is_admin = get_admin_of(bot, sender.id, message.chat.id)
            .await?
            .is_some();
        if !is_admin {
            params
                .reply("Only group admins can use this command.")
                .await?;
            return Ok(true);
        }
    }

    (command.function)(params).await?;
    Ok(true)
}

/// Wraps the function's return value in a pinning closure.
macro_rules! wrap {
    ($thing:expr) => {
        |params| Box::pin($thing(params))
    };
}

const START: Command = Command {
    callname: "/start",
    description: "",
    function: wrap!(start),
    admin_only: false,
    hidden: true,
};

const HELP: Command = Command {
    callname: "/help",
    description: "show this help",
    function: wrap!(start),
    admin_only: false,
    hidden: false,
};

const WARN: Command = Command {
    callname: "/warn &lt;reason&gt;",
    description: "warn the user you replied to",
    function: wrap!(warn),
    admin_only: true,
    hidden: false,
};

const WARNINGS: Command = Command {
    callname: "/warnings",
    description: "show active warnings of the user you replied to",
    function: wrap!(warnings),
    admin_only: false,
    hidden: false,
};

const MUTE: Command = Command {
    callname: "/mute &lt;minutes&gt;",
    description: "mute the user you replied to, an hour by default",
    function: wrap!(mute),
    admin_only: true,
    hidden: false,
};

const UNMUTE: Command = Command {
    callname: "/unmute",
    description: "lift restrictions from the user you replied to",
    function: wrap!(unmute),
    admin_only: true,
    hidden: false,
};

const KICK: Command = Command {
    callname: "/kick",
    description: "kick the user you replied to",
    function: wrap!(kick),
    admin_only: true,
    hidden: false,
};

const BAN: Command = Command {
    callname: "/ban",
    description: "ban the user you replied to",
    function: wrap!(ban),
    admin_only: true,
    hidden: false,
};

const REGISTER_GROUP: Command = Command {
    callname: "/register_group &lt;community&gt;",
    description: "register this group under a community name",
    function: wrap!(register_group),
    admin_only: true,
    hidden: false,
};

const UNREGISTER_GROUP: Command = Command {
    callname: "/unregister_group",
    description: "remove this group from its community",
    function: wrap!(unregister_group),
    admin_only: true,
    hidden: false,
};

const AUTOMOD_STATUS: Command = Command {
    callname: "/automod_status",
    description: "show which moderation features are on",
    function: wrap!(automod_status),
    admin_only: true,
    hidden: false,
};

const MULTIJOIN: Command = Command {
    callname: "/multijoin &lt;on|off&gt;",
    description: "toggle multi-join detection for this community",
    function: wrap!(multijoin),
    admin_only: true,
    hidden: false,
};

pub fn intro_text() -> String {
    format!(
        "This bot guards communities of Telegram groups: it tracks users \
        mass-joining your groups, filters messages, and keeps shared \
        warning counts across all groups of a community.\n\n\
        To use it, add it to your groups as an admin with the ability to \
        remove messages and restrict members, then run \
        <code>/register_group &lt;community&gt;</code> in each group with \
        the same community name.\n\n{}",
        Command::generate_help()
    )
}

async fn start(params: CommandParams<'_>) -> Ret {
    params.reply(&intro_text()).await
}

async fn warn(params: CommandParams<'_>) -> Ret {
    let Some(group) = params.require_group().await? else {
        return Ok(());
    };
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user you want to warn.")
            .await;
    };
    let Some(sender) = &params.message.from else {
        return Ok(());
    };
    if target.is_bot {
        return params.reply("Bots don't take warnings to heart.").await;
    }

    let reason = match params.get_params() {
        "" => "No reason given",
        reason => reason,
    };
    let now = Utc::now();
    let target = target.clone();

    if let Err(e) = params
        .database
        .add_warning(
            &group.community_id,
            target.id,
            reason,
            sender.id,
            params.message.chat.id,
            now,
        )
        .await
    {
        log::error!("Database error adding warning: {e}");
        return params.reply("Database error, try again later.").await;
    }

    let settings = match params.database.get_settings(&group.community_id).await {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Database error loading settings: {e}");
            return Ok(());
        }
    };
    let count = params
        .database
        .active_warning_count(
            &group.community_id,
            target.id,
            settings.warning_system.warning_expiry,
            now,
        )
        .await
        .unwrap_or(1);

    let name = user_name_prettyprint(&target, false, true);
    let text = format!(
        "⚠️ {name} has been warned: {}\nWarnings: {count}/{}",
        html_escape::encode_text(reason),
        settings.warning_system.max_warnings
    );
    params.reply(&text).await?;

    maybe_escalate_warnings(
        params.bot,
        params.database,
        &group.community_id,
        params.message.chat.id,
        &target,
        &settings,
        now,
    )
    .await;
    Ok(())
}

async fn warnings(params: CommandParams<'_>) -> Ret {
    let Some(group) = params.require_group().await? else {
        return Ok(());
    };
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user whose warnings you want to see.")
            .await;
    };
    let target = target.clone();

    let settings = match params.database.get_settings(&group.community_id).await {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Database error loading settings: {e}");
            return params.reply("Database error, try again later.").await;
        }
    };
    let count = match params
        .database
        .active_warning_count(
            &group.community_id,
            target.id,
            settings.warning_system.warning_expiry,
            Utc::now(),
        )
        .await
    {
        Ok(count) => count,
        Err(e) => {
            log::error!("Database error counting warnings: {e}");
            return params.reply("Database error, try again later.").await;
        }
    };

    let name = user_name_prettyprint(&target, false, true);
    params
        .reply(&format!(
            "{name} has {count}/{} active warnings in this community.",
            settings.warning_system.max_warnings
        ))
        .await
}

/// Parse an optional duration parameter given in minutes, into seconds.
fn parse_mute_secs(params: &str) -> Option<u32> {
    match params.split_whitespace().next() {
        None => Some(3600),
        Some(word) => word.parse::<u32>().ok().and_then(|m| m.checked_mul(60)),
    }
}

async fn mute(params: CommandParams<'_>) -> Ret {
    if params.require_group().await?.is_none() {
        return Ok(());
    }
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user you want to mute.")
            .await;
    };
    let target = target.clone();

    let Some(secs) = parse_mute_secs(params.get_params()) else {
        return params
            .reply("Usage: <code>/mute &lt;minutes&gt;</code>, or just <code>/mute</code> for an hour.")
            .await;
    };

    let until = Utc::now() + chrono::TimeDelta::seconds(i64::from(secs));
    if let Err(e) = mute_member(params.bot, params.message.chat.id, target.id, until).await {
        log::warn!("Failed to mute {}: {e}", target.id);
        return params
            .reply("Couldn't mute them. Is this bot an admin with the ability to restrict members?")
            .await;
    }

    let name = user_name_prettyprint(&target, false, true);
    params
        .reply(&format!("🔇 {name} has been muted for {}.", format_duration(secs)))
        .await
}

async fn unmute(params: CommandParams<'_>) -> Ret {
    if params.require_group().await?.is_none() {
        return Ok(());
    }
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user you want to unmute.")
            .await;
    };
    let target = target.clone();

    // Restoring all permissions with an immediate expiry lifts the mute.
    if let Err(e) = params
        .bot
        .restrict_member(
            params.message.chat.id,
            target.id,
            teloxide::types::ChatPermissions::all(),
            Utc::now(),
        )
        .await
    {
        log::warn!("Failed to unmute {}: {e}", target.id);
        return params
            .reply("Couldn't unmute them. Is this bot an admin with the ability to restrict members?")
            .await;
    }

    let name = user_name_prettyprint(&target, false, true);
    params.reply(&format!("🔊 {name} can speak again.")).await
}

async fn kick(params: CommandParams<'_>) -> Ret {
    if params.require_group().await?.is_none() {
        return Ok(());
    }
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user you want to kick.")
            .await;
    };
    let target = target.clone();

    if let Err(e) = kick_member(params.bot, params.message.chat.id, target.id).await {
        log::warn!("Failed to kick {}: {e}", target.id);
        return params
            .reply("Couldn't kick them. Is this bot an admin with the ability to ban members?")
            .await;
    }

    let name = user_name_prettyprint(&target, false, true);
    params.reply(&format!("👢 {name} has been kicked.")).await
}

async fn ban(params: CommandParams<'_>) -> Ret {
    if params.require_group().await?.is_none() {
        return Ok(());
    }
    let Some(target) = params.target_user() else {
        return params
            .reply("Reply to a message of the user you want to ban.")
            .await;
    };
    let target = target.clone();

    if let Err(e) = params
        .bot
        .ban_member(params.message.chat.id, target.id)
        .await
    {
        log::warn!("Failed to ban {}: {e}", target.id);
        return params
            .reply("Couldn't ban them. Is this bot an admin with the ability to ban members?")
            .await;
    }

    let name = user_name_prettyprint(&target, false, true);
    params.reply(&format!("🚫 {name} has been banned.")).await
}

async fn register_group(params: CommandParams<'_>) -> Ret {
    if params.message.chat.is_private() {
        return params.reply("This command only works in groups.").await;
    }

    let community_id = params.get_params().trim();
    if community_id.is_empty() || community_id.split_whitespace().count() != 1 {
        return params
            .reply("Usage: <code>/register_group &lt;community&gt;</code>, one word.")
            .await;
    }

    let chat_name = params.message.chat.title().unwrap_or("Unknown");
    if let Err(e) = params
        .database
        .register_group(params.message.chat.id, community_id, chat_name)
        .await
    {
        log::error!("Database error registering group: {e}");
        return params.reply("Database error, try again later.").await;
    }

    params
        .reply(&format!(
            "✅ Registered <b>{}</b> under community <code>{}</code>.",
            html_escape::encode_text(chat_name),
            html_escape::encode_text(community_id)
        ))
        .await
}

async fn unregister_group(params: CommandParams<'_>) -> Ret {
    if params.require_group().await?.is_none() {
        return Ok(());
    }

    if let Err(e) = params.database.unregister_group(params.message.chat.id).await {
        log::error!("Database error unregistering group: {e}");
        return params.reply("Database error, try again later.").await;
    }

    params
        .reply("✅ This group is no longer part of its community.")
        .await
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "✅ on"
    } else {
        "❌ off"
    }
}

async fn automod_status(params: CommandParams<'_>) -> Ret {
    let Some(group) = params.require_group().await? else {
        return Ok(());
    };

    let settings = match params.database.get_settings(&group.community_id).await {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Database error loading settings: {e}");
            return params.reply("Database error, try again later.").await;
        }
    };

    let text = format!(
        "🛡 <b>Moderation status for <code>{}</code></b>\n\n\
        Banned words: {}\n\
        Anti-spam: {}\n\
        Anti-flood: {}\n\
        Media restrictions: {}\n\
        Multi-join detection: {}\n\
        Warning system: {}\n\
        Auto-delete: {}\n\
        Reports: {}\n\
        New user restrictions: {}",
        html_escape::encode_text(&group.community_id),
        on_off(settings.banned_words.enabled),
        on_off(settings.anti_spam.enabled),
        on_off(settings.anti_flood.enabled),
        on_off(settings.media_restrictions.enabled),
        on_off(settings.multi_join.enabled),
        on_off(settings.warning_system.enabled),
        on_off(settings.auto_delete.enabled),
        on_off(settings.report_settings.enabled),
        on_off(settings.new_user_restrictions.enabled),
    );
    params.reply(&text).await
}

async fn multijoin(params: CommandParams<'_>) -> Ret {
    let Some(group) = params.require_group().await? else {
        return Ok(());
    };

    let enable = match params.get_params().trim() {
        "on" => true,
        "off" => false,
        _ => {
            return params
                .reply("Usage: <code>/multijoin &lt;on|off&gt;</code>")
                .await;
        }
    };

    let mut settings = match params.database.get_settings(&group.community_id).await {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Database error loading settings: {e}");
            return params.reply("Database error, try again later.").await;
        }
    };
    settings.multi_join.enabled = enable;
    if let Err(e) = params
        .database
        .set_settings(&group.community_id, &settings)
        .await
    {
        log::error!("Database error saving settings: {e}");
        return params.reply("Database error, try again later.").await;
    }

    params
        .reply(&format!(
            "Multi-join detection is now {} for <code>{}</code>.",
            if enable { "on" } else { "off" },
            html_escape::encode_text(&group.community_id)
        ))
        .await
}
