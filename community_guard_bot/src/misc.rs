use teloxide::types::{Chat, ChatId, Recipient, User};

/// Tries to print the user in the prettiest way possible, with either
/// `@username` or full name that hopefully links to the user if
/// `with_link_formatting` is `true`. Optionally allows including user ID.
#[must_use]
pub fn user_name_prettyprint(user: &User, with_id: bool, with_link_formatting: bool) -> String {
    let mut name = {
        if let Some(username) = &user.username {
            format!("@{username}")
        } else if with_link_formatting {
            let mut full_name = format!(
                "<a href=\"tg://user?id={}\">{}",
                user.id,
                html_escape::encode_text(&user.first_name)
            );

            if let Some(last_name) = &user.last_name {
                full_name.push(' ');
                full_name.push_str(&html_escape::encode_text(last_name));
            }

            full_name.push_str("</a>");

            full_name
        } else {
            user.full_name()
        }
    };

    if with_id {
        use std::fmt::Write;
        write!(name, " (userid {})", user.id).expect("Writing to a String never fails");
    }

    name
}

/// Tries to print the chat name in the prettiest way possible, with either
/// `@username` or chat title.
#[must_use]
pub fn chat_name_prettyprint(chat: &Chat) -> String {
    if let Some(username) = chat.username() {
        format!("@{username}")
    } else if let Some(title) = chat.title() {
        title.to_string()
    } else {
        // Shouldn't happen for the group chats we deal with, but eh.
        format!("chat {}", chat.id)
    }
}

/// The report channel setting is stored as text and may hold either a
/// `@channelusername` or a numeric chat ID. Empty or unparsable means
/// no destination.
#[must_use]
pub fn parse_report_destination(setting: &str) -> Option<Recipient> {
    let setting = setting.trim();
    if setting.is_empty() {
        return None;
    }
    if setting.starts_with('@') {
        return Some(Recipient::ChannelUsername(setting.to_string()));
    }
    setting.parse::<i64>().ok().map(|id| Recipient::Id(ChatId(id)))
}

/// Human-readable rendering of a duration in seconds, to the largest
/// sensible unit. "2 hours", "1 minute", "45 seconds".
#[must_use]
pub fn format_duration(seconds: u32) -> String {
    fn plural(n: u32, unit: &str) -> String {
        if n == 1 {
            format!("{n} {unit}")
        } else {
            format!("{n} {unit}s")
        }
    }

    if seconds >= 86400 {
        plural(seconds / 86400, "day")
    } else if seconds >= 3600 {
        plural(seconds / 3600, "hour")
    } else if seconds >= 60 {
        plural(seconds / 60, "minute")
    } else {
        plural(seconds, "second")
    }
}
