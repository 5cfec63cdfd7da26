//! Common plumbing shared by the guard bots: runtime and logging
//! bootstrap, admin lookups, and a send helper that doesn't fall over
//! the moment Telegram says "retry after".

use std::future::Future;

use teloxide::{
    payloads::SendMessageSetters,
    prelude::*,
    types::{Message, MessageId, Recipient, ReplyParameters},
    RequestError,
};

/// Initialize logging and run the `closure` in an async runtime.
/// Logging is enabled by default on level `info` unless overridden
/// by environment variable `RUST_LOG`. This uses the crate
/// [pretty_env_logger][] internally, see its documentation for more details.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
pub fn start_everything(closure: impl Future<Output = ()>) {
    let log_level = std::env::var_os("RUST_LOG")
        .unwrap_or_else(|| std::ffi::OsString::from("info"))
        .into_string()
        .unwrap_or_else(|_| String::from("info"));

    // systemd's journal stamps lines on its own, so skip our own timestamps there.
    let running_as_systemd_service = std::env::var_os("JOURNAL_STREAM").is_some();

    let mut builder = match running_as_systemd_service {
        true => pretty_env_logger::formatted_builder(),
        false => pretty_env_logger::formatted_timed_builder(),
    };

    builder.parse_filters(&log_level);

    if builder.try_init().is_err() {
        log::error!("Tried to init logger twice!");
    }

    log::info!("hi");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(closure);
}

/// Find out if a user of this ID is an admin of the specified chat of that ID.
/// If so, returns the `ChatMember` object describing their permissions,
/// otherwise `None`.
pub async fn get_admin_of(
    bot: &Bot,
    user: UserId,
    chat: ChatId,
) -> Result<Option<teloxide::types::ChatMember>, teloxide::RequestError> {
    Ok(bot
        .get_chat_administrators(chat)
        .await?
        .into_iter()
        .find(|x| x.user.id == user))
}

/// How many times to try a send before giving up.
const SEND_ATTEMPTS: u8 = 3;

pub trait BotGuardSendMsg {
    /// Send a message with HTML markup, retrying on flood waits.
    /// Anything longer than Telegram's character limit gets truncated;
    /// our notices are short enough that this never matters in practice.
    fn guard_send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: &'a str,
        reply_to: impl Into<Option<MessageId>> + Send,
    ) -> impl Future<Output = Result<Message, RequestError>> + Send;
}

impl BotGuardSendMsg for Bot {
    async fn guard_send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: &'a str,
        reply_to: impl Into<Option<MessageId>> + Send,
    ) -> Result<Message, RequestError> {
        let to_where: Recipient = to_where.into();
        let reply_to = reply_to.into();

        let text = match text.char_indices().nth(4096) {
            Some((cutoff, _)) => &text[..cutoff],
            None => text,
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let mut request = self
                .send_message(to_where.clone(), text)
                .parse_mode(teloxide::types::ParseMode::Html);
            if let Some(reply_to) = reply_to {
                request = request.reply_parameters(ReplyParameters::new(reply_to));
            }

            match request.await {
                Err(RequestError::RetryAfter(duration)) if attempt < SEND_ATTEMPTS => {
                    tokio::time::sleep(duration.duration()).await;
                }
                other => return other,
            }
        }
    }
}
