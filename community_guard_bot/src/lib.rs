//! Source code for Community Guard Bot, a moderation bot for communities
//! that span multiple Telegram groups under one shared ruleset.

/// Various types used throughout.
mod types;

/// Per-community moderation settings.
mod settings;

/// The database.
mod database;

/// Miscellaneous functions.
mod misc;

/// Functions that perform stuff via the bot.
mod actions;

/// Detection of one user joining many community groups in a short time.
mod multi_join;

/// The message-level auto-moderation engine.
mod automod;

/// Functions that handle events from Telegram.
mod handlers;

/// Entry function that starts the bot.
mod entry;
pub use entry::*;
