use std::{fs, sync::Arc};
use teloxide::{dptree::deps, prelude::*};

use crate::{
    actions::auto_delete_spinloop,
    database::Database,
    handlers::{self, commands::Command},
    multi_join::MultiJoinDetector,
};

/// # Panics
///
/// Panics if there's no key file
pub async fn entry() {
    let key = fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!");

    let bot = Bot::new(key);

    bot.set_my_commands(Command::generate_bot_commands())
        .await
        .expect("Failed to set bot commands!");

    let database: Arc<Database> = Database::new().await.expect("Failed to create database!");
    let detector = Arc::new(MultiJoinDetector::new());

    tokio::spawn(auto_delete_spinloop(bot.clone(), Arc::downgrade(&database)));

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::handle_message))
        .branch(Update::filter_chat_member().endpoint(handlers::handle_chat_member_update));

    log::info!("Dispatching the dispatcher!");

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(deps![database, detector])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("it appears we have been bonked.");
}
