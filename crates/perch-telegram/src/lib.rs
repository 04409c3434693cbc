//! Telegram adapter (teloxide).
//!
//! Implements the `perch-core` gateway port over the Telegram Bot API using
//! long polling. The runtime never sees teloxide types: `connect` suspends
//! inside the dispatcher until `disconnect` uses the dispatcher's shutdown
//! token to wind it down.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teloxide::{dispatching::ShutdownToken, dptree, prelude::*};
use tracing::{debug, info, warn};

use perch_core::{
    config::BotAuth,
    gateway::{CommandRouter, GatewaySession},
    Error, Result,
};

pub struct TelegramGateway {
    router: Arc<CommandRouter>,
    shutdown: Mutex<Option<ShutdownToken>>,
}

impl TelegramGateway {
    pub fn new(router: Arc<CommandRouter>) -> Self {
        Self {
            router,
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl GatewaySession for TelegramGateway {
    async fn connect(&self, auth: &BotAuth) -> Result<()> {
        let bot = Bot::new(auth.token.clone());

        match bot.get_me().await {
            Ok(me) => info!("connected to telegram as @{}", me.username()),
            Err(e) => warn!("could not fetch bot identity: {e}"),
        }

        let handler = Update::filter_message().endpoint(handle_message);
        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self.router.clone()])
            .build();

        if let Ok(mut guard) = self.shutdown.lock() {
            *guard = Some(dispatcher.shutdown_token());
        }

        dispatcher.dispatch().await;
        Ok(())
    }

    async fn disconnect(&self) {
        let token = self
            .shutdown
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(token) = token {
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => debug!("dispatcher was not running: {e}"),
            }
        }
    }
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    router: Arc<CommandRouter>,
) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    match router.dispatch(msg.chat.id.0, text).await {
        Some(Ok(reply)) => {
            bot.send_message(msg.chat.id, reply).await?;
        }
        Some(Err(e)) => {
            // Extension failures are isolated: report to the chat, keep the
            // process alive.
            warn!("command failed: {e}");
            let _ = bot
                .send_message(msg.chat.id, user_facing_error(&e))
                .await;
        }
        None => {}
    }

    Ok(())
}

fn user_facing_error(e: &Error) -> String {
    format!("Something went wrong handling that command: {e}")
}
