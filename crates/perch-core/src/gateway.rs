//! Hexagonal port for the real-time messaging session.
//!
//! The runtime treats the messaging client as an opaque connected session:
//! `connect` suspends until disconnect, interrupt or unrecoverable error,
//! and `disconnect` asks it to stop. Extensions never touch the session
//! directly; they register handlers on the [`CommandRouter`], which the
//! adapter drives with inbound messages.

use std::{collections::HashMap, sync::Arc, sync::RwLock};

use async_trait::async_trait;

use crate::{config::BotAuth, Error, Result};

/// An inbound command, already split off its arguments by the router.
#[derive(Clone, Debug)]
pub struct CommandContext {
    pub chat_id: i64,
    pub args: Vec<String>,
}

/// A message handler an extension registers for one command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handles the command and returns the reply text.
    async fn handle(&self, ctx: CommandContext) -> Result<String>;
}

/// The dispatch mechanism extensions use to register message handlers.
#[derive(Default)]
pub struct CommandRouter {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `name`. Registering a duplicate name fails
    /// loudly before any side effect.
    pub fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(name) {
            return Err(Error::DuplicateCommand(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Removes a handler; returns whether one was present.
    pub fn deregister(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Routes `/command arg...` text to its handler.
    ///
    /// Returns `None` when the text is not a command or no handler matches;
    /// the adapter decides whether to ignore or answer "unknown command".
    pub async fn dispatch(&self, chat_id: i64, text: &str) -> Option<Result<String>> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?;
        let args: Vec<String> = parts.map(str::to_string).collect();

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(name).cloned()
        }?;

        Some(handler.handle(CommandContext { chat_id, args }).await)
    }
}

/// The opaque connected session supplied by an adapter crate.
#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Connects with the given credentials and serves until the session
    /// ends. Suspends the caller for the whole lifetime of the connection.
    async fn connect(&self, auth: &BotAuth) -> Result<()>;

    /// Asks a running session to stop; `connect` then returns.
    async fn disconnect(&self);
}
