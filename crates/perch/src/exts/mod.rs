//! Built-in extensions shipped with the binary.

use std::sync::Arc;

use perch_core::extensions::ExtensionManager;

mod ping;
mod uptime;

pub const BUILTINS: &[&str] = &["ping", "uptime"];

/// Makes the built-in extensions loadable. Called once at startup.
pub fn register_builtins(manager: &ExtensionManager) {
    manager.register_factory("ping", Box::new(|| Arc::new(ping::PingExt)));
    manager.register_factory("uptime", Box::new(|| Arc::new(uptime::UptimeExt::new())));
}
