use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use perch_core::{
    extensions::{Extension, RegistrationContext},
    gateway::{CommandContext, CommandHandler},
    shutdown::ShutdownAction,
    Result,
};

/// `/uptime` reports how long the process has been running. On shutdown it
/// logs the final session length via the shutdown registry.
pub struct UptimeExt {
    started: DateTime<Utc>,
}

impl UptimeExt {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
        }
    }
}

#[async_trait]
impl Extension for UptimeExt {
    async fn setup(&self, ctx: &mut RegistrationContext) -> Result<()> {
        ctx.register_command(
            "uptime",
            Arc::new(UptimeHandler {
                started: self.started,
            }),
        )?;

        let started = self.started;
        ctx.on_shutdown(ShutdownAction::defer(move || {
            info!("session length: {}", format_span(started, Utc::now()));
            Ok(())
        }))
    }
}

struct UptimeHandler {
    started: DateTime<Utc>,
}

#[async_trait]
impl CommandHandler for UptimeHandler {
    async fn handle(&self, _ctx: CommandContext) -> Result<String> {
        Ok(format!("up {}", format_span(self.started, Utc::now())))
    }
}

fn format_span(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let secs = (to - from).num_seconds().max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);

    match (days, hours, mins) {
        (0, 0, 0) => format!("{secs}s"),
        (0, 0, _) => format!("{mins}m {secs}s"),
        (0, _, _) => format!("{hours}h {mins}m {secs}s"),
        _ => format!("{days}d {hours}h {mins}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn span_formatting() {
        let t0 = Utc::now();
        assert_eq!(format_span(t0, t0 + Duration::seconds(42)), "42s");
        assert_eq!(format_span(t0, t0 + Duration::seconds(125)), "2m 5s");
        assert_eq!(
            format_span(t0, t0 + Duration::seconds(3 * 3600 + 60 + 1)),
            "3h 1m 1s"
        );
        assert_eq!(
            format_span(t0, t0 + Duration::days(2) + Duration::seconds(3600)),
            "2d 1h 0m"
        );
        // A clock that goes backwards never produces a negative span.
        assert_eq!(format_span(t0, t0 - Duration::seconds(5)), "0s");
    }
}
