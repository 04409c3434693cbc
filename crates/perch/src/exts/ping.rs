use std::sync::Arc;

use async_trait::async_trait;

use perch_core::{
    extensions::{Extension, RegistrationContext},
    gateway::{CommandContext, CommandHandler},
    pools::ResourcePools,
    Result,
};

/// Liveness check: `/ping` answers `pong`. The reply is computed on the I/O
/// pool, so a successful ping proves the workers are alive too, not just the
/// event loop.
pub struct PingExt;

#[async_trait]
impl Extension for PingExt {
    async fn setup(&self, ctx: &mut RegistrationContext) -> Result<()> {
        ctx.register_command(
            "ping",
            Arc::new(PingHandler {
                pools: ctx.pools().clone(),
            }),
        )
    }
}

struct PingHandler {
    pools: Arc<ResourcePools>,
}

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _ctx: CommandContext) -> Result<String> {
        let pool = self.pools.acquire_io_pool().await?;
        pool.run(|| "pong".to_string()).await
    }
}
