use std::{path::PathBuf, sync::Arc};

use perch_core::{
    config::{config_path, ConfigFile, DbConfig},
    extensions::ExtensionManager,
    gateway::CommandRouter,
    pools::ResourcePools,
    runtime::Runtime,
    shutdown::ShutdownRegistry,
};
use perch_telegram::TelegramGateway;

mod exts;

#[tokio::main]
async fn main() -> Result<(), perch_core::Error> {
    perch_core::logging::init("perch")?;

    let path: PathBuf = std::env::args()
        .nth(1)
        .map(Into::into)
        .unwrap_or_else(|| config_path("perch.ini"));
    let config_file = ConfigFile::open(path)?;
    let config = config_file.get()?;

    // The composition root owns the single pool set, the shutdown registry
    // and the dispatcher; everything else gets handles.
    let pools = Arc::new(ResourcePools::new());
    let registry = Arc::new(ShutdownRegistry::new());
    let router = Arc::new(CommandRouter::new());

    pools.acquire_cpu_pool().await?;
    pools.acquire_io_pool().await?;
    if let Some(db) = DbConfig::from_config(&config) {
        pools.acquire_db(&db).await?;
    }

    let extensions = Arc::new(ExtensionManager::new(
        router.clone(),
        pools.clone(),
        registry.clone(),
    ));
    exts::register_builtins(&extensions);
    for &name in exts::BUILTINS {
        if let Err(e) = extensions.load(name).await {
            // A broken extension must not keep the bot from starting.
            tracing::error!("skipping extension {name:?}: {e}");
        }
    }

    let gateway = Arc::new(TelegramGateway::new(router));
    let runtime = Arc::new(Runtime::new(config, gateway, extensions, pools, registry));

    runtime.run().await
}
