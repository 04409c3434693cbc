//! Loadable feature modules ("extensions").
//!
//! An extension is a named unit exposing `setup`/`teardown` hooks. Factories
//! are registered explicitly at program initialization; `load` builds the
//! extension and runs its setup hook against a [`RegistrationContext`] that
//! records everything the extension registers. If setup fails, that record
//! is used to roll the partial registration back, so an extension is always
//! either fully loaded or fully absent.

use std::{collections::HashMap, sync::Arc, sync::RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    gateway::{CommandHandler, CommandRouter},
    pools::ResourcePools,
    shutdown::{ShutdownAction, ShutdownRegistry},
    Error, Result,
};

/// A named, independently loadable unit of bot functionality.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Registers the extension's handlers and resources.
    async fn setup(&self, ctx: &mut RegistrationContext) -> Result<()>;

    /// Releases anything `setup` acquired. Best-effort; failures are logged
    /// by the manager and never re-raised.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Extension")
    }
}

/// Builds a fresh extension instance on each load.
pub type ExtensionFactory = Box<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// What an extension gets to see while its setup hook runs.
///
/// Command registrations made through the context are tracked so a failed
/// setup can be rolled back without leaving stray handlers behind.
pub struct RegistrationContext {
    router: Arc<CommandRouter>,
    pools: Arc<ResourcePools>,
    registry: Arc<ShutdownRegistry>,
    commands: Vec<String>,
}

impl RegistrationContext {
    pub fn register_command(&mut self, name: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        self.router.register(name, handler)?;
        self.commands.push(name.to_string());
        Ok(())
    }

    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    pub fn on_shutdown(&self, action: ShutdownAction) -> Result<()> {
        self.registry.register(action)
    }
}

struct LoadedExtension {
    ext: Arc<dyn Extension>,
    commands: Vec<String>,
}

/// Tracks the set of active extensions and owns their load/unload protocol.
pub struct ExtensionManager {
    factories: RwLock<HashMap<String, ExtensionFactory>>,
    active: tokio::sync::Mutex<HashMap<String, LoadedExtension>>,
    router: Arc<CommandRouter>,
    pools: Arc<ResourcePools>,
    registry: Arc<ShutdownRegistry>,
}

impl ExtensionManager {
    pub fn new(
        router: Arc<CommandRouter>,
        pools: Arc<ResourcePools>,
        registry: Arc<ShutdownRegistry>,
    ) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            active: tokio::sync::Mutex::new(HashMap::new()),
            router,
            pools,
            registry,
        }
    }

    /// Makes an extension available for loading. Called once per concrete
    /// extension type at program initialization.
    pub fn register_factory(&self, name: &str, factory: ExtensionFactory) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), factory);
    }

    /// Names of all currently active extensions.
    pub async fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active.lock().await.contains_key(name)
    }

    /// Loads `name`, running its setup hook.
    ///
    /// Fails with [`Error::AlreadyLoaded`] if active and
    /// [`Error::UnknownExtension`] if no factory exists. A failing setup is
    /// rolled back (registered commands removed, teardown attempted) before
    /// the original cause is surfaced as [`Error::LoadFailure`].
    pub async fn load(&self, name: &str) -> Result<Arc<dyn Extension>> {
        // The active-set lock is held across setup so two concurrent loads
        // of the same name cannot interleave.
        let mut active = self.active.lock().await;
        if active.contains_key(name) {
            return Err(Error::AlreadyLoaded(name.to_string()));
        }

        let ext = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            let factory = factories
                .get(name)
                .ok_or_else(|| Error::UnknownExtension(name.to_string()))?;
            factory()
        };

        info!("loading extension {name:?}");
        let mut ctx = RegistrationContext {
            router: self.router.clone(),
            pools: self.pools.clone(),
            registry: self.registry.clone(),
            commands: Vec::new(),
        };

        match ext.setup(&mut ctx).await {
            Ok(()) => {
                active.insert(
                    name.to_string(),
                    LoadedExtension {
                        ext: ext.clone(),
                        commands: ctx.commands,
                    },
                );
                Ok(ext)
            }
            Err(source) => {
                // Roll back whatever the half-initialized extension managed
                // to register. A rollback failure is logged, never allowed
                // to mask the original error.
                for cmd in &ctx.commands {
                    self.router.deregister(cmd);
                }
                if let Err(e) = ext.teardown().await {
                    warn!("rollback teardown of {name:?} failed: {e}");
                }
                Err(Error::LoadFailure {
                    name: name.to_string(),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Unloads `name`, removing its handlers and running its teardown hook.
    /// Teardown failure is logged but does not fail the unload.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let removed = self.active.lock().await.remove(name);
        let Some(loaded) = removed else {
            return Err(Error::UnknownExtension(name.to_string()));
        };

        info!("unloading extension {name:?}");
        for cmd in &loaded.commands {
            self.router.deregister(cmd);
        }
        if let Err(e) = loaded.ext.teardown().await {
            warn!("teardown of {name:?} failed: {e}");
        }
        Ok(())
    }

    /// Attempts to unload every active extension, continuing past
    /// individual failures. Order is unspecified.
    pub async fn unload_all(&self) {
        let names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unload(&name).await {
                warn!("failed to unload extension {name:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CommandContext;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Pong;

    #[async_trait]
    impl CommandHandler for Pong {
        async fn handle(&self, _ctx: CommandContext) -> Result<String> {
            Ok("pong".to_string())
        }
    }

    struct PingExt {
        torn_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Extension for PingExt {
        async fn setup(&self, ctx: &mut RegistrationContext) -> Result<()> {
            ctx.register_command("ping", Arc::new(Pong))
        }

        async fn teardown(&self) -> Result<()> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Registers one command, then fails setup.
    struct BrokenExt;

    #[async_trait]
    impl Extension for BrokenExt {
        async fn setup(&self, ctx: &mut RegistrationContext) -> Result<()> {
            ctx.register_command("halfway", Arc::new(Pong))?;
            Err(Error::Extension("setup exploded".to_string()))
        }
    }

    struct StubbornExt;

    #[async_trait]
    impl Extension for StubbornExt {
        async fn setup(&self, _ctx: &mut RegistrationContext) -> Result<()> {
            Ok(())
        }

        async fn teardown(&self) -> Result<()> {
            Err(Error::Extension("refusing to die".to_string()))
        }
    }

    fn manager() -> (ExtensionManager, Arc<CommandRouter>, Arc<AtomicBool>) {
        let router = Arc::new(CommandRouter::new());
        let pools = Arc::new(ResourcePools::new());
        let registry = Arc::new(ShutdownRegistry::new());
        let torn_down = Arc::new(AtomicBool::new(false));

        let mgr = ExtensionManager::new(router.clone(), pools, registry);
        {
            let torn_down = torn_down.clone();
            mgr.register_factory(
                "ping",
                Box::new(move || {
                    Arc::new(PingExt {
                        torn_down: torn_down.clone(),
                    })
                }),
            );
        }
        mgr.register_factory("broken", Box::new(|| Arc::new(BrokenExt)));
        mgr.register_factory("stubborn", Box::new(|| Arc::new(StubbornExt)));
        (mgr, router, torn_down)
    }

    #[tokio::test]
    async fn load_registers_commands() {
        let (mgr, router, _) = manager();
        mgr.load("ping").await.unwrap();
        assert!(mgr.is_active("ping").await);
        assert_eq!(router.commands(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_load_fails_and_keeps_one_entry() {
        let (mgr, _, _) = manager();
        mgr.load("ping").await.unwrap();

        let err = mgr.load("ping").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyLoaded(_)));
        assert_eq!(mgr.active().await, vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn unknown_name_is_reported() {
        let (mgr, _, _) = manager();
        assert!(matches!(
            mgr.load("nope").await.unwrap_err(),
            Error::UnknownExtension(_)
        ));
        assert!(matches!(
            mgr.unload("nope").await.unwrap_err(),
            Error::UnknownExtension(_)
        ));
    }

    #[tokio::test]
    async fn failed_setup_leaves_no_partial_registration() {
        let (mgr, router, _) = manager();

        let err = mgr.load("broken").await.unwrap_err();
        match &err {
            Error::LoadFailure { name, source } => {
                assert_eq!(name, "broken");
                assert!(matches!(**source, Error::Extension(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!mgr.is_active("broken").await);
        assert!(router.commands().is_empty());
    }

    #[tokio::test]
    async fn broken_sibling_does_not_affect_loaded_extension() {
        let (mgr, _, _) = manager();
        mgr.load("ping").await.unwrap();
        assert!(mgr.load("broken").await.is_err());
        assert_eq!(mgr.active().await, vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn unload_runs_teardown_and_removes_commands() {
        let (mgr, router, torn_down) = manager();
        mgr.load("ping").await.unwrap();
        mgr.unload("ping").await.unwrap();

        assert!(torn_down.load(Ordering::SeqCst));
        assert!(!mgr.is_active("ping").await);
        assert!(router.commands().is_empty());
    }

    #[tokio::test]
    async fn unload_all_continues_past_failures() {
        let (mgr, _, _) = manager();
        mgr.load("ping").await.unwrap();
        mgr.load("stubborn").await.unwrap();

        mgr.unload_all().await;
        assert!(mgr.active().await.is_empty());
    }
}
