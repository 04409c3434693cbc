//! The top-level run loop and its state machine.
//!
//! [`Runtime`] owns the whole process lifecycle: it validates the auth
//! config, installs termination-signal listeners, runs the gateway session
//! until it ends or an interrupt arrives, then performs the ordered
//! shutdown sequence (unload extensions, drain the shutdown registry, close
//! the pools, disconnect the session). Shutdown runs at most once and a
//! failing step never stops the steps after it; the priority is exiting
//! cleanly, not exiting with a perfect report.
//!
//! Signal handlers never run shutdown themselves. They only send on a watch
//! channel the run loop observes at its suspension points, which keeps
//! signal context trivial. A second signal arriving while shutdown is in
//! progress forces an immediate exit so repeated operator interrupts cannot
//! hang the process.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::BotAuth, extensions::ExtensionManager, gateway::GatewaySession, pools::ResourcePools,
    shutdown::ShutdownRegistry, Error, Result,
};

/// Exit code when a repeated interrupt forces shutdown to be abandoned.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Lifecycle stage of the bot process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// What to do with an incoming termination signal, given the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InterruptAction {
    /// Signal the run loop and let the graceful sequence happen.
    Graceful,
    /// Shutdown is already in progress; give up on it and exit now.
    Forced,
}

pub struct Runtime {
    config: Arc<Value>,
    session: Arc<dyn GatewaySession>,
    extensions: Arc<ExtensionManager>,
    pools: Arc<ResourcePools>,
    registry: Arc<ShutdownRegistry>,
    state: AtomicU8,
    interrupt_tx: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(
        config: Arc<Value>,
        session: Arc<dyn GatewaySession>,
        extensions: Arc<ExtensionManager>,
        pools: Arc<ResourcePools>,
        registry: Arc<ShutdownRegistry>,
    ) -> Self {
        let (interrupt_tx, _) = watch::channel(false);
        Self {
            config,
            session,
            extensions,
            pools,
            registry,
            state: AtomicU8::new(NOT_STARTED),
            interrupt_tx,
        }
    }

    pub fn state(&self) -> RunState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => RunState::Running,
            STOPPING => RunState::Stopping,
            STOPPED => RunState::Stopped,
            _ => RunState::NotStarted,
        }
    }

    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    /// Runs the bot to completion: start, serve, shut down.
    ///
    /// Fails with [`Error::Config`] before any state change if the `auth`
    /// section is missing its `token` or `client_id`.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let auth = BotAuth::from_config(&self.config)?;

        if self
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        // Subscribe before the listener exists so an interrupt arriving
        // during startup cannot slip between the two.
        let mut interrupt_rx = self.interrupt_tx.subscribe();
        self.spawn_signal_listener();

        info!("starting gateway session as client {}", auth.client_id);

        tokio::select! {
            res = self.session.connect(&auth) => match res {
                Ok(()) => info!("gateway session ended normally"),
                Err(e) => error!("gateway session failed: {e}"),
            },
            _ = interrupt_rx.changed() => {
                warn!("interrupt received; beginning graceful shutdown");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Performs the ordered shutdown sequence exactly once.
    ///
    /// A second caller (or a second interrupt racing the first) finds the
    /// state already past `Running` and returns after a log line. Every
    /// step is best-effort: failures are logged by the step itself and the
    /// sequence continues. The state always ends at `Stopped`.
    pub async fn shutdown(&self) {
        if self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("shutdown requested but not running (state: {:?})", self.state());
            return;
        }

        info!("unloading extensions, then stopping");
        self.extensions.unload_all().await;

        let failures = self.registry.drain().await;
        if failures > 0 {
            warn!("{failures} shutdown action(s) failed; continuing");
        }

        let pool_failures = self.pools.close_all().await;
        if !pool_failures.is_empty() {
            warn!("{} pool(s) failed to close cleanly; continuing", pool_failures.len());
        }

        self.session.disconnect().await;

        self.state.store(STOPPED, Ordering::SeqCst);
        info!("shutdown complete");
    }

    /// Reacts to a termination signal.
    ///
    /// Before shutdown begins this only nudges the run loop over the watch
    /// channel. Once shutdown is in progress, a further interrupt abandons
    /// the graceful path and exits immediately with [`FORCED_EXIT_CODE`].
    pub fn interrupt(&self) {
        match self.classify_interrupt() {
            InterruptAction::Graceful => {
                info!("termination signal received");
                let _ = self.interrupt_tx.send(true);
            }
            InterruptAction::Forced => {
                error!("second interrupt during shutdown; terminating immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }

    fn classify_interrupt(&self) -> InterruptAction {
        match self.state() {
            RunState::Stopping | RunState::Stopped => InterruptAction::Forced,
            RunState::NotStarted | RunState::Running => InterruptAction::Graceful,
        }
    }

    /// The unix signals that all map to the same interrupt condition:
    /// SIGTERM and SIGQUIT from orchestrators, SIGABRT from supervisors
    /// that escalate. SIGINT arrives separately through `ctrl_c`.
    #[cfg(unix)]
    fn termination_signals() -> [tokio::signal::unix::SignalKind; 3] {
        use tokio::signal::unix::SignalKind;
        [
            SignalKind::terminate(),
            SignalKind::quit(),
            SignalKind::from_raw(libc::SIGABRT),
        ]
    }

    #[cfg(unix)]
    fn spawn_signal_listener(self: &Arc<Self>) {
        use tokio::signal::unix::signal;

        let [term_kind, quit_kind, abort_kind] = Self::termination_signals();
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut term = match signal(term_kind) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut quit = match signal(quit_kind) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGQUIT handler: {e}");
                    return;
                }
            };
            let mut abort = match signal(abort_kind) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGABRT handler: {e}");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = quit.recv() => {}
                    _ = abort.recv() => {}
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            error!("ctrl-c listener failed: {e}");
                            return;
                        }
                    }
                }
                runtime.interrupt();
            }
        });
    }

    #[cfg(not(unix))]
    fn spawn_signal_listener(self: &Arc<Self>) {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("ctrl-c listener failed: {e}");
                    return;
                }
                runtime.interrupt();
            }
        });
    }
}
