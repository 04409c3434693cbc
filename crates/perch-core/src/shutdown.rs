//! Ordered cleanup actions, drained exactly once at shutdown.
//!
//! Any component may register work to run when the process stops: either a
//! deferred zero-argument callable or an operation that is already in
//! flight. Actions run strictly one at a time in registration order, so
//! "close the DB pool" registered after the things that use it will also run
//! after them. Registering from *inside* a running action is supported and
//! the new action joins the tail of the same drain pass.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
};

use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, error, info};

use crate::{Error, Result};

/// A single unit of shutdown work.
pub enum ShutdownAction {
    /// Deferred callable, invoked during the drain.
    Deferred(Box<dyn FnOnce() -> Result<()> + Send + 'static>),
    /// An already-scheduled asynchronous operation, awaited during the drain.
    Pending(BoxFuture<'static, Result<()>>),
}

impl ShutdownAction {
    pub fn defer<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::Deferred(Box::new(f))
    }

    pub fn pending<Fut>(fut: Fut) -> Self
    where
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self::Pending(fut.boxed())
    }
}

const ARMED: u8 = 0;
const DRAINING: u8 = 1;
const DRAINED: u8 = 2;

/// FIFO queue of [`ShutdownAction`]s with an at-most-once drain.
pub struct ShutdownRegistry {
    queue: Mutex<VecDeque<ShutdownAction>>,
    state: AtomicU8,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(ARMED),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        self.state.load(Ordering::SeqCst) == DRAINED
    }

    /// Appends an action to the queue.
    ///
    /// Allowed at any time before the drain finishes, including from within
    /// an action the drain is currently executing; such an action runs in
    /// the same pass, after the existing tail. Once the drain has completed
    /// there is no later pass, so registration is rejected.
    pub fn register(&self, action: ShutdownAction) -> Result<()> {
        // A poisoned lock only means some earlier action panicked while the
        // queue was held; the queue itself is still usable.
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the queue lock: `drain` stores DRAINED under the
        // same lock once the queue is empty, so an accepted registration
        // is always still visible to the drain loop.
        if self.is_drained() {
            return Err(Error::RegistryDrained);
        }
        queue.push_back(action);
        Ok(())
    }

    /// Executes every queued action in FIFO order, one at a time.
    ///
    /// The queue length is re-checked on every iteration, so cascading
    /// registrations are picked up. A failing or panicking action is
    /// reported and the remaining queue still runs. Returns the number of
    /// actions that failed. Runs at most once; a second call is a no-op.
    pub async fn drain(&self) -> usize {
        if self
            .state
            .compare_exchange(ARMED, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("shutdown registry already drained");
            return 0;
        }

        let mut executed = 0usize;
        let mut failures = 0usize;

        loop {
            // The lock is held only for the pop, never across an action, so
            // actions are free to register more cleanup while they run. The
            // terminal state is stored while the lock is still held, which
            // closes the window where `register` could accept an action
            // after the final pop found the queue empty.
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                let next = queue.pop_front();
                if next.is_none() {
                    self.state.store(DRAINED, Ordering::SeqCst);
                }
                next
            };
            let Some(action) = next else { break };
            executed += 1;

            let outcome = match action {
                ShutdownAction::Deferred(f) => panic::catch_unwind(AssertUnwindSafe(f)),
                ShutdownAction::Pending(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("shutdown action failed: {e}");
                    failures += 1;
                }
                Err(_) => {
                    // Programming error in the action itself; isolated so
                    // the rest of the queue still gets its chance.
                    error!("shutdown action panicked; continuing with remaining actions");
                    failures += 1;
                }
            }
        }

        info!("shutdown registry drained: {executed} action(s), {failures} failure(s)");
        failures
    }
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn log_action(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> ShutdownAction {
        let log = log.clone();
        ShutdownAction::defer(move || {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[tokio::test]
    async fn drains_in_registration_order() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(log_action(&log, "a")).unwrap();
        registry.register(log_action(&log, "b")).unwrap();
        registry.register(log_action(&log, "c")).unwrap();

        assert_eq!(registry.drain().await, 0);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cascading_registration_runs_in_same_pass() {
        let registry = Arc::new(ShutdownRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        // Executing A registers D; D must run after C, before drain returns.
        {
            let registry = registry.clone();
            let log_outer = log.clone();
            let log_inner = log.clone();
            registry
                .clone()
                .register(ShutdownAction::defer(move || {
                    log_outer.lock().unwrap().push("a");
                    registry.register(log_action(&log_inner, "d"))?;
                    Ok(())
                }))
                .unwrap();
        }
        registry.register(log_action(&log, "b")).unwrap();
        registry.register(log_action(&log, "c")).unwrap();

        registry.drain().await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn drain_runs_at_most_once() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(log_action(&log, "once")).unwrap();
        registry.drain().await;
        registry.drain().await;

        assert_eq!(*log.lock().unwrap(), vec!["once"]);
        assert!(registry.is_drained());
    }

    #[tokio::test]
    async fn registration_after_drain_is_rejected() {
        let registry = ShutdownRegistry::new();
        registry.drain().await;

        let err = registry
            .register(ShutdownAction::defer(|| Ok(())))
            .unwrap_err();
        assert!(matches!(err, Error::RegistryDrained));
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_the_queue() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry
            .register(ShutdownAction::defer(|| {
                Err(Error::Extension("bad cleanup".to_string()))
            }))
            .unwrap();
        registry
            .register(ShutdownAction::defer(|| panic!("worse cleanup")))
            .unwrap();
        registry.register(log_action(&log, "survivor")).unwrap();

        let failures = registry.drain().await;
        assert_eq!(failures, 2);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn concurrent_registrations_either_run_or_are_rejected() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = Arc::new(ShutdownRegistry::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let accepted = accepted.clone();
                let executed = executed.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let executed = executed.clone();
                        let action = ShutdownAction::defer(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        if registry.register(action).is_ok() {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        registry.drain().await;
        for w in writers {
            w.join().unwrap();
        }

        // No accepted action may vanish: everything register said yes to
        // was executed, everything after the drain was rejected.
        assert_eq!(
            executed.load(Ordering::SeqCst),
            accepted.load(Ordering::SeqCst)
        );
        assert!(registry.is_drained());
    }

    #[tokio::test]
    async fn pending_operations_are_awaited_in_order() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        registry
            .register(ShutdownAction::pending(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                log_a.lock().unwrap().push("async");
                Ok(())
            }))
            .unwrap();
        registry.register(log_action(&log, "sync")).unwrap();

        registry.drain().await;
        assert_eq!(*log.lock().unwrap(), vec!["async", "sync"]);
    }
}
