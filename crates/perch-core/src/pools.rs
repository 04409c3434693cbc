//! Process-wide resource pools.
//!
//! One [`ResourcePools`] value is owned by the composition root and handed
//! out by reference; every resource inside it is a lazily-created singleton.
//! CPU-bound and I/O-bound work runs on fixed-size pools of OS threads so
//! long-running jobs never block the event loop; the HTTP client and the
//! database pool are shared handles. Nothing outside [`ResourcePools::close_all`]
//! may terminate any of them, which is what makes use-after-close impossible
//! while the runtime is in its RUNNING state.
//!
//! Sizing policy: CPU-bound work saturates cores, so the CPU pool gets
//! 2 x logical cores; I/O-bound work mostly waits, so the I/O pool gets
//! 5 x logical cores. Both floor at one core even if detection fails.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crossbeam_channel::{unbounded, Sender};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error, info};

use crate::{config::DbConfig, errors::Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub fn logical_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// 2 x cores, floored at one core.
pub fn cpu_pool_size(cores: usize) -> usize {
    2 * cores.max(1)
}

/// 5 x cores, floored at one core.
pub fn io_pool_size(cores: usize) -> usize {
    5 * cores.max(1)
}

/// A bounded pool of OS threads fed from a shared work queue.
///
/// Jobs have no ordering guarantee relative to each other. Shutdown is a
/// graceful drain: the queue is closed, workers finish whatever is already
/// queued, then exit.
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();

        let workers: Vec<thread::JoinHandle<()>> = (0..size)
            .filter_map(|i| {
                let rx = rx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            // A panicking job must not take the worker down
                            // with it; the payload was already reported by
                            // the panic hook.
                            let _ = panic::catch_unwind(AssertUnwindSafe(job));
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        error!("failed to spawn {name} pool worker {i}: {e}");
                        None
                    }
                }
            })
            .collect();

        let live = workers.len();
        info!("made {name} pool with {live} of {size} workers");

        Self {
            name,
            size: live,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Number of workers that actually started, which is what queued jobs
    /// will be spread across.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a fire-and-forget job.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self
            .sender
            .lock()
            .map_err(|_| Error::Pool(format!("{} pool lock poisoned", self.name)))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| Error::Pool(format!("{} pool is shut down", self.name))),
            None => Err(Error::Pool(format!("{} pool is shut down", self.name))),
        }
    }

    /// Runs a job on the pool and awaits its result without blocking the
    /// event loop.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.spawn(move || {
            let _ = tx.send(job());
        })?;
        rx.await
            .map_err(|_| Error::Pool(format!("{} pool worker dropped the result", self.name)))
    }

    /// Closes the queue and joins every worker, letting queued jobs finish.
    /// Idempotent; the second call finds nothing left to do.
    fn shutdown(&self) -> Result<()> {
        let tx = self
            .sender
            .lock()
            .map_err(|_| Error::PoolClose {
                pool: self.name,
                message: "lock poisoned".to_string(),
            })?
            .take();
        if tx.is_none() {
            debug!("{} pool already shut down", self.name);
            return Ok(());
        }
        drop(tx);

        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => {
                return Err(Error::PoolClose {
                    pool: self.name,
                    message: "worker list lock poisoned".to_string(),
                })
            }
        };

        let mut failed = 0usize;
        for handle in handles {
            if handle.join().is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::PoolClose {
                pool: self.name,
                message: format!("{failed} worker(s) panicked during drain"),
            });
        }

        info!("{} pool drained and shut down", self.name);
        Ok(())
    }
}

#[derive(Default)]
struct PoolsInner {
    cpu: Option<Arc<WorkerPool>>,
    io: Option<Arc<WorkerPool>>,
    http: Option<reqwest::Client>,
    db: Option<PgPool>,
}

/// The process-wide pool set. At most one of each resource exists; each is
/// created on first acquisition and destroyed exactly once by `close_all`.
pub struct ResourcePools {
    inner: tokio::sync::Mutex<PoolsInner>,
    closed: AtomicBool,
}

impl ResourcePools {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(PoolsInner::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self, what: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Pool(format!("{what} requested after close_all")));
        }
        Ok(())
    }

    pub async fn acquire_cpu_pool(&self) -> Result<Arc<WorkerPool>> {
        self.check_open("cpu pool")?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .cpu
            .get_or_insert_with(|| {
                Arc::new(WorkerPool::new("cpu", cpu_pool_size(logical_cores())))
            })
            .clone())
    }

    pub async fn acquire_io_pool(&self) -> Result<Arc<WorkerPool>> {
        self.check_open("io pool")?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .io
            .get_or_insert_with(|| Arc::new(WorkerPool::new("io", io_pool_size(logical_cores()))))
            .clone())
    }

    /// Shared HTTP client session. `reqwest::Client` is itself a cheap
    /// cloneable handle around a connection pool.
    pub async fn acquire_http(&self) -> Result<reqwest::Client> {
        self.check_open("http session")?;
        let mut inner = self.inner.lock().await;
        if let Some(client) = &inner.http {
            debug!("acquiring existing http session");
            return Ok(client.clone());
        }
        info!("initialising http session");
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Pool(format!("http session: {e}")))?;
        inner.http = Some(client.clone());
        Ok(client)
    }

    /// Shared database pool, configured from the `database` config section.
    /// Connects lazily; no round-trip happens until the pool is first used.
    pub async fn acquire_db(&self, cfg: &DbConfig) -> Result<PgPool> {
        self.check_open("database pool")?;
        let mut inner = self.inner.lock().await;
        if let Some(pool) = &inner.db {
            debug!("acquiring existing database pool");
            return Ok(pool.clone());
        }
        info!("initialising database pool from config");
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_lazy(&cfg.url)?;
        inner.db = Some(pool.clone());
        Ok(pool)
    }

    /// Shuts down every created pool exactly once, draining outstanding work.
    ///
    /// Idempotent: the second call is a no-op. One pool's failure never
    /// stops the others from closing; every failure is logged and returned.
    pub async fn close_all(&self) -> Vec<Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("pools already closed");
            return Vec::new();
        }

        let (cpu, io, http, db) = {
            let mut inner = self.inner.lock().await;
            (
                inner.cpu.take(),
                inner.io.take(),
                inner.http.take(),
                inner.db.take(),
            )
        };

        let mut failures = Vec::new();

        for pool in [cpu, io].into_iter().flatten() {
            if let Err(e) = pool.shutdown() {
                error!("pool close failure: {e}");
                failures.push(e);
            }
        }

        // The HTTP client has no explicit close; dropping the last handle
        // tears down its connection pool.
        drop(http);

        if let Some(pool) = db {
            info!("closing database pool");
            pool.close().await;
        }

        failures
    }
}

impl Default for ResourcePools {
    fn default() -> Self {
        Self::new()
    }
}
