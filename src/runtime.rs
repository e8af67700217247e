//! I/O worker runtime owned by a connection.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, warn};

use crate::error::{Error, InternalKind, Result};

const STARTUP_WAIT: Duration = Duration::from_secs(5);

/// Counts live I/O worker threads.
///
/// Cloning shares the count, so a gauge handed to a connector can be
/// inspected after the connection is gone.
#[derive(Debug, Clone, Default)]
pub struct ThreadGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    live: Mutex<usize>,
    changed: Condvar,
}

impl ThreadGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads currently running.
    pub fn live(&self) -> usize {
        *self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `pred(live)` holds or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(usize) -> bool) -> bool {
        let live = self.inner.live.lock().unwrap_or_else(|e| e.into_inner());
        let (live, _) = self
            .inner
            .changed
            .wait_timeout_while(live, timeout, |n| !pred(*n))
            .unwrap_or_else(|e| e.into_inner());
        pred(*live)
    }

    fn adjust(&self, up: bool) {
        let mut live = self.inner.live.lock().unwrap_or_else(|e| e.into_inner());
        if up {
            *live += 1;
        } else {
            *live = live.saturating_sub(1);
        }
        self.inner.changed.notify_all();
    }
}

/// A multi-threaded tokio runtime with a fixed worker count.
///
/// Dropping it stops the runtime and joins every worker, unless the drop
/// happens inside an async context, where joining is impossible and the
/// workers are released in the background instead.
#[derive(Debug)]
pub struct IoRuntime {
    runtime: Option<Runtime>,
    threads: usize,
    workers: ThreadGauge,
}

impl IoRuntime {
    /// Start `threads` workers and wait for them to come up.
    pub fn start(threads: usize, gauge: ThreadGauge) -> Result<Self> {
        if threads == 0 {
            return Err(Error::invalid("io thread count must be at least 1"));
        }

        let workers = ThreadGauge::new();
        let (up_local, up_shared) = (workers.clone(), gauge.clone());
        let (down_local, down_shared) = (workers.clone(), gauge);

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("colbridge-io")
            .enable_time()
            .on_thread_start(move || {
                up_local.adjust(true);
                up_shared.adjust(true);
            })
            .on_thread_stop(move || {
                down_shared.adjust(false);
                down_local.adjust(false);
            })
            .build()
            .map_err(|e| Error::internal(InternalKind::Runtime, e.to_string()))?;

        if !workers.wait_until(STARTUP_WAIT, |n| n >= threads) {
            warn!(threads, live = workers.live(), "io workers slow to start");
        }
        debug!(threads, "io runtime started");

        Ok(Self {
            runtime: Some(runtime),
            threads,
            workers,
        })
    }

    pub fn handle(&self) -> Option<Handle> {
        self.runtime.as_ref().map(|rt| rt.handle().clone())
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Workers of this runtime still alive.
    pub fn live_workers(&self) -> usize {
        self.workers.live()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Stop the runtime and join its workers.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            warn!("io runtime dropped inside an async context, releasing workers in background");
            runtime.shutdown_background();
            return;
        }

        drop(runtime);
        debug!(threads = self.threads, live = self.workers.live(), "io runtime stopped");
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
