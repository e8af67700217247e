//! An in-process engine serving scripted result sets.
//!
//! `MemoryEngine` behaves like a remote engine from the bridge's point of
//! view: every completion is delivered from a task on the connection's I/O
//! runtime, optionally after a delay. It understands no query language;
//! a statement selects the [`Dataset`] registered under exactly that text.
//! [`Faults`] inject the failures a real engine can produce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::debug;

use crate::engine::{
    CloseHandler, Cluster, Engine, EngineError, OpenHandler, Origin, PendingOperation,
    QueryHandler, QueryMetadata, QueryMetrics, QueryStream, RowHandler, RowVariant, Warning,
};
use crate::options::{Credential, QueryOptions, duration_ms};

pub const REQUEST_CANCELED: i32 = 2;
pub const AUTHENTICATION_FAILURE: i32 = 6;
pub const UNAMBIGUOUS_TIMEOUT: i32 = 14;
pub const UNKNOWN_STATEMENT: i32 = 24045;

/// Rows returned for one statement.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    rows: Vec<Vec<u8>>,
    warnings: Vec<Warning>,
    fail_at: Option<(usize, EngineError)>,
    row_delay: Duration,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows<I, R>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Vec<u8>>,
    {
        self.rows.extend(rows.into_iter().map(Into::into));
        self
    }

    /// Rows given as JSON values, each encoded compactly.
    pub fn json_rows(mut self, rows: &[serde_json::Value]) -> Self {
        self.rows
            .extend(rows.iter().map(|v| v.to_string().into_bytes()));
        self
    }

    pub fn warning(mut self, code: i32, message: impl Into<String>) -> Self {
        self.warnings.push(Warning {
            code,
            message: message.into(),
        });
        self
    }

    /// Fail the stream with `error` instead of delivering row `index`.
    pub fn fail_at(mut self, index: usize, error: EngineError) -> Self {
        self.fail_at = Some((index, error));
        self
    }

    /// Delay before each row is delivered.
    pub fn row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Failures to inject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Faults {
    /// Open completes with this error.
    pub fail_open: Option<EngineError>,
    /// Query submission is rejected synchronously.
    pub fail_submit: Option<EngineError>,
    /// Query submission completes with this error.
    pub fail_query: Option<EngineError>,
    /// Invoke every completion handler twice.
    pub double_fire: bool,
    /// Delay before open, close and query completions.
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
}

/// Counters for what the engine has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub clusters: usize,
    pub opens: usize,
    pub closes: usize,
    pub queries: usize,
    pub cancels: usize,
}

#[derive(Default)]
struct Counters {
    clusters: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    queries: AtomicUsize,
    cancels: AtomicUsize,
    requests: AtomicUsize,
}

#[derive(Default)]
struct Shared {
    datasets: Mutex<HashMap<String, Dataset>>,
    faults: Mutex<Faults>,
    credential: Mutex<Option<Credential>>,
    last_origin: Mutex<Option<Origin>>,
    counters: Counters,
}

impl Shared {
    fn faults(&self) -> Faults {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Scripted engine. Clones share datasets, faults and counters.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `dataset` for `statement`.
    pub fn dataset(self, statement: impl Into<String>, dataset: Dataset) -> Self {
        self.shared
            .datasets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(statement.into(), dataset);
        self
    }

    pub fn faults(self, faults: Faults) -> Self {
        self.set_faults(faults);
        self
    }

    /// Replace the fault set on a running engine.
    pub fn set_faults(&self, faults: Faults) {
        *self.shared.faults.lock().unwrap_or_else(|e| e.into_inner()) = faults;
    }

    /// Only accept this credential when opening.
    pub fn require_credential(self, credential: Credential) -> Self {
        *self
            .shared
            .credential
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(credential);
        self
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            clusters: c.clusters.load(Ordering::SeqCst),
            opens: c.opens.load(Ordering::SeqCst),
            closes: c.closes.load(Ordering::SeqCst),
            queries: c.queries.load(Ordering::SeqCst),
            cancels: c.cancels.load(Ordering::SeqCst),
        }
    }

    /// The origin of the most recent open request.
    pub fn last_origin(&self) -> Option<Origin> {
        self.shared
            .last_origin
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Engine for MemoryEngine {
    fn create_cluster(&self, io: Handle) -> Arc<dyn Cluster> {
        self.shared.counters.clusters.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryCluster {
            shared: Arc::clone(&self.shared),
            io,
            query_timeout: Mutex::new(None),
        })
    }
}

struct MemoryCluster {
    shared: Arc<Shared>,
    io: Handle,
    query_timeout: Mutex<Option<Duration>>,
}

/// Invoke `handler` once, or twice when double firing.
fn fire<T: Clone>(handler: &mut dyn FnMut(T), value: T, double: bool) {
    if double {
        handler(value.clone());
    }
    handler(value);
}

impl Cluster for MemoryCluster {
    fn open_in_background(&self, origin: Origin, mut handler: OpenHandler) {
        let shared = Arc::clone(&self.shared);
        let faults = shared.faults();
        *self.query_timeout.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(origin.options.timeouts.query);

        self.io.spawn(async move {
            tokio::time::sleep(faults.latency).await;

            let expected = shared
                .credential
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let result = match (faults.fail_open, expected) {
                (Some(err), _) => Err(err),
                (None, Some(expected))
                    if expected.username != origin.credential.username
                        || expected.password != origin.credential.password =>
                {
                    Err(EngineError::new(AUTHENTICATION_FAILURE, "authentication failure"))
                }
                _ => {
                    shared.counters.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            };
            *shared.last_origin.lock().unwrap_or_else(|e| e.into_inner()) = Some(origin);
            fire(&mut handler, result, faults.double_fire);
        });
    }

    fn close(&self, mut handler: CloseHandler) {
        let shared = Arc::clone(&self.shared);
        let faults = shared.faults();
        self.io.spawn(async move {
            tokio::time::sleep(faults.latency).await;
            shared.counters.closes.fetch_add(1, Ordering::SeqCst);
            fire(&mut |()| handler(), (), faults.double_fire);
        });
    }

    fn execute_query(
        &self,
        options: QueryOptions,
        mut handler: QueryHandler,
    ) -> Result<Box<dyn PendingOperation>, EngineError> {
        let faults = self.shared.faults();
        if let Some(err) = faults.fail_submit {
            return Err(err);
        }
        self.shared.counters.queries.fetch_add(1, Ordering::SeqCst);

        let pending = Arc::new(MemoryPending {
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let dataset = self
            .shared
            .datasets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&options.statement)
            .cloned();
        let timeout = options.timeout.or(*self
            .query_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()));
        let request = self.shared.counters.requests.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let io = self.io.clone();
        let waiting = Arc::clone(&pending);

        self.io.spawn(async move {
            if !waiting.cancelled.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(faults.latency) => {}
                    _ = waiting.wake.notified() => {}
                }
            }

            let result: Result<Arc<dyn QueryStream>, EngineError> =
                if waiting.cancelled.load(Ordering::SeqCst) {
                    Err(EngineError::new(REQUEST_CANCELED, "request canceled"))
                } else if let Some(err) = faults.fail_query {
                    Err(err)
                } else {
                    match dataset {
                        Some(dataset) => Ok(Arc::new(MemoryStream {
                            inner: Arc::new(StreamInner::new(
                                dataset, shared, io, request, timeout,
                                faults.double_fire,
                            )),
                        })),
                        None => Err(EngineError::new(
                            UNKNOWN_STATEMENT,
                            format!("no dataset for statement: {}", options.statement),
                        )),
                    }
                };
            fire(&mut handler, result, faults.double_fire);
        });

        Ok(Box::new(PendingHandle(pending)))
    }
}

struct MemoryPending {
    cancelled: AtomicBool,
    wake: Notify,
}

struct PendingHandle(Arc<MemoryPending>);

impl PendingOperation for PendingHandle {
    fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.wake.notify_one();
    }
}

struct Progress {
    next: usize,
    finished: bool,
    result_size: u64,
}

struct StreamInner {
    dataset: Dataset,
    shared: Arc<Shared>,
    io: Handle,
    request_id: String,
    timeout: Option<Duration>,
    double_fire: bool,
    started: Instant,
    progress: Mutex<Progress>,
    cancelled: AtomicBool,
    wake: Notify,
    metadata: Mutex<Option<QueryMetadata>>,
}

impl StreamInner {
    fn new(
        dataset: Dataset,
        shared: Arc<Shared>,
        io: Handle,
        request: usize,
        timeout: Option<Duration>,
        double_fire: bool,
    ) -> Self {
        Self {
            dataset,
            shared,
            io,
            request_id: format!("mem-{:08x}", request),
            timeout,
            double_fire,
            started: Instant::now(),
            progress: Mutex::new(Progress {
                next: 0,
                finished: false,
                result_size: 0,
            }),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            metadata: Mutex::new(None),
        }
    }

    fn step(&self) -> Result<RowVariant, EngineError> {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if progress.finished {
            return Ok(RowVariant::End);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            progress.finished = true;
            return Ok(RowVariant::End);
        }
        if let Some(timeout) = self.timeout {
            if self.started.elapsed() > timeout {
                progress.finished = true;
                return Err(EngineError::new(UNAMBIGUOUS_TIMEOUT, "query timed out"));
            }
        }
        if let Some((index, err)) = &self.dataset.fail_at {
            if progress.next == *index {
                progress.finished = true;
                return Err(err.clone());
            }
        }

        match self.dataset.rows.get(progress.next) {
            Some(row) => {
                progress.next += 1;
                progress.result_size += row.len() as u64;
                Ok(RowVariant::Row(row.clone()))
            }
            None => {
                progress.finished = true;
                let elapsed = self.started.elapsed();
                *self.metadata.lock().unwrap_or_else(|e| e.into_inner()) = Some(QueryMetadata {
                    request_id: self.request_id.clone(),
                    warnings: self.dataset.warnings.clone(),
                    metrics: QueryMetrics {
                        elapsed_time: elapsed,
                        execution_time: elapsed,
                        result_count: progress.next as u64,
                        result_size: progress.result_size,
                        processed_objects: self.dataset.rows.len() as u64,
                    },
                });
                debug!(request_id = %self.request_id, rows = progress.next, "memory stream ended");
                Ok(RowVariant::End)
            }
        }
    }
}

struct MemoryStream {
    inner: Arc<StreamInner>,
}

impl QueryStream for MemoryStream {
    fn next_row(&self, mut handler: RowHandler) {
        let inner = Arc::clone(&self.inner);
        self.inner.io.spawn(async move {
            let delay = inner.dataset.row_delay;
            if !delay.is_zero() && !inner.cancelled.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            let step = inner.step();
            fire(&mut handler, step, inner.double_fire);
        });
    }

    fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.shared.counters.cancels.fetch_add(1, Ordering::SeqCst);
            self.inner.wake.notify_one();
        }
    }

    fn metadata(&self) -> Option<QueryMetadata> {
        self.inner
            .metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
