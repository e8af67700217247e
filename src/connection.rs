//! Connection lifecycle.
//!
//! A [`Connection`] owns one engine cluster object and the I/O runtime its
//! completions run on. Opening starts the workers before the engine is
//! asked to connect; closing waits for the engine to confirm before the
//! workers are stopped and joined. Whatever happens, teardown runs once.
//!
//! # Example
//!
//! ```rust,ignore
//! use columnar_bridge::prelude::*;
//!
//! let conn = Connector::new(engine)
//!     .credential(Credential::new("admin", "secret"))
//!     .io_threads(2)
//!     .open("couchbases://cb.example.com")?;
//!
//! let mut cursor = conn.query(QueryOptions::new("SELECT 1"))?;
//! while let Pull::Row(row) = cursor.next_row()? {
//!     println!("{}", String::from_utf8_lossy(&row));
//! }
//! conn.close()?;
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::completion::{self, Callback, Delivery, SingleFire};
use crate::connstr;
use crate::cursor::{Cursor, RowCallback, RowEvent};
use crate::engine::{Cluster, Engine, EngineError, Origin, PendingOperation, QueryStream};
use crate::error::{Error, InternalKind, Result};
use crate::host::{FreeThreaded, Host};
use crate::options::{ClusterOptions, Credential, QueryOptions};
use crate::runtime::{IoRuntime, ThreadGauge};

/// Builder for opening a [`Connection`].
pub struct Connector {
    engine: Arc<dyn Engine>,
    credential: Credential,
    options: ClusterOptions,
    io_threads: Option<usize>,
    host: Arc<dyn Host>,
    gauge: ThreadGauge,
}

impl Connector {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            credential: Credential::new("", ""),
            options: ClusterOptions::default(),
            io_threads: None,
            host: Arc::new(FreeThreaded),
            gauge: ThreadGauge::new(),
        }
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    /// Number of I/O worker threads. Overrides both the options and the
    /// connection string.
    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = Some(n);
        self
    }

    /// Lock re-entered around every user callback.
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /// Report worker threads to a shared gauge.
    pub fn thread_gauge(mut self, gauge: ThreadGauge) -> Self {
        self.gauge = gauge;
        self
    }

    /// Open the connection, blocking until the engine reports the outcome.
    ///
    /// On failure every worker thread started for the attempt has been
    /// joined before this returns.
    pub fn open(self, connection_string: &str) -> Result<Connection> {
        completion::ensure_can_block()?;

        let mut parsed = connstr::parse(connection_string)?;
        let mut options = self.options;
        options.apply_params(&mut parsed)?;
        if let Some(n) = self.io_threads {
            options.num_io_threads = n;
        }
        options.validate()?;

        let mut io = IoRuntime::start(options.num_io_threads, self.gauge)?;
        let handle = io
            .handle()
            .ok_or_else(|| Error::internal(InternalKind::Runtime, "io runtime is not running"))?;
        let cluster = self.engine.create_cluster(handle);

        let close_wait = options.timeouts.management;
        let info = ConnectionInfo {
            connection_string: parsed.to_string(),
            username: self.credential.username.clone(),
            user_agent: options.user_agent(),
            io_threads: options.num_io_threads,
        };
        let origin = Origin {
            connection_string: parsed,
            credential: self.credential,
            user_agent: info.user_agent.clone(),
            options,
        };

        let (producer, consumer) = completion::channel();
        let guard = SingleFire::new("open", move |result: std::result::Result<(), EngineError>| {
            producer.set(result)
        });
        cluster.open_in_background(origin, Box::new(guard.handler()));

        let outcome = match consumer.wait() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into_error("open")),
            Err(e) => Err(e),
        };

        if let Err(err) = outcome {
            warn!(error = %err, "open failed, unwinding");
            if let Err(close_err) = close_cluster(&cluster, None) {
                debug!(error = %close_err, "close after failed open did not complete");
            }
            drop(cluster);
            io.shutdown();
            return Err(err);
        }

        info!(
            connection_string = %info.connection_string,
            io_threads = info.io_threads,
            "connection open"
        );
        Ok(Connection {
            live: Mutex::new(Some(Live {
                cluster,
                io,
                close_wait,
            })),
            closing: Mutex::new(()),
            host: self.host,
            info,
        })
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("credential", &self.credential)
            .field("options", &self.options)
            .field("io_threads", &self.io_threads)
            .finish_non_exhaustive()
    }
}

/// What a connection was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connection_string: String,
    pub username: String,
    pub user_agent: String,
    pub io_threads: usize,
}

struct Live {
    cluster: Arc<dyn Cluster>,
    io: IoRuntime,
    /// How long a detached close waits for the engine.
    close_wait: Duration,
}

/// An open cluster connection.
pub struct Connection {
    live: Mutex<Option<Live>>,
    /// Serialises concurrent closers so each waits for teardown to finish.
    closing: Mutex<()>,
    host: Arc<dyn Host>,
    info: ConnectionInfo,
}

impl Connection {
    /// Open with default settings apart from the credential and options.
    pub fn open(
        engine: Arc<dyn Engine>,
        connection_string: &str,
        credential: Credential,
        options: ClusterOptions,
    ) -> Result<Self> {
        Connector::new(engine)
            .credential(credential)
            .options(options)
            .open(connection_string)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_open(&self) -> bool {
        self.lock_live().is_some()
    }

    /// I/O workers of this connection still alive. Zero once closed.
    pub fn live_workers(&self) -> usize {
        self.lock_live()
            .as_ref()
            .map(|live| live.io.live_workers())
            .unwrap_or(0)
    }

    /// Close the connection and join its I/O workers.
    ///
    /// Closing an already-closed connection is a no-op.
    pub fn close(&self) -> Result<()> {
        self.shutdown(None)
    }

    /// Close, notifying `callback` once the engine confirms.
    ///
    /// The callback runs on an I/O worker under the host lock. On an
    /// already-closed connection it runs immediately on the calling thread.
    /// A failing callback is reported as the return value.
    pub fn close_with_callback(
        &self,
        callback: impl FnOnce(Result<()>) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<()> {
        self.shutdown(Some(Box::new(callback)))
    }

    fn shutdown(&self, callback: Option<Callback<()>>) -> Result<()> {
        completion::ensure_can_block()?;
        let _closing = self.closing.lock().unwrap_or_else(|e| e.into_inner());

        let callback = callback.map(|cb| Delivery::callback(Arc::clone(&self.host), cb));
        let Some(Live { cluster, mut io, .. }) = self.lock_live().take() else {
            debug!("close on a closed connection");
            return match callback {
                Some(delivery) => delivery.deliver(Ok(())),
                None => Ok(()),
            };
        };

        let result = close_cluster(&cluster, callback);
        drop(cluster);
        io.shutdown();
        info!(connection_string = %self.info.connection_string, "connection closed");
        result
    }

    /// Run a query and return a cursor that blocks on each pull.
    pub fn query(&self, options: QueryOptions) -> Result<Cursor> {
        self.submit(options, None)
    }

    /// Run a query whose rows are delivered to `on_row`, one per pull.
    pub fn query_with_rows(
        &self,
        options: QueryOptions,
        on_row: impl Fn(Result<RowEvent>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<Cursor> {
        self.submit(options, Some(Arc::new(on_row)))
    }

    /// Submit a query without blocking.
    ///
    /// `on_complete` runs once with the cursor or the engine's error. If
    /// submission itself is rejected the error is returned here and
    /// `on_complete` never runs.
    pub fn query_with_callback(
        &self,
        options: QueryOptions,
        on_complete: impl FnOnce(Result<Cursor>) -> anyhow::Result<()> + Send + 'static,
        on_row: Option<RowCallback>,
    ) -> Result<PendingQuery> {
        options.validate()?;
        let cluster = self.cluster()?;

        let host = Arc::clone(&self.host);
        // Held here as well so a synchronous rejection can disarm it before
        // a dropped handler reports CompletionDropped.
        let delivery = Arc::new(Mutex::new(Some(Delivery::callback(
            Arc::clone(&host),
            on_complete,
        ))));
        let pending = Arc::clone(&delivery);
        let guard = SingleFire::new(
            "query",
            move |result: std::result::Result<Arc<dyn QueryStream>, EngineError>| {
                let outcome = result
                    .map(|stream| Cursor::new(stream, on_row, host))
                    .map_err(|e| e.into_error("query"));
                let delivery = pending.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(delivery) = delivery {
                    if delivery.deliver(outcome).is_err() {
                        debug!("query completion callback failed");
                    }
                }
            },
        );

        match cluster.execute_query(options, Box::new(guard.handler())) {
            Ok(operation) => Ok(PendingQuery { operation }),
            Err(e) => {
                let rejected = delivery.lock().unwrap_or_else(|p| p.into_inner()).take();
                if let Some(delivery) = rejected {
                    delivery.disarm();
                }
                Err(e.into_error("query"))
            }
        }
    }

    fn submit(&self, options: QueryOptions, row_callback: Option<RowCallback>) -> Result<Cursor> {
        options.validate()?;
        completion::ensure_can_block()?;
        let cluster = self.cluster()?;

        let (producer, consumer) = completion::channel();
        let guard = SingleFire::new(
            "query",
            move |result: std::result::Result<Arc<dyn QueryStream>, EngineError>| {
                producer.set(result)
            },
        );
        let _operation = cluster
            .execute_query(options, Box::new(guard.handler()))
            .map_err(|e| e.into_error("query"))?;

        let stream = consumer.wait()?.map_err(|e| e.into_error("query"))?;
        Ok(Cursor::new(stream, row_callback, Arc::clone(&self.host)))
    }

    fn cluster(&self) -> Result<Arc<dyn Cluster>> {
        self.lock_live()
            .as_ref()
            .map(|live| Arc::clone(&live.cluster))
            .ok_or(Error::Closed)
    }

    fn lock_live(&self) -> MutexGuard<'_, Option<Live>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }

        if completion::ensure_can_block().is_ok() {
            if let Err(e) = self.close() {
                error!(error = %e, "close on drop failed");
            }
            return;
        }

        // Inside an async context nothing can be waited on here.
        let live = self.lock_live().take();
        if let Some(live) = live {
            warn!("connection dropped inside an async context, closing in background");
            close_detached(live);
        }
    }
}

/// Close `live` from a plain thread that keeps the runtime alive until the
/// engine confirms or `close_wait` runs out, then joins the workers.
fn close_detached(live: Live) {
    let Live {
        cluster,
        io,
        close_wait,
    } = live;
    let (confirmed, confirmation) = mpsc::channel();
    cluster.close(Box::new(move || {
        let _ = confirmed.send(());
    }));

    let spawned = thread::Builder::new()
        .name("colbridge-close".into())
        .spawn(move || {
            let mut io = io;
            if confirmation.recv_timeout(close_wait).is_err() {
                warn!(
                    wait_ms = close_wait.as_millis() as u64,
                    "engine close was not confirmed before the runtime was released"
                );
            }
            drop(cluster);
            io.shutdown();
            debug!("detached close finished");
        });
    if let Err(e) = spawned {
        // The runtime went down with the closure, in the background.
        warn!(error = %e, "could not start close thread, engine close not confirmed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("open", &self.is_open())
            .finish()
    }
}

/// A query submitted in callback mode whose response is still pending.
pub struct PendingQuery {
    operation: Box<dyn PendingOperation>,
}

impl PendingQuery {
    /// Ask the engine to abandon the query.
    pub fn cancel(&self) {
        self.operation.cancel();
    }
}

impl fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQuery").finish_non_exhaustive()
    }
}

/// Ask the engine to close `cluster` and wait for it to confirm.
///
/// `notify` is driven from the completion point before the waiter wakes.
fn close_cluster(
    cluster: &Arc<dyn Cluster>,
    notify: Option<Delivery<()>>,
) -> Result<()> {
    let (producer, consumer) = completion::channel::<Result<()>>();
    let guard = SingleFire::new("close", move |()| {
        let notified = match notify {
            Some(delivery) => delivery.deliver(Ok(())),
            None => Ok(()),
        };
        producer.set(notified);
    });
    let mut handler = guard.handler();
    cluster.close(Box::new(move || handler(())));
    consumer.wait()?
}
