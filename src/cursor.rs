//! Streaming query cursor.
//!
//! A cursor pulls one row at a time from the engine's result stream. Each
//! pull is a fresh completion cell; the cursor never buffers more than the
//! single row in flight, so rows arrive in exactly the engine's order.
//!
//! ```text
//! Created ──▶ Active ──row──▶ Active ──end──▶ Ended
//!               │                                ▲
//!               └──────── cancel ────────────────┘ (later pulls yield End)
//! ```
//!
//! With a row callback the pull returns [`Pull::Pending`] straight away and
//! the outcome is handed to the callback on an I/O worker, under the host
//! lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::completion::{self, Delivery, SingleFire};
use crate::engine::{EngineError, QueryMetadata, QueryStream, RowVariant};
use crate::error::{Error, InternalKind, Result};
use crate::host::Host;

/// What a row callback receives for each pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEvent {
    Row(Vec<u8>),
    End,
}

/// The immediate result of [`Cursor::next_row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    Row(Vec<u8>),
    End,
    /// Callback mode: the outcome will be delivered to the row callback.
    Pending,
}

impl From<RowEvent> for Pull {
    fn from(event: RowEvent) -> Self {
        match event {
            RowEvent::Row(bytes) => Pull::Row(bytes),
            RowEvent::End => Pull::End,
        }
    }
}

pub type RowCallback = Arc<dyn Fn(Result<RowEvent>) -> anyhow::Result<()> + Send + Sync>;

struct StreamState {
    stream: Arc<dyn QueryStream>,
    row_callback: Option<RowCallback>,
    host: Arc<dyn Host>,
    cancelled: AtomicBool,
    /// The engine reported end-of-stream.
    ended: AtomicBool,
    /// No further rows will be requested.
    finished: AtomicBool,
    in_flight: AtomicBool,
    rows: AtomicU64,
    callback_error: Mutex<Option<Error>>,
}

impl StreamState {
    fn is_done(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(rows = self.rows.load(Ordering::Relaxed), "cancelling query stream");
        if !self.finished.load(Ordering::Acquire) {
            self.stream.cancel();
        }
    }

    /// Turn what the engine delivered into the caller-visible outcome.
    fn settle(&self, delivered: std::result::Result<RowVariant, EngineError>) -> Result<RowEvent> {
        let outcome = if self.cancelled.load(Ordering::Acquire) {
            if matches!(delivered, Ok(RowVariant::End)) {
                self.ended.store(true, Ordering::Release);
            }
            self.finished.store(true, Ordering::Release);
            Ok(RowEvent::End)
        } else {
            match delivered {
                Ok(RowVariant::Row(bytes)) => {
                    self.rows.fetch_add(1, Ordering::Relaxed);
                    Ok(RowEvent::Row(bytes))
                }
                Ok(RowVariant::End) => {
                    self.ended.store(true, Ordering::Release);
                    self.finished.store(true, Ordering::Release);
                    debug!(rows = self.rows.load(Ordering::Relaxed), "query stream ended");
                    Ok(RowEvent::End)
                }
                Ok(RowVariant::Empty) => {
                    self.finished.store(true, Ordering::Release);
                    Err(Error::internal(
                        InternalKind::UnableToBuildResult,
                        "engine delivered neither a row nor end of stream",
                    ))
                }
                Err(e) => {
                    self.finished.store(true, Ordering::Release);
                    Err(e.into_error("next_row"))
                }
            }
        };
        self.in_flight.store(false, Ordering::Release);
        outcome
    }

    fn record_callback_error(&self, err: Error) {
        *self.callback_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
    }
}

/// One outstanding callback-mode pull.
///
/// If the engine drops the row handler without calling it, the stream is
/// finished and the callback receives `Internal(CompletionDropped)`.
struct CallbackPull {
    state: Arc<StreamState>,
    delivery: Option<Delivery<RowEvent>>,
}

impl CallbackPull {
    fn complete(mut self, delivered: std::result::Result<RowVariant, EngineError>) {
        let outcome = self.state.settle(delivered);
        if let Some(delivery) = self.delivery.take() {
            if let Err(e) = delivery.deliver(outcome) {
                self.state.record_callback_error(e);
            }
        }
    }
}

impl Drop for CallbackPull {
    fn drop(&mut self) {
        let Some(delivery) = self.delivery.take() else {
            return;
        };
        warn!(
            rows = self.state.rows.load(Ordering::Relaxed),
            "row handler dropped by the engine"
        );
        self.state.finished.store(true, Ordering::Release);
        self.state.in_flight.store(false, Ordering::Release);
        let dropped = Error::internal(
            InternalKind::CompletionDropped,
            "row completion was dropped without a result",
        );
        if let Err(e) = delivery.deliver(Err(dropped)) {
            self.state.record_callback_error(e);
        }
    }
}

/// Pull-based iterator over a running query.
pub struct Cursor {
    state: Arc<StreamState>,
    misused: bool,
}

impl Cursor {
    pub(crate) fn new(
        stream: Arc<dyn QueryStream>,
        row_callback: Option<RowCallback>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            state: Arc::new(StreamState {
                stream,
                row_callback,
                host,
                cancelled: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                rows: AtomicU64::new(0),
                callback_error: Mutex::new(None),
            }),
            misused: false,
        }
    }

    /// Whether rows are delivered to a callback instead of returned.
    pub fn is_callback_mode(&self) -> bool {
        self.state.row_callback.is_some()
    }

    /// Pull the next row.
    ///
    /// Blocking mode waits for the engine and returns the row or
    /// [`Pull::End`]. Callback mode returns [`Pull::Pending`] at once. A
    /// finished or cancelled cursor returns [`Pull::End`] in both modes
    /// without contacting the engine.
    pub fn next_row(&mut self) -> Result<Pull> {
        let state = &self.state;
        if state.is_done() {
            return Ok(Pull::End);
        }

        match &state.row_callback {
            None => {
                completion::ensure_can_block()?;
                if state.in_flight.swap(true, Ordering::AcqRel) {
                    return Err(Error::invalid("a pull is already in flight"));
                }

                let (producer, consumer) = completion::channel();
                let settling = Arc::clone(state);
                let guard = SingleFire::new("next_row", move |delivered| {
                    producer.set(settling.settle(delivered));
                });
                state.stream.next_row(Box::new(guard.handler()));

                match consumer.wait() {
                    Ok(outcome) => outcome.map(Pull::from),
                    Err(e) => {
                        state.finished.store(true, Ordering::Release);
                        state.in_flight.store(false, Ordering::Release);
                        Err(e)
                    }
                }
            }
            Some(callback) => {
                if state.in_flight.swap(true, Ordering::AcqRel) {
                    return Err(Error::invalid("a pull is already in flight"));
                }

                let callback = Arc::clone(callback);
                let pull = CallbackPull {
                    state: Arc::clone(state),
                    delivery: Some(Delivery::callback(Arc::clone(&state.host), move |o| {
                        callback(o)
                    })),
                };
                let guard = SingleFire::new("next_row", move |delivered| pull.complete(delivered));
                state.stream.next_row(Box::new(guard.handler()));
                Ok(Pull::Pending)
            }
        }
    }

    /// Stop the stream. Later pulls return [`Pull::End`].
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// A handle that can cancel this cursor from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// No more rows will be produced.
    pub fn is_finished(&self) -> bool {
        self.state.is_done()
    }

    /// Rows handed out so far.
    pub fn rows_delivered(&self) -> u64 {
        self.state.rows.load(Ordering::Relaxed)
    }

    /// Query metadata, available once the engine has reported the end of
    /// the stream. `None` before that.
    pub fn metadata(&self) -> Option<QueryMetadata> {
        if !self.state.ended.load(Ordering::Acquire) {
            return None;
        }
        self.state.stream.metadata()
    }

    /// The most recent row callback failure, if any.
    pub fn take_callback_error(&self) -> Option<Error> {
        self.state
            .callback_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl Iterator for Cursor {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_callback_mode() {
            if self.misused {
                return None;
            }
            self.misused = true;
            return Some(Err(Error::invalid(
                "cursor delivers rows through its callback and cannot be iterated",
            )));
        }

        match self.next_row() {
            Ok(Pull::Row(bytes)) => Some(Ok(bytes)),
            Ok(Pull::End) | Ok(Pull::Pending) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.state.is_done() {
            debug!("cursor dropped before end of stream");
            self.state.cancel();
        }
        if let Some(err) = self.take_callback_error() {
            error!(error = %err, "row callback failure was never collected");
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("callback_mode", &self.is_callback_mode())
            .field("rows", &self.rows_delivered())
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Cancels a cursor from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<StreamState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
