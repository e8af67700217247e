//! Single-fire completion cells.
//!
//! A [`Producer`]/[`Consumer`] pair hands exactly one value from an engine
//! worker thread to the waiting caller. `Producer::set` takes `self`, so a
//! second set cannot be expressed. [`SingleFire`] covers the other half of
//! the problem: engine handlers are `FnMut` and may be invoked more than
//! once, but only the first invocation may have an effect.
//!
//! [`Delivery`] folds the two delivery modes into one value so every
//! operation completes through the same code path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{Error, InternalKind, Result};
use crate::host::{self, Host};

/// User callback invoked from a worker thread under the host lock.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) -> anyhow::Result<()> + Send>;

/// Fail if the calling thread is driving an async runtime, where a
/// blocking wait would stall or panic.
pub fn ensure_can_block() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::invalid(
            "cannot block on a completion from inside an async runtime",
        ));
    }
    Ok(())
}

/// Create a linked producer/consumer pair.
pub fn channel<T>() -> (Producer<T>, Consumer<T>) {
    let (tx, rx) = oneshot::channel();
    (Producer { tx }, Consumer { rx })
}

/// Write half of a completion cell.
pub struct Producer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Producer<T> {
    /// Fill the cell. Never blocks.
    pub fn set(self, value: T) {
        if self.tx.send(value).is_err() {
            debug!("completion consumer dropped before set");
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Read half of a completion cell.
pub struct Consumer<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Consumer<T> {
    /// Block the calling thread until the producer sets a value.
    ///
    /// There is no timeout: the engine bounds every operation. If the
    /// producer is dropped unset the wait ends with an internal error
    /// instead of hanging.
    pub fn wait(self) -> Result<T> {
        ensure_can_block()?;
        self.rx.blocking_recv().map_err(|_| {
            Error::internal(
                InternalKind::CompletionDropped,
                "completion was dropped without a result",
            )
        })
    }

    /// Take the value if it has already been set.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

type Slot<T> = Mutex<Option<Box<dyn FnOnce(T) + Send>>>;

/// Guard that lets a repeatedly-invoked handler act only once.
///
/// The guard is shared: every clone of the handler returned by
/// [`SingleFire::handler`] observes the same flag.
pub struct SingleFire<T> {
    operation: &'static str,
    fired: AtomicBool,
    suppressed: AtomicUsize,
    slot: Slot<T>,
}

impl<T: Send + 'static> SingleFire<T> {
    pub fn new(operation: &'static str, f: impl FnOnce(T) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            operation,
            fired: AtomicBool::new(false),
            suppressed: AtomicUsize::new(0),
            slot: Mutex::new(Some(Box::new(f))),
        })
    }

    /// Run the guarded action if this is the first fire.
    ///
    /// Returns `false` for every fire after the first.
    pub fn fire(&self, value: T) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            let n = self.suppressed.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                operation = self.operation,
                suppressed = n,
                "ignoring repeated completion"
            );
            return false;
        }

        let action = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match action {
            Some(action) => {
                action(value);
                true
            }
            None => false,
        }
    }

    /// A handler suitable for passing to the engine.
    pub fn handler(self: &Arc<Self>) -> impl FnMut(T) + Send + 'static {
        let guard = Arc::clone(self);
        move |value| {
            guard.fire(value);
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// How many repeat fires were swallowed.
    pub fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SingleFire<T> {
    fn drop(&mut self) {
        if !*self.fired.get_mut() {
            debug!(operation = self.operation, "handler dropped without firing");
        }
    }
}

/// How a completed value reaches the caller.
///
/// A delivery that is dropped before [`Delivery::deliver`] runs hands over
/// `Internal(CompletionDropped)` instead, so the waiter or callback always
/// sees exactly one outcome. [`Delivery::disarm`] opts out of that.
pub struct Delivery<T> {
    mode: Option<Mode<T>>,
}

enum Mode<T> {
    /// A caller is blocked on the paired [`Consumer`].
    Blocking(Producer<Result<T>>),
    /// Invoke a user callback under the host lock.
    Callback {
        callback: Callback<T>,
        host: Arc<dyn Host>,
    },
}

impl<T: Send + 'static> Delivery<T> {
    pub fn blocking(producer: Producer<Result<T>>) -> Self {
        Self {
            mode: Some(Mode::Blocking(producer)),
        }
    }

    pub fn callback(
        host: Arc<dyn Host>,
        callback: impl FnOnce(Result<T>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            mode: Some(Mode::Callback {
                callback: Box::new(callback),
                host,
            }),
        }
    }
}

impl<T> Delivery<T> {
    pub fn is_blocking(&self) -> bool {
        matches!(self.mode, Some(Mode::Blocking(_)))
    }

    /// Hand the value over. A failing user callback is logged and
    /// returned as an internal error.
    pub fn deliver(mut self, value: Result<T>) -> Result<()> {
        match self.mode.take() {
            Some(mode) => hand_over(mode, value),
            None => Ok(()),
        }
    }

    /// Drop without notifying anyone. Used when the operation was rejected
    /// synchronously and the caller already has the error.
    pub fn disarm(mut self) {
        self.mode = None;
    }
}

fn hand_over<T>(mode: Mode<T>, value: Result<T>) -> Result<()> {
    match mode {
        Mode::Blocking(producer) => {
            producer.set(value);
            Ok(())
        }
        Mode::Callback { callback, host } => {
            match host::call(host.as_ref(), move || callback(value)) {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => {
                    error!(error = %e, "user callback failed");
                    Err(Error::internal(InternalKind::CallbackFailed, format!("{e:#}")))
                }
                None => Err(Error::internal(
                    InternalKind::CallbackFailed,
                    "host did not run the callback",
                )),
            }
        }
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        if let Some(mode) = self.mode.take() {
            warn!("completion dropped before a result was delivered");
            let dropped = Error::internal(
                InternalKind::CompletionDropped,
                "operation was abandoned before it completed",
            );
            // Callback failures are already logged by hand_over.
            let _ = hand_over(mode, Err(dropped));
        }
    }
}

impl<T> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(Mode::Blocking(_)) => f.write_str("Delivery::Blocking"),
            Some(Mode::Callback { .. }) => f.write_str("Delivery::Callback"),
            None => f.write_str("Delivery::Spent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FreeThreaded, GlobalLock};
    use std::thread;

    #[test]
    fn test_set_then_wait_across_threads() {
        let (producer, consumer) = channel::<u32>();
        let worker = thread::spawn(move || producer.set(7));
        assert_eq!(consumer.wait().unwrap(), 7);
        worker.join().unwrap();
    }

    #[test]
    fn test_dropped_producer_is_internal_error() {
        let (producer, consumer) = channel::<u32>();
        drop(producer);
        let err = consumer.wait().unwrap_err();
        assert_eq!(err.internal_kind(), Some(InternalKind::CompletionDropped));
    }

    #[test]
    fn test_try_take() {
        let (producer, mut consumer) = channel::<&str>();
        assert_eq!(consumer.try_take(), None);
        producer.set("done");
        assert_eq!(consumer.try_take(), Some("done"));
    }

    #[test]
    fn test_wait_inside_runtime_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (_producer, consumer) = channel::<u32>();
        let err = rt.block_on(async move { consumer.wait() }).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_single_fire_once() {
        let (producer, consumer) = channel::<u32>();
        let guard = SingleFire::new("test", move |v| producer.set(v));
        let mut handler = guard.handler();
        handler(1);
        handler(2);
        handler(3);
        assert_eq!(consumer.wait().unwrap(), 1);
        assert!(guard.has_fired());
        assert_eq!(guard.suppressed(), 2);
    }

    #[test]
    fn test_single_fire_shared_across_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let guard = SingleFire::new("test", move |_: ()| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mut handler = guard.handler();
                thread::spawn(move || handler(()))
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(guard.suppressed(), 7);
    }

    #[test]
    fn test_delivery_blocking() {
        let (producer, consumer) = channel::<Result<String>>();
        let delivery = Delivery::blocking(producer);
        assert!(delivery.is_blocking());
        delivery.deliver(Ok("ok".to_string())).unwrap();
        assert_eq!(consumer.wait().unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_delivery_callback_under_host_lock() {
        let lock = GlobalLock::new();
        let seen = Arc::new(Mutex::new(None));
        let (l, s) = (lock.clone(), seen.clone());
        let delivery = Delivery::callback(lock.clone(), move |v: Result<u8>| {
            *s.lock().unwrap() = Some((v?, l.is_held()));
            Ok(())
        });
        delivery.deliver(Ok(9)).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((9, true)));
        assert_eq!(lock.entries(), 1);
    }

    #[test]
    fn test_delivery_callback_failure() {
        let delivery = Delivery::callback(Arc::new(FreeThreaded), |_: Result<u8>| {
            anyhow::bail!("handler exploded")
        });
        let err = delivery.deliver(Ok(1)).unwrap_err();
        assert_eq!(err.internal_kind(), Some(InternalKind::CallbackFailed));
        assert!(err.to_string().contains("handler exploded"));
    }

    #[test]
    fn test_undelivered_callback_still_runs_once() {
        let lock = GlobalLock::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (l, s) = (lock.clone(), seen.clone());
        let delivery = Delivery::callback(lock.clone(), move |v: Result<u8>| {
            s.lock().unwrap().push((v.map_err(|e| e.internal_kind()), l.is_held()));
            Ok(())
        });

        let guard = SingleFire::new("test", move |v: u8| {
            delivery.deliver(Ok(v)).unwrap();
        });
        let handler = guard.handler();
        drop(handler);
        assert!(seen.lock().unwrap().is_empty());
        drop(guard);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Err(Some(InternalKind::CompletionDropped)), true)]
        );
    }

    #[test]
    fn test_fired_or_disarmed_delivery_is_silent_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let guard = SingleFire::new("test", {
            let delivery = Delivery::callback(Arc::new(FreeThreaded), move |_: Result<u8>| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            move |v: u8| {
                delivery.deliver(Ok(v)).unwrap();
            }
        });
        guard.handler()(1);
        drop(guard);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counted = calls.clone();
        let delivery = Delivery::callback(Arc::new(FreeThreaded), move |_: Result<u8>| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        delivery.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undelivered_blocking_wakes_waiter() {
        let (producer, consumer) = channel::<Result<u8>>();
        drop(Delivery::blocking(producer));
        let err = consumer.wait().unwrap().unwrap_err();
        assert_eq!(err.internal_kind(), Some(InternalKind::CompletionDropped));
    }
}
