//! Host execution lock.
//!
//! Completions run on I/O worker threads. When the caller is an embedding
//! with a global interpreter lock, every user callback has to re-enter
//! that lock before touching interpreter state and leave it again before
//! control returns to the engine. [`Host`] is that seam.
//!
//! Blocking bridge calls (`open`, `close`, `Cursor::next_row`) must be
//! made with the host lock released, otherwise the worker delivering the
//! completion can never acquire it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

pub trait Host: Send + Sync + 'static {
    /// Run `f` with the host's execution lock held.
    fn enter(&self, f: &mut dyn FnMut());
}

/// No global lock: callbacks run directly on the delivering thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeThreaded;

impl Host for FreeThreaded {
    fn enter(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// A single process-wide lock, re-entrant on the owning thread.
#[derive(Debug, Default)]
pub struct GlobalLock {
    lock: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
    entries: AtomicUsize,
}

impl GlobalLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether the calling thread currently holds the lock.
    pub fn is_held(&self) -> bool {
        let owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        *owner == Some(thread::current().id())
    }

    /// Number of times a callback has entered the lock.
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }

    fn set_owner(&self, owner: Option<ThreadId>) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = owner;
    }
}

impl Host for GlobalLock {
    fn enter(&self, f: &mut dyn FnMut()) {
        self.entries.fetch_add(1, Ordering::SeqCst);
        if self.is_held() {
            f();
            return;
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.set_owner(Some(thread::current().id()));
        let _owner = OwnerReset(self);
        f();
    }
}

/// Clears the owner on the way out, including when `f` unwinds. Declared
/// after the mutex guard so it drops first.
struct OwnerReset<'a>(&'a GlobalLock);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        self.0.set_owner(None);
    }
}

/// Run a one-shot closure under the host lock and hand back its result.
///
/// Returns `None` only if the host never invoked the closure.
pub(crate) fn call<R>(host: &dyn Host, f: impl FnOnce() -> R) -> Option<R> {
    let mut f = Some(f);
    let mut out = None;
    host.enter(&mut || {
        if let Some(f) = f.take() {
            out = Some(f());
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_threaded_runs_inline() {
        assert_eq!(call(&FreeThreaded, || 21 * 2), Some(42));
    }

    #[test]
    fn test_global_lock_held_inside() {
        let lock = GlobalLock::new();
        assert!(!lock.is_held());
        let held = call(lock.as_ref(), || lock.is_held());
        assert_eq!(held, Some(true));
        assert!(!lock.is_held());
        assert_eq!(lock.entries(), 1);
    }

    #[test]
    fn test_global_lock_reentrant() {
        let lock = GlobalLock::new();
        let inner = call(lock.as_ref(), || call(lock.as_ref(), || lock.is_held()));
        assert_eq!(inner, Some(Some(true)));
        assert_eq!(lock.entries(), 2);
    }

    #[test]
    fn test_global_lock_released_after_panic() {
        let lock = GlobalLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            call(lock.as_ref(), || {
                panic!("callback blew up");
            })
        }));
        assert!(result.is_err());
        assert!(!lock.is_held());

        let other = lock.clone();
        let held = thread::spawn(move || call(other.as_ref(), || other.is_held()))
            .join()
            .unwrap();
        assert_eq!(held, Some(true));
        assert_eq!(call(lock.as_ref(), || lock.is_held()), Some(true));
        assert_eq!(lock.entries(), 3);
    }

    #[test]
    fn test_global_lock_serialises_threads() {
        let lock = GlobalLock::new();
        let counter = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    call(lock.as_ref(), || {
                        assert!(lock.is_held());
                        counter.lock().unwrap().push(i);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.lock().unwrap().len(), 4);
        assert_eq!(lock.entries(), 4);
    }
}
