//! The exclusion lock and threading mode (spec §5, §9 Design Notes:
//! "`EngineContext`'s `Mutex<()>` plus a thread-local re-entrance flag
//! for the generator thread").
//!
//! Grounded on `MTLock`/`isGeneratorThread()` in `int_process.h`: every
//! public entry point takes the lock except calls made from the
//! generator thread itself while it already holds it, which would
//! otherwise deadlock.

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard};

thread_local! {
    static IS_GENERATOR_THREAD: Cell<bool> = Cell::new(false);
    static HOLDING_LOCK: Cell<bool> = Cell::new(false);
}

/// How callbacks and the generator/handler pipeline are scheduled
/// relative to user threads, `int_process`'s threading-mode split.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadingMode {
    /// No background threads; the caller must pump events itself.
    NoThreads,
    /// A dedicated generator thread observes raw platform events.
    GeneratorThreading,
    /// Generator and handler each run on their own thread.
    HandlerThreading,
    /// Callbacks are additionally dispatched off a separate thread so
    /// user callback code never runs on the generator or handler.
    CallbackThreading,
}

/// Marks the calling thread as the generator thread for the remainder
/// of its lifetime. Called once, from the thread the generator actor is
/// spawned on.
pub fn mark_current_thread_as_generator() {
    IS_GENERATOR_THREAD.with(|f| f.set(true));
}

pub fn is_generator_thread() -> bool {
    IS_GENERATOR_THREAD.with(|f| f.get())
}

/// The engine-wide exclusion lock. A guard obtained through
/// `Dispatcher::acquire` is a no-op re-entrant lock when called from the
/// generator thread while it already holds the lock, exactly as
/// `MTLock(generator)` special-cases `isGeneratorThread()`.
pub struct Dispatcher {
    lock: Mutex<()>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            lock: Mutex::new(()),
        }
    }
}

/// Either a real held guard, or evidence this thread already held the
/// lock reentrantly and doesn't need to release anything.
pub enum LockToken<'a> {
    Held(MutexGuard<'a, ()>),
    Reentrant,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusion lock, short-circuiting for a generator
    /// thread that's already inside a locked region.
    pub fn acquire(&self) -> LockToken<'_> {
        if is_generator_thread() && HOLDING_LOCK.with(|f| f.get()) {
            return LockToken::Reentrant;
        }
        let guard = self.lock.lock().unwrap();
        HOLDING_LOCK.with(|f| f.set(true));
        LockToken::Held(guard)
    }
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        if matches!(self, LockToken::Held(_)) {
            HOLDING_LOCK.with(|f| f.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_thread_takes_a_real_lock() {
        let d = Dispatcher::new();
        let token = d.acquire();
        assert!(matches!(token, LockToken::Held(_)));
    }

    #[test]
    fn generator_thread_reentry_does_not_deadlock() {
        let d = Dispatcher::new();
        mark_current_thread_as_generator();
        let outer = d.acquire();
        assert!(matches!(outer, LockToken::Held(_)));
        let inner = d.acquire();
        assert!(matches!(inner, LockToken::Reentrant));
        drop(inner);
        drop(outer);
    }
}
