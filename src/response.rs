//! Asynchronous-response bookkeeping (spec §4.7, §3 "Response handle").
//!
//! Each response is a future-like slot: `{status, payload, event
//! correlation id}`. Platforms that answer synchronously still produce a
//! `Response` (already `Ready`); platforms with async I/O (`plat_needsAsyncIO`)
//! leave it `Pending` until the handler observes the matching event and
//! calls `complete`/`fail`.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseStatus {
    Pending,
    Ready,
    Error,
}

struct Inner<T> {
    status: ResponseStatus,
    payload: Option<T>,
    error: Option<Error>,
}

/// A single pending reply, correlated to the generator event that will
/// eventually resolve it. Cloning a `Response` shares the same slot (it's
/// `Arc`-backed), matching the source's `*_response::ptr` shared-pointer
/// responses.
pub struct Response<T> {
    event_id: u64,
    inner: Arc<(Mutex<Inner<T>>, Condvar)>,
}

impl<T> Clone for Response<T> {
    fn clone(&self) -> Self {
        Response {
            event_id: self.event_id,
            inner: self.inner.clone(),
        }
    }
}

impl<T> Response<T> {
    pub fn new_pending(event_id: u64) -> Self {
        Response {
            event_id,
            inner: Arc::new((
                Mutex::new(Inner {
                    status: ResponseStatus::Pending,
                    payload: None,
                    error: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn new_ready(event_id: u64, payload: T) -> Self {
        Response {
            event_id,
            inner: Arc::new((
                Mutex::new(Inner {
                    status: ResponseStatus::Ready,
                    payload: Some(payload),
                    error: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn status(&self) -> ResponseStatus {
        self.inner.0.lock().unwrap().status.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status() != ResponseStatus::Pending
    }

    /// Driven by the handler when the correlated event is decoded.
    pub fn complete(&self, payload: T) {
        let (lock, cvar) = &*self.inner;
        let mut guard = lock.lock().unwrap();
        guard.status = ResponseStatus::Ready;
        guard.payload = Some(payload);
        cvar.notify_all();
    }

    pub fn fail(&self, err: Error) {
        let (lock, cvar) = &*self.inner;
        let mut guard = lock.lock().unwrap();
        guard.status = ResponseStatus::Error;
        guard.error = Some(err);
        cvar.notify_all();
    }

    /// Block until resolved. In production this is only ever called by
    /// `AsyncResponseSet::wait_for_async_event`, which is itself driven by
    /// the generator/handler pipeline waking this condvar -- callers never
    /// poll (spec §4.7).
    pub fn wait(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let (lock, cvar) = &*self.inner;
        let mut guard = lock.lock().unwrap();
        while guard.status == ResponseStatus::Pending {
            guard = cvar.wait(guard).unwrap();
        }
        match guard.status {
            ResponseStatus::Ready => Ok(guard.payload.clone().unwrap()),
            ResponseStatus::Error => Err(guard.error.clone().unwrap()),
            ResponseStatus::Pending => unreachable!(),
        }
    }
}

pub type MemResponse = Response<Vec<u8>>;
pub type ResultResponse = Response<()>;
pub type RegResponse = Response<u64>;
pub type AllRegResponse = Response<crate::registers::Registers>;
pub type StackResponse = Response<Vec<u8>>;

/// The caller-visible signal that an operation didn't complete
/// synchronously, carrying what to wait on.
pub enum AsyncWait<T> {
    Ready(T),
    Pending(Response<T>),
}

/// Tracks a set of outstanding responses and blocks the caller (via
/// `plat_preAsyncWait`-style hook before blocking) until all of them
/// resolve. Wait is always driven by the generator/handler pipeline; this
/// type never polls.
#[derive(Default)]
pub struct AsyncResponseSet;

impl AsyncResponseSet {
    pub fn new() -> Self {
        AsyncResponseSet
    }

    pub fn wait_for_one<T: Clone>(&self, resp: &Response<T>) -> Result<T, Error> {
        resp.wait()
    }

    pub fn wait_for_all<T: Clone>(&self, resps: &[Response<T>]) -> Result<Vec<T>, Error> {
        let mut out = Vec::with_capacity(resps.len());
        for r in resps {
            out.push(r.wait()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ready_response_resolves_immediately() {
        let r = Response::new_ready(1, 42u64);
        assert_eq!(r.wait().unwrap(), 42);
    }

    #[test]
    fn pending_response_resolves_after_complete_from_another_thread() {
        let r: Response<u64> = Response::new_pending(7);
        let r2 = r.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r2.complete(99);
        });
        assert_eq!(r.wait().unwrap(), 99);
        handle.join().unwrap();
    }

    #[test]
    fn failed_response_propagates_error() {
        let r: Response<u64> = Response::new_pending(1);
        r.fail(Error::bad_address("unmapped"));
        assert_eq!(r.wait().unwrap_err().kind, crate::error::ErrorKind::BadAddress);
    }

    #[test]
    fn wait_for_all_collects_in_order() {
        let set = AsyncResponseSet::new();
        let a = Response::new_ready(1, 1u64);
        let b = Response::new_ready(2, 2u64);
        let out = set.wait_for_all(&[a, b]).unwrap();
        assert_eq!(out, vec![1, 2]);
    }
}
