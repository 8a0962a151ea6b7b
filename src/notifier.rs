//! Cross-thread wakeup primitive (spec §4.8).
//!
//! On POSIX the source backs this with a self-pipe (`int_notify::unix_details`);
//! on Windows with a semaphore. We keep the self-pipe on unix (via `nix`,
//! matching the teacher crate's platform-access story) and expose the same
//! `noteEvent` / `clearEvent` / `hasEvents` surface plus the raw waitable fd
//! so an embedder can fold the engine into their own event loop (spec §6,
//! "obtain the notifier waitable").

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::unistd::{close, pipe, read, write};

pub struct Notifier {
    events_noted: AtomicUsize,
    pipe_read: RawFd,
    pipe_write: RawFd,
}

impl Notifier {
    pub fn new() -> nix::Result<Self> {
        let (pipe_read, pipe_write) = pipe()?;
        Ok(Notifier {
            events_noted: AtomicUsize::new(0),
            pipe_read,
            pipe_write,
        })
    }

    /// Record one event and wake anyone blocked on the waitable.
    pub fn note_event(&self) {
        self.events_noted.fetch_add(1, Ordering::SeqCst);
        let _ = write(self.pipe_write, &[0u8; 1]);
        log::trace!("notifier: noted event");
    }

    /// Drain the single byte written by `note_event` for one outstanding
    /// note, mirroring `clearEvent`'s "one byte per note" contract. This
    /// does not clear the whole backlog: callers drain one note per wakeup,
    /// same as `int_notify::clearEvent`.
    pub fn clear_event(&self) {
        if self.events_noted.load(Ordering::SeqCst) > 0 {
            let mut buf = [0u8; 1];
            let _ = read(self.pipe_read, &mut buf);
            self.events_noted.fetch_sub(1, Ordering::SeqCst);
            log::trace!("notifier: cleared event");
        }
    }

    pub fn has_events(&self) -> bool {
        self.events_noted.load(Ordering::SeqCst) > 0
    }

    pub fn outstanding(&self) -> usize {
        self.events_noted.load(Ordering::SeqCst)
    }

    /// The fd an embedder can multiplex with `select`/`poll`/`epoll`.
    pub fn waitable(&self) -> RawFd {
        self.pipe_read
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let _ = close(self.pipe_read);
        let _ = close(self.pipe_write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_then_has_events_then_clear() {
        let n = Notifier::new().unwrap();
        assert!(!n.has_events());
        n.note_event();
        assert!(n.has_events());
        n.clear_event();
        assert!(!n.has_events());
    }

    #[test]
    fn counts_multiple_outstanding_notes() {
        let n = Notifier::new().unwrap();
        n.note_event();
        n.note_event();
        assert_eq!(n.outstanding(), 2);
        n.clear_event();
        assert_eq!(n.outstanding(), 1);
        n.clear_event();
        assert_eq!(n.outstanding(), 0);
    }
}
