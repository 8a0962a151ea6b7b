//! Per-process collection of threads (spec §3 "Thread record" grouping,
//! §4.2 startup/attach enumerating LWPs).
//!
//! Grounded on `int_threadPool`: lookup by LWP, "are all threads
//! stopped" queries, and the save/restore-user-state pair used around an
//! internal operation that must not disturb what the user last asked
//! for (`saveUserState`/`restoreUserState`).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::thread::{ThreadId, ThreadRecord};
use crate::thread_state::{StateSlot, StateValue};

#[derive(Default)]
pub struct ThreadPool {
    by_lwp: HashMap<i32, ThreadId>,
    members: Vec<ThreadId>,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, lwp: i32, id: ThreadId) {
        self.by_lwp.insert(lwp, id);
        self.members.push(id);
    }

    pub fn remove(&mut self, id: ThreadId) {
        self.members.retain(|&m| m != id);
        self.by_lwp.retain(|_, &mut v| v != id);
    }

    pub fn find_by_lwp(&self, lwp: i32) -> Option<ThreadId> {
        self.by_lwp.get(&lwp).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn all_stopped(&self, threads: &crate::arena::Arena<ThreadRecord>) -> bool {
        self.members.iter().all(|&id| {
            threads
                .get(id)
                .map_or(true, |t| !t.state.handler_state().is_running())
        })
    }

    pub fn any_running(&self, threads: &crate::arena::Arena<ThreadRecord>) -> bool {
        !self.all_stopped(threads)
    }

    /// `saveUserState`: record what the `User` slot was asserting before
    /// an internal operation overrides it, so it can be put back
    /// afterwards without the caller's intent being lost.
    pub fn save_user_state(
        &self,
        threads: &crate::arena::Arena<ThreadRecord>,
    ) -> HashMap<ThreadId, StateValue> {
        self.members
            .iter()
            .filter_map(|&id| threads.get(id).map(|t| (id, t.state.get(StateSlot::User))))
            .collect()
    }

    /// `restoreUserState`: re-assert each thread's saved `User` slot.
    pub fn restore_user_state(
        &self,
        threads: &mut crate::arena::Arena<ThreadRecord>,
        saved: &HashMap<ThreadId, StateValue>,
    ) -> Result<()> {
        for (&id, &value) in saved {
            let t = threads
                .get_mut(id)
                .ok_or_else(|| Error::stale_handle("thread removed during save/restore"))?;
            t.state.desync_state(StateSlot::User, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::process::ProcessRecord;
    use crate::thread::ThreadRecord;

    #[test]
    fn find_by_lwp_after_add() {
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let pid = procs.insert(ProcessRecord::new_for_test());
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let tid = threads.insert(ThreadRecord::new(pid, 42, 42));
        let mut pool = ThreadPool::new();
        pool.add(42, tid);
        assert_eq!(pool.find_by_lwp(42), Some(tid));
        assert_eq!(pool.find_by_lwp(99), None);
    }

    #[test]
    fn all_stopped_true_when_empty() {
        let threads: Arena<ThreadRecord> = Arena::new();
        let pool = ThreadPool::new();
        assert!(pool.all_stopped(&threads));
    }

    #[test]
    fn save_and_restore_user_state_round_trips() {
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let pid = procs.insert(ProcessRecord::new_for_test());
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let mut t = ThreadRecord::new(pid, 1, 1);
        t.state.set_state(StateSlot::User, StateValue::Running);
        let tid = threads.insert(t);
        let mut pool = ThreadPool::new();
        pool.add(1, tid);

        let saved = pool.save_user_state(&threads);
        threads
            .get_mut(tid)
            .unwrap()
            .state
            .set_state(StateSlot::User, StateValue::Stopped);
        pool.restore_user_state(&mut threads, &saved).unwrap();
        assert_eq!(
            threads.get(tid).unwrap().state.get(StateSlot::User),
            StateValue::Running
        );
    }
}
