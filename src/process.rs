//! Process lifecycle (spec §4.2): create, attach, reattach, detach,
//! terminate, and the fork/exec transitions that reshape a process
//! record in place.
//!
//! Grounded on `int_process`'s `create`/`attach`/`reAttach`/`detach`/
//! `terminate`/`forked`/`execed` state machine, and the Startup slot's
//! role in holding every newly-created thread until the caller's first
//! continue.

use crate::arena::Handle;
use crate::breakpoint::BreakpointEngine;
use crate::counters::{Counter, CounterType, GlobalCounters};
use crate::error::{Error, Result};
use crate::library::LibraryTracker;
use crate::memory::{fork_mem_state, new_mem_state, MemStateHandle};
use crate::platform::PlatformOps;
use crate::rpc::RpcScheduler;
use crate::thread::{ThreadId, ThreadRecord};
use crate::thread_pool::ThreadPool;
use crate::thread_state::{StateSlot, StateValue};

pub struct ProcessMarker;
pub type ProcessId = Handle<ProcessMarker>;

/// How a process came to be tracked, `int_process::creation_mode_t`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreationMode {
    Created,
    Attached,
    ForkedChild,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessState {
    Neonatal,
    Running,
    Stopped,
    Exited,
    Detached,
    Errored,
}

/// `int_process`: the process-wide record. Thread membership lives in
/// `ThreadPool`; the address space lives behind `MemStateHandle` so it
/// can be shared copy-on-write with forked children.
pub struct ProcessRecord {
    pub pid: i32,
    pub creation_mode: CreationMode,
    pub state: ProcessState,
    pub threads: ThreadPool,
    pub mem_state: MemStateHandle,
    pub breakpoints: BreakpointEngine,
    pub rpcs: RpcScheduler,
    pub libraries: LibraryTracker,
    pub was_created_via_attach: bool,
    /// Set once the startup-sync handshake has released the initial
    /// thread; until then every thread sits parked on `Startup`.
    pub startup_complete: bool,
    pub silent_running: bool,
}

impl ProcessRecord {
    pub fn new(pid: i32, creation_mode: CreationMode) -> Self {
        ProcessRecord {
            pid,
            creation_mode,
            state: ProcessState::Neonatal,
            threads: ThreadPool::new(),
            mem_state: new_mem_state(),
            breakpoints: BreakpointEngine::new(),
            rpcs: RpcScheduler::new(),
            libraries: LibraryTracker::new(),
            was_created_via_attach: matches!(creation_mode, CreationMode::Attached),
            startup_complete: false,
            silent_running: false,
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        ProcessRecord::new(1, CreationMode::Created)
    }

    /// `forked`: a child inherits the parent's memory state (shared
    /// until the first mutation) but starts with an empty thread pool
    /// and its own fresh breakpoint/RPC bookkeeping.
    pub fn forked(&self, child_pid: i32) -> Self {
        ProcessRecord {
            pid: child_pid,
            creation_mode: CreationMode::ForkedChild,
            state: ProcessState::Neonatal,
            threads: ThreadPool::new(),
            mem_state: fork_mem_state(&self.mem_state),
            breakpoints: BreakpointEngine::new(),
            rpcs: RpcScheduler::new(),
            libraries: LibraryTracker::new(),
            was_created_via_attach: false,
            startup_complete: false,
            silent_running: false,
        }
    }

    /// `execed`: same pid, but the address space and loaded-library set
    /// are entirely replaced, so memory state must not be shared with
    /// whatever it pointed at before.
    pub fn mark_execed(&mut self) {
        self.mem_state = new_mem_state();
        self.breakpoints = BreakpointEngine::new();
    }

    /// Recompute `mem_state.breakpoint_traps` from the breakpoint
    /// engine's own instance map, the source of truth for which
    /// addresses currently carry an installed trap. Call after any
    /// install/uninstall/suspend/resume so `MemorySubsystem` sees the
    /// current set (spec §4.5).
    pub fn sync_breakpoint_traps(&mut self) {
        let windows = self.breakpoints.trap_windows();
        let mut mem = self.mem_state.borrow_mut();
        mem.breakpoint_traps.clear();
        for w in windows {
            mem.breakpoint_traps.insert(w.addr, w);
        }
    }
}

/// Drives the create/attach/detach/terminate transitions against a
/// platform backend, and the startup-sync handshake that holds new
/// threads at `Startup` until released.
pub struct ProcessLifecycle<'p> {
    platform: &'p dyn PlatformOps,
}

impl<'p> ProcessLifecycle<'p> {
    pub fn new(platform: &'p dyn PlatformOps) -> Self {
        ProcessLifecycle { platform }
    }

    pub fn create(&self, path: &str, argv: &[String]) -> Result<ProcessRecord> {
        let pid = self.platform.plat_create(path, argv)?;
        Ok(ProcessRecord::new(pid, CreationMode::Created))
    }

    pub fn attach(&self, pid: i32) -> Result<ProcessRecord> {
        self.platform.plat_attach(pid)?;
        let mut proc = ProcessRecord::new(pid, CreationMode::Attached);
        proc.state = ProcessState::Stopped;
        Ok(proc)
    }

    /// Re-attach after a detach: same pid, fresh bookkeeping, existing
    /// threads must be rediscovered by the caller via `refresh_threads`.
    pub fn reattach(&self, pid: i32) -> Result<ProcessRecord> {
        self.attach(pid)
    }

    pub fn detach(&self, proc: &mut ProcessRecord) -> Result<()> {
        if proc.state == ProcessState::Exited {
            return Err(Error::not_attached("process has already exited"));
        }
        self.platform.plat_detach(proc.pid)?;
        proc.state = ProcessState::Detached;
        Ok(())
    }

    pub fn terminate(&self, proc: &mut ProcessRecord) -> Result<()> {
        if proc.state == ProcessState::Exited {
            return Ok(());
        }
        self.platform.plat_terminate(proc.pid)?;
        proc.state = ProcessState::Exited;
        Ok(())
    }

    /// Register a newly observed thread and park it at `Startup` until
    /// `release_startup` is called (spec §4.2: creation holds every
    /// thread at the Startup slot). `proc_id` is the handle the caller's
    /// process arena already assigned `proc`.
    pub fn register_thread(
        &self,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut crate::arena::Arena<ThreadRecord>,
        lwp: i32,
        tid: i32,
    ) -> ThreadId {
        let mut rec = ThreadRecord::new(proc_id, lwp, tid);
        rec.state.desync_state(StateSlot::Startup, StateValue::Stopped);
        let id = threads.insert(rec);
        proc.threads.add(lwp, id);
        id
    }

    /// Release every thread's `Startup` slot once the caller's first
    /// continue arrives.
    pub fn release_startup(&self, proc: &mut ProcessRecord, threads: &mut crate::arena::Arena<ThreadRecord>) {
        for id in proc.threads.iter() {
            if let Some(t) = threads.get_mut(id) {
                t.state.restore_state(StateSlot::Startup);
            }
        }
        proc.startup_complete = true;
    }
}

/// Tracks how many processes are mid-startup or mid-teardown, the
/// `StartupTeardownProcesses` counter from spec §3/§4.9, and gates a
/// clean shutdown until it reaches zero.
pub struct ProcStopEventManager<'g> {
    counter: Counter<'g>,
}

impl<'g> ProcStopEventManager<'g> {
    pub fn new(globals: &'g GlobalCounters) -> Self {
        ProcStopEventManager {
            counter: Counter::new(CounterType::StartupTeardownProcesses, globals),
        }
    }

    pub fn begin_transition(&mut self) {
        self.counter.inc();
    }

    pub fn end_transition(&mut self) {
        self.counter.dec();
    }

    pub fn any_in_transition(&self) -> bool {
        self.counter.global_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPlatform;

    #[test]
    fn create_yields_neonatal_process() {
        let platform = MockPlatform::new();
        let lifecycle = ProcessLifecycle::new(&platform);
        let proc = lifecycle.create("/bin/true", &[]).unwrap();
        assert_eq!(proc.state, ProcessState::Neonatal);
        assert_eq!(proc.creation_mode, CreationMode::Created);
    }

    #[test]
    fn attach_yields_stopped_process() {
        let platform = MockPlatform::new();
        let lifecycle = ProcessLifecycle::new(&platform);
        let proc = lifecycle.attach(123).unwrap();
        assert_eq!(proc.state, ProcessState::Stopped);
        assert!(proc.was_created_via_attach);
    }

    #[test]
    fn detach_after_exit_is_rejected() {
        let platform = MockPlatform::new();
        let lifecycle = ProcessLifecycle::new(&platform);
        let mut proc = lifecycle.create("/bin/true", &[]).unwrap();
        lifecycle.terminate(&mut proc).unwrap();
        let err = lifecycle.detach(&mut proc).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotAttached);
    }

    #[test]
    fn forked_child_shares_mem_state_until_mutated() {
        let platform = MockPlatform::new();
        let lifecycle = ProcessLifecycle::new(&platform);
        let parent = lifecycle.create("/bin/true", &[]).unwrap();
        let child = parent.forked(999);
        assert_eq!(child.creation_mode, CreationMode::ForkedChild);
        assert_eq!(std::rc::Rc::strong_count(&parent.mem_state), 2);
    }

    #[test]
    fn proc_stop_event_manager_tracks_active_transitions() {
        let globals = GlobalCounters::new();
        let mut mgr = ProcStopEventManager::new(&globals);
        assert!(!mgr.any_in_transition());
        mgr.begin_transition();
        assert!(mgr.any_in_transition());
        mgr.end_transition();
        assert!(!mgr.any_in_transition());
    }
}
