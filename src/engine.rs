//! `EngineContext`: the single non-static handle a client holds (spec §2,
//! §6, §9 Design Notes "no global `MTManager::mt_`-style singleton").
//!
//! Owns every arena, the global counter table, the notifier, the
//! exclusion lock, and the registered callbacks. Every public method
//! takes the lock via `Dispatcher::acquire` before touching shared
//! state, except when already running on (and holding the lock as) the
//! generator thread.

use std::sync::Mutex;

use crate::arena::Arena;
use crate::breakpoint::{IntBreakpoint, BreakpointId};
use crate::counters::GlobalCounters;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::generator::{DecodeQueue, Generator};
use crate::handler::Handler;
use crate::library::LibraryRecord;
use crate::lock::{Dispatcher, ThreadingMode};
use crate::memory::MemorySubsystem;
use crate::notifier::Notifier;
use crate::platform::{HwPerm, PlatformOps, ResumeRequest};
use crate::process::{ProcessId, ProcessLifecycle, ProcessRecord};
use crate::registers::{RegisterId, Registers};
use crate::response::{AsyncWait, ResultResponse};
use crate::thread::{ThreadId, ThreadRecord};

/// Passed to `EngineContext::new`; the engine has no persisted state
/// beyond this (spec §6).
pub struct EngineConfig {
    pub threading_mode: ThreadingMode,
    pub page_size_override: Option<usize>,
    pub default_continue_signal: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            threading_mode: ThreadingMode::NoThreads,
            page_size_override: None,
            default_continue_signal: 0,
        }
    }
}

/// A breakpoint request as the caller describes it; `post_breakpoint`
/// turns this into an installed `IntBreakpoint`.
pub struct BreakpointSpec {
    pub addr: u64,
    pub one_time: bool,
    pub process_stopper: bool,
    pub suppress_callbacks: bool,
    pub thread_specific: Option<i32>,
    pub hw: Option<(HwPerm, u32, bool)>,
}

pub struct RpcSpec {
    pub lwp: i32,
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub process_stopper: bool,
}

type Callback = Box<dyn Fn(&Event) + Send>;

pub struct EngineContext {
    platform: Box<dyn PlatformOps>,
    config: EngineConfig,
    dispatcher: Dispatcher,
    globals: GlobalCounters,
    notifier: Notifier,
    processes: Mutex<Arena<ProcessRecord>>,
    threads: Mutex<Arena<ThreadRecord>>,
    memory: Mutex<MemorySubsystem>,
    callbacks: Mutex<Vec<Callback>>,
    threading_mode: Mutex<ThreadingMode>,
}

impl EngineContext {
    pub fn new(platform: Box<dyn PlatformOps>, config: EngineConfig) -> Result<Self> {
        let page_size = config
            .page_size_override
            .unwrap_or_else(|| platform.plat_page_size());
        let threading_mode = config.threading_mode;
        Ok(EngineContext {
            platform,
            config,
            dispatcher: Dispatcher::new(),
            globals: GlobalCounters::new(),
            notifier: Notifier::new().map_err(|e| Error::io_failure(e.to_string()))?,
            processes: Mutex::new(Arena::new()),
            threads: Mutex::new(Arena::new()),
            memory: Mutex::new(MemorySubsystem::new(page_size)),
            callbacks: Mutex::new(Vec::new()),
            threading_mode: Mutex::new(threading_mode),
        })
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn set_threading_mode(&self, mode: ThreadingMode) {
        *self.threading_mode.lock().unwrap() = mode;
    }

    pub fn register_callback(&self, cb: Callback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    fn dispatch(&self, events: &[Event]) {
        let callbacks = self.callbacks.lock().unwrap();
        for ev in events {
            for cb in callbacks.iter() {
                cb(ev);
            }
        }
    }

    pub fn create_process(&self, path: &str, argv: &[String]) -> Result<ProcessId> {
        let _token = self.dispatcher.acquire();
        let lifecycle = ProcessLifecycle::new(self.platform.as_ref());
        let proc = lifecycle.create(path, argv)?;
        let os_pid = proc.pid;
        let pid = self.processes.lock().unwrap().insert(proc);
        self.register_initial_threads(&lifecycle, pid, os_pid)?;
        Ok(pid)
    }

    pub fn attach_process(&self, os_pid: i32) -> Result<ProcessId> {
        let _token = self.dispatcher.acquire();
        let lifecycle = ProcessLifecycle::new(self.platform.as_ref());
        let proc = lifecycle.attach(os_pid)?;
        let pid = self.processes.lock().unwrap().insert(proc);
        self.register_initial_threads(&lifecycle, pid, os_pid)?;
        Ok(pid)
    }

    /// Enumerate the process's LWPs via the platform and park each at
    /// `Startup` (spec §4.2: "All threads enter the Startup slot =
    /// stopped until `initializeAddressSpace` completes"). Called right
    /// after `create`/`attach` insert the process record, so there is a
    /// `ProcessId` to register threads against.
    fn register_initial_threads(
        &self,
        lifecycle: &ProcessLifecycle<'_>,
        pid: ProcessId,
        os_pid: i32,
    ) -> Result<()> {
        let states = self.platform.plat_get_os_running_states(os_pid)?;
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let mut threads = self.threads.lock().unwrap();
        for (lwp, _running) in states {
            lifecycle.register_thread(pid, proc, &mut threads, lwp, lwp);
        }
        Ok(())
    }

    /// Release every thread of `pid` past the `Startup` slot, letting the
    /// caller's subsequent `continue_thread` calls actually take effect.
    pub fn release_startup(&self, pid: ProcessId) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let lifecycle = ProcessLifecycle::new(self.platform.as_ref());
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let mut threads = self.threads.lock().unwrap();
        lifecycle.release_startup(proc, &mut threads);
        Ok(())
    }

    pub fn detach_process(&self, pid: ProcessId) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let lifecycle = ProcessLifecycle::new(self.platform.as_ref());
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        lifecycle.detach(proc)
    }

    pub fn terminate_process(&self, pid: ProcessId) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let lifecycle = ProcessLifecycle::new(self.platform.as_ref());
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        lifecycle.terminate(proc)
    }

    pub fn threads_of(&self, pid: ProcessId) -> Result<Vec<ThreadId>> {
        let procs = self.processes.lock().unwrap();
        let proc = procs.get(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        Ok(proc.threads.iter().collect())
    }

    pub fn libraries_of(&self, pid: ProcessId) -> Result<Vec<LibraryRecord>> {
        let procs = self.processes.lock().unwrap();
        let proc = procs.get(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        Ok(proc.mem_state.borrow().libraries.iter().cloned().collect())
    }

    /// Pump one round of generator-poll + handler-drain for `pid`,
    /// dispatching any resulting events to registered callbacks. Under
    /// `NoThreads` this is the caller's job; under the threaded modes the
    /// background actors call the same sequence on their own loop.
    pub fn pump(&self, pid: ProcessId, block: bool) -> Result<usize> {
        let os_pid = {
            let _token = self.dispatcher.acquire();
            let procs = self.processes.lock().unwrap();
            let proc = procs.get(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
            proc.pid
        };

        // The platform wait is the blocking call (spec §5 Deadlock
        // avoidance: "Platform calls that may block... must be made
        // without holding the exclusion lock"); `_token` above is already
        // dropped before we get here.
        let mut generator = Generator::new(&self.globals);
        let mut queue = DecodeQueue::new();
        let got = generator.poll_once(self.platform.as_ref(), os_pid, block, &mut queue, &self.notifier)?;
        if !got {
            return Ok(0);
        }

        let _token = self.dispatcher.acquire();
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let handler = Handler::new(self.platform.as_ref());
        let mut threads = self.threads.lock().unwrap();
        let events = handler.drain(&mut generator, &mut queue, pid, proc, &mut threads)?;
        self.notifier.clear_event();
        let n = events.len();
        drop(threads);
        drop(procs);
        drop(_token);
        self.dispatch(&events);
        Ok(n)
    }

    pub fn post_breakpoint(&self, pid: ProcessId, spec: BreakpointSpec) -> Result<BreakpointId> {
        let _token = self.dispatcher.acquire();
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let threads = self.threads.lock().unwrap();
        let lwp = spec
            .thread_specific
            .or_else(|| proc.threads.iter().next().and_then(|t| threads.get(t).map(|r| r.lwp)))
            .ok_or_else(|| Error::no_such_thread("process has no threads to breakpoint"))?;
        drop(threads);

        let bp = IntBreakpoint {
            control_transfer_to: None,
            suppress_callbacks: spec.suppress_callbacks,
            one_time: spec.one_time,
            one_time_hit: false,
            process_stopper: spec.process_stopper,
            thread_specific: spec.thread_specific,
            hw: spec.hw.map(|(perm, size, _)| (perm, size)),
        };

        let id = match spec.hw {
            Some((perm, size, proc_wide)) => proc.breakpoints.install_hw(
                self.platform.as_ref(),
                lwp,
                spec.addr,
                perm,
                size,
                proc_wide,
                bp,
            )?,
            None => {
                proc.breakpoints.prep(self.platform.as_ref(), lwp, spec.addr)?;
                proc.breakpoints.insert(self.platform.as_ref(), lwp, spec.addr)?;
                proc.breakpoints.add_to_int_breakpoint(bp, spec.addr)?
            }
        };
        proc.sync_breakpoint_traps();
        Ok(id)
    }

    pub fn post_rpc(&self, pid: ProcessId, spec: RpcSpec) -> Result<u64> {
        let _token = self.dispatcher.acquire();
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        Ok(proc
            .rpcs
            .post(spec.lwp, spec.code, spec.entry_offset, spec.process_stopper))
    }

    pub fn read_memory(&self, pid: ProcessId, addr: u64, len: usize) -> Result<AsyncWait<Vec<u8>>> {
        let _token = self.dispatcher.acquire();
        let procs = self.processes.lock().unwrap();
        let proc = procs.get(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let threads = self.threads.lock().unwrap();
        let lwp = proc
            .threads
            .iter()
            .next()
            .and_then(|t| threads.get(t).map(|r| r.lwp))
            .ok_or_else(|| Error::no_such_thread("process has no threads"))?;
        drop(threads);

        let mem_state = proc.mem_state.borrow();
        let traps: Vec<_> = mem_state.breakpoint_traps.values().cloned().collect();
        drop(mem_state);

        let mut mem = self.memory.lock().unwrap();
        let platform = self.platform.as_ref();
        let data = mem.read_mem(addr, len, &traps, |a, l| platform.plat_read_mem(lwp, a, l))?;
        Ok(AsyncWait::Ready(data))
    }

    pub fn write_memory(&self, pid: ProcessId, addr: u64, data: &[u8]) -> Result<ResultResponse> {
        let _token = self.dispatcher.acquire();
        let mut procs = self.processes.lock().unwrap();
        let proc = procs.get_mut(pid).ok_or_else(|| Error::stale_handle("unknown process"))?;
        let threads = self.threads.lock().unwrap();
        let lwp = proc
            .threads
            .iter()
            .next()
            .and_then(|t| threads.get(t).map(|r| r.lwp))
            .ok_or_else(|| Error::no_such_thread("process has no threads"))?;
        drop(threads);

        let mem_state = proc.mem_state.borrow();
        let traps: Vec<_> = mem_state.breakpoint_traps.values().cloned().collect();
        drop(mem_state);

        {
            let mut mem = self.memory.lock().unwrap();
            let platform = self.platform.as_ref();
            mem.write_mem(addr, data, &traps, |a, d| platform.plat_write_mem(lwp, a, d))?;
        }

        // A write overlapping an installed trap's saved-original bytes
        // must patch them too, so a later uninstall restores what was
        // just written instead of stale pre-trap bytes (spec §4.5).
        let patched: Vec<_> = {
            let mut mem_state = proc.mem_state.borrow_mut();
            for window in mem_state.breakpoint_traps.values_mut() {
                MemorySubsystem::patch_trap_window(window, addr, data);
            }
            mem_state.breakpoint_traps.values().cloned().collect()
        };
        for window in &patched {
            proc.breakpoints.apply_patched_window(window);
        }

        Ok(ResultResponse::new_ready(0, ()))
    }

    pub fn read_register(&self, tid: ThreadId, reg: RegisterId) -> Result<u64> {
        let _token = self.dispatcher.acquire();
        let threads = self.threads.lock().unwrap();
        let t = threads.get(tid).ok_or_else(|| Error::stale_handle("unknown thread"))?;
        self.platform.plat_get_register(t.lwp, reg)
    }

    pub fn write_register(&self, tid: ThreadId, reg: RegisterId, value: u64) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let mut threads = self.threads.lock().unwrap();
        let t = threads.get_mut(tid).ok_or_else(|| Error::stale_handle("unknown thread"))?;
        self.platform.plat_set_register(t.lwp, reg, value)?;
        t.invalidate_register_cache();
        Ok(())
    }

    pub fn read_all_registers(&self, tid: ThreadId) -> Result<Registers> {
        let _token = self.dispatcher.acquire();
        let mut threads = self.threads.lock().unwrap();
        let t = threads.get_mut(tid).ok_or_else(|| Error::stale_handle("unknown thread"))?;
        if let Some(cached) = t.cached_registers() {
            return Ok(cached.clone());
        }
        let regs = self.platform.plat_get_all_registers(t.lwp)?;
        t.fill_register_cache(regs.clone());
        Ok(regs)
    }

    pub fn write_all_registers(&self, tid: ThreadId, regs: &Registers) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let mut threads = self.threads.lock().unwrap();
        let t = threads.get_mut(tid).ok_or_else(|| Error::stale_handle("unknown thread"))?;
        self.platform.plat_set_all_registers(t.lwp, regs)?;
        t.fill_register_cache(regs.clone());
        Ok(())
    }

    pub fn continue_thread(&self, tid: ThreadId) -> Result<()> {
        let _token = self.dispatcher.acquire();
        let mut threads = self.threads.lock().unwrap();
        let t = threads.get_mut(tid).ok_or_else(|| Error::stale_handle("unknown thread"))?;
        self.platform.plat_cont(t.lwp, ResumeRequest::Continue, Some(self.config.default_continue_signal))?;
        t.state.set_handler_state(crate::thread_state::StateValue::Running);
        t.invalidate_register_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPlatform;
    use crate::thread_state::{StateSlot, StateValue};

    #[test]
    fn create_process_then_read_write_memory_round_trips() {
        let engine = EngineContext::new(Box::new(MockPlatform::new()), EngineConfig::default()).unwrap();
        let pid = engine.create_process("/bin/true", &[]).unwrap();
        {
            let mut threads = engine.threads.lock().unwrap();
            let mut procs = engine.processes.lock().unwrap();
            let proc = procs.get_mut(pid).unwrap();
            let tid = threads.insert(ThreadRecord::new(pid, 7, 7));
            proc.threads.add(7, tid);
        }

        engine.write_memory(pid, 0x1000, &[1, 2, 3, 4]).unwrap();
        let data = match engine.read_memory(pid, 0x1000, 4).unwrap() {
            AsyncWait::Ready(v) => v,
            AsyncWait::Pending(_) => panic!("mock platform is always synchronous"),
        };
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_process_handle_is_rejected() {
        let engine = EngineContext::new(Box::new(MockPlatform::new()), EngineConfig::default()).unwrap();
        let pid = engine.create_process("/bin/true", &[]).unwrap();
        engine.terminate_process(pid).unwrap();
        let err = engine.detach_process(pid).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotAttached);
    }

    #[test]
    fn create_process_registers_and_parks_initial_threads() {
        let platform = MockPlatform::new();
        platform.seed_threads(vec![11, 12]);
        let engine = EngineContext::new(Box::new(platform), EngineConfig::default()).unwrap();
        let pid = engine.create_process("/bin/true", &[]).unwrap();

        let tids = engine.threads_of(pid).unwrap();
        assert_eq!(tids.len(), 2);
        {
            let threads = engine.threads.lock().unwrap();
            for tid in &tids {
                let t = threads.get(*tid).unwrap();
                assert!(t.state.is_desynced(StateSlot::Startup));
                assert_eq!(t.state.get(StateSlot::Startup), StateValue::Stopped);
            }
        }

        engine.release_startup(pid).unwrap();
        let threads = engine.threads.lock().unwrap();
        for tid in &tids {
            let t = threads.get(*tid).unwrap();
            assert_eq!(t.state.get(StateSlot::Startup), StateValue::None);
        }
    }

    #[test]
    fn register_round_trip_through_cache() {
        let engine = EngineContext::new(Box::new(MockPlatform::new()), EngineConfig::default()).unwrap();
        let pid = engine.create_process("/bin/true", &[]).unwrap();
        let tid = {
            let mut threads = engine.threads.lock().unwrap();
            threads.insert(ThreadRecord::new(pid, 1, 1))
        };
        let mut regs = Registers::new();
        regs.set_pc(0x4000);
        engine.write_all_registers(tid, &regs).unwrap();
        let back = engine.read_all_registers(tid).unwrap();
        assert_eq!(back.pc(), 0x4000);
    }
}
