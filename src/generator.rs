//! The generator actor (spec §2, §4.1): blocks on the platform event
//! source, converts raw notifications into the decode queue, and
//! updates only the `Generator` observation slot. Never touches
//! protocol or user state directly.

use std::collections::VecDeque;

use crate::counters::{Counter, CounterType, GlobalCounters};
use crate::error::Result;
use crate::notifier::Notifier;
use crate::platform::{PlatformOps, RawEvent};

/// Events the generator has pulled off the platform but the handler
/// hasn't decoded yet.
#[derive(Default)]
pub struct DecodeQueue {
    events: VecDeque<RawEvent>,
}

impl DecodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ev: RawEvent) {
        self.events.push_back(ev);
    }

    pub fn pop(&mut self) -> Option<RawEvent> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Drives one generator iteration for a single process. A real
/// `GeneratorThreading`/`HandlerThreading` deployment runs `poll_once`
/// in a loop on its own OS thread; `NoThreads` mode has the caller drive
/// it directly from `EngineContext::pump`.
pub struct Generator<'g> {
    async_events: Counter<'g>,
    generator_running: Counter<'g>,
}

impl<'g> Generator<'g> {
    pub fn new(globals: &'g GlobalCounters) -> Self {
        Generator {
            async_events: Counter::new(CounterType::AsyncEvents, globals),
            generator_running: Counter::new(CounterType::GeneratorRunningThreads, globals),
        }
    }

    /// Block (or poll, if `block` is false) on one platform event for
    /// `pid`, queue it for the handler, and note the transition via the
    /// `AsyncEvents` counter so idle teardown can see it's not safe yet.
    pub fn poll_once(
        &mut self,
        platform: &dyn PlatformOps,
        pid: i32,
        block: bool,
        queue: &mut DecodeQueue,
        notifier: &Notifier,
    ) -> Result<bool> {
        platform.plat_pre_handle_event();
        let observed = platform.plat_wait_and_handle_for_proc(pid, block)?;
        platform.plat_post_handle_event();

        match observed {
            Some(ev) => {
                self.async_events.inc();
                track_thread_transition(&mut self.generator_running, &ev);
                queue.push(ev);
                notifier.note_event();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The handler calls this once an event has been fully decoded and
    /// handled, dropping the `AsyncEvents` count back down.
    pub fn mark_decoded(&mut self) {
        self.async_events.dec();
    }
}

fn track_thread_transition(generator_running: &mut Counter<'_>, ev: &RawEvent) {
    match ev {
        RawEvent::Stopped { .. } | RawEvent::Exited { .. } | RawEvent::Signaled { .. } => {
            if generator_running.local_count() > 0 {
                generator_running.dec();
            }
        }
        RawEvent::LwpCreated { .. } | RawEvent::Forked { .. } => {
            generator_running.inc();
        }
        RawEvent::Execed { .. } | RawEvent::LwpExited { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPlatform;

    struct OneShotPlatform {
        inner: MockPlatform,
        fired: std::cell::Cell<bool>,
    }

    impl OneShotPlatform {
        fn new() -> Self {
            OneShotPlatform {
                inner: MockPlatform::new(),
                fired: std::cell::Cell::new(false),
            }
        }
    }

    impl std::ops::Deref for OneShotPlatform {
        type Target = MockPlatform;
        fn deref(&self) -> &MockPlatform {
            &self.inner
        }
    }

    impl PlatformOps for OneShotPlatform {
        fn plat_create(&self, path: &str, argv: &[String]) -> Result<i32> {
            self.inner.plat_create(path, argv)
        }
        fn plat_attach(&self, pid: i32) -> Result<()> {
            self.inner.plat_attach(pid)
        }
        fn plat_detach(&self, pid: i32) -> Result<()> {
            self.inner.plat_detach(pid)
        }
        fn plat_terminate(&self, pid: i32) -> Result<()> {
            self.inner.plat_terminate(pid)
        }
        fn plat_forked(&self, parent_pid: i32) -> Result<i32> {
            self.inner.plat_forked(parent_pid)
        }
        fn plat_execed(&self, pid: i32) -> Result<()> {
            self.inner.plat_execed(pid)
        }
        fn plat_sync_run_state(&self, pid: i32) -> Result<()> {
            self.inner.plat_sync_run_state(pid)
        }
        fn plat_cont(&self, lwp: i32, how: crate::platform::ResumeRequest, signal: Option<i32>) -> Result<()> {
            self.inner.plat_cont(lwp, how, signal)
        }
        fn plat_stop(&self, lwp: i32) -> Result<()> {
            self.inner.plat_stop(lwp)
        }
        fn plat_get_all_registers(&self, lwp: i32) -> Result<crate::registers::Registers> {
            self.inner.plat_get_all_registers(lwp)
        }
        fn plat_set_all_registers(&self, lwp: i32, regs: &crate::registers::Registers) -> Result<()> {
            self.inner.plat_set_all_registers(lwp, regs)
        }
        fn plat_get_register(&self, lwp: i32, reg: crate::registers::RegisterId) -> Result<u64> {
            self.inner.plat_get_register(lwp, reg)
        }
        fn plat_set_register(&self, lwp: i32, reg: crate::registers::RegisterId, value: u64) -> Result<()> {
            self.inner.plat_set_register(lwp, reg, value)
        }
        fn plat_read_mem(&self, lwp: i32, addr: u64, len: usize) -> Result<Vec<u8>> {
            self.inner.plat_read_mem(lwp, addr, len)
        }
        fn plat_write_mem(&self, lwp: i32, addr: u64, data: &[u8]) -> Result<()> {
            self.inner.plat_write_mem(lwp, addr, data)
        }
        fn plat_breakpoint_size(&self) -> usize {
            self.inner.plat_breakpoint_size()
        }
        fn plat_breakpoint_bytes(&self) -> Vec<u8> {
            self.inner.plat_breakpoint_bytes()
        }
        fn plat_breakpoint_advances_pc(&self) -> bool {
            self.inner.plat_breakpoint_advances_pc()
        }
        fn plat_create_allocation_snippet(&self, addr_hint: u64, size: usize) -> Result<Vec<u8>> {
            self.inner.plat_create_allocation_snippet(addr_hint, size)
        }
        fn plat_create_deallocation_snippet(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
            self.inner.plat_create_deallocation_snippet(addr, size)
        }
        fn plat_malloc_exec_memory(&self, pid: i32, min: u64, size: usize) -> Result<u64> {
            self.inner.plat_malloc_exec_memory(pid, min, size)
        }
        fn plat_get_os_running_states(&self, pid: i32) -> Result<Vec<(i32, bool)>> {
            self.inner.plat_get_os_running_states(pid)
        }
        fn plat_is_static_binary(&self, pid: i32) -> bool {
            self.inner.plat_is_static_binary(pid)
        }
        fn plat_get_executable(&self, pid: i32) -> Result<String> {
            self.inner.plat_get_executable(pid)
        }
        fn plat_get_stack_info(&self, lwp: i32) -> Result<(u64, u64)> {
            self.inner.plat_get_stack_info(lwp)
        }
        fn plat_wait_and_handle_for_proc(&self, pid: i32, block: bool) -> Result<Option<RawEvent>> {
            if self.fired.get() {
                return Ok(None);
            }
            self.fired.set(true);
            let _ = (pid, block);
            Ok(Some(RawEvent::Stopped { pid, signal: 5 }))
        }
        fn refresh_libraries(&self, pid: i32) -> Result<Vec<crate::library::LibraryInfo>> {
            self.inner.refresh_libraries(pid)
        }
    }

    #[test]
    fn poll_once_queues_event_and_notifies() {
        let platform = OneShotPlatform::new();
        let globals = GlobalCounters::new();
        let mut gen = Generator::new(&globals);
        let mut queue = DecodeQueue::new();
        let notifier = Notifier::new().unwrap();

        let got = gen
            .poll_once(&platform, 1, true, &mut queue, &notifier)
            .unwrap();
        assert!(got);
        assert_eq!(queue.len(), 1);
        assert_eq!(globals.global_count(CounterType::AsyncEvents), 1);
        assert!(notifier.has_events());

        let got_again = gen
            .poll_once(&platform, 1, false, &mut queue, &notifier)
            .unwrap();
        assert!(!got_again);
    }
}
