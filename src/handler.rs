//! The handler actor (spec §2, §4.1, §4.8): drains the decode queue,
//! runs decode/handle logic per event, mutates handler- and
//! internal-layer state, schedules follow-on work, and produces the
//! callback-facing `Event`s.
//!
//! Runs on its own thread under `HandlerThreading`/`CallbackThreading`,
//! or inline on the caller's thread under `GeneratorThreading`/
//! `NoThreads` (spec §2: "the user's own caller thread (when [handler
//! threading is] disabled)").

use crate::arena::Arena;
use crate::error::Result;
use crate::event::Event;
use crate::generator::{DecodeQueue, Generator};
use crate::library::LibraryInfo;
use crate::platform::{PlatformOps, RawEvent, ResumeRequest};
use crate::process::{ProcessId, ProcessRecord};
use crate::thread::{ThreadId, ThreadRecord};
use crate::thread_state::{StateSlot, StateValue};

/// Decodes and handles one `RawEvent`, mutating `Internal`/`Handler`
/// slots and producing the zero-or-more callback events it implies.
pub struct Handler<'p> {
    platform: &'p dyn PlatformOps,
}

impl<'p> Handler<'p> {
    pub fn new(platform: &'p dyn PlatformOps) -> Self {
        Handler { platform }
    }

    /// Drain every queued raw event for `proc`, handling each in order.
    pub fn drain(
        &self,
        generator: &mut Generator<'_>,
        queue: &mut DecodeQueue,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
    ) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        while let Some(raw) = queue.pop() {
            let events = self.handle_one(proc_id, proc, threads, raw)?;
            generator.mark_decoded();
            out.extend(events);
        }
        Ok(out)
    }

    fn handle_one(
        &self,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
        raw: RawEvent,
    ) -> Result<Vec<Event>> {
        log::debug!("handling raw event: {:?}", raw);
        match raw {
            RawEvent::Stopped { pid: _, signal } => self.handle_stopped(proc_id, proc, threads, signal),
            RawEvent::Exited { pid, code } => {
                proc.state = crate::process::ProcessState::Exited;
                let _ = pid;
                Ok(vec![Event::ProcessExited { process: proc_id, code }])
            }
            RawEvent::Signaled { pid: _, signal } => {
                Ok(vec![Event::ProcessSignaled { process: proc_id, signal }])
            }
            RawEvent::Forked { parent_pid: _, child_pid: _ } => {
                // The engine (which owns the process arena) is responsible
                // for actually inserting the forked child; the handler
                // only reports the observation.
                Ok(vec![])
            }
            RawEvent::Execed { pid: _ } => {
                proc.mark_execed();
                Ok(vec![Event::Execed { process: proc_id }])
            }
            RawEvent::LwpCreated { pid: _, lwp } => {
                Ok(self.handle_lwp_created(proc_id, proc, threads, lwp))
            }
            RawEvent::LwpExited { pid: _, lwp } => {
                Ok(self.handle_lwp_exited(proc_id, proc, threads, lwp))
            }
        }
    }

    fn handle_stopped(
        &self,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
        signal: i32,
    ) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for tid in proc.threads.iter() {
            {
                let t = match threads.get_mut(tid) {
                    Some(t) => t,
                    None => continue,
                };
                t.state.set_generator_state(StateValue::Stopped);
                t.invalidate_register_cache();
            }

            // A trap signal at a known breakpoint address is decoded into a
            // BreakpointHit; anything else is a plain stop. `resolve_hit`
            // is the sole place that maps the (possibly trap-advanced) PC
            // back to the installed address, so the existence check here
            // reuses exactly the address it resolved rather than a raw PC
            // that wouldn't match the instance's own key.
            let hit = if signal == self.trap_signal() {
                self.resolve_hit(proc, threads, tid)
            } else {
                None
            };

            if let Some((addr, bp)) = hit {
                // If any logical breakpoint bound to this address asked
                // for suppressed callbacks, the whole hit is suppressed
                // (spec §9 Open Questions: "suppress if any is marked
                // suppress").
                if !proc.breakpoints.any_bound_suppresses_callbacks(addr) {
                    events.push(Event::BreakpointHit {
                        process: proc_id,
                        thread: tid,
                        breakpoint: bp,
                    });
                }

                self.step_over_breakpoint(proc, threads, tid, addr)?;

                if proc.breakpoints.any_bound_is_process_stopper(addr) {
                    self.stop_other_threads(proc, threads, tid);
                }
            }

            if let Some(t) = threads.get_mut(tid) {
                t.state.set_handler_state(StateValue::Stopped);
                t.state.mark_reconciled();
                events.push(Event::ThreadStopped { process: proc_id, thread: tid });
            }
        }
        Ok(events)
    }

    /// Step the thread literally over the trap byte it just hit (spec
    /// §4.3 step 3): suspend the instance (restoring the original
    /// bytes), single-step once, then resume it (reinstalling the
    /// trap). The `BreakpointResume` slot marks the thread as mid-step so
    /// a concurrent stop request still sees it as parked at the
    /// breakpoint rather than freely running.
    fn step_over_breakpoint(
        &self,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
        tid: ThreadId,
        addr: u64,
    ) -> Result<()> {
        let lwp = match threads.get(tid) {
            Some(t) => t.lwp,
            None => return Ok(()),
        };

        if self.platform.plat_breakpoint_advances_pc() {
            self.platform
                .plat_set_register(lwp, crate::registers::REG_PC, addr)?;
        }

        if let Some(t) = threads.get_mut(tid) {
            t.state.desync_state(StateSlot::BreakpointResume, StateValue::Stopped);
        }

        proc.breakpoints.suspend(self.platform, lwp, addr)?;
        self.platform.plat_cont(lwp, ResumeRequest::SingleStep, None)?;
        proc.breakpoints.resume(self.platform, lwp, addr)?;
        proc.sync_breakpoint_traps();

        if let Some(t) = threads.get_mut(tid) {
            t.state.restore_state(StateSlot::BreakpointResume);
            t.invalidate_register_cache();
        }
        Ok(())
    }

    /// A process-stopper breakpoint parks every other thread in the
    /// process (spec §4.3 point 2), asserted through the `PendingStop`
    /// slot that already exists for exactly this purpose.
    fn stop_other_threads(&self, proc: &ProcessRecord, threads: &mut Arena<ThreadRecord>, except: ThreadId) {
        for tid in proc.threads.iter() {
            if tid == except {
                continue;
            }
            if let Some(t) = threads.get_mut(tid) {
                t.state.desync_state(StateSlot::PendingStop, StateValue::Stopped);
            }
        }
    }

    fn resolve_hit(
        &self,
        proc: &ProcessRecord,
        threads: &Arena<ThreadRecord>,
        tid: ThreadId,
    ) -> Option<(u64, crate::breakpoint::BreakpointId)> {
        let t = threads.get(tid)?;
        let pc = self.platform.plat_get_register(t.lwp, crate::registers::REG_PC).ok()?;
        // PC has already advanced past the trap byte on platforms where
        // plat_breakpoint_advances_pc() is true; the instance is still
        // keyed by the trap's own address either way since the caller
        // backs PC up before this lookup on those platforms.
        let addr = if self.platform.plat_breakpoint_advances_pc() {
            pc.saturating_sub(self.platform.plat_breakpoint_size() as u64)
        } else {
            pc
        };
        let bp = proc.breakpoints.instance_at(addr)?.bps.first().copied()?;
        Some((addr, bp))
    }

    fn trap_signal(&self) -> i32 {
        5 // SIGTRAP, the only signal the decode step treats as a breakpoint candidate.
    }

    fn handle_lwp_created(
        &self,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
        lwp: i32,
    ) -> Vec<Event> {
        if proc.threads.find_by_lwp(lwp).is_some() {
            return vec![];
        }
        let mut rec = ThreadRecord::new(proc_id, lwp, lwp);
        rec.state.desync_state(StateSlot::Startup, StateValue::Stopped);
        let tid = threads.insert(rec);
        proc.threads.add(lwp, tid);
        vec![Event::ThreadCreated { process: proc_id, thread: tid }]
    }

    fn handle_lwp_exited(
        &self,
        proc_id: ProcessId,
        proc: &mut ProcessRecord,
        threads: &mut Arena<ThreadRecord>,
        lwp: i32,
    ) -> Vec<Event> {
        match proc.threads.find_by_lwp(lwp) {
            Some(tid) => {
                if let Some(t) = threads.get_mut(tid) {
                    t.state.set_state(StateSlot::Exiting, StateValue::Exited);
                }
                proc.threads.remove(tid);
                vec![Event::ThreadExited { process: proc_id, thread: tid }]
            }
            None => vec![],
        }
    }

    /// Library refresh is handler-layer work triggered after a stop, not
    /// part of raw-event decoding; exposed separately so the engine can
    /// call it whenever its own policy (every stop, every exec, on
    /// request) says to.
    pub fn refresh_libraries(&self, proc_id: ProcessId, proc: &mut ProcessRecord, pid: i32) -> Vec<Event> {
        let result: Result<Vec<LibraryInfo>> = self.platform.refresh_libraries(pid);
        let events = proc.libraries.refresh(&mut proc.mem_state.borrow_mut().libraries, result);
        events
            .into_iter()
            .map(|e| Event::LibraryChanged { process: proc_id, change: e.into() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::IntBreakpoint;
    use crate::counters::GlobalCounters;
    use crate::notifier::Notifier;
    use crate::process::CreationMode;
    use crate::test_support::MockPlatform;

    #[test]
    fn stop_event_marks_threads_stopped_and_clears_registers() {
        let platform = MockPlatform::new();
        let globals = GlobalCounters::new();
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let proc_id = procs.insert(ProcessRecord::new(1, CreationMode::Created));
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let tid = threads.insert(ThreadRecord::new(proc_id, 1, 1));
        procs.get_mut(proc_id).unwrap().threads.add(1, tid);

        let mut generator = Generator::new(&globals);
        let mut queue = DecodeQueue::new();
        queue.push(RawEvent::Stopped { pid: 1, signal: 19 });
        let notifier = Notifier::new().unwrap();
        let _ = &notifier;

        let handler = Handler::new(&platform);
        let proc = procs.get_mut(proc_id).unwrap();
        let events = handler
            .drain(&mut generator, &mut queue, proc_id, proc, &mut threads)
            .unwrap();

        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ThreadStopped { .. })));
        let t = threads.get(tid).unwrap();
        assert_eq!(t.state.handler_state(), StateValue::Stopped);
        assert_eq!(t.state.generator_state(), StateValue::Stopped);
        assert!(!t.register_cache.valid);
    }

    #[test]
    fn lwp_created_registers_a_new_thread() {
        let platform = MockPlatform::new();
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let proc_id = procs.insert(ProcessRecord::new(1, CreationMode::Created));
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let handler = Handler::new(&platform);
        let proc = procs.get_mut(proc_id).unwrap();

        let events = handler.handle_lwp_created(proc_id, proc, &mut threads, 42);
        assert_eq!(events.len(), 1);
        assert!(proc.threads.find_by_lwp(42).is_some());
    }

    #[test]
    fn breakpoint_hit_steps_over_and_emits_one_event() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x8000, vec![0x90, 0x90, 0x90, 0x90]);
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let proc_id = procs.insert(ProcessRecord::new(1, CreationMode::Created));
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let tid = threads.insert(ThreadRecord::new(proc_id, 1, 1));
        {
            let proc = procs.get_mut(proc_id).unwrap();
            proc.threads.add(1, tid);
            proc.breakpoints.prep(&platform, 1, 0x8000).unwrap();
            proc.breakpoints.insert(&platform, 1, 0x8000).unwrap();
            proc.breakpoints
                .add_to_int_breakpoint(IntBreakpoint::new(), 0x8000)
                .unwrap();
            proc.sync_breakpoint_traps();
        }
        // The mock's plat_breakpoint_advances_pc() is true, so the PC the
        // thread reports post-trap sits one byte past the installed address.
        platform.plat_set_register(1, crate::registers::REG_PC, 0x8001).unwrap();

        let handler = Handler::new(&platform);
        let proc = procs.get_mut(proc_id).unwrap();
        let events = handler
            .handle_stopped(proc_id, proc, &mut threads, 5)
            .unwrap();

        let hits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::BreakpointHit { .. }))
            .collect();
        assert_eq!(hits.len(), 1);
        assert!(events.iter().any(|e| matches!(e, Event::ThreadStopped { .. })));

        let t = threads.get(tid).unwrap();
        assert_eq!(t.state.get(StateSlot::BreakpointResume), StateValue::None);
        assert!(proc.mem_state.borrow().breakpoint_traps.contains_key(&0x8000));
    }

    #[test]
    fn process_stopper_breakpoint_parks_other_threads() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x9000, vec![1, 2, 3, 4]);
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let proc_id = procs.insert(ProcessRecord::new(1, CreationMode::Created));
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let hitter = threads.insert(ThreadRecord::new(proc_id, 1, 1));
        let other = threads.insert(ThreadRecord::new(proc_id, 2, 2));
        {
            let proc = procs.get_mut(proc_id).unwrap();
            proc.threads.add(1, hitter);
            proc.threads.add(2, other);
            proc.breakpoints.prep(&platform, 1, 0x9000).unwrap();
            proc.breakpoints.insert(&platform, 1, 0x9000).unwrap();
            proc.breakpoints
                .add_to_int_breakpoint(
                    IntBreakpoint {
                        process_stopper: true,
                        ..IntBreakpoint::new()
                    },
                    0x9000,
                )
                .unwrap();
            proc.sync_breakpoint_traps();
        }
        platform.plat_set_register(1, crate::registers::REG_PC, 0x9001).unwrap();

        let handler = Handler::new(&platform);
        let proc = procs.get_mut(proc_id).unwrap();
        handler.handle_stopped(proc_id, proc, &mut threads, 5).unwrap();

        let other_rec = threads.get(other).unwrap();
        assert!(other_rec.state.is_desynced(StateSlot::PendingStop));
        assert_eq!(other_rec.state.get(StateSlot::PendingStop), StateValue::Stopped);
    }

    #[test]
    fn exited_event_marks_process_exited() {
        let platform = MockPlatform::new();
        let mut procs: Arena<ProcessRecord> = Arena::new();
        let proc_id = procs.insert(ProcessRecord::new(1, CreationMode::Created));
        let mut threads: Arena<ThreadRecord> = Arena::new();
        let handler = Handler::new(&platform);
        let proc = procs.get_mut(proc_id).unwrap();

        let events = handler
            .handle_one(proc_id, proc, &mut threads, RawEvent::Exited { pid: 1, code: 0 })
            .unwrap();
        assert!(matches!(events[0], Event::ProcessExited { code: 0, .. }));
        assert_eq!(proc.state, crate::process::ProcessState::Exited);
    }
}
