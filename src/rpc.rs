//! Inferior-RPC scheduling (spec §4.4): running caller-supplied code
//! snippets inside the tracee without disturbing its visible state.
//!
//! Grounded on `int_iRPC`/`rpcMgr` in `int_process.h`: each RPC moves a
//! thread through `IRPCSetup` (save registers, install code, point PC at
//! it) to `IRPC` (running) to completion (restore registers). A
//! "process-stopper" RPC additionally asserts every other thread stopped
//! for its duration, tracked by the `ProcStopRPCs` counter.

use std::collections::VecDeque;

use crate::counters::{Counter, CounterType};
use crate::error::{Error, Result};
use crate::registers::Registers;
use crate::response::{AllRegResponse, ResultResponse};
use crate::thread_state::{StateSlot, StateValue, ThreadStateModel};

/// One posted inferior RPC, `int_iRPC`.
pub struct RpcRecord {
    pub id: u64,
    pub lwp: i32,
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub process_stopper: bool,
    pub run_even_if_stopped: bool,
    saved_regs: Option<Registers>,
    install_addr: Option<u64>,
    phase: RpcPhase,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RpcPhase {
    Queued,
    SavingRegisters,
    InstallingCode,
    Running,
    RestoringRegisters,
    Complete,
}

impl RpcRecord {
    pub fn new(id: u64, lwp: i32, code: Vec<u8>, entry_offset: usize) -> Self {
        RpcRecord {
            id,
            lwp,
            code,
            entry_offset,
            process_stopper: false,
            run_even_if_stopped: false,
            saved_regs: None,
            install_addr: None,
            phase: RpcPhase::Queued,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == RpcPhase::Complete
    }
}

/// Per-process RPC queue and the counters the spec's Testable Properties
/// call out (`SyncRPCs`, `SyncRPCRunningThreads`, `ProcStopRPCs`).
pub struct RpcScheduler {
    pending: VecDeque<RpcRecord>,
    running: Option<RpcRecord>,
    next_id: u64,
}

impl Default for RpcScheduler {
    fn default() -> Self {
        RpcScheduler {
            pending: VecDeque::new(),
            running: None,
            next_id: 1,
        }
    }
}

impl RpcScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, lwp: i32, code: Vec<u8>, entry_offset: usize, process_stopper: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut rec = RpcRecord::new(id, lwp, code, entry_offset);
        rec.process_stopper = process_stopper;
        self.pending.push_back(rec);
        id
    }

    pub fn has_work(&self) -> bool {
        self.running.is_some() || !self.pending.is_empty()
    }

    /// Step 1 of the run sequence: pull the next queued RPC, mark the
    /// thread's `IRPCSetup` slot, and return the register-save response
    /// the caller must await before proceeding to `install`.
    pub fn begin_next(
        &mut self,
        state: &mut ThreadStateModel,
        save_registers: impl FnOnce(i32) -> Result<Registers>,
    ) -> Result<Option<&RpcRecord>> {
        if self.running.is_some() {
            return Err(Error::internal_invariant_violated(
                "begin_next called while an RPC is already running",
            ));
        }
        let mut rec = match self.pending.pop_front() {
            Some(r) => r,
            None => return Ok(None),
        };
        rec.phase = RpcPhase::SavingRegisters;
        state.desync_state(StateSlot::IRPCSetup, StateValue::Running);
        let regs = save_registers(rec.lwp)?;
        rec.saved_regs = Some(regs);
        self.running = Some(rec);
        Ok(self.running.as_ref())
    }

    /// Step 2: install the code snippet at `addr` (obtained from the
    /// engine's inferior-malloc path) and advance to `IRPC` once the
    /// caller confirms the PC has been redirected there.
    pub fn install(&mut self, state: &mut ThreadStateModel, addr: u64) -> Result<()> {
        let rec = self
            .running
            .as_mut()
            .ok_or_else(|| Error::internal_invariant_violated("install with no running RPC"))?;
        rec.install_addr = Some(addr);
        rec.phase = RpcPhase::InstallingCode;
        state.mark_reconciled();
        Ok(())
    }

    /// Step 3: the thread's PC now points at the installed snippet;
    /// advance the `IRPC` slot so the reconciler lets it run.
    pub fn start_running(&mut self, state: &mut ThreadStateModel) -> Result<u64> {
        let rec = self
            .running
            .as_mut()
            .ok_or_else(|| Error::internal_invariant_violated("start_running with no running RPC"))?;
        let addr = rec
            .install_addr
            .ok_or_else(|| Error::internal_invariant_violated("RPC started before code installed"))?
            + rec.entry_offset as u64;
        rec.phase = RpcPhase::Running;
        state.desync_state(StateSlot::IRPC, StateValue::Running);
        Ok(addr)
    }

    /// Step 4-5: the generator observed the RPC-completion trap; restore
    /// the saved registers and clear the slots, completing `resp`.
    pub fn complete(
        &mut self,
        state: &mut ThreadStateModel,
        resp: &ResultResponse,
        restore_registers: impl FnOnce(i32, &Registers) -> Result<()>,
    ) -> Result<()> {
        let mut rec = self
            .running
            .take()
            .ok_or_else(|| Error::internal_invariant_violated("complete with no running RPC"))?;
        rec.phase = RpcPhase::RestoringRegisters;
        let saved = rec
            .saved_regs
            .as_ref()
            .ok_or_else(|| Error::internal_invariant_violated("RPC completed with no saved registers"))?;
        restore_registers(rec.lwp, saved)?;
        state.restore_state(StateSlot::IRPC);
        state.restore_state(StateSlot::IRPCSetup);
        rec.phase = RpcPhase::Complete;
        resp.complete(());
        Ok(())
    }

    /// Registers the save-response this RPC's setup phase produced, for
    /// callers that want to await it directly instead of polling
    /// `begin_next`'s synchronous return.
    pub fn saved_registers_response(lwp: i32, regs: Registers) -> AllRegResponse {
        AllRegResponse::new_ready(lwp as u64, regs)
    }

    pub fn is_process_stopper_active(&self) -> bool {
        self.running.as_ref().map_or(false, |r| r.process_stopper)
    }
}

/// Whether RPCs may currently be posted to `lwp`: the spec's
/// `notAvailableForRPC` condition (thread exiting, detaching, or already
/// running an ephemeral internal RPC).
pub fn not_available_for_rpc(state: &ThreadStateModel) -> bool {
    matches!(
        state.get(StateSlot::Exiting),
        StateValue::Running | StateValue::NeonatalIntermediate
    ) || matches!(state.get(StateSlot::Detach), StateValue::Running)
}

pub fn track_process_stopper<'g>(counter: &mut Counter<'g>, starting: bool) {
    debug_assert_eq!(counter.counter_type(), CounterType::ProcStopRPCs);
    if starting {
        counter.inc();
    } else {
        counter.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::GlobalCounters;

    #[test]
    fn run_sequence_restores_registers_and_clears_slots() {
        let mut sched = RpcScheduler::new();
        let mut state = ThreadStateModel::new();
        sched.post(1, vec![0x90, 0xCC], 0, false);

        let mut saved = Registers::new();
        saved.set_pc(0x1000);
        sched
            .begin_next(&mut state, |_lwp| Ok(saved.clone()))
            .unwrap();
        sched.install(&mut state, 0x5000).unwrap();
        let entry = sched.start_running(&mut state).unwrap();
        assert_eq!(entry, 0x5000);

        let resp = ResultResponse::new_pending(1);
        let restored = std::cell::RefCell::new(None);
        sched
            .complete(&mut state, &resp, |_lwp, regs| {
                *restored.borrow_mut() = Some(regs.clone());
                Ok(())
            })
            .unwrap();

        assert!(resp.is_ready());
        assert_eq!(restored.borrow().as_ref().unwrap().pc(), 0x1000);
        assert_eq!(state.get(StateSlot::IRPC), StateValue::None);
        assert_eq!(state.get(StateSlot::IRPCSetup), StateValue::None);
    }

    #[test]
    fn begin_next_rejects_reentry_while_one_is_running() {
        let mut sched = RpcScheduler::new();
        let mut state = ThreadStateModel::new();
        sched.post(1, vec![0x90], 0, false);
        sched.post(1, vec![0x91], 0, false);
        sched.begin_next(&mut state, |_| Ok(Registers::new())).unwrap();
        let err = sched
            .begin_next(&mut state, |_| Ok(Registers::new()))
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InternalInvariantViolated);
    }

    #[test]
    fn process_stopper_rpc_is_tracked_via_counter() {
        let globals = GlobalCounters::new();
        let mut counter = Counter::new(CounterType::ProcStopRPCs, &globals);
        track_process_stopper(&mut counter, true);
        assert_eq!(counter.local_count(), 1);
        track_process_stopper(&mut counter, false);
        assert_eq!(counter.local_count(), 0);
    }
}
