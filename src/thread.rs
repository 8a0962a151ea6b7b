//! Per-LWP thread record (spec §3 "Thread record", §4.1).
//!
//! Grounded on `int_thread` in `int_process.h`: the register cache, the
//! single-step bookkeeping, the pending-RPC list, and the state model
//! that `thread_state.rs` implements.

use crate::arena::Handle;
use crate::breakpoint::{BreakpointId, EmulatedSingleStep};
use crate::process::ProcessId;
use crate::registers::{RegisterCache, Registers};
use crate::rpc::RpcRecord;
use crate::thread_state::ThreadStateModel;

pub struct ThreadMarker;
pub type ThreadId = Handle<ThreadMarker>;

/// `int_thread`.
pub struct ThreadRecord {
    pub lwp: i32,
    pub tid: i32,
    pub process: ProcessId,
    pub state: ThreadStateModel,
    pub register_cache: RegisterCache,
    cached_registers: Option<Registers>,
    /// Snapshot taken at `IRPCSetup`, restored once the running RPC
    /// completes.
    pub saved_user_registers: Option<Registers>,
    pub user_single_step: bool,
    pub single_step: bool,
    pub emulated_single_step: Option<EmulatedSingleStep>,
    pub clearing_breakpoint: Option<BreakpointId>,
    pub hw_breakpoints: Vec<BreakpointId>,
    pub pending_rpcs: Vec<RpcRecord>,
    pub suspended: bool,
    /// True if this thread was already running when the engine attached
    /// to it, so detach can restore that instead of always resuming.
    pub running_when_attached: bool,
}

impl ThreadRecord {
    pub fn new(process: ProcessId, lwp: i32, tid: i32) -> Self {
        ThreadRecord {
            lwp,
            tid,
            process,
            state: ThreadStateModel::new(),
            register_cache: RegisterCache::default(),
            cached_registers: None,
            saved_user_registers: None,
            user_single_step: false,
            single_step: false,
            emulated_single_step: None,
            clearing_breakpoint: None,
            hw_breakpoints: Vec::new(),
            pending_rpcs: Vec::new(),
            suspended: false,
            running_when_attached: false,
        }
    }

    pub fn cached_registers(&self) -> Option<&Registers> {
        if self.register_cache.valid {
            self.cached_registers.as_ref()
        } else {
            None
        }
    }

    pub fn fill_register_cache(&mut self, regs: Registers) {
        self.cached_registers = Some(regs);
        self.register_cache.valid = true;
    }

    pub fn invalidate_register_cache(&mut self) {
        self.register_cache.valid = false;
    }

    pub fn is_running_rpc(&self) -> bool {
        !self.pending_rpcs.is_empty() && self.saved_user_registers.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn register_cache_invalidation_clears_reads() {
        let mut arena: Arena<crate::process::ProcessRecord> = Arena::new();
        let pid = arena.insert(crate::process::ProcessRecord::new_for_test());
        let mut t = ThreadRecord::new(pid, 100, 100);
        let mut regs = Registers::new();
        regs.set_pc(0x1000);
        t.fill_register_cache(regs);
        assert!(t.cached_registers().is_some());
        t.invalidate_register_cache();
        assert!(t.cached_registers().is_none());
    }
}
