//! The `plat_*` capability surface (spec §6) and the collapsed
//! indep/unified/hybrid LWP-control hierarchy (spec §9 Design Notes).
//!
//! The source mixes platform policy into `int_process` through virtual
//! inheritance across `indep_lwp_control_process` / `unified_lwp_control_process`
//! / `hybrid_lwp_control_process`. We flatten that into one trait
//! (`PlatformOps`, implemented once per backend) plus an enum
//! (`LwpControlMode`) the engine consults when syncing run state, exactly
//! as the Design Notes direct.

use crate::error::Result;
use crate::registers::{RegisterId, Registers};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LwpControlMode {
    /// Each LWP is stopped/continued independently.
    Indep,
    /// The whole process is stopped/continued as one unit.
    Unified,
    /// A mix: some operations are per-LWP, others are process-wide.
    Hybrid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    Continue,
    SingleStep,
    ContinueToSyscall,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HwPerm {
    Read,
    Write,
    Execute,
}

/// What the generator observed about one tracee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawEvent {
    Stopped { pid: i32, signal: i32 },
    Exited { pid: i32, code: i32 },
    Signaled { pid: i32, signal: i32 },
    Forked { parent_pid: i32, child_pid: i32 },
    Execed { pid: i32 },
    LwpCreated { pid: i32, lwp: i32 },
    LwpExited { pid: i32, lwp: i32 },
}

/// Everything a backend (ptrace, the Windows debug API, a BG-style
/// service mesh, or `/proc`) must implement. The engine consumes this
/// purely through the trait object; no backend implementation lives in
/// this crate.
pub trait PlatformOps: Send + Sync {
    // --- Process ---
    fn plat_create(&self, path: &str, argv: &[String]) -> Result<i32>;
    fn plat_attach(&self, pid: i32) -> Result<()>;
    fn plat_detach(&self, pid: i32) -> Result<()>;
    fn plat_terminate(&self, pid: i32) -> Result<()>;
    fn plat_forked(&self, parent_pid: i32) -> Result<i32>;
    fn plat_execed(&self, pid: i32) -> Result<()>;
    fn plat_sync_run_state(&self, pid: i32) -> Result<()>;
    fn plat_process_group_continues(&self) -> bool {
        false
    }

    // --- Thread ---
    fn plat_cont(&self, lwp: i32, how: ResumeRequest, signal: Option<i32>) -> Result<()>;
    fn plat_stop(&self, lwp: i32) -> Result<()>;
    fn plat_get_all_registers(&self, lwp: i32) -> Result<Registers>;
    fn plat_set_all_registers(&self, lwp: i32, regs: &Registers) -> Result<()>;
    fn plat_get_register(&self, lwp: i32, reg: RegisterId) -> Result<u64>;
    fn plat_set_register(&self, lwp: i32, reg: RegisterId, value: u64) -> Result<()>;

    // --- Memory ---
    fn plat_read_mem(&self, lwp: i32, addr: u64, len: usize) -> Result<Vec<u8>>;
    fn plat_write_mem(&self, lwp: i32, addr: u64, data: &[u8]) -> Result<()>;
    fn plat_needs_async_io(&self) -> bool {
        false
    }

    // --- Breakpoints ---
    fn plat_breakpoint_size(&self) -> usize;
    fn plat_breakpoint_bytes(&self) -> Vec<u8>;
    fn plat_breakpoint_advances_pc(&self) -> bool;
    fn plat_needs_emulated_single_step(&self) -> bool {
        false
    }
    fn plat_needs_pc_save_before_single_step(&self) -> bool {
        false
    }
    /// Only called when `plat_needs_emulated_single_step` is true: the
    /// successor addresses of the instruction at `lwp`'s current PC, for
    /// the one-shot breakpoints `EmulatedSingleStep` installs at each.
    fn plat_emulated_single_step_targets(&self, _lwp: i32) -> Result<Vec<u64>> {
        Err(crate::error::Error::unsupported_platform_op(
            "plat_emulated_single_step_targets not implemented",
        ))
    }
    fn plat_support_hw_breakpoint(&self) -> bool {
        false
    }
    fn plat_hw_bp_avail(&self, _lwp: i32, _perm: HwPerm, _size: u32) -> bool {
        false
    }

    // --- Code snippets / inferior malloc ---
    fn plat_create_allocation_snippet(&self, addr_hint: u64, size: usize) -> Result<Vec<u8>>;
    fn plat_create_deallocation_snippet(&self, addr: u64, size: usize) -> Result<Vec<u8>>;
    fn plat_malloc_exec_memory(&self, pid: i32, min: u64, size: usize) -> Result<u64>;

    // --- Introspection ---
    fn plat_get_os_running_states(&self, pid: i32) -> Result<Vec<(i32, bool)>>;
    fn plat_is_static_binary(&self, pid: i32) -> bool;
    fn plat_get_executable(&self, pid: i32) -> Result<String>;
    fn plat_get_stack_info(&self, lwp: i32) -> Result<(u64, u64)>;
    fn plat_page_size(&self) -> usize {
        4096
    }

    // --- Events ---
    fn plat_wait_and_handle_for_proc(&self, pid: i32, block: bool) -> Result<Option<RawEvent>>;
    fn plat_pre_handle_event(&self) {}
    fn plat_post_handle_event(&self) {}
    fn plat_pre_async_wait(&self) {}
    fn refresh_libraries(&self, pid: i32) -> Result<Vec<crate::library::LibraryInfo>>;

    // --- Features ---
    fn plat_support_fork(&self) -> bool {
        true
    }
    fn plat_support_exec(&self) -> bool {
        true
    }
    fn plat_support_dotf(&self) -> bool {
        false
    }
    fn plat_support_thread_events(&self) -> bool {
        true
    }
    fn plat_support_lwp_create(&self) -> bool {
        true
    }
    fn plat_support_lwp_pre_destroy(&self) -> bool {
        false
    }
    fn plat_support_lwp_post_destroy(&self) -> bool {
        true
    }
    fn plat_needs_thread_for_mem_ops(&self) -> bool {
        true
    }

    fn lwp_control_mode(&self) -> LwpControlMode {
        LwpControlMode::Indep
    }
}
