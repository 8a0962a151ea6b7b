//! Software and hardware breakpoints, suspend/resume, and emulated
//! single-step (spec §4.3). The largest single component by the budget
//! in spec §2 (22% of the core).
//!
//! Grounded on `int_breakpoint` (logical breakpoint), `bp_instance` /
//! `sw_breakpoint` / `hw_breakpoint` (concrete instance), and
//! `emulated_singlestep` in `int_process.h`.

use std::collections::HashMap;

use crate::arena::{Arena, Handle};
use crate::error::{Error, Result};
use crate::memory::{Address, TrapWindow};
use crate::platform::{HwPerm, PlatformOps};
use crate::response::{MemResponse, ResultResponse};

/// At least as large as any arch's trap instruction (`BP_BUFFER_SIZE`).
pub const BP_BUFFER_SIZE: usize = 8;
/// Long breakpoints pad the write to this size to fool interception code
/// that only looks for 4-byte writes (`BP_LONG_SIZE`).
pub const BP_LONG_SIZE: usize = 4;

pub struct IntBreakpointMarker;
pub type BreakpointId = Handle<IntBreakpointMarker>;

/// `int_breakpoint`: the user-facing logical breakpoint.
#[derive(Clone)]
pub struct IntBreakpoint {
    pub control_transfer_to: Option<Address>,
    pub suppress_callbacks: bool,
    pub one_time: bool,
    pub one_time_hit: bool,
    pub process_stopper: bool,
    pub thread_specific: Option<i32>,
    pub hw: Option<(HwPerm, u32)>,
}

impl IntBreakpoint {
    pub fn new() -> Self {
        IntBreakpoint {
            control_transfer_to: None,
            suppress_callbacks: false,
            one_time: false,
            one_time_hit: false,
            process_stopper: false,
            thread_specific: None,
            hw: None,
        }
    }

    pub fn is_hw(&self) -> bool {
        self.hw.is_some()
    }

    pub fn is_thread_specific_to(&self, tid: i32) -> bool {
        match self.thread_specific {
            Some(t) => t == tid,
            None => true,
        }
    }
}

impl Default for IntBreakpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Software breakpoint payload: saved bytes plus the three-phase install
/// bookkeeping (`sw_breakpoint`).
pub struct SwBreakpointData {
    pub buffer: [u8; BP_BUFFER_SIZE],
    pub buffer_size: usize,
    pub prepped: bool,
    pub long_breakpoint: bool,
}

/// Hardware breakpoint payload (`hw_breakpoint`).
pub struct HwBreakpointData {
    pub perm: HwPerm,
    pub size: u32,
    pub proc_wide: bool,
    pub owning_lwp: Option<i32>,
    pub error: bool,
}

pub enum BpVariant {
    Sw(SwBreakpointData),
    Hw(HwBreakpointData),
}

/// `bp_instance`: tied to a concrete address, owns the set of logical
/// breakpoints mapped onto it.
pub struct BpInstance {
    pub addr: Address,
    pub bps: Vec<BreakpointId>,
    pub installed: bool,
    pub suspend_count: u32,
    pub variant: BpVariant,
}

impl BpInstance {
    pub fn is_empty_of_logical_bps(&self) -> bool {
        self.bps.is_empty()
    }
}

/// `emulated_singlestep`: one-shot breakpoints at every successor of the
/// current instruction, used when the platform can't (or mustn't)
/// single-step directly.
pub struct EmulatedSingleStep {
    pub saved_user_single_step: bool,
    pub saved_single_step: bool,
    pub addrs: Vec<Address>,
}

pub struct BreakpointEngine {
    logical: Arena<IntBreakpoint>,
    /// address -> bp_instance, mirrors `mem_state.breakpoints` for the sw
    /// side; hw breakpoints are per-thread so they aren't addressed here.
    instances: HashMap<Address, BpInstance>,
}

impl Default for BreakpointEngine {
    fn default() -> Self {
        BreakpointEngine {
            logical: Arena::new(),
            instances: HashMap::new(),
        }
    }
}

impl BreakpointEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BreakpointId) -> Option<&IntBreakpoint> {
        self.logical.get(id)
    }

    pub fn instance_at(&self, addr: Address) -> Option<&BpInstance> {
        self.instances.get(&addr)
    }

    /// Whether *any* logical breakpoint bound at `addr` asked for
    /// suppressed callbacks (spec §9 Open Questions: multiple logical
    /// breakpoints sharing an address suppress the hit if any one of
    /// them does).
    pub fn any_bound_suppresses_callbacks(&self, addr: Address) -> bool {
        self.instances
            .get(&addr)
            .map(|inst| {
                inst.bps
                    .iter()
                    .filter_map(|&id| self.logical.get(id))
                    .any(|bp| bp.suppress_callbacks)
            })
            .unwrap_or(false)
    }

    /// Whether any logical breakpoint bound at `addr` is a process
    /// stopper, the same "any one" rule applied to that flag.
    pub fn any_bound_is_process_stopper(&self, addr: Address) -> bool {
        self.instances
            .get(&addr)
            .map(|inst| {
                inst.bps
                    .iter()
                    .filter_map(|&id| self.logical.get(id))
                    .any(|bp| bp.process_stopper)
            })
            .unwrap_or(false)
    }

    /// Phase 1 of software install: read the target bytes into the
    /// instance buffer. Returns the response to wait on for async
    /// platforms.
    pub fn prep(&mut self, platform: &dyn PlatformOps, lwp: i32, addr: Address) -> Result<MemResponse> {
        // Re-posting a breakpoint at an address that's already prepped must
        // not re-read memory: `insert` has likely already overwritten the
        // target with trap bytes, and re-reading now would save those
        // instead of the real original bytes (spec §8: installing the same
        // logical breakpoint twice at one address is idempotent).
        if let Some(inst) = self.instances.get(&addr) {
            if let BpVariant::Sw(sw) = &inst.variant {
                if sw.prepped {
                    return Ok(MemResponse::new_ready(0, sw.buffer[..sw.buffer_size].to_vec()));
                }
            }
        }
        let size = platform.plat_breakpoint_size();
        let data = platform.plat_read_mem(lwp, addr, size.max(BP_LONG_SIZE.min(size.max(1))))?;
        let resp = MemResponse::new_ready(0, data.clone());
        self.instances.entry(addr).or_insert_with(|| BpInstance {
            addr,
            bps: Vec::new(),
            installed: false,
            suspend_count: 0,
            variant: BpVariant::Sw(SwBreakpointData {
                buffer: [0u8; BP_BUFFER_SIZE],
                buffer_size: 0,
                prepped: false,
                long_breakpoint: false,
            }),
        });
        let inst = self.instances.get_mut(&addr).unwrap();
        if let BpVariant::Sw(sw) = &mut inst.variant {
            let n = data.len().min(BP_BUFFER_SIZE);
            sw.buffer[..n].copy_from_slice(&data[..n]);
            sw.buffer_size = n;
            sw.prepped = true;
        }
        Ok(resp)
    }

    /// Phase 2: write the platform trap bytes, padding to `BP_LONG_SIZE`
    /// when the instance is long.
    pub fn insert(
        &mut self,
        platform: &dyn PlatformOps,
        lwp: i32,
        addr: Address,
    ) -> Result<ResultResponse> {
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_parameter("no prepped breakpoint instance at address"))?;
        let trap = platform.plat_breakpoint_bytes();
        let (long_bp, write_len) = match &inst.variant {
            BpVariant::Sw(sw) => (sw.long_breakpoint, if sw.long_breakpoint {
                BP_LONG_SIZE.max(trap.len())
            } else {
                trap.len()
            }),
            BpVariant::Hw(_) => {
                return Err(Error::bad_parameter("insert() is a software-breakpoint-only phase"))
            }
        };
        let mut write_buf = vec![0u8; write_len];
        write_buf[..trap.len()].copy_from_slice(&trap);
        if long_bp && write_len > trap.len() {
            if let BpVariant::Sw(sw) = &inst.variant {
                write_buf[trap.len()..].copy_from_slice(&sw.buffer[trap.len()..write_len]);
            }
        }
        platform.plat_write_mem(lwp, addr, &write_buf)?;
        inst.installed = true;
        Ok(ResultResponse::new_ready(0, ()))
    }

    /// Phase 3: bind the logical breakpoint to the (now prepped+inserted)
    /// instance and publish it. Installing the same logical breakpoint
    /// twice at one address is idempotent (spec §8 boundary case).
    pub fn add_to_int_breakpoint(&mut self, bp: IntBreakpoint, addr: Address) -> Result<BreakpointId> {
        let id = self.logical.insert(bp);
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_parameter("breakpoint instance not installed yet"))?;
        if !inst.bps.contains(&id) {
            inst.bps.push(id);
        }
        log::debug!("breakpoint {} bound at {:#x}", id.index(), addr);
        Ok(id)
    }

    /// Patch the saved-original bytes of the instance at `window.addr`
    /// back from a `TrapWindow` that `MemorySubsystem::patch_trap_window`
    /// has already updated for a user write overlapping it, so the two
    /// copies (this engine's own buffer, and `mem_state`'s derived view)
    /// stay consistent (spec §4.5).
    pub fn apply_patched_window(&mut self, window: &TrapWindow) {
        if let Some(inst) = self.instances.get_mut(&window.addr) {
            if let BpVariant::Sw(sw) = &mut inst.variant {
                let n = window.original_bytes.len().min(BP_BUFFER_SIZE);
                sw.buffer[..n].copy_from_slice(&window.original_bytes[..n]);
            }
        }
    }

    /// The saved-original-bytes view `MemorySubsystem` needs to keep
    /// reads/writes trap-transparent.
    pub fn trap_windows(&self) -> Vec<TrapWindow> {
        self.instances
            .values()
            .filter_map(|inst| match &inst.variant {
                BpVariant::Sw(sw) if inst.suspend_count == 0 && sw.prepped => Some(TrapWindow {
                    addr: inst.addr,
                    original_bytes: sw.buffer[..sw.buffer_size].to_vec(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Uninstall: restore saved bytes, and if the logical-breakpoint set
    /// becomes empty, remove the instance from the address map (spec
    /// §4.3). Round-trips exactly (spec §8: "install-then-uninstall...
    /// restores the exact original bytes").
    pub fn uninstall(
        &mut self,
        platform: &dyn PlatformOps,
        lwp: i32,
        addr: Address,
        bp: BreakpointId,
    ) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_address("no breakpoint instance at address"))?;
        inst.bps.retain(|&b| b != bp);
        self.logical.remove(bp);

        if inst.is_empty_of_logical_bps() {
            if let BpVariant::Sw(sw) = &inst.variant {
                if inst.installed {
                    platform.plat_write_mem(lwp, addr, &sw.buffer[..sw.buffer_size])?;
                }
            }
            self.instances.remove(&addr);
        }
        Ok(())
    }

    /// Suspend: write the original bytes back without removing the
    /// instance (used while single-stepping past the breakpoint site).
    /// Suspend/resume nests via `suspend_count`.
    pub fn suspend(&mut self, platform: &dyn PlatformOps, lwp: i32, addr: Address) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_address("no breakpoint instance at address"))?;
        inst.suspend_count += 1;
        if inst.suspend_count == 1 {
            if let BpVariant::Sw(sw) = &inst.variant {
                platform.plat_write_mem(lwp, addr, &sw.buffer[..sw.buffer_size])?;
            }
        }
        Ok(())
    }

    /// Resume: re-write the trap once the suspend depth returns to zero.
    pub fn resume(&mut self, platform: &dyn PlatformOps, lwp: i32, addr: Address) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_address("no breakpoint instance at address"))?;
        if inst.suspend_count == 0 {
            return Err(Error::internal_invariant_violated("resume without matching suspend"));
        }
        inst.suspend_count -= 1;
        if inst.suspend_count == 0 {
            let trap = platform.plat_breakpoint_bytes();
            platform.plat_write_mem(lwp, addr, &trap)?;
        }
        Ok(())
    }

    // --- Hardware breakpoints ---

    pub fn install_hw(
        &mut self,
        platform: &dyn PlatformOps,
        lwp: i32,
        addr: Address,
        perm: HwPerm,
        size: u32,
        proc_wide: bool,
        bp: IntBreakpoint,
    ) -> Result<BreakpointId> {
        if !platform.plat_support_hw_breakpoint() {
            return Err(Error::unsupported_platform_op("platform lacks hw breakpoint support"));
        }
        if !platform.plat_hw_bp_avail(lwp, perm, size) {
            return Err(Error::permission_denied("no free hardware breakpoint slot"));
        }
        let id = self.logical.insert(bp);
        self.instances.insert(
            addr,
            BpInstance {
                addr,
                bps: vec![id],
                installed: true,
                suspend_count: 0,
                variant: BpVariant::Hw(HwBreakpointData {
                    perm,
                    size,
                    proc_wide,
                    owning_lwp: if proc_wide { None } else { Some(lwp) },
                    error: false,
                }),
            },
        );
        Ok(id)
    }

    pub fn uninstall_hw(&mut self, addr: Address, bp: BreakpointId) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&addr)
            .ok_or_else(|| Error::bad_address("no hw breakpoint instance at address"))?;
        inst.bps.retain(|&b| b != bp);
        self.logical.remove(bp);
        if inst.is_empty_of_logical_bps() {
            self.instances.remove(&addr);
        }
        Ok(())
    }

    // --- Emulated single step ---

    /// Compute successor addresses via the platform and install a
    /// one-shot breakpoint at each. On any hit, `clear_emulated_single_step`
    /// should be called to remove the whole set.
    pub fn start_emulated_single_step(
        &mut self,
        platform: &dyn PlatformOps,
        lwp: i32,
        user_single_step: bool,
        single_step: bool,
    ) -> Result<EmulatedSingleStep> {
        let addrs = platform.plat_emulated_single_step_targets(lwp)?;
        for &addr in &addrs {
            let bp = IntBreakpoint {
                one_time: true,
                ..IntBreakpoint::new()
            };
            self.prep(platform, lwp, addr)?;
            self.insert(platform, lwp, addr)?;
            self.add_to_int_breakpoint(bp, addr)?;
        }
        Ok(EmulatedSingleStep {
            saved_user_single_step: user_single_step,
            saved_single_step: single_step,
            addrs,
        })
    }

    /// Clear every one-shot breakpoint the emulated step installed,
    /// restoring the prior single-step mode (returned to the caller,
    /// which writes it back onto the thread).
    pub fn clear_emulated_single_step(
        &mut self,
        platform: &dyn PlatformOps,
        lwp: i32,
        es: &EmulatedSingleStep,
    ) -> Result<(bool, bool)> {
        for &addr in &es.addrs {
            if let Some(inst) = self.instances.get(&addr) {
                let bps = inst.bps.clone();
                for bp in bps {
                    self.uninstall(platform, lwp, addr, bp)?;
                }
            }
        }
        Ok((es.saved_user_single_step, es.saved_single_step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPlatform;

    #[test]
    fn install_then_uninstall_restores_original_bytes() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x1000, vec![0x90, 0x91, 0x92, 0x93]);
        let mut eng = BreakpointEngine::new();

        eng.prep(&platform, 1, 0x1000).unwrap();
        eng.insert(&platform, 1, 0x1000).unwrap();
        let id = eng
            .add_to_int_breakpoint(IntBreakpoint::new(), 0x1000)
            .unwrap();

        assert_ne!(platform.read_word(0x1000), vec![0x90, 0x91]);

        eng.uninstall(&platform, 1, 0x1000, id).unwrap();
        assert_eq!(&platform.read_word(0x1000)[..2], &[0x90, 0x91]);
    }

    #[test]
    fn installing_same_logical_bp_twice_is_idempotent() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x2000, vec![1, 2, 3, 4]);
        let mut eng = BreakpointEngine::new();
        eng.prep(&platform, 1, 0x2000).unwrap();
        eng.insert(&platform, 1, 0x2000).unwrap();
        let id = eng.add_to_int_breakpoint(IntBreakpoint::new(), 0x2000).unwrap();
        // Re-binding the *same* handle at the same address must not duplicate it.
        let inst = eng.instances.get_mut(&0x2000).unwrap();
        if !inst.bps.contains(&id) {
            inst.bps.push(id);
        }
        assert_eq!(eng.instance_at(0x2000).unwrap().bps.len(), 1);
    }

    #[test]
    fn reposting_at_an_installed_address_preserves_saved_bytes() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x2500, vec![11, 12, 13, 14]);
        let mut eng = BreakpointEngine::new();
        eng.prep(&platform, 1, 0x2500).unwrap();
        eng.insert(&platform, 1, 0x2500).unwrap();
        let first = eng.add_to_int_breakpoint(IntBreakpoint::new(), 0x2500).unwrap();

        // A second post_breakpoint-style call at the same address: prep
        // must not re-read the now-trapped target bytes into the saved
        // buffer.
        eng.prep(&platform, 1, 0x2500).unwrap();
        eng.insert(&platform, 1, 0x2500).unwrap();
        let second = eng.add_to_int_breakpoint(IntBreakpoint::new(), 0x2500).unwrap();
        assert_eq!(eng.instance_at(0x2500).unwrap().bps.len(), 2);

        eng.uninstall(&platform, 1, 0x2500, first).unwrap();
        eng.uninstall(&platform, 1, 0x2500, second).unwrap();
        assert_eq!(&platform.read_word(0x2500)[..4], &[11, 12, 13, 14]);
    }

    #[test]
    fn suspend_then_resume_is_a_noop_to_the_target() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x3000, vec![5, 6, 7, 8]);
        let mut eng = BreakpointEngine::new();
        eng.prep(&platform, 1, 0x3000).unwrap();
        eng.insert(&platform, 1, 0x3000).unwrap();
        eng.add_to_int_breakpoint(IntBreakpoint::new(), 0x3000).unwrap();
        let after_install = platform.read_word(0x3000);

        eng.suspend(&platform, 1, 0x3000).unwrap();
        eng.resume(&platform, 1, 0x3000).unwrap();

        assert_eq!(platform.read_word(0x3000), after_install);
    }

    #[test]
    fn one_time_breakpoint_removed_after_one_hit() {
        let platform = MockPlatform::new();
        platform.seed_memory(0x4000, vec![9, 9, 9, 9]);
        let mut eng = BreakpointEngine::new();
        eng.prep(&platform, 1, 0x4000).unwrap();
        eng.insert(&platform, 1, 0x4000).unwrap();
        let id = eng
            .add_to_int_breakpoint(
                IntBreakpoint {
                    one_time: true,
                    ..IntBreakpoint::new()
                },
                0x4000,
            )
            .unwrap();
        // Simulate a hit: mark it, then the hit-handler removes it.
        eng.get(id).unwrap();
        eng.uninstall(&platform, 1, 0x4000, id).unwrap();
        assert!(eng.instance_at(0x4000).is_none());
    }
}
