//! In-memory `PlatformOps` stand-in used only by unit tests across the
//! crate. Real backends live outside this crate; this one exists purely
//! so the engine's own logic can be exercised without a live tracee.

#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::library::LibraryInfo;
use crate::platform::{HwPerm, PlatformOps, RawEvent, ResumeRequest};
use crate::registers::{RegisterId, Registers};

pub struct MockPlatform {
    mem: RefCell<HashMap<u64, Vec<u8>>>,
    regs: RefCell<HashMap<i32, Registers>>,
    lwps: RefCell<Vec<i32>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            mem: RefCell::new(HashMap::new()),
            regs: RefCell::new(HashMap::new()),
            lwps: RefCell::new(Vec::new()),
        }
    }

    pub fn seed_memory(&self, addr: u64, bytes: Vec<u8>) {
        self.mem.borrow_mut().insert(addr, bytes);
    }

    /// The LWPs `plat_get_os_running_states` reports, for exercising the
    /// initial-thread registration path without a live tracee.
    pub fn seed_threads(&self, lwps: Vec<i32>) {
        *self.lwps.borrow_mut() = lwps;
    }

    /// Reads back whatever 4 bytes currently sit at `addr`, assembled
    /// from the flat per-address byte map the mock writes into.
    pub fn read_word(&self, addr: u64) -> Vec<u8> {
        let mem = self.mem.borrow();
        (0..4).map(|i| Self::byte_at(&mem, addr + i)).collect()
    }

    fn byte_at(mem: &HashMap<u64, Vec<u8>>, addr: u64) -> u8 {
        for (base, bytes) in mem.iter() {
            if addr >= *base && addr < base + bytes.len() as u64 {
                return bytes[(addr - base) as usize];
            }
        }
        0
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformOps for MockPlatform {
    fn plat_create(&self, _path: &str, _argv: &[String]) -> Result<i32> {
        Ok(1)
    }
    fn plat_attach(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
    fn plat_detach(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
    fn plat_terminate(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
    fn plat_forked(&self, _parent_pid: i32) -> Result<i32> {
        Ok(2)
    }
    fn plat_execed(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
    fn plat_sync_run_state(&self, _pid: i32) -> Result<()> {
        Ok(())
    }

    fn plat_cont(&self, _lwp: i32, _how: ResumeRequest, _signal: Option<i32>) -> Result<()> {
        Ok(())
    }
    fn plat_stop(&self, _lwp: i32) -> Result<()> {
        Ok(())
    }
    fn plat_get_all_registers(&self, lwp: i32) -> Result<Registers> {
        Ok(self.regs.borrow().get(&lwp).cloned().unwrap_or_default())
    }
    fn plat_set_all_registers(&self, lwp: i32, regs: &Registers) -> Result<()> {
        self.regs.borrow_mut().insert(lwp, regs.clone());
        Ok(())
    }
    fn plat_get_register(&self, lwp: i32, reg: RegisterId) -> Result<u64> {
        Ok(self
            .regs
            .borrow()
            .get(&lwp)
            .and_then(|r| r.get(reg))
            .unwrap_or(0))
    }
    fn plat_set_register(&self, lwp: i32, reg: RegisterId, value: u64) -> Result<()> {
        self.regs.borrow_mut().entry(lwp).or_default().set(reg, value);
        Ok(())
    }

    fn plat_read_mem(&self, _lwp: i32, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mem = self.mem.borrow();
        Ok((0..len as u64).map(|i| Self::byte_at(&mem, addr + i)).collect())
    }
    fn plat_write_mem(&self, _lwp: i32, addr: u64, data: &[u8]) -> Result<()> {
        self.mem.borrow_mut().insert(addr, data.to_vec());
        Ok(())
    }

    fn plat_breakpoint_size(&self) -> usize {
        1
    }
    fn plat_breakpoint_bytes(&self) -> Vec<u8> {
        vec![0xCC]
    }
    fn plat_breakpoint_advances_pc(&self) -> bool {
        true
    }

    fn plat_create_allocation_snippet(&self, _addr_hint: u64, _size: usize) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
    fn plat_create_deallocation_snippet(&self, _addr: u64, _size: usize) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
    fn plat_malloc_exec_memory(&self, _pid: i32, min: u64, _size: usize) -> Result<u64> {
        Ok(min)
    }

    fn plat_get_os_running_states(&self, _pid: i32) -> Result<Vec<(i32, bool)>> {
        Ok(self.lwps.borrow().iter().map(|&lwp| (lwp, false)).collect())
    }
    fn plat_is_static_binary(&self, _pid: i32) -> bool {
        false
    }
    fn plat_get_executable(&self, _pid: i32) -> Result<String> {
        Ok("mock-executable".to_string())
    }
    fn plat_get_stack_info(&self, _lwp: i32) -> Result<(u64, u64)> {
        Ok((0, 0))
    }

    fn plat_wait_and_handle_for_proc(&self, _pid: i32, _block: bool) -> Result<Option<RawEvent>> {
        Ok(None)
    }
    fn refresh_libraries(&self, _pid: i32) -> Result<Vec<LibraryInfo>> {
        Ok(Vec::new())
    }
}

/// A platform whose every call fails, for exercising error propagation
/// paths (e.g. `plat_hw_bp_avail` denial, unsupported emulated step).
pub struct UnsupportedPlatform;

impl PlatformOps for UnsupportedPlatform {
    fn plat_create(&self, _path: &str, _argv: &[String]) -> Result<i32> {
        Err(Error::unsupported_platform_op("create not supported"))
    }
    fn plat_attach(&self, _pid: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("attach not supported"))
    }
    fn plat_detach(&self, _pid: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("detach not supported"))
    }
    fn plat_terminate(&self, _pid: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("terminate not supported"))
    }
    fn plat_forked(&self, _parent_pid: i32) -> Result<i32> {
        Err(Error::unsupported_platform_op("fork not supported"))
    }
    fn plat_execed(&self, _pid: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("exec not supported"))
    }
    fn plat_sync_run_state(&self, _pid: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("sync not supported"))
    }
    fn plat_cont(&self, _lwp: i32, _how: ResumeRequest, _signal: Option<i32>) -> Result<()> {
        Err(Error::unsupported_platform_op("cont not supported"))
    }
    fn plat_stop(&self, _lwp: i32) -> Result<()> {
        Err(Error::unsupported_platform_op("stop not supported"))
    }
    fn plat_get_all_registers(&self, _lwp: i32) -> Result<Registers> {
        Err(Error::unsupported_platform_op("registers not supported"))
    }
    fn plat_set_all_registers(&self, _lwp: i32, _regs: &Registers) -> Result<()> {
        Err(Error::unsupported_platform_op("registers not supported"))
    }
    fn plat_get_register(&self, _lwp: i32, _reg: RegisterId) -> Result<u64> {
        Err(Error::unsupported_platform_op("register not supported"))
    }
    fn plat_set_register(&self, _lwp: i32, _reg: RegisterId, _value: u64) -> Result<()> {
        Err(Error::unsupported_platform_op("register not supported"))
    }
    fn plat_read_mem(&self, _lwp: i32, _addr: u64, _len: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported_platform_op("mem read not supported"))
    }
    fn plat_write_mem(&self, _lwp: i32, _addr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::unsupported_platform_op("mem write not supported"))
    }
    fn plat_breakpoint_size(&self) -> usize {
        0
    }
    fn plat_breakpoint_bytes(&self) -> Vec<u8> {
        Vec::new()
    }
    fn plat_breakpoint_advances_pc(&self) -> bool {
        false
    }
    fn plat_hw_bp_avail(&self, _lwp: i32, _perm: HwPerm, _size: u32) -> bool {
        false
    }
    fn plat_create_allocation_snippet(&self, _addr_hint: u64, _size: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported_platform_op("snippets not supported"))
    }
    fn plat_create_deallocation_snippet(&self, _addr: u64, _size: usize) -> Result<Vec<u8>> {
        Err(Error::unsupported_platform_op("snippets not supported"))
    }
    fn plat_malloc_exec_memory(&self, _pid: i32, _min: u64, _size: usize) -> Result<u64> {
        Err(Error::unsupported_platform_op("inferior malloc not supported"))
    }
    fn plat_get_os_running_states(&self, _pid: i32) -> Result<Vec<(i32, bool)>> {
        Err(Error::unsupported_platform_op("introspection not supported"))
    }
    fn plat_is_static_binary(&self, _pid: i32) -> bool {
        false
    }
    fn plat_get_executable(&self, _pid: i32) -> Result<String> {
        Err(Error::unsupported_platform_op("introspection not supported"))
    }
    fn plat_get_stack_info(&self, _lwp: i32) -> Result<(u64, u64)> {
        Err(Error::unsupported_platform_op("introspection not supported"))
    }
    fn plat_wait_and_handle_for_proc(&self, _pid: i32, _block: bool) -> Result<Option<RawEvent>> {
        Err(Error::unsupported_platform_op("events not supported"))
    }
    fn refresh_libraries(&self, _pid: i32) -> Result<Vec<LibraryInfo>> {
        Err(Error::unsupported_platform_op("library refresh not supported"))
    }
}
