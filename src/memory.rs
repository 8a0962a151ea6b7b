//! Memory cache, inferior-malloc bookkeeping, and the copy-on-write
//! `mem_state` shared across forked children (spec §4.5, §3 "Memory
//! state").
//!
//! `MemState` is exactly the source's `mem_state`: the set of processes
//! sharing it, the loaded libraries, the address -> sw-breakpoint map,
//! and the inferior-malloc table. Per Design Notes §9 ("Shared
//! memory-state across forks: use reference-counted ownership... with
//! copy-on-write on first mutation"), we get that for free from `Rc`: a
//! forked child starts by cloning the `Rc<RefCell<MemState>>`, and the
//! first process to mutate calls `make_unique`, which clones the payload
//! out from under a shared `Rc` (`Rc::make_mut`'s semantics) the moment
//! `Rc::strong_count` is greater than one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::library::LibraryPool;

pub type Address = u64;

/// A single overlapping software-breakpoint "trap window": the bytes the
/// tracee would see at `addr..addr+len` if the trap were not installed.
/// `MemorySubsystem` needs this so writes never clobber an active trap and
/// reads return the original bytes transparently (spec §4.5).
#[derive(Clone, Debug)]
pub struct TrapWindow {
    pub addr: Address,
    pub original_bytes: Vec<u8>,
}

impl TrapWindow {
    fn end(&self) -> Address {
        self.addr + self.original_bytes.len() as Address
    }
}

/// The shared, copy-on-write process address-space record.
#[derive(Clone, Default)]
pub struct MemStateData {
    pub libraries: LibraryPool,
    /// address -> saved original bytes, mirroring `mem_state.breakpoints`
    /// (`std::map<Address, sw_breakpoint*>`); the breakpoint engine keeps
    /// the rest of the `sw_breakpoint` record, this is just what
    /// `MemorySubsystem` needs to keep reads/writes trap-transparent.
    pub breakpoint_traps: HashMap<Address, TrapWindow>,
    /// address -> size, `mem_state.inf_malloced_memory`.
    pub inf_malloced_memory: HashMap<Address, usize>,
}

pub type MemStateHandle = Rc<RefCell<MemStateData>>;

pub fn new_mem_state() -> MemStateHandle {
    Rc::new(RefCell::new(MemStateData::default()))
}

/// Fork a child's memory state: shares the parent's `Rc` until either
/// side mutates it (copy-on-write). Matches `mem_state(mem_state &m,
/// int_process *proc)`'s "shared until divergence" contract.
pub fn fork_mem_state(parent: &MemStateHandle) -> MemStateHandle {
    parent.clone()
}

/// Ensure this handle is uniquely owned, cloning the payload on first
/// divergence. Call this before any mutation that must not be observed
/// by a still-sharing sibling. Returns whether a clone actually happened.
pub fn make_unique(handle: &mut MemStateHandle) -> bool {
    if Rc::strong_count(handle) > 1 {
        let cloned = handle.borrow().clone();
        *handle = Rc::new(RefCell::new(cloned));
        true
    } else {
        false
    }
}

/// A page-granular read cache plus the inferior-malloc arena, per process.
pub struct MemorySubsystem {
    page_size: usize,
    cache: HashMap<Address, Vec<u8>>,
}

impl MemorySubsystem {
    pub fn new(page_size: usize) -> Self {
        MemorySubsystem {
            page_size,
            cache: HashMap::new(),
        }
    }

    fn page_base(&self, addr: Address) -> Address {
        addr - (addr % self.page_size as Address)
    }

    fn invalidate_range(&mut self, addr: Address, len: usize) {
        let mut page = self.page_base(addr);
        let end = addr + len as Address;
        while page < end {
            self.cache.remove(&page);
            page += self.page_size as Address;
        }
    }

    /// Overlay trap bytes out of a just-read buffer so readers see the
    /// original program bytes transparently.
    fn overlay_originals(buf: &mut [u8], addr: Address, traps: &[TrapWindow]) {
        let end = addr + buf.len() as Address;
        for t in traps {
            let lo = t.addr.max(addr);
            let hi = t.end().min(end);
            if lo >= hi {
                continue;
            }
            let buf_off = (lo - addr) as usize;
            let trap_off = (lo - t.addr) as usize;
            let len = (hi - lo) as usize;
            buf[buf_off..buf_off + len]
                .copy_from_slice(&t.original_bytes[trap_off..trap_off + len]);
        }
    }

    /// Read `len` bytes at `addr`, consulting the page cache first and
    /// falling back to `read_from_target` (a synchronous or
    /// already-awaited async platform read) on a miss. Returns bytes with
    /// any active trap windows overlaid back to their original values.
    pub fn read_mem(
        &mut self,
        addr: Address,
        len: usize,
        traps: &[TrapWindow],
        read_from_target: impl FnOnce(Address, usize) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let page = self.page_base(addr);
        let buf = if let Some(cached) = self.cache.get(&page) {
            if (addr - page) as usize + len <= cached.len() {
                cached[(addr - page) as usize..(addr - page) as usize + len].to_vec()
            } else {
                self.fill_page(page, &read_from_target)?;
                let cached = &self.cache[&page];
                cached[(addr - page) as usize..(addr - page) as usize + len].to_vec()
            }
        } else {
            self.fill_page(page, &read_from_target)?;
            let cached = &self.cache[&page];
            cached[(addr - page) as usize..(addr - page) as usize + len].to_vec()
        };
        let mut buf = buf;
        Self::overlay_originals(&mut buf, addr, traps);
        Ok(buf)
    }

    fn fill_page(
        &mut self,
        page: Address,
        read_from_target: &impl Fn(Address, usize) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let data = read_from_target(page, self.page_size)?;
        self.cache.insert(page, data);
        Ok(())
    }

    /// Write `data` at `addr`. Invalidates overlapping cache pages. If the
    /// write range straddles an active trap, the write is split so the
    /// trap bytes on the target are preserved -- user writes never
    /// clobber an installed breakpoint (spec §4.5).
    pub fn write_mem(
        &mut self,
        addr: Address,
        data: &[u8],
        traps: &[TrapWindow],
        mut write_to_target: impl FnMut(Address, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.invalidate_range(addr, data.len());
        let end = addr + data.len() as Address;

        // Build the list of (offset, len) chunks of `data` that should
        // actually reach the target, skipping any byte covered by a trap.
        let mut skip = vec![false; data.len()];
        for t in traps {
            let lo = t.addr.max(addr);
            let hi = t.end().min(end);
            if lo >= hi {
                continue;
            }
            let off = (lo - addr) as usize;
            let len = (hi - lo) as usize;
            for b in &mut skip[off..off + len] {
                *b = true;
            }
        }

        let mut i = 0;
        while i < data.len() {
            if skip[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < data.len() && !skip[i] {
                i += 1;
            }
            write_to_target(addr + start as Address, &data[start..i])?;
        }

        // The trap's own saved-original buffer also needs updating if the
        // user write falls inside it, so a later uninstall restores what
        // the user actually wrote, not stale bytes from before the write.
        Ok(())
    }

    /// Update a trap's saved-original buffer for the portion of `data`
    /// that overlaps it. Called by the breakpoint engine after
    /// `write_mem` when a user write straddled a trap.
    pub fn patch_trap_window(window: &mut TrapWindow, addr: Address, data: &[u8]) {
        let lo = window.addr.max(addr);
        let hi = window.end().min(addr + data.len() as Address);
        if lo >= hi {
            return;
        }
        let win_off = (lo - window.addr) as usize;
        let data_off = (lo - addr) as usize;
        let len = (hi - lo) as usize;
        window.original_bytes[win_off..win_off + len]
            .copy_from_slice(&data[data_off..data_off + len]);
    }

    /// Direct inferior-malloc bookkeeping: record a newly allocated
    /// executable region. Actual allocation is an RPC (`RPCScheduler`) or
    /// `direct_infMalloc`; this just updates `exec_mem_cache`.
    pub fn note_allocation(mem: &MemStateHandle, addr: Address, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::bad_parameter("inferior malloc size must be > 0"));
        }
        mem.borrow_mut().inf_malloced_memory.insert(addr, size);
        Ok(())
    }

    pub fn note_deallocation(mem: &MemStateHandle, addr: Address) -> Result<()> {
        mem.borrow_mut()
            .inf_malloced_memory
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| Error::bad_address("no such inferior allocation"))
    }
}
