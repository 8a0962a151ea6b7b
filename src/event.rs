//! The decoded, handler-facing event stream (spec §4.8 handler
//! decode/dispatch; §6 "register_callback").
//!
//! `RawEvent` (platform.rs) is what the generator observes; `Event` is
//! what the handler produces after it's resolved which thread/process
//! it belongs to and what internal bookkeeping (breakpoint hit, RPC
//! completion, library change) it implies. This is the type user
//! callbacks actually see.

use crate::breakpoint::BreakpointId;
use crate::library::LibraryEvent;
use crate::process::ProcessId;
use crate::thread::ThreadId;

#[derive(Clone, Debug)]
pub enum Event {
    ThreadStopped { process: ProcessId, thread: ThreadId },
    ThreadRunning { process: ProcessId, thread: ThreadId },
    ThreadCreated { process: ProcessId, thread: ThreadId },
    ThreadExited { process: ProcessId, thread: ThreadId },
    ProcessExited { process: ProcessId, code: i32 },
    ProcessSignaled { process: ProcessId, signal: i32 },
    Forked { parent: ProcessId, child: ProcessId },
    Execed { process: ProcessId },
    BreakpointHit { process: ProcessId, thread: ThreadId, breakpoint: BreakpointId },
    RpcCompleted { process: ProcessId, thread: ThreadId, rpc_id: u64 },
    LibraryChanged { process: ProcessId, change: LibraryChange },
}

#[derive(Clone, Debug)]
pub enum LibraryChange {
    Added(String),
    Removed(String),
    RefreshFailed(String),
}

impl From<LibraryEvent> for LibraryChange {
    fn from(e: LibraryEvent) -> Self {
        match e {
            LibraryEvent::Added(rec) => LibraryChange::Added(rec.name),
            LibraryEvent::Removed(rec) => LibraryChange::Removed(rec.name),
            LibraryEvent::RefreshFailed(msg) => LibraryChange::RefreshFailed(msg),
        }
    }
}
