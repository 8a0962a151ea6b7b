//! Eleven global counters driving sync gates (spec §3, §4.9).
//!
//! Kept as a fixed-size array indexed by the enum discriminant, per
//! Design Notes §9 ("Make the counter table a fixed-size array indexed by
//! the enum"). Each counter has a local (per-thread or per-process) half
//! and a global half; the global half is guarded by its own lock so the
//! generator thread can poll it without touching the exclusion lock.

use std::sync::atomic::{AtomicI64, Ordering};

pub const NUM_COUNTER_TYPES: usize = 11;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum CounterType {
    HandlerRunningThreads = 0,
    GeneratorRunningThreads = 1,
    SyncRPCs = 2,
    SyncRPCRunningThreads = 3,
    PendingStops = 4,
    ClearingBPs = 5,
    ProcStopRPCs = 6,
    AsyncEvents = 7,
    ForceGeneratorBlock = 8,
    GeneratorNonExitedThreads = 9,
    StartupTeardownProcesses = 10,
}

impl CounterType {
    pub const ALL: [CounterType; NUM_COUNTER_TYPES] = [
        CounterType::HandlerRunningThreads,
        CounterType::GeneratorRunningThreads,
        CounterType::SyncRPCs,
        CounterType::SyncRPCRunningThreads,
        CounterType::PendingStops,
        CounterType::ClearingBPs,
        CounterType::ProcStopRPCs,
        CounterType::AsyncEvents,
        CounterType::ForceGeneratorBlock,
        CounterType::GeneratorNonExitedThreads,
        CounterType::StartupTeardownProcesses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CounterType::HandlerRunningThreads => "HandlerRunningThreads",
            CounterType::GeneratorRunningThreads => "GeneratorRunningThreads",
            CounterType::SyncRPCs => "SyncRPCs",
            CounterType::SyncRPCRunningThreads => "SyncRPCRunningThreads",
            CounterType::PendingStops => "PendingStops",
            CounterType::ClearingBPs => "ClearingBPs",
            CounterType::ProcStopRPCs => "ProcStopRPCs",
            CounterType::AsyncEvents => "AsyncEvents",
            CounterType::ForceGeneratorBlock => "ForceGeneratorBlock",
            CounterType::GeneratorNonExitedThreads => "GeneratorNonExitedThreads",
            CounterType::StartupTeardownProcesses => "StartupTeardownProcesses",
        }
    }
}

/// The 11-slot global table. One atomic per slot stands in for the
/// header's `static Mutex locks[NumCounterTypes]` + `static int
/// global_counts[NumCounterTypes]` pair: an `AtomicI64` gives the same
/// "lock-free polling from the generator" property without a real mutex.
pub struct GlobalCounters {
    counts: [AtomicI64; NUM_COUNTER_TYPES],
}

impl Default for GlobalCounters {
    fn default() -> Self {
        GlobalCounters {
            counts: Default::default(),
        }
    }
}

impl GlobalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_count(&self, ct: CounterType) -> i64 {
        self.counts[ct as usize].load(Ordering::SeqCst)
    }

    fn adjust(&self, ct: CounterType, delta: i64) -> i64 {
        self.counts[ct as usize].fetch_add(delta, Ordering::SeqCst) + delta
    }
}

/// A per-owner (thread or process) local counter paired with a reference
/// into the global table. `inc`/`dec` move both halves together.
pub struct Counter<'g> {
    ct: CounterType,
    local: i64,
    global: &'g GlobalCounters,
}

impl<'g> Counter<'g> {
    pub fn new(ct: CounterType, global: &'g GlobalCounters) -> Self {
        Counter {
            ct,
            local: 0,
            global,
        }
    }

    pub fn inc(&mut self) {
        self.local += 1;
        self.global.adjust(self.ct, 1);
        log::trace!(
            "counter {} inc -> local {} global {}",
            self.ct.name(),
            self.local,
            self.global.global_count(self.ct)
        );
    }

    pub fn dec(&mut self) {
        debug_assert!(self.local > 0, "counter {} underflow", self.ct.name());
        self.local -= 1;
        self.global.adjust(self.ct, -1);
        log::trace!(
            "counter {} dec -> local {} global {}",
            self.ct.name(),
            self.local,
            self.global.global_count(self.ct)
        );
    }

    pub fn local_count(&self) -> i64 {
        self.local
    }

    pub fn global_count(&self) -> i64 {
        self.global.global_count(self.ct)
    }

    pub fn counter_type(&self) -> CounterType {
        self.ct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_dec_tracks_local_and_global() {
        let g = GlobalCounters::new();
        let mut c1 = Counter::new(CounterType::PendingStops, &g);
        let mut c2 = Counter::new(CounterType::PendingStops, &g);
        c1.inc();
        c2.inc();
        c2.inc();
        assert_eq!(g.global_count(CounterType::PendingStops), 3);
        assert_eq!(c1.local_count() + c2.local_count(), 3);
        c1.dec();
        assert_eq!(g.global_count(CounterType::PendingStops), 2);
    }

    #[test]
    fn counters_are_independent_per_type() {
        let g = GlobalCounters::new();
        let mut async_events = Counter::new(CounterType::AsyncEvents, &g);
        async_events.inc();
        assert_eq!(g.global_count(CounterType::AsyncEvents), 1);
        assert_eq!(g.global_count(CounterType::PendingStops), 0);
    }
}
