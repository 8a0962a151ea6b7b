//! The per-thread multi-layer state model (spec §4.1).
//!
//! Ported from `int_thread::State` / `int_thread::StateTracker` /
//! `StateID` constants in `int_process.h`. Sixteen state slots, strictly
//! ordered by priority (lowest id wins when resolving the effective
//! target). Fourteen are *target* slots any subsystem can assert a value
//! into; the last two (`Handler`, `Generator`) are *observation* slots
//! written only by the respective actor.

use std::fmt;

/// `int_thread::State`, unchanged cardinality and ordering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StateValue {
    None,
    Neonatal,
    NeonatalIntermediate,
    Running,
    Stopped,
    DontCare,
    /// "same as next-higher-priority slot" -- resolved away during
    /// reconciliation, never itself an effective target.
    Ditto,
    Exited,
    Detached,
    Error,
}

impl StateValue {
    /// Port of the source's `RUNNING_STATE(S)` macro.
    pub fn is_running(self) -> bool {
        matches!(self, StateValue::Running | StateValue::NeonatalIntermediate)
    }
}

/// `int_thread`'s sixteen `*StateID` constants, in priority order
/// (`AsyncStateID = 0 .. GeneratorStateID = 15`). `#[repr(usize)]` so the
/// discriminant doubles as the array index into `ThreadStateModel::slots`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum StateSlot {
    Async = 0,
    Callback = 1,
    PendingStop = 2,
    IRPC = 3,
    IRPCSetup = 4,
    IRPCWait = 5,
    Breakpoint = 6,
    Internal = 7,
    BreakpointResume = 8,
    Exiting = 9,
    Startup = 10,
    Detach = 11,
    UserRPC = 12,
    User = 13,
    Handler = 14,
    Generator = 15,
}

pub const NUM_STATE_SLOTS: usize = 16;
pub const NUM_TARGET_STATE_SLOTS: usize = NUM_STATE_SLOTS - 2;

impl StateSlot {
    pub const TARGET_SLOTS_IN_PRIORITY_ORDER: [StateSlot; NUM_TARGET_STATE_SLOTS] = [
        StateSlot::Async,
        StateSlot::Callback,
        StateSlot::PendingStop,
        StateSlot::IRPC,
        StateSlot::IRPCSetup,
        StateSlot::IRPCWait,
        StateSlot::Breakpoint,
        StateSlot::Internal,
        StateSlot::BreakpointResume,
        StateSlot::Exiting,
        StateSlot::Startup,
        StateSlot::Detach,
        StateSlot::UserRPC,
        StateSlot::User,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StateSlot::Async => "Async",
            StateSlot::Callback => "Callback",
            StateSlot::PendingStop => "PendingStop",
            StateSlot::IRPC => "IRPC",
            StateSlot::IRPCSetup => "IRPCSetup",
            StateSlot::IRPCWait => "IRPCWait",
            StateSlot::Breakpoint => "Breakpoint",
            StateSlot::Internal => "Internal",
            StateSlot::BreakpointResume => "BreakpointResume",
            StateSlot::Exiting => "Exiting",
            StateSlot::Startup => "Startup",
            StateSlot::Detach => "Detach",
            StateSlot::UserRPC => "UserRPC",
            StateSlot::User => "User",
            StateSlot::Handler => "Handler",
            StateSlot::Generator => "Generator",
        }
    }
}

impl fmt::Display for StateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One slot's current assertion. `synced` tracks whether the reconciler
/// has already made the thread match this layer's intent
/// (`setState`/`desyncState` in the source).
#[derive(Copy, Clone, Debug)]
struct Tracker {
    value: StateValue,
    synced: bool,
}

impl Default for Tracker {
    fn default() -> Self {
        Tracker {
            value: StateValue::None,
            synced: true,
        }
    }
}

/// The per-thread collection of all sixteen slots plus reconciliation.
pub struct ThreadStateModel {
    slots: [Tracker; NUM_STATE_SLOTS],
}

impl Default for ThreadStateModel {
    fn default() -> Self {
        ThreadStateModel {
            slots: [Tracker::default(); NUM_STATE_SLOTS],
        }
    }
}

impl ThreadStateModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: StateSlot) -> StateValue {
        self.slots[slot as usize].value
    }

    pub fn is_desynced(&self, slot: StateSlot) -> bool {
        !self.slots[slot as usize].synced
    }

    /// `setState`: assert a value and mark it already reflected.
    pub fn set_state(&mut self, slot: StateSlot, value: StateValue) {
        self.slots[slot as usize] = Tracker {
            value,
            synced: true,
        };
    }

    /// `desyncState`: assert a value that the reconciler still needs to
    /// act on.
    pub fn desync_state(&mut self, slot: StateSlot, value: StateValue) {
        self.slots[slot as usize] = Tracker {
            value,
            synced: false,
        };
    }

    /// `restoreState`: drop this layer's assertion.
    pub fn restore_state(&mut self, slot: StateSlot) {
        self.set_state(slot, StateValue::None);
    }

    /// The effective target: the value of the lowest-numbered target slot
    /// that isn't `None`/`DontCare`/`Ditto`. `Ditto` means "defer to the
    /// next slot", so it's skipped rather than resolved to `None`.
    pub fn effective_target(&self) -> StateValue {
        for slot in StateSlot::TARGET_SLOTS_IN_PRIORITY_ORDER {
            let v = self.get(slot);
            if !matches!(v, StateValue::None | StateValue::DontCare | StateValue::Ditto) {
                return v;
            }
        }
        StateValue::DontCare
    }

    /// Any target slot still awaiting reconciliation.
    pub fn has_pending_reconciliation(&self) -> bool {
        StateSlot::TARGET_SLOTS_IN_PRIORITY_ORDER
            .iter()
            .any(|&s| self.is_desynced(s))
    }

    /// Mark every desynced target slot as synced, i.e. the reconciler has
    /// acted on the effective target.
    pub fn mark_reconciled(&mut self) {
        for slot in StateSlot::TARGET_SLOTS_IN_PRIORITY_ORDER {
            self.slots[slot as usize].synced = true;
        }
    }

    // Handler/Generator are observation slots: written only by their
    // actor, never resolved as part of the effective target.
    pub fn set_handler_state(&mut self, value: StateValue) {
        self.set_state(StateSlot::Handler, value);
    }

    pub fn handler_state(&self) -> StateValue {
        self.get(StateSlot::Handler)
    }

    pub fn set_generator_state(&mut self, value: StateValue) {
        self.set_state(StateSlot::Generator, value);
    }

    pub fn generator_state(&self) -> StateValue {
        self.get(StateSlot::Generator)
    }

    pub fn internal_state(&self) -> StateValue {
        self.get(StateSlot::Internal)
    }

    /// The four-implication layered stop/run invariant from spec §3:
    /// `(Generator=running) => (Handler=running)`,
    /// `(Handler=running) => (Internal=running)`,
    /// `(Internal=stopped) => (Handler=stopped)`,
    /// `(Handler=stopped) => (Generator=stopped)`.
    pub fn layering_invariant_holds(&self) -> bool {
        let g = self.generator_state();
        let h = self.handler_state();
        let i = self.internal_state();

        let imp1 = g != StateValue::Running || h == StateValue::Running;
        let imp2 = h != StateValue::Running || i == StateValue::Running;
        let imp3 = i != StateValue::Stopped || h == StateValue::Stopped;
        let imp4 = h != StateValue::Stopped || g == StateValue::Stopped;
        imp1 && imp2 && imp3 && imp4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_effective_target_is_dontcare() {
        let m = ThreadStateModel::new();
        assert_eq!(m.effective_target(), StateValue::DontCare);
    }

    #[test]
    fn lowest_priority_slot_wins() {
        let mut m = ThreadStateModel::new();
        m.desync_state(StateSlot::User, StateValue::Running);
        m.desync_state(StateSlot::Breakpoint, StateValue::Stopped);
        // Breakpoint (6) outranks User (13).
        assert_eq!(m.effective_target(), StateValue::Stopped);
    }

    #[test]
    fn ditto_defers_to_next_slot() {
        let mut m = ThreadStateModel::new();
        m.desync_state(StateSlot::Breakpoint, StateValue::Ditto);
        m.desync_state(StateSlot::Internal, StateValue::Running);
        assert_eq!(m.effective_target(), StateValue::Running);
    }

    #[test]
    fn restore_state_clears_the_slot() {
        let mut m = ThreadStateModel::new();
        m.set_state(StateSlot::User, StateValue::Running);
        m.restore_state(StateSlot::User);
        assert_eq!(m.get(StateSlot::User), StateValue::None);
    }

    #[test]
    fn reconcile_clears_desync_flags() {
        let mut m = ThreadStateModel::new();
        m.desync_state(StateSlot::User, StateValue::Running);
        assert!(m.has_pending_reconciliation());
        m.mark_reconciled();
        assert!(!m.has_pending_reconciliation());
    }

    #[test]
    fn layering_invariant_rejects_generator_running_handler_stopped() {
        let mut m = ThreadStateModel::new();
        m.set_generator_state(StateValue::Running);
        m.set_handler_state(StateValue::Stopped);
        assert!(!m.layering_invariant_holds());
    }

    #[test]
    fn layering_invariant_holds_when_fully_stopped() {
        let mut m = ThreadStateModel::new();
        m.set_generator_state(StateValue::Stopped);
        m.set_handler_state(StateValue::Stopped);
        m.set_state(StateSlot::Internal, StateValue::Stopped);
        assert!(m.layering_invariant_holds());
    }
}
