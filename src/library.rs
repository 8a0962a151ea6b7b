//! Dynamically loaded library tracking (spec §4.6, §3 "Library record").
//!
//! Grounded on `int_library` / the header's mark-for-reaping discipline:
//! `refresh` diffs the platform's current table against `mem_state.libs`,
//! marks removed libraries instead of dropping them immediately, and a
//! later sweep reaps anything still marked.

use std::collections::HashMap;

/// What a `PlatformOps` backend reports for one loaded library.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryInfo {
    pub name: String,
    pub load_address: u64,
    pub dynamic_address: u64,
    pub data_load_address: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct LibraryRecord {
    pub name: String,
    pub load_address: u64,
    pub data_load_address: Option<u64>,
    pub dynamic_address: u64,
    /// Marked for reaping: a refresh observed it vanish from the
    /// platform's table but a sweep hasn't collected it yet.
    pub marked: bool,
}

impl LibraryRecord {
    fn key(&self) -> (String, u64) {
        (self.name.clone(), self.load_address)
    }
}

impl From<LibraryInfo> for LibraryRecord {
    fn from(info: LibraryInfo) -> Self {
        LibraryRecord {
            name: info.name,
            load_address: info.load_address,
            data_load_address: info.data_load_address,
            dynamic_address: info.dynamic_address,
            marked: false,
        }
    }
}

#[derive(Default)]
pub struct LibraryPool {
    libs: HashMap<(String, u64), LibraryRecord>,
    tracking_enabled: bool,
}

#[derive(Debug, Default)]
pub struct RefreshDiff {
    pub added: Vec<LibraryRecord>,
    pub removed: Vec<LibraryRecord>,
}

impl LibraryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking_enabled
    }

    pub fn set_tracking(&mut self, enabled: bool) {
        self.tracking_enabled = enabled;
    }

    pub fn len(&self) -> usize {
        self.libs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&LibraryRecord> {
        self.libs.values().find(|l| l.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LibraryRecord> {
        self.libs.values()
    }

    /// Compare the platform-supplied table against what we know, by
    /// `(name, load_address)`, exactly as `int_process::refresh_libraries`
    /// documents. Added libraries are inserted immediately; removed ones
    /// are marked, not dropped -- `sweep_marked` does the actual removal.
    pub fn diff_and_apply(&mut self, current: Vec<LibraryInfo>) -> RefreshDiff {
        let mut seen: std::collections::HashSet<(String, u64)> =
            std::collections::HashSet::with_capacity(current.len());
        let mut diff = RefreshDiff::default();

        for info in current {
            let key = (info.name.clone(), info.load_address);
            seen.insert(key.clone());
            if !self.libs.contains_key(&key) {
                let rec: LibraryRecord = info.into();
                diff.added.push(rec.clone());
                self.libs.insert(key, rec);
            }
        }

        let mut to_mark = Vec::new();
        for (key, rec) in self.libs.iter() {
            if !seen.contains(key) && !rec.marked {
                to_mark.push(key.clone());
            }
        }
        for key in to_mark {
            if let Some(rec) = self.libs.get_mut(&key) {
                rec.marked = true;
                diff.removed.push(rec.clone());
            }
        }
        diff
    }

    /// Reap everything still marked after a refresh diff was consumed.
    pub fn sweep_marked(&mut self) {
        self.libs.retain(|_, rec| !rec.marked);
    }

    fn remove(&mut self, rec: &LibraryRecord) {
        self.libs.remove(&rec.key());
    }
}

/// Event raised when a refresh completes, unless suppressed (spec §4.6
/// step 4: "Raise library-event callbacks if not suppressed").
#[derive(Debug)]
pub enum LibraryEvent {
    Added(LibraryRecord),
    Removed(LibraryRecord),
    RefreshFailed(String),
}

/// Runs the four-step refresh algorithm from spec §4.6 against whatever
/// table the platform handed back, producing the events to raise.
pub struct LibraryTracker {
    suppress_callbacks: bool,
}

impl Default for LibraryTracker {
    fn default() -> Self {
        LibraryTracker {
            suppress_callbacks: false,
        }
    }
}

impl LibraryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_suppress_callbacks(&mut self, b: bool) {
        self.suppress_callbacks = b;
    }

    /// Step 1-4 of spec §4.6. `refresh_result` is `Err` when the platform
    /// call itself failed (plat_* refresh), in which case the prior
    /// library set is left intact and a single `RefreshFailed` event is
    /// raised (spec §7: "Errors during library refresh leave the prior
    /// library set intact and raise a refresh-failed event").
    pub fn refresh(
        &mut self,
        pool: &mut LibraryPool,
        refresh_result: Result<Vec<LibraryInfo>, crate::error::Error>,
    ) -> Vec<LibraryEvent> {
        let current = match refresh_result {
            Ok(libs) => libs,
            Err(e) => {
                log::warn!("library refresh failed, keeping prior set: {}", e);
                return vec![LibraryEvent::RefreshFailed(e.message)];
            }
        };

        let diff = pool.diff_and_apply(current);
        for removed in &diff.removed {
            pool.remove(removed);
        }

        if self.suppress_callbacks {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(diff.added.len() + diff.removed.len());
        for lib in diff.added {
            log::debug!("library added: {} @ {:#x}", lib.name, lib.load_address);
            events.push(LibraryEvent::Added(lib));
        }
        for lib in diff.removed {
            log::debug!("library removed: {} @ {:#x}", lib.name, lib.load_address);
            events.push(LibraryEvent::Removed(lib));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, addr: u64) -> LibraryInfo {
        LibraryInfo {
            name: name.to_string(),
            load_address: addr,
            dynamic_address: addr + 0x1000,
            data_load_address: None,
        }
    }

    #[test]
    fn first_refresh_adds_all_libraries() {
        let mut pool = LibraryPool::new();
        let mut tracker = LibraryTracker::new();
        let events = tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LibraryEvent::Added(l) if l.name == "libfoo.so"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn second_refresh_with_same_set_produces_no_events() {
        let mut pool = LibraryPool::new();
        let mut tracker = LibraryTracker::new();
        tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        let events = tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        assert!(events.is_empty());
    }

    #[test]
    fn library_dlclose_is_detected_as_removed() {
        let mut pool = LibraryPool::new();
        let mut tracker = LibraryTracker::new();
        tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        let events = tracker.refresh(&mut pool, Ok(vec![]));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LibraryEvent::Removed(l) if l.name == "libfoo.so"));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn failed_refresh_keeps_prior_set_and_raises_refresh_failed() {
        let mut pool = LibraryPool::new();
        let mut tracker = LibraryTracker::new();
        tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        let events = tracker.refresh(
            &mut pool,
            Err(crate::error::Error::io_failure("proc maps unreadable")),
        );
        assert_eq!(pool.len(), 1, "prior set must survive a failed refresh");
        assert!(matches!(events[0], LibraryEvent::RefreshFailed(_)));
    }

    #[test]
    fn suppressed_callbacks_still_mutate_pool_but_emit_nothing() {
        let mut pool = LibraryPool::new();
        let mut tracker = LibraryTracker::new();
        tracker.set_suppress_callbacks(true);
        let events = tracker.refresh(&mut pool, Ok(vec![info("libfoo.so", 0x1000)]));
        assert!(events.is_empty());
        assert_eq!(pool.len(), 1);
    }
}
