//! Generation-checked arenas and typed handles.
//!
//! Process/Thread/Breakpoint/MemState cycles are the hardest part of a
//! direct port: int_process <-> int_thread <-> bp_instance <-> mem_state
//! all point at each other. Rather than reproduce that with `Rc`/`Weak`
//! cycles (which is what the teacher crate does for `ThreadGroup`, and
//! which needs a manual `Drop` to break), we address everything through a
//! small integer handle into an arena, per the REDESIGN FLAGS in spec §9.
//! A stale handle (arena slot recycled since the handle was taken) is
//! detected via a generation counter instead of being a use-after-free.

use std::marker::PhantomData;

#[derive(Debug)]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

// Manual impls: `#[derive(Clone, Copy, Eq, ...)]` would require `T: Clone`
// etc, which we don't want to force on every handle's payload type.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// A slab arena addressed by `Handle<T>`. Slots are reused on removal;
/// the generation counter is what lets a stale `Handle` be rejected
/// instead of silently aliasing a new occupant of the same slot.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        match self.free_head {
            Some(idx) => {
                let generation = match &self.slots[idx as usize] {
                    Slot::Vacant { generation, .. } => *generation,
                    Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot"),
                };
                let next_free = match &self.slots[idx as usize] {
                    Slot::Vacant { next_free, .. } => *next_free,
                    Slot::Occupied { .. } => unreachable!(),
                };
                self.free_head = next_free;
                self.slots[idx as usize] = Slot::Occupied { value, generation };
                self.len += 1;
                Handle::new(idx, generation)
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    value,
                    generation: 0,
                });
                self.len += 1;
                Handle::new(idx, 0)
            }
        }
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next_gen = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_gen,
                    },
                );
                self.free_head = Some(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { value, generation } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { value, generation } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Sweep every occupied slot whose handle is accepted by `keep`,
    /// removing the rest. Used for "collection of terminated processes is
    /// a sweep over the arena" (spec §9 Design Notes).
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for idx in 0..self.slots.len() {
            let should_remove = match &self.slots[idx] {
                Slot::Occupied { value, .. } => !keep(value),
                Slot::Vacant { .. } => false,
            };
            if should_remove {
                let generation = match &self.slots[idx] {
                    Slot::Occupied { generation, .. } => *generation,
                    Slot::Vacant { .. } => unreachable!(),
                };
                self.slots[idx] = Slot::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                self.free_head = Some(idx as u32);
                self.len -= 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { value, generation } => {
                Some((Handle::new(i as u32, *generation), value))
            }
            Slot::Vacant { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Occupied { value, generation } => {
                    Some((Handle::new(i as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}
