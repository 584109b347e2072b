//! Generational slot arena.
//!
//! Slots are recycled through an embedded free list. Every removal bumps the slot's generation, so
//! an id that outlives its value never resolves to whatever is stored in the slot later.
use std::fmt;

const NIL: u32 = u32::MAX;

/// Index plus generation of an arena slot
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// An id that never resolves
    pub const INVALID: Self = Self {
        index: NIL,
        generation: 0,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_invalid(&self) -> bool {
        self.index == NIL
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            f.write_str("SlotId(INVALID)")
        } else {
            write!(f, "SlotId({}v{})", self.index, self.generation)
        }
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next_free: u32 },
}

pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free_list_head: u32,
    len: usize,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list_head: NIL,
            len: 0,
        }
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever created, live or free
    pub fn reserved_len(&self) -> usize {
        self.slots.len()
    }

    /// Index the next `insert` will use
    pub fn next_index(&self) -> u32 {
        if self.free_list_head != NIL {
            self.free_list_head
        } else {
            self.slots.len() as u32
        }
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;

        if self.free_list_head == NIL {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                generation: 0,
                value,
            });
            return SlotId {
                index,
                generation: 0,
            };
        }

        let index = self.free_list_head;
        let slot = &mut self.slots[index as usize];
        let (generation, next_free) = match *slot {
            Slot::Free {
                generation,
                next_free,
            } => (generation, next_free),
            Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
        };
        *slot = Slot::Occupied { generation, value };
        self.free_list_head = next_free;

        SlotId { index, generation }
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// The live id stored at `index`, if the slot is occupied
    pub fn id_at(&self, index: u32) -> Option<SlotId> {
        match self.slots.get(index as usize)? {
            Slot::Occupied { generation, .. } => Some(SlotId {
                index,
                generation: *generation,
            }),
            Slot::Free { .. } => None,
        }
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let next = Slot::Free {
            generation: id.generation.wrapping_add(1),
            next_free: self.free_list_head,
        };
        let value = match std::mem::replace(slot, next) {
            Slot::Occupied { value, .. } => value,
            Slot::Free { .. } => unreachable!(),
        };
        self.free_list_head = id.index;
        self.len -= 1;

        Some(value)
    }

    /// Ids of all live values, in slot order
    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Remove every live value, bumping generations as `remove` does
    pub fn drain(&mut self) -> Vec<T> {
        let ids = self.ids();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    SlotId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Free { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    SlotId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Free { .. } => None,
            })
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.iter().map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_id_does_not_resolve_after_reuse() {
        let mut arena = SlotArena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        assert!(arena.get(a).is_none());

        let b = arena.insert("b");
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn free_slots_are_reused_before_growing() {
        let mut arena = SlotArena::new();
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();
        arena.remove(ids[1]);
        arena.remove(ids[3]);

        assert_eq!(arena.next_index(), 3);
        assert_eq!(arena.insert(10).index(), 3);
        assert_eq!(arena.insert(11).index(), 1);
        assert_eq!(arena.insert(12).index(), 4);
        assert_eq!(arena.reserved_len(), 5);
    }

    #[test]
    fn drain_invalidates_everything() {
        let mut arena = SlotArena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let mut drained = arena.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
        assert!(!arena.contains(b));
        assert!(arena.id_at(a.index()).is_none());
    }

    #[test]
    fn invalid_id_never_resolves() {
        let mut arena = SlotArena::new();
        arena.insert(());
        assert!(arena.get(SlotId::INVALID).is_none());
        assert!(SlotId::INVALID.is_invalid());
    }
}
