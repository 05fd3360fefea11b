//! Generational arena holding the native objects handles point at.
//!
//! A [`ResourceId`] is an `(index, generation)` pair. Every slot carries a
//! claim count: handles and the operation cache each hold claims, and the
//! stored value is handed back to the caller when the last claim goes, so it
//! can be dropped outside whatever lock guards the table. Freeing a slot bumps
//! its generation, so an identity never aliases whatever reuses the slot.

use std::fmt;

/// Identity token of one native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

impl ResourceId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.index.to_le_bytes());
        out[4..].copy_from_slice(&self.generation.to_le_bytes());
        out
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    claims: u32,
    value: Option<T>,
}

pub(crate) struct ResourceTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> ResourceTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value with one claim on it.
    pub fn insert(&mut self, value: T) -> ResourceId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.claims = 1;
            slot.value = Some(value);
            return ResourceId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            claims: 1,
            value: Some(value),
        });
        ResourceId {
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: ResourceId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.value.is_some())
    }

    fn slot_mut(&mut self, id: ResourceId) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.value.is_some())
    }

    pub fn get(&self, id: ResourceId) -> Option<&T> {
        self.slot(id).and_then(|s| s.value.as_ref())
    }

    #[cfg(test)]
    pub fn contains(&self, id: ResourceId) -> bool {
        self.slot(id).is_some()
    }

    pub fn claims(&self, id: ResourceId) -> u32 {
        self.slot(id).map_or(0, |s| s.claims)
    }

    /// Add a claim. Returns `false` if the identity is stale.
    pub fn retain(&mut self, id: ResourceId) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.claims += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a claim, returning the value when it was the last one.
    pub fn release(&mut self, id: ResourceId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        slot.claims -= 1;
        if slot.claims > 0 {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        value
    }

    /// Number of objects with at least one claim.
    pub fn len(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Remove every value regardless of claims.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.claims = 0;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.live = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut table = ResourceTable::new();
        let id = table.insert("a");
        assert_eq!(table.get(id), Some(&"a"));
        assert_eq!(table.claims(id), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn last_release_returns_value() {
        let mut table = ResourceTable::new();
        let id = table.insert("a");
        assert!(table.retain(id));
        assert_eq!(table.release(id), None);
        assert_eq!(table.release(id), Some("a"));
        assert!(table.is_empty());
        assert!(!table.contains(id));
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut table = ResourceTable::new();
        let old = table.insert("a");
        table.release(old);
        let new = table.insert("b");

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(table.get(old), None);
        assert_eq!(table.get(new), Some(&"b"));
    }

    #[test]
    fn stale_id_cannot_be_retained_or_released() {
        let mut table = ResourceTable::new();
        let old = table.insert("a");
        table.release(old);
        let new = table.insert("b");

        assert!(!table.retain(old));
        assert_eq!(table.release(old), None);
        assert_eq!(table.claims(new), 1);
    }

    #[test]
    fn drain_empties_table() {
        let mut table = ResourceTable::new();
        let a = table.insert(1);
        table.insert(2);
        table.retain(a);

        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.is_empty());
        assert!(!table.contains(a));
    }

    #[test]
    fn resource_id_display() {
        let mut table = ResourceTable::new();
        let id = table.insert(());
        assert_eq!(id.to_string(), "#0v0");
    }
}
