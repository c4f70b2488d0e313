use super::Present;

/// Stable handle to a present in the [`Arena`].
///
/// Handles held by an index outlive the record they point to; a lookup
/// through a stale handle returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresentId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    value: Option<Present>,
}

/// Generation-checked slot arena owning every in-flight present.
#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, present: Present) -> PresentId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(present);
            return PresentId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(present),
        });

        PresentId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: PresentId) -> Option<&Present> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: PresentId) -> Option<&mut Present> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Take the present out, invalidating every outstanding handle to it.
    pub fn remove(&mut self, id: PresentId) -> Option<Present> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let value = slot.value.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        Some(value)
    }

    pub fn contains(&self, id: PresentId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::Runtime;

    fn present(t: u64) -> Present {
        Present::new(t, 1, 1, Runtime::Dxgi)
    }

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert(present(1));
        let b = arena.insert(present(2));

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a).map(|p| p.qpc_time), Some(1));
        assert_eq!(arena.get(b).map(|p| p.qpc_time), Some(2));

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.qpc_time, 1);
        assert_eq!(arena.len(), 1);
        assert!(!arena.contains(a));
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(present(1));
        arena.remove(a);

        let c = arena.insert(present(3));
        assert_ne!(a, c);
        assert!(arena.get(a).is_none());
        assert!(arena.get_mut(a).is_none());
        assert_eq!(arena.get(c).map(|p| p.qpc_time), Some(3));
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut arena = Arena::new();
        let a = arena.insert(present(1));
        if let Some(p) = arena.get_mut(a) {
            p.screen_time = 9;
        }
        assert_eq!(arena.get(a).map(|p| p.screen_time), Some(9));
        assert!(!arena.is_empty());
    }
}
