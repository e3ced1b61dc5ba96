//! Pool registry.
//!
//! Pools live in a slab of generation-tagged slots. The registry also keeps
//! creation order for enumeration and a counter bumped on every insertion or
//! removal, so that inspection tools can notice the list changed under them.

use crate::handle::PoolRef;
use crate::macros::fatal;

/// Something the registry can look up by name
pub(crate) trait Named {
    fn name(&self) -> &str;
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    order: Vec<u32>,
    vacant: Vec<u32>,
    change_count: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            order: Vec::new(),
            vacant: Vec::new(),
            change_count: 0,
        }
    }
}

impl<T: Named> Registry<T> {
    pub(crate) fn insert(&mut self, entry: T) -> PoolRef {
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .unwrap_or_else(|_| fatal!("pool registry overflow"));
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                index
            }
        };
        self.order.push(index);
        self.change_count += 1;
        PoolRef::new(index, self.slots[index as usize].generation)
    }

    /// Remove a pool, invalidating every handle to it.
    pub(crate) fn remove(&mut self, pool: PoolRef) -> T {
        self.check(pool);
        let slot = &mut self.slots[pool.index as usize];
        let Some(entry) = slot.entry.take() else {
            fatal!("stale pool handle {pool}");
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.order.retain(|&index| index != pool.index);
        self.vacant.push(pool.index);
        self.change_count += 1;
        entry
    }

    fn check(&self, pool: PoolRef) {
        let live = self
            .slots
            .get(pool.index as usize)
            .is_some_and(|slot| slot.generation == pool.generation && slot.entry.is_some());
        if !live {
            fatal!("stale pool handle {pool}");
        }
    }

    pub(crate) fn get(&self, pool: PoolRef) -> &T {
        self.check(pool);
        match &self.slots[pool.index as usize].entry {
            Some(entry) => entry,
            None => fatal!("stale pool handle {pool}"),
        }
    }

    pub(crate) fn get_mut(&mut self, pool: PoolRef) -> &mut T {
        self.check(pool);
        match &mut self.slots[pool.index as usize].entry {
            Some(entry) => entry,
            None => fatal!("stale pool handle {pool}"),
        }
    }

    /// Handle of the live pool in slot `index`, as stamped into block headers.
    pub(crate) fn handle_at(&self, index: usize) -> Option<PoolRef> {
        let slot = self.slots.get(index)?;
        slot.entry.as_ref()?;
        Some(PoolRef::new(index as u32, slot.generation))
    }

    /// First pool, in creation order, with the given name.
    pub(crate) fn find(&self, name: &str) -> Option<PoolRef> {
        self.iter()
            .find(|(_, entry)| entry.name() == name)
            .map(|(pool, _)| pool)
    }

    /// Live pools in creation order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (PoolRef, &T)> + '_ {
        self.order.iter().filter_map(|&index| {
            let slot = &self.slots[index as usize];
            slot.entry
                .as_ref()
                .map(|entry| (PoolRef::new(index, slot.generation), entry))
        })
    }

    /// Handles of all live pools in creation order.
    pub(crate) fn handles(&self) -> Vec<PoolRef> {
        self.iter().map(|(pool, _)| pool).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn change_count(&self) -> usize {
        self.change_count
    }
}
