use std::hash::Hash;
use std::marker::PhantomData;

/// Generational index into a [`Pool`].
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn new(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Copy for Handle<T> {}

/// Slot storage handing out [`Handle`]s. A slot's generation is bumped on
/// release, so stale handles stop resolving.
pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        const INITIAL_SIZE: usize = 64;
        return Pool::new(INITIAL_SIZE);
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![0; initial_size],
        };

        p.empty = (0..initial_size).rev().collect();
        p.items.resize_with(initial_size, || None);

        return p;
    }

    /// Store `item`, growing the pool when every slot is taken. Returns
    /// `None` only once the 16-bit slot space is exhausted.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        if self.empty.is_empty() {
            self.grow()?;
        }
        let empty_slot = self.empty.pop()?;

        self.items[empty_slot] = Some(item);

        return Some(Handle::new(empty_slot as u16, self.generation[empty_slot]));
    }

    fn grow(&mut self) -> Option<()> {
        let old = self.items.len();
        let new = (old.max(1) * 2).min(u16::MAX as usize + 1);
        if new <= old {
            return None;
        }
        self.items.resize_with(new, || None);
        self.generation.resize(new, 0);
        self.empty.extend((old..new).rev());
        Some(())
    }

    /// Remove and return the item behind `item`. Stale handles return `None`
    /// and leave the pool untouched.
    pub fn release(&mut self, item: Handle<T>) -> Option<T> {
        let slot = item.slot as usize;
        if slot >= self.items.len() || self.generation[slot] != item.generation {
            return None;
        }
        let value = self.items[slot].take()?;
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        Some(value)
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        let slot = item.slot as usize;
        if slot < self.items.len() && self.generation[slot] == item.generation {
            return self.items[slot].as_ref();
        }
        None
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        let slot = item.slot as usize;
        if slot < self.items.len() && self.generation[slot] == item.generation {
            return self.items[slot].as_mut();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_some())
            .map(|(slot, _)| Handle::new(slot as u16, self.generation[slot]))
            .collect()
    }

    /// Empty the pool, returning every stored item.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (slot, item) in self.items.iter_mut().enumerate() {
            if let Some(value) = item.take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(value);
            }
        }
        out
    }
}
