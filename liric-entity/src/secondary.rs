use crate::EntityRef;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A `K -> V` map over an externally-owned dense key space.
///
/// Unlike [`crate::PrimaryMap`], a `SecondaryMap` cannot allocate keys; it
/// behaves as if every key already maps to a default value, growing lazily
/// on mutable access. Finalization caches (e.g. a block's dense
/// instruction array) are modeled this way so they can be recomputed
/// without disturbing the primary entity storage.
#[derive(Clone, Debug)]
pub struct SecondaryMap<K: EntityRef, V: Clone> {
    elems: Vec<V>,
    default: V,
    unused: PhantomData<K>,
}

impl<K: EntityRef, V: Clone + Default> SecondaryMap<K, V> {
    /// Create a new empty map using `V::default()` for unset entries.
    pub fn new() -> Self {
        Self::with_default(V::default())
    }
}

impl<K: EntityRef, V: Clone + Default> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityRef, V: Clone> SecondaryMap<K, V> {
    /// Create a new empty map with an explicit default value.
    pub fn with_default(default: V) -> Self {
        Self {
            elems: Vec::new(),
            default,
            unused: PhantomData,
        }
    }

    /// Look up `key`, returning the default if it was never set.
    pub fn get(&self, key: K) -> &V {
        self.elems.get(key.index()).unwrap_or(&self.default)
    }

    /// Clear every entry back to the default.
    pub fn clear(&mut self) {
        self.elems.clear();
    }

    fn ensure(&mut self, index: usize) {
        if index >= self.elems.len() {
            self.elems.resize(index + 1, self.default.clone());
        }
    }
}

impl<K: EntityRef, V: Clone> Index<K> for SecondaryMap<K, V> {
    type Output = V;
    fn index(&self, key: K) -> &V {
        self.get(key)
    }
}

impl<K: EntityRef, V: Clone> IndexMut<K> for SecondaryMap<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        self.ensure(key.index());
        &mut self.elems[key.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_ref;

    entity_ref!(K, "k");

    #[test]
    fn grows_on_write() {
        let mut m: SecondaryMap<K, u32> = SecondaryMap::new();
        assert_eq!(m[K::new(5)], 0);
        m[K::new(2)] = 7;
        assert_eq!(m[K::new(2)], 7);
        assert_eq!(m[K::new(0)], 0);
    }
}
