//! MergeMap: key/value map adaptor over [`MergeSet`].
//!
//! Entries are stored as `(K, V)` pairs keyed by their first field. Keys
//! never change once stored; `insert_or_assign` and the mutable accessors
//! only touch values.

use core::fmt;
use core::ops::{Index, IndexMut};

use crate::error::Result;
use crate::merge_set::{MergeSet, Position};
use crate::traits::{First, HashTraits, MergeTraits};

pub struct MergeMap<K, V, Tr = HashTraits>
where
    Tr: MergeTraits<K>,
{
    set: MergeSet<(K, V), Tr, First>,
}

impl<K, V, Tr> MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    pub fn new() -> Self
    where
        Tr: Default,
    {
        Self { set: MergeSet::new() }
    }

    pub fn with_traits(traits: Tr) -> Self {
        Self { set: MergeSet::with_traits(traits) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.set.contains(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.set.get(key).map(|(_, v)| v)
    }

    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        self.set.get(key).map(|(k, v)| (k, v))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.set.get_mut(key).map(|(_, v)| v)
    }

    pub fn find(&self, key: &K) -> Position {
        self.set.find(key)
    }

    /// Entry at `pos`.
    pub fn at(&self, pos: Position) -> Result<(&K, &V)> {
        self.set.at(pos).map(|(k, v)| (k, v))
    }

    pub fn value_at_mut(&mut self, pos: Position) -> Result<&mut V> {
        self.set.at_mut(pos).map(|(_, v)| v)
    }

    /// Insert `key -> value` unless `key` is present. Returns whether the
    /// pair was inserted; an existing value is left alone.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        Ok(self.set.insert((key, value))?.inserted)
    }

    /// Insert `key -> value`, or overwrite the value of an existing key. The
    /// stored key object is kept. Returns whether a new entry was created.
    pub fn insert_or_assign(&mut self, key: K, value: V) -> Result<bool> {
        let pos = self.set.find(&key);
        if pos.is_found() {
            self.set.at_mut(pos)?.1 = value;
            return Ok(false);
        }
        self.set.add(pos, || (key, value))?;
        Ok(true)
    }

    /// Add `key -> value` at a position returned by a failed `find(&key)`.
    pub fn add(&mut self, pos: Position, key: K, value: V) -> Result<Position> {
        self.set.add(pos, || (key, value))
    }

    /// Value for `key`, inserting `create()` first when absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, create: F) -> Result<&mut V>
    where
        F: FnOnce() -> V,
    {
        let pos = self.set.find(&key);
        let pos = if pos.is_found() { pos } else { self.set.add(pos, || (key, create()))? };
        self.value_at_mut(pos)
    }

    /// Remove `key` and return its value. Hash-ordered maps only.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        Ok(self.set.remove(key)?.map(|(_, v)| v))
    }

    /// Remove and return the entry at `pos`. Hash-ordered maps only.
    pub fn extract(&mut self, pos: Position) -> Result<(K, V)> {
        self.set.extract(pos)
    }

    /// Remove every entry matching `pred`. Hash-ordered maps only.
    pub fn remove_if<P>(&mut self, mut pred: P) -> Result<usize>
    where
        P: FnMut(&K, &V) -> bool,
    {
        self.set.remove_if(|(k, v)| pred(k, v))
    }

    /// Move entries whose keys are absent here out of `other`.
    pub fn merge_from(&mut self, other: &mut Self) -> Result<()> {
        self.set.merge_from(&mut other.set)
    }

    /// Move entries whose keys are absent from `other` into it.
    pub fn merge_to(&mut self, other: &mut Self) -> Result<()> {
        self.set.merge_to(&mut other.set)
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.set.iter().map(|(k, v)| (k, v))
    }

    /// Entries with mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> + '_ {
        self.set.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.set.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.set.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.set.iter_mut().map(|(_, v)| v)
    }

    pub fn try_clone(&self) -> Result<Self>
    where
        K: Clone,
        V: Clone,
    {
        Ok(Self { set: self.set.try_clone()? })
    }
}

impl<K, V, Tr> Default for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone, Tr> Clone for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    fn clone(&self) -> Self {
        Self { set: self.set.clone() }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, Tr> fmt::Debug for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, Tr> Index<&K> for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    type Output = V;

    /// Panics when `key` is absent.
    fn index(&self, key: &K) -> &V {
        match self.get(key) {
            Some(value) => value,
            None => panic!("MergeMap: key not found"),
        }
    }
}

impl<K: Clone, V: Default, Tr> IndexMut<&K> for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    /// Inserts `V::default()` when `key` is absent. Panics if that insert
    /// fails.
    fn index_mut(&mut self, key: &K) -> &mut V {
        match self.get_or_insert_with(key.clone(), V::default) {
            Ok(value) => value,
            Err(err) => panic!("MergeMap: {err}"),
        }
    }
}

impl<K, V, Tr> Extend<(K, V)> for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    /// Panics if an insert fails.
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.set.extend(iter);
    }
}

impl<K, V, Tr> FromIterator<(K, V)> for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K> + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { set: iter.into_iter().collect() }
    }
}

impl<K, V, Tr> IntoIterator for MergeMap<K, V, Tr>
where
    Tr: MergeTraits<K>,
{
    type Item = (K, V);
    type IntoIter = crate::merge_set::IntoIter<(K, V), Tr::Bloom>;

    fn into_iter(self) -> Self::IntoIter {
        self.set.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::traits::LessTraits;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn insert_does_not_overwrite_but_assign_does() {
        let mut map: MergeMap<String, u32> = MergeMap::new();
        assert_eq!(map.insert("a".into(), 1), Ok(true));
        assert_eq!(map.insert("a".into(), 2), Ok(false));
        assert_eq!(map.get(&"a".into()), Some(&1));
        assert_eq!(map.insert_or_assign("a".into(), 3), Ok(false));
        assert_eq!(map.get(&"a".into()), Some(&3));
        assert_eq!(map.insert_or_assign("b".into(), 4), Ok(true));
        assert_eq!(map.len(), 2);
    }

    /// `insert_or_assign` replaces only the value; the stored key object is
    /// the one inserted first.
    #[test]
    fn assign_keeps_original_key_object() {
        #[derive(Debug)]
        struct Tagged(u32, &'static str);
        impl PartialEq for Tagged {
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }
        impl Eq for Tagged {}
        impl core::hash::Hash for Tagged {
            fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }
        let mut map: MergeMap<Tagged, u32> = MergeMap::new();
        map.insert(Tagged(1, "first"), 10).unwrap();
        map.insert_or_assign(Tagged(1, "second"), 20).unwrap();
        let (k, v) = map.get_key_value(&Tagged(1, "")).unwrap();
        assert_eq!(k.1, "first");
        assert_eq!(*v, 20);
    }

    #[test]
    fn index_reads_and_index_mut_default_inserts() {
        let mut map: MergeMap<u32, Vec<u32>> = MergeMap::new();
        map[&7].push(1);
        map[&7].push(2);
        assert_eq!(map[&7], vec![1, 2]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    #[should_panic(expected = "key not found")]
    fn index_on_missing_key_panics() {
        let map: MergeMap<u32, u32> = MergeMap::new();
        assert_eq!(map[&1], 0);
    }

    /// Shuffled inserts of 1..=1000 followed by removing every even key
    /// leave exactly the 500 odd keys.
    #[test]
    fn remove_even_keys_after_shuffled_inserts() {
        let mut keys: Vec<u32> = (1..=1000).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));
        let mut map: MergeMap<u32, u32> = MergeMap::new();
        for &k in &keys {
            assert_eq!(map.insert(k, k * 10), Ok(true));
        }
        for k in (2..=1000).step_by(2) {
            assert_eq!(map.remove(&k), Ok(Some(k * 10)));
        }
        assert_eq!(map.len(), 500);
        assert!(map.keys().all(|k| k % 2 == 1));
        assert_eq!(map.iter().count(), 500);
        for k in (1..=1000).step_by(2) {
            assert_eq!(map.get(&k), Some(&(k * 10)));
        }
    }

    /// An ordered map filled through indexing, `insert` and `add` holds all
    /// 1024 keys and is empty after `clear`.
    #[test]
    fn ordered_map_mixed_inserts_then_clear() {
        let mut keys: Vec<u32> = (0..1024).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(5));
        let mut map: MergeMap<u32, u32, LessTraits> = MergeMap::new();
        for (i, &k) in keys.iter().enumerate() {
            match i % 3 {
                0 => map[&k] = k + 1,
                1 => assert_eq!(map.insert(k, k + 1), Ok(true)),
                _ => {
                    let pos = map.find(&k);
                    assert!(!pos.is_found());
                    map.add(pos, k, k + 1).unwrap();
                }
            }
        }
        assert_eq!(map.len(), 1024);
        for k in 0..1024 {
            assert_eq!(map.get(&k), Some(&(k + 1)));
        }
        assert!(matches!(map.remove(&0), Err(Error::Unsupported(_))));
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn iter_mut_and_values_mut_touch_values_only() {
        let mut map: MergeMap<u32, u32> = (0..100).map(|k| (k, k)).collect();
        for (k, v) in map.iter_mut() {
            *v += *k;
        }
        for v in map.values_mut() {
            *v += 1;
        }
        for k in 0..100 {
            assert_eq!(map[&k], 2 * k + 1);
        }
        let total: u32 = map.values().sum();
        assert_eq!(total, (0..100).map(|k| 2 * k + 1).sum());
    }

    #[test]
    fn get_or_insert_with_and_merge_from() {
        let mut a: MergeMap<u32, &str> = MergeMap::new();
        *a.get_or_insert_with(1, || "one").unwrap() = "uno";
        assert_eq!(a.get_or_insert_with(1, || "ignored"), Ok(&mut "uno"));
        let mut b: MergeMap<u32, &str> = [(1, "dup"), (2, "two")].into_iter().collect();
        a.merge_from(&mut b).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[&1], "uno");
        assert_eq!(b.len(), 1);
        assert_eq!(b[&1], "dup");
        let pos = a.find(&2);
        assert_eq!(a.extract(pos), Ok((2, "two")));
        assert_eq!(a.remove_if(|_, v| *v == "uno"), Ok(1));
        assert!(a.is_empty());
    }
}
