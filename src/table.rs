// Open-addressed, string-keyed hash table used for globals, instance fields,
// class method tables, and (via `Heap`) the process-wide string intern set.
//
// Keys are always interned strings, identified by `ObjRef`; callers supply
// the key's precomputed hash (every `Obj::String` carries one) so this type
// never needs to touch the heap itself.
//
// Tombstones: a deleted entry is left as `Slot::Tombstone` rather than
// `Slot::Empty` so that later probes don't stop short of a live entry that
// was inserted after it. `count` includes tombstones for load-factor
// purposes; `len` (the public, "real" entry count) does not. Rehashing
// recomputes `count` from scratch, which drops tombstones.

use crate::gc::ObjRef;

const LOAD_FACTOR: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone)]
enum Slot<V> {
    Empty,
    Tombstone,
    Occupied(ObjRef, u32, V),
}

#[derive(Clone)]
pub struct Table<V> {
    entries: Vec<Slot<V>>,
    /// Occupied + tombstone slots. Drives growth decisions.
    count: usize,
    /// Occupied slots only. The table's real size.
    len: usize,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Table { entries: Vec::new(), count: 0, len: 0 }
    }
}

impl<V> Table<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot_index(entries: &[Slot<V>], key: ObjRef, hash: u32) -> usize {
        let cap = entries.len();
        let mut index = (hash as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _, _) => {
                    if *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn ensure_capacity(&mut self) {
        let needed = self.entries.is_empty()
            || (self.count + 1) as f64 > self.entries.len() as f64 * LOAD_FACTOR;
        if needed {
            let new_cap = if self.entries.is_empty() {
                INITIAL_CAPACITY
            } else {
                self.entries.len() * 2
            };
            self.grow(new_cap);
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let old = std::mem::replace(
            &mut self.entries,
            (0..new_cap).map(|_| Slot::Empty).collect(),
        );
        self.count = 0;
        for slot in old {
            if let Slot::Occupied(k, h, v) = slot {
                let idx = Self::find_slot_index(&self.entries, k, h);
                self.entries[idx] = Slot::Occupied(k, h, v);
                self.count += 1;
            }
        }
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<&V> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot_index(&self.entries, key, hash);
        match &self.entries[idx] {
            Slot::Occupied(_, _, v) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: ObjRef, hash: u32) -> Option<&mut V> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot_index(&self.entries, key, hash);
        match &mut self.entries[idx] {
            Slot::Occupied(_, _, v) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Returns `true` if this inserted a brand-new key (as opposed to
    /// overwriting an existing one).
    pub fn set(&mut self, key: ObjRef, hash: u32, value: V) -> bool {
        self.ensure_capacity();
        let idx = Self::find_slot_index(&self.entries, key, hash);
        let was_new = match &self.entries[idx] {
            Slot::Occupied(..) => false,
            Slot::Empty => {
                self.count += 1;
                true
            }
            Slot::Tombstone => true,
        };
        if was_new {
            self.len += 1;
        }
        self.entries[idx] = Slot::Occupied(key, hash, value);
        was_new
    }

    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_slot_index(&self.entries, key, hash);
        match self.entries[idx] {
            Slot::Occupied(..) => {
                self.entries[idx] = Slot::Tombstone;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, u32, &V)> {
        self.entries.iter().filter_map(|s| match s {
            Slot::Occupied(k, h, v) => Some((*k, *h, v)),
            _ => None,
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, _, v)| v)
    }

    /// Copies every entry of `other` into `self`, overwriting on collision.
    /// Used by `INHERIT` to flatten a superclass's methods into a subclass.
    pub fn copy_from(&mut self, other: &Table<V>)
    where
        V: Clone,
    {
        for (k, h, v) in other.iter() {
            self.set(k, h, v.clone());
        }
    }

    /// Drops every occupied entry for which `keep` returns false, turning it
    /// into a tombstone. Used for the intern table's weak-reference sweep:
    /// strings that didn't survive marking must not be resurrected by their
    /// own entry in this table.
    pub fn retain(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.entries {
            if let Slot::Occupied(k, _, _) = slot {
                if !keep(*k) {
                    *slot = Slot::Tombstone;
                    self.len -= 1;
                }
            }
        }
    }

    /// Probe by hash and an externally supplied equality test rather than by
    /// `ObjRef` identity. Used only by string interning, where the candidate
    /// bytes must be compared against the heap (no `ObjRef` exists yet for
    /// content that hasn't been interned before).
    pub fn find_by(&self, hash: u32, matches: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.entries.len();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, h, _) => {
                    if *h == hash && matches(*k) {
                        return Some(*k);
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: u32) -> ObjRef {
        ObjRef::from_raw(i)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut t: Table<i32> = Table::new();
        assert!(t.set(r(1), 111, 42));
        assert_eq!(t.get(r(1), 111), Some(&42));
    }

    #[test]
    fn overwrite_does_not_grow_len() {
        let mut t: Table<i32> = Table::new();
        assert!(t.set(r(1), 1, 1));
        assert!(!t.set(r(1), 1, 2));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(r(1), 1), Some(&2));
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone_without_growing_count() {
        let mut t: Table<i32> = Table::new();
        t.set(r(1), 1, 1);
        t.set(r(2), 2, 2);
        assert!(t.delete(r(1), 1));
        assert_eq!(t.get(r(1), 1), None);
        assert!(t.get(r(2), 2).is_some());
        // Reinserting a different key into the same bucket should succeed
        // and should not double count the tombstone slot.
        t.set(r(3), 1, 3);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: Table<i32> = Table::new();
        for i in 0..100u32 {
            t.set(r(i), i, i as i32);
        }
        assert_eq!(t.len(), 100);
        for i in 0..100u32 {
            assert_eq!(t.get(r(i), i), Some(&(i as i32)));
        }
    }

    #[test]
    fn retain_drops_unmarked_entries() {
        let mut t: Table<()> = Table::new();
        t.set(r(1), 1, ());
        t.set(r(2), 2, ());
        t.retain(|k| k == r(1));
        assert_eq!(t.len(), 1);
        assert!(t.get(r(1), 1).is_some());
        assert!(t.get(r(2), 2).is_none());
    }
}
