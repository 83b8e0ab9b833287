//! An [LruList] orders shared values from most to least recently used.
//!
//! This is implemented as a vec-backed linked list where the values are held behind `Arc`, plus an auxiliary
//! hash-based index.  Unlike a bounded Lru cache it never evicts by itself: the owner decides when to pop the tail.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

struct OccupiedEntry<K, V> {
    key: K,
    item: Arc<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum ListEntry<K, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubly linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K, V> ListEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            Self::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

pub struct LruList<K: Hash + Eq, V> {
    entries: Vec<ListEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<K, usize, RandomState>,
    head: Option<usize>,
    tail: Option<usize>,
    empty_head: Option<usize>,
}

impl<K: Hash + Eq, V> Default for LruList<K, V> {
    fn default() -> Self {
        LruList {
            entries: Default::default(),
            index: Default::default(),
            head: None,
            tail: None,
            empty_head: None,
        }
    }
}

impl<K: Hash + Eq + Clone, V> LruList<K, V> {
    pub fn new() -> LruList<K, V> {
        Default::default()
    }

    /// Entirely unlink an occupied index from the list, leaving its own links cleared.
    fn unlink_index(&mut self, index: usize) {
        let (prev, next) = {
            let e = self.entries[index].as_occupied_mut();
            (e.prev.take(), e.next.take())
        };

        match prev {
            Some(p) => self.entries[p].as_occupied_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].as_occupied_mut().prev = prev,
            None => self.tail = prev,
        }
    }

    /// Link an occupied, unlinked index in as the most recent item.
    fn link_front(&mut self, index: usize) {
        let old_head = self.head;
        self.entries[index].as_occupied_mut().next = old_head;
        match old_head {
            Some(h) => self.entries[h].as_occupied_mut().prev = Some(index),
            // If there's no head this is the only entry, and it's also the tail.
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    /// Mark a key as used, returning its value.
    pub fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        if self.head != Some(ind) {
            self.unlink_index(ind);
            self.link_front(ind);
        }
        Some(self.entries[ind].as_occupied().item.clone())
    }

    #[cfg(test)]
    fn peek(&self, key: &K) -> Option<&Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(&self.entries[ind].as_occupied().item)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Make a specific index of the list become empty.
    fn become_empty(&mut self, index: usize) -> (K, Arc<V>) {
        self.unlink_index(index);
        let old = std::mem::replace(
            &mut self.entries[index],
            ListEntry::Empty(EmptyEntry {
                next_empty: self.empty_head,
            }),
        );
        self.empty_head = Some(index);
        match old {
            ListEntry::Occupied(OccupiedEntry { key, item, .. }) => {
                self.index.remove(&key);
                (key, item)
            }
            _ => panic!("Should have been occupied"),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.become_empty(ind).1)
    }

    /// Remove and return the least recently used entry.
    pub fn pop_back(&mut self) -> Option<(K, Arc<V>)> {
        let tail = self.tail?;
        Some(self.become_empty(tail))
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(ListEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry as the most recently used.  Return the old value if this key was already present.
    pub fn push_front(&mut self, key: K, item: Arc<V>) -> Option<Arc<V>> {
        let ret = self.remove(&key);
        let ind = self.find_empty();

        self.entries[ind] = ListEntry::Occupied(OccupiedEntry {
            key: key.clone(),
            item,
            prev: None,
            next: None,
        });
        self.index.insert(key, ind);
        self.link_front(ind);
        ret
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Arc<V>)> {
        let mut ind = self.head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some((&ret.key, &ret.item))
        })
    }
}
