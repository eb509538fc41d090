//! Insertion-ordered hash table backing `Set`
//!
//! Entries are appended to a slot array and chained into buckets. Deleting
//! leaves a hole in the slot; holes are only squeezed out when the table is
//! rehashed. A rehash never mutates the old table's slots: it builds a new
//! table, records which old slots were holes and links the old table to the
//! new one. Iterators holding an old table follow those links and translate
//! their position, so iteration survives growth, shrinking and `clear`
//! triggered while it runs.

use parking_lot::RwLock;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxBuildHasher;

use otter_unified_gc::TaggedValue;

/// Smallest bucket count
pub const MIN_CAPACITY: usize = 4;

/// What happened to an obsolete table's slots
#[derive(Debug, Clone, PartialEq, Eq)]
enum Obsoleted {
    /// Rehashed: sorted slot indices that were holes
    Rehashed(Vec<u32>),
    /// Cleared: nothing survived
    Cleared,
}

struct TableData {
    /// Bucket heads (slot indices)
    buckets: Vec<Option<u32>>,
    /// Slot keys in insertion order; holes are deleted entries
    keys: Vec<TaggedValue>,
    /// Next slot in the same bucket
    chain: Vec<Option<u32>>,
    number_of_elements: usize,
    number_of_deleted_elements: usize,
    next_table: Option<Arc<LinkedHashTable>>,
    obsoleted: Option<Obsoleted>,
}

impl TableData {
    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: TaggedValue) -> usize {
        let mut hasher = FxBuildHasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.capacity() - 1)
    }

    fn find(&self, key: TaggedValue) -> Option<usize> {
        let mut entry = self.buckets[self.bucket_of(key)];
        while let Some(index) = entry {
            let index = index as usize;
            if self.keys[index] == key {
                return Some(index);
            }
            entry = self.chain[index];
        }
        None
    }

    fn append(&mut self, key: TaggedValue) {
        let bucket = self.bucket_of(key);
        let index = self.keys.len() as u32;
        self.keys.push(key);
        self.chain.push(self.buckets[bucket]);
        self.buckets[bucket] = Some(index);
        self.number_of_elements += 1;
    }
}

/// One generation of a Set's storage
pub struct LinkedHashTable {
    data: RwLock<TableData>,
}

/// Canonical stored form of a Set value
fn canonical(value: TaggedValue) -> TaggedValue {
    if value.is_hole() {
        TaggedValue::undefined()
    } else {
        value.normalize_key()
    }
}

impl LinkedHashTable {
    /// Create an empty table with room for `capacity` entries (rounded up
    /// to a power of two, at least [`MIN_CAPACITY`])
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Arc::new(Self {
            data: RwLock::new(TableData {
                buckets: vec![None; capacity],
                keys: Vec::with_capacity(capacity),
                chain: Vec::with_capacity(capacity),
                number_of_elements: 0,
                number_of_deleted_elements: 0,
                next_table: None,
                obsoleted: None,
            }),
        })
    }

    /// Bucket count; also the slot count that triggers a rehash
    pub fn capacity(&self) -> usize {
        self.data.read().capacity()
    }

    /// Live entries
    pub fn number_of_elements(&self) -> usize {
        self.data.read().number_of_elements
    }

    /// Holes left by deletions
    pub fn number_of_deleted_elements(&self) -> usize {
        self.data.read().number_of_deleted_elements
    }

    /// Slots in use, holes included
    pub fn slot_count(&self) -> usize {
        self.data.read().keys.len()
    }

    /// Key in `index`, `None` for a hole or past the end
    pub fn key_at(&self, index: usize) -> Option<TaggedValue> {
        self.data
            .read()
            .keys
            .get(index)
            .copied()
            .filter(|key| !key.is_hole())
    }

    /// The table that replaced this one
    pub fn next_table(&self) -> Option<Arc<LinkedHashTable>> {
        self.data.read().next_table.clone()
    }

    /// Whether this table has been replaced
    pub fn is_obsolete(&self) -> bool {
        self.data.read().next_table.is_some()
    }

    /// Whether `key` is present (SameValueZero)
    pub fn has(&self, key: TaggedValue) -> bool {
        self.data.read().find(canonical(key)).is_some()
    }

    /// Live keys in insertion order
    pub fn keys(&self) -> Vec<TaggedValue> {
        self.data
            .read()
            .keys
            .iter()
            .copied()
            .filter(|key| !key.is_hole())
            .collect()
    }

    /// Insert `key` if absent. Returns the table now holding the set,
    /// which is a new one if the insert needed a rehash.
    pub fn add(self: &Arc<Self>, key: TaggedValue) -> Arc<Self> {
        let key = canonical(key);
        let (full, grow) = {
            let data = self.data.read();
            debug_assert!(data.next_table.is_none(), "add on an obsolete table");
            if data.find(key).is_some() {
                return self.clone();
            }
            let full = data.keys.len() >= data.capacity();
            (full, data.number_of_elements + 1 > data.capacity() / 2)
        };
        let table = if full {
            let capacity = self.capacity();
            self.rehash(if grow { capacity * 2 } else { capacity })
        } else {
            self.clone()
        };
        table.data.write().append(key);
        table
    }

    /// Remove `key` if present, leaving a hole. Returns whether it was
    /// present and the table now holding the set (smaller after a shrink).
    pub fn delete(self: &Arc<Self>, key: TaggedValue) -> (bool, Arc<Self>) {
        let key = canonical(key);
        let shrink_to = {
            let mut data = self.data.write();
            debug_assert!(data.next_table.is_none(), "delete on an obsolete table");
            let Some(index) = data.find(key) else {
                return (false, self.clone());
            };
            data.keys[index] = TaggedValue::hole();
            data.number_of_elements -= 1;
            data.number_of_deleted_elements += 1;

            let capacity = data.capacity();
            (capacity > MIN_CAPACITY && data.number_of_elements < capacity / 4).then_some(capacity / 2)
        };
        match shrink_to {
            Some(capacity) => (true, self.rehash(capacity)),
            None => (true, self.clone()),
        }
    }

    /// Empty the set. The old table is marked cleared so iterators on it
    /// restart at the beginning of the (empty) replacement.
    pub fn clear(self: &Arc<Self>) -> Arc<Self> {
        let table = Self::new(MIN_CAPACITY);
        let mut data = self.data.write();
        data.next_table = Some(table.clone());
        data.obsoleted = Some(Obsoleted::Cleared);
        table
    }

    /// Copy live entries, in order, into a fresh table of `capacity`
    /// buckets and link this table to it
    pub fn rehash(self: &Arc<Self>, capacity: usize) -> Arc<Self> {
        let mut data = self.data.write();
        let table = Self::new(capacity.max(data.number_of_elements));
        let mut holes = Vec::with_capacity(data.number_of_deleted_elements);
        {
            let mut new_data = table.data.write();
            for (index, key) in data.keys.iter().enumerate() {
                if key.is_hole() {
                    holes.push(index as u32);
                } else {
                    new_data.append(*key);
                }
            }
        }
        tracing::trace!(
            target: "otter::vm",
            from = data.capacity(),
            to = table.capacity(),
            elements = data.number_of_elements,
            holes = holes.len(),
            "linked hash table rehash"
        );
        data.next_table = Some(table.clone());
        data.obsoleted = Some(Obsoleted::Rehashed(holes));
        table
    }

    /// Translate a slot position in this (obsolete) table to the next
    /// table: every hole before `index` is gone there.
    pub fn adjust_index(&self, index: usize) -> usize {
        match &self.data.read().obsoleted {
            None => index,
            Some(Obsoleted::Cleared) => 0,
            Some(Obsoleted::Rehashed(holes)) => {
                index - holes.partition_point(|&hole| (hole as usize) < index)
            }
        }
    }

    /// Follow `next_table` links to the live table, translating `index`
    /// along the way
    pub fn latest(self: &Arc<Self>, mut index: usize) -> (Arc<Self>, usize) {
        let mut table = self.clone();
        while let Some(next) = table.next_table() {
            index = table.adjust_index(index);
            table = next;
        }
        (table, index)
    }
}

impl std::fmt::Debug for LinkedHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        f.debug_struct("LinkedHashTable")
            .field("capacity", &data.capacity())
            .field("elements", &data.number_of_elements)
            .field("deleted", &data.number_of_deleted_elements)
            .field("obsolete", &data.next_table.is_some())
            .finish()
    }
}
