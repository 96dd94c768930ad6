use crate::memory::{Gc, Object};
use crate::vm::value::Value;

const INITIAL_CAPACITY: usize = 8;

/// A single slot in the table. Three states are distinguished:
/// a live entry (`key` set), an empty slot (`key` unset, `value` nil) and
/// a tombstone left behind by `delete` (`key` unset, `value` true).
/// Tombstones keep probe sequences intact.
#[derive(Debug)]
struct Entry {
    key: Option<Gc<Object>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// Open-addressed hash table from interned strings to values, with linear
/// probing. Keys compare by pointer identity; interning guarantees that
/// byte-equal strings are the same pointer. Capacity is a power of two so
/// the hash wraps with a mask.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones. Tombstones are only dropped when the
    /// table grows.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Looks up `key`, returning a copy of the stored value.
    pub fn get(&self, key: Gc<Object>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = self.find_entry(key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value.clone())
    }

    /// Inserts or overwrites `key`. Returns `true` if the key was not
    /// present before.
    pub fn set(&mut self, key: Gc<Object>, value: Value) -> bool {
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let index = self.find_entry(key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();

        // A reused tombstone is already included in `count`.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Removes `key`, leaving a tombstone so later probes still find
    /// entries that collided past this slot. Returns `true` if the key
    /// was present.
    pub fn delete(&mut self, key: Gc<Object>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_entry(key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copies every live entry of `other` into `self`. Used by class
    /// inheritance to flatten the superclass methods into the subclass.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(*key, value.clone());
        }
    }

    /// Looks up a string key by contents rather than identity. This is the
    /// one contents-based lookup, used by the interner before a string
    /// object exists for these bytes.
    pub fn find_string(&self, data: &str, hash: u32) -> Option<Gc<Object>> {
        if self.count == 0 {
            return None;
        }

        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = key.as_string();
                    if string.hash == hash && string.data == data {
                        return Some(*key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Iterates over the live entries.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a Gc<Object>, &'a Value)> + 'a {
        self.entries
            .iter()
            .filter_map(|e| e.key.as_ref().map(|k| (k, &e.value)))
    }

    /// Tombstones every entry whose key has not been marked reachable.
    /// The GC calls this between mark and sweep so the intern table never
    /// points at freed strings.
    pub(crate) fn remove_unmarked_keys(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = &entry.key {
                if !key.marked() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    /// Probe for `key`, returning the index of its entry or of the slot
    /// where it would be inserted (preferring the first tombstone passed).
    fn find_entry(&self, key: Gc<Object>) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = key.as_string().hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) => {
                    if existing.ptr_eq(&key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };

        let old = std::mem::replace(
            &mut self.entries,
            (0..capacity).map(|_| Entry::empty()).collect(),
        );

        // Tombstones are dropped on the way over, so recount.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_entry(key);
                self.entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GC;

    #[test]
    fn set_get_overwrite() {
        let mut gc = GC::new();
        let key = gc.intern("breakfast".to_owned());
        let mut table = Table::new();

        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        match table.get(key) {
            Some(Value::Number(n)) => assert_eq!(n, 2.0),
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn missing_key() {
        let mut gc = GC::new();
        let key = gc.intern("nope".to_owned());
        let table = Table::new();
        assert!(table.get(key).is_none());
    }

    #[test]
    fn delete_leaves_probes_intact() {
        let mut gc = GC::new();
        let mut table = Table::new();

        let keys: Vec<_> = (0..32)
            .map(|i| gc.intern(format!("key{}", i)))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::Number(i as f64));
        }

        assert!(table.delete(keys[7]));
        assert!(!table.delete(keys[7]));
        assert!(table.get(keys[7]).is_none());

        // Everything else must still be reachable through its probe chain.
        for (i, key) in keys.iter().enumerate() {
            if i == 7 {
                continue;
            }
            match table.get(*key) {
                Some(Value::Number(n)) => assert_eq!(n, i as f64),
                other => panic!("lost key{}: {:?}", i, other),
            }
        }
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut gc = GC::new();
        let mut table = Table::new();
        let key = gc.intern("transient".to_owned());

        table.set(key, Value::Bool(false));
        table.delete(key);
        assert!(table.set(key, Value::Bool(true)));
        assert!(matches!(table.get(key), Some(Value::Bool(true))));
    }

    #[test]
    fn find_string_by_contents() {
        let mut gc = GC::new();
        let key = gc.intern("init".to_owned());
        let mut table = Table::new();
        table.set(key, Value::Nil);

        let hash = key.as_string().hash;
        let found = table.find_string("init", hash).expect("interned string");
        assert!(found.ptr_eq(&key));
        assert!(table.find_string("inir", hash).is_none());
    }

    #[test]
    fn add_all_copies_entries() {
        let mut gc = GC::new();
        let a = gc.intern("a".to_owned());
        let b = gc.intern("b".to_owned());

        let mut from = Table::new();
        from.set(a, Value::Number(1.0));
        from.set(b, Value::Number(2.0));

        let mut to = Table::new();
        to.set(a, Value::Number(10.0));
        to.add_all(&from);

        assert!(matches!(to.get(a), Some(Value::Number(n)) if n == 1.0));
        assert!(matches!(to.get(b), Some(Value::Number(n)) if n == 2.0));
    }
}
