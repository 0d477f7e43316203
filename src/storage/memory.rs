use super::triple::{TriplePrefix, TripleStore};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;

/// A shard's set of records.
#[derive(Debug, Default)]
pub struct SetStore {
    records: DashSet<String>,
}

impl SetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, record: &str) -> bool {
        self.records.contains(record)
    }

    /// Returns true when the record was not present before.
    pub fn add(&self, record: &str) -> bool {
        self.records.insert(record.to_string())
    }

    /// Returns the number of newly added records.
    pub fn add_all<'a>(&self, records: impl IntoIterator<Item = &'a str>) -> u64 {
        records
            .into_iter()
            .filter(|record| self.add(record))
            .count() as u64
    }

    pub fn remove(&self, record: &str) -> bool {
        self.records.remove(record).is_some()
    }

    /// Keeps only the records in `keep`. Returns whether anything was dropped.
    pub fn retain_all(&self, keep: &HashSet<&str>) -> bool {
        let before = self.records.len();
        self.records.retain(|record| keep.contains(record.as_str()));
        self.records.len() != before
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Swaps in freshly loaded contents.
    pub fn replace_with(&self, other: SetStore) {
        self.records.clear();
        for record in other.records {
            self.records.insert(record);
        }
    }
}

/// A shard's key → set-of-values mapping.
///
/// A key exists only while it has at least one value.
#[derive(Debug, Default)]
pub struct MapSetStore {
    entries: DashMap<String, Arc<DashSet<String>>>,
}

impl MapSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn contains_entry(&self, key: &str, value: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|values| values.contains(value))
    }

    pub fn add(&self, key: &str, value: &str) -> bool {
        self.entries
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string())
    }

    /// Removes the key and all of its values.
    pub fn remove_key(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_entry(&self, key: &str, value: &str) -> bool {
        let removed = match self.entries.get(key) {
            Some(values) => values.remove(value).is_some(),
            None => return false,
        };
        self.entries.remove_if(key, |_, values| values.is_empty());
        removed
    }

    pub fn get(&self, key: &str) -> Vec<String> {
        self.entries
            .get(key)
            .map(|values| values.iter().map(|v| v.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every `(key, value)` pair.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for entry in self.entries.iter() {
            for value in entry.value().iter() {
                pairs.push((entry.key().clone(), value.key().clone()));
            }
        }
        pairs
    }
}

/// The local backend behind one shard.
#[derive(Debug)]
pub enum LocalStore {
    Set(SetStore),
    MapSet(MapSetStore),
    Triple(TripleStore),
}

impl LocalStore {
    pub fn len(&self) -> usize {
        match self {
            LocalStore::Set(set) => set.len(),
            LocalStore::MapSet(map) => map.len(),
            LocalStore::Triple(triples) => triples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            LocalStore::Set(set) => set.is_empty(),
            LocalStore::MapSet(map) => map.is_empty(),
            LocalStore::Triple(triples) => triples.is_empty(),
        }
    }

    pub fn clear(&self) {
        match self {
            LocalStore::Set(set) => set.clear(),
            LocalStore::MapSet(map) => map.clear(),
            LocalStore::Triple(triples) => triples.clear(),
        }
    }

    /// Every record as a list of fields: `[record]` for sets, `[key, value]`
    /// for map-sets, `[first, second, third]` for triple sets.
    pub fn scan(&self) -> Vec<Vec<String>> {
        match self {
            LocalStore::Set(set) => set.records().into_iter().map(|r| vec![r]).collect(),
            LocalStore::MapSet(map) => map.entries().into_iter().map(|(k, v)| vec![k, v]).collect(),
            LocalStore::Triple(triples) => triples
                .scan(TriplePrefix::All)
                .iter()
                .map(|t| t.fields())
                .collect(),
        }
    }
}
