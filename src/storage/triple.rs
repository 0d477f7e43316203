use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Three ordered fields stored as one record of a triple set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub first: String,
    pub second: String,
    pub third: String,
}

impl Triple {
    pub fn new(first: impl Into<String>, second: impl Into<String>, third: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
            third: third.into(),
        }
    }

    /// Routing key. Fields are joined with a unit separator so that
    /// `("ab", "c", "d")` and `("a", "bc", "d")` stay distinct.
    pub fn key(&self) -> String {
        format!("{}\u{1f}{}\u{1f}{}", self.first, self.second, self.third)
    }

    pub fn fields(&self) -> Vec<String> {
        vec![self.first.clone(), self.second.clone(), self.third.clone()]
    }

    pub fn from_fields(fields: &[String]) -> Option<Self> {
        match fields {
            [first, second, third] => Some(Triple::new(first, second, third)),
            _ => None,
        }
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.first, self.second, self.third)
    }
}

/// Which triples a scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriplePrefix<'a> {
    All,
    First(&'a str),
    FirstSecond(&'a str, &'a str),
}

impl<'a> TriplePrefix<'a> {
    /// Scan arguments as sent on the wire.
    pub fn fields(&self) -> Vec<String> {
        match *self {
            TriplePrefix::All => Vec::new(),
            TriplePrefix::First(first) => vec![first.to_string()],
            TriplePrefix::FirstSecond(first, second) => vec![first.to_string(), second.to_string()],
        }
    }

    /// `None` for more than two fields.
    pub fn from_fields(fields: &'a [String]) -> Option<Self> {
        match fields {
            [] => Some(TriplePrefix::All),
            [first] => Some(TriplePrefix::First(first)),
            [first, second] => Some(TriplePrefix::FirstSecond(first, second)),
            _ => None,
        }
    }
}

/// A shard's triples, indexed by first then second field so that prefix
/// scans only walk the matching branch.
///
/// Mutations hold the first-field entry for their whole duration; empty
/// branches are pruned on removal.
#[derive(Debug, Default)]
pub struct TripleStore {
    index: DashMap<String, DashMap<String, DashSet<String>>>,
}

impl TripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, first: &str, second: &str, third: &str) -> bool {
        self.index.get(first).is_some_and(|seconds| {
            seconds
                .get(second)
                .is_some_and(|thirds| thirds.contains(third))
        })
    }

    /// Returns true when the triple was not present before.
    pub fn add(&self, first: &str, second: &str, third: &str) -> bool {
        let seconds = self.index.entry(first.to_string()).or_default();
        let added = seconds
            .entry(second.to_string())
            .or_default()
            .insert(third.to_string());
        added
    }

    pub fn remove(&self, first: &str, second: &str, third: &str) -> bool {
        let removed = match self.index.get_mut(first) {
            Some(seconds) => {
                let removed = seconds
                    .get(second)
                    .is_some_and(|thirds| thirds.remove(third).is_some());
                seconds.remove_if(second, |_, thirds| thirds.is_empty());
                removed
            }
            None => return false,
        };
        self.index.remove_if(first, |_, seconds| seconds.is_empty());
        removed
    }

    pub fn clear(&self) {
        self.index.clear();
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.index
            .iter()
            .map(|seconds| seconds.iter().map(|thirds| thirds.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn scan(&self, prefix: TriplePrefix<'_>) -> Vec<Triple> {
        let mut triples = Vec::new();
        match prefix {
            TriplePrefix::All => {
                for seconds in self.index.iter() {
                    collect_seconds(seconds.key(), seconds.value(), &mut triples);
                }
            }
            TriplePrefix::First(first) => {
                if let Some(seconds) = self.index.get(first) {
                    collect_seconds(first, seconds.value(), &mut triples);
                }
            }
            TriplePrefix::FirstSecond(first, second) => {
                if let Some(seconds) = self.index.get(first) {
                    if let Some(thirds) = seconds.get(second) {
                        for third in thirds.iter() {
                            triples.push(Triple::new(first, second, third.key().as_str()));
                        }
                    }
                }
            }
        }
        triples
    }
}

fn collect_seconds(first: &str, seconds: &DashMap<String, DashSet<String>>, out: &mut Vec<Triple>) {
    for thirds in seconds.iter() {
        for third in thirds.value().iter() {
            out.push(Triple::new(first, thirds.key().as_str(), third.key().as_str()));
        }
    }
}
