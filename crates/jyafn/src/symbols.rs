//! Interned symbol table.
//!
//! Symbols are short strings deduplicated into dense `u64` ids. A graph
//! accumulates symbols while it is built (constants, datetime format
//! strings) and the table is serialized with the artifact, so ids are stable
//! across dump/load.
//!
//! Ids with the high bit set are *dynamic*: they are handed out per call for
//! symbol values first seen at call time (unknown input symbols, datetimes
//! formatted at run time) and resolve through the call context instead of
//! this table.

use indexmap::IndexSet;
use serde_derive::{Deserialize, Serialize};

/// Marks a per-call dynamic symbol id.
pub(crate) const DYNAMIC_SYMBOL_BIT: u64 = 1 << 63;

/// Insertion-ordered string interner with dense ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    symbols: IndexSet<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning its id. Two symbols with the same content
    /// share an id.
    pub fn intern(&mut self, text: &str) -> u64 {
        match self.symbols.get_index_of(text) {
            Some(index) => index as u64,
            None => self.symbols.insert_full(text.to_string()).0 as u64,
        }
    }

    /// The id of `text`, if it was interned.
    pub fn get(&self, text: &str) -> Option<u64> {
        self.symbols.get_index_of(text).map(|i| i as u64)
    }

    /// The text behind a static id.
    pub fn text(&self, id: u64) -> Option<&str> {
        self.symbols.get_index(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterate symbols in id order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    /// Approximate heap footprint, for size estimates.
    pub(crate) fn size_estimate(&self) -> usize {
        self.symbols
            .iter()
            .map(|s| s.len() + std::mem::size_of::<String>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut table = SymbolTable::new();
        let a = table.intern("a");
        let b = table.intern("b");
        assert_ne!(a, b);
        assert_eq!(table.intern("a"), a);
        assert_eq!(table.len(), 2);
        assert_eq!(table.text(b), Some("b"));
        assert_eq!(table.get("c"), None);
    }

    #[test]
    fn ids_are_insertion_ordered() {
        let mut table = SymbolTable::new();
        for (i, s) in ["x", "y", "z"].iter().enumerate() {
            assert_eq!(table.intern(s), i as u64);
        }
        let round: SymbolTable =
            postcard::from_bytes(&postcard::to_allocvec(&table).unwrap()).unwrap();
        assert_eq!(round.get("z"), Some(2));
    }
}
