//! Mapping constants: immutable lookup tables embedded in a graph.
//!
//! A [`Mapping`] is built eagerly from host pairs, outside any graph, and is
//! reusable across graphs: the first `get` inside a graph registers the
//! encoded table with that graph. Lookup at run time is a hash probe keyed
//! by the flat key words; insertion order is not observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::builder::{self, IntoRefValue, RefValue};
use crate::error::{BuildError, Error};
use crate::graph::Graph;
use crate::layout::Layout;
use crate::op::Op;
use crate::symbols::{DYNAMIC_SYMBOL_BIT, SymbolTable};
use crate::types::Type;
use crate::value::{Value, encode_value, intern_symbols};

fn fresh_handle_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The serialized form of a mapping: layouts plus encoded rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MappingSpec {
    pub name: String,
    pub key_layout: Layout,
    pub value_layout: Layout,
    pub rows: Vec<(Vec<u64>, Vec<u64>)>,
}

impl MappingSpec {
    /// Build the run-time lookup table.
    pub fn build_table(&self) -> HashMap<Box<[u64]>, Box<[u64]>> {
        self.rows
            .iter()
            .map(|(k, v)| (k.clone().into_boxed_slice(), v.clone().into_boxed_slice()))
            .collect()
    }

    /// Rewrite symbol words in every row through `remap`. Used when the
    /// owning graph is embedded into another graph.
    pub fn remap_symbols(&mut self, remap: &impl Fn(u64) -> u64) {
        let key_leaves = self.key_layout.leaf_types();
        let value_leaves = self.value_layout.leaf_types();
        for (key, value) in &mut self.rows {
            for (word, ty) in key.iter_mut().zip(&key_leaves) {
                if *ty == Type::Symbol {
                    *word = remap(*word);
                }
            }
            for (word, ty) in value.iter_mut().zip(&value_leaves) {
                if *ty == Type::Symbol {
                    *word = remap(*word);
                }
            }
        }
    }

    pub fn size_estimate(&self) -> usize {
        self.rows
            .iter()
            .map(|(k, v)| (k.len() + v.len()) * 8)
            .sum()
    }
}

/// An immutable `key -> value` table usable from any graph.
#[derive(Clone, Debug)]
pub struct Mapping {
    id: u64,
    name: String,
    key_layout: Layout,
    value_layout: Layout,
    entries: Vec<(Value, Value)>,
}

impl Mapping {
    /// Build a mapping by consuming `entries` once. Both sides of every
    /// entry are validated against the layouts at registration time.
    pub fn new(
        name: impl Into<String>,
        key_layout: Layout,
        value_layout: Layout,
        entries: impl IntoIterator<Item = (Value, Value)>,
    ) -> Self {
        Mapping {
            id: fresh_handle_id(),
            name: name.into(),
            key_layout,
            value_layout,
            entries: entries.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_layout(&self) -> &Layout {
        &self.key_layout
    }

    pub fn value_layout(&self) -> &Layout {
        &self.value_layout
    }

    /// Look the key up in the current graph. A key missing at call time
    /// aborts the call.
    pub fn get(&self, key: impl IntoRefValue) -> Result<RefValue, Error> {
        builder::with_current(|g| {
            let mapping = self.ensure_registered(g)?;
            let key = key.into_ref_value(g)?;
            let keys = builder::flatten_ref_value(g, &key, &self.key_layout)?;
            let ptr = g.push(
                Op::MapGet {
                    mapping,
                    key_width: keys.len() as u32,
                    value_width: self.value_layout.width() as u32,
                },
                &keys,
            )?;
            builder::load_slots(g, ptr, &self.value_layout)
        })
        .map_err(Error::from)
    }

    /// Look the key up in the current graph, falling back to `default` when
    /// the key is absent at call time.
    pub fn get_or(
        &self,
        key: impl IntoRefValue,
        default: impl IntoRefValue,
    ) -> Result<RefValue, Error> {
        builder::with_current(|g| {
            let mapping = self.ensure_registered(g)?;
            let key = key.into_ref_value(g)?;
            let default = default.into_ref_value(g)?;
            let keys = builder::flatten_ref_value(g, &key, &self.key_layout)?;
            let defaults = builder::flatten_ref_value(g, &default, &self.value_layout)?;
            let mut operands = keys;
            let key_width = operands.len() as u32;
            operands.extend(defaults);
            let ptr = g.push(
                Op::MapGetOr {
                    mapping,
                    key_width,
                    value_width: self.value_layout.width() as u32,
                },
                &operands,
            )?;
            builder::load_slots(g, ptr, &self.value_layout)
        })
        .map_err(Error::from)
    }

    fn ensure_registered(&self, g: &mut Graph) -> Result<u32, BuildError> {
        if let Some(index) = g.lookup_mapping(self.id) {
            return Ok(index);
        }
        let spec = self.encode_into(&mut g.symbols)?;
        Ok(g.register_mapping(self.id, spec))
    }

    /// Encode every entry against the layouts, interning symbols into
    /// `symbols`.
    fn encode_into(&self, symbols: &mut SymbolTable) -> Result<MappingSpec, BuildError> {
        let mut rows = Vec::with_capacity(self.entries.len());
        for (index, (key, value)) in self.entries.iter().enumerate() {
            intern_symbols(key, symbols);
            intern_symbols(value, symbols);
            let encode = |value: &Value, layout: &Layout| -> Result<Vec<u64>, BuildError> {
                let mut words = Vec::with_capacity(layout.width());
                let mut dynamic = Vec::new();
                let mut path = String::new();
                encode_value(value, layout, &mut words, symbols, &mut dynamic, &mut path)
                    .map_err(|e| BuildError::BadMappingEntry {
                        name: self.name.clone(),
                        index,
                        message: e.to_string(),
                    })?;
                debug_assert!(dynamic.is_empty(), "mapping symbols are interned eagerly");
                if words.iter().any(|w| w & DYNAMIC_SYMBOL_BIT != 0) {
                    // Unreachable while interning precedes encoding; guards
                    // the table against unresolvable ids all the same.
                    return Err(BuildError::BadMappingEntry {
                        name: self.name.clone(),
                        index,
                        message: "entry contains a dynamic symbol".into(),
                    });
                }
                Ok(words)
            };
            rows.push((
                encode(key, &self.key_layout)?,
                encode(value, &self.value_layout)?,
            ));
        }
        Ok(MappingSpec {
            name: self.name.clone(),
            key_layout: self.key_layout.clone(),
            value_layout: self.value_layout.clone(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_encodes_symbol_keys() {
        let mapping = Mapping::new(
            "m",
            Layout::Symbol,
            Layout::Scalar,
            [
                (Value::from("a"), Value::from(2.0)),
                (Value::from("b"), Value::from(4.0)),
            ],
        );
        let mut symbols = SymbolTable::new();
        let spec = mapping.encode_into(&mut symbols).unwrap();
        assert_eq!(spec.rows.len(), 2);
        let table = spec.build_table();
        let a = symbols.get("a").unwrap();
        assert_eq!(table[&vec![a].into_boxed_slice()], vec![2.0f64.to_bits()].into_boxed_slice());
    }

    #[test]
    fn bad_entries_are_rejected_at_registration() {
        let mapping = Mapping::new(
            "m",
            Layout::Symbol,
            Layout::Scalar,
            [(Value::from(1.0), Value::from(2.0))],
        );
        let err = mapping.encode_into(&mut SymbolTable::new()).unwrap_err();
        assert!(err.to_string().contains("mapping `m` entry 0"));
    }
}
