//! Encoded row batches.
//!
//! A [`Dataset`] holds many values of one layout, each encoded to its flat
//! word form, and can push every row through a compiled function at once.

use core::fmt;

use crate::error::{Error, InvocationError};
use crate::function::Function;
use crate::layout::Layout;
use crate::symbols::SymbolTable;
use crate::value::{Value, decode_value, encode_value, intern_symbols};

/// A batch of values sharing one layout, stored in encoded form.
#[derive(Clone, Debug)]
pub struct Dataset {
    layout: Layout,
    symbols: SymbolTable,
    rows: Vec<Vec<u64>>,
}

impl Dataset {
    /// Encode `rows` against `layout`. Fails on the first row that does not
    /// match, naming its index.
    pub fn build(
        layout: Layout,
        rows: impl IntoIterator<Item = Value>,
    ) -> Result<Dataset, Error> {
        let mut symbols = SymbolTable::new();
        let mut encoded = Vec::new();
        for (index, row) in rows.into_iter().enumerate() {
            intern_symbols(&row, &mut symbols);
            let mut words = Vec::with_capacity(layout.width());
            let mut dynamic = Vec::new();
            let mut path = format!("[{index}]");
            encode_value(&row, &layout, &mut words, &symbols, &mut dynamic, &mut path)?;
            encoded.push(words);
        }
        Ok(Dataset {
            layout,
            symbols,
            rows: encoded,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Recover the host values.
    pub fn decode(&self) -> Result<Vec<Value>, Error> {
        self.rows
            .iter()
            .map(|row| {
                let mut slice = row.as_slice();
                let mut path = String::new();
                Ok(decode_value(
                    &mut slice,
                    &self.layout,
                    &self.symbols,
                    &[],
                    &mut path,
                )?)
            })
            .collect()
    }

    /// Call `function` on every row, producing the output dataset. Fails on
    /// the first failing row, naming its index.
    pub fn map(&self, function: &Function) -> Result<Dataset, Error> {
        if !self.layout.same_shape(function.input_layout()) {
            return Err(InvocationError::InputEncoding {
                path: ".".into(),
                message: format!(
                    "dataset layout {} does not match function input {}",
                    self.layout,
                    function.input_layout()
                ),
            }
            .into());
        }
        let mut outputs = Vec::with_capacity(self.rows.len());
        for (index, row) in self.decode()?.into_iter().enumerate() {
            let output = function.call(&row).map_err(|e| {
                Error::from(InvocationError::Fault(format!("row {index}: {e}")))
            })?;
            outputs.push(output);
        }
        Dataset::build(function.output_layout().clone(), outputs)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Dataset({} rows of {}; {} words each)",
            self.rows.len(),
            self.layout,
            self.layout.width()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_decode_round_trip() {
        let layout = Layout::struct_of([("a", Layout::Scalar), ("b", Layout::Symbol)]);
        let rows = vec![
            Value::struct_of([("a", Value::Scalar(1.0)), ("b", Value::from("x"))]),
            Value::struct_of([("a", Value::Scalar(2.0)), ("b", Value::from("y"))]),
        ];
        let dataset = Dataset::build(layout, rows.clone()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.decode().unwrap(), rows);
    }

    #[test]
    fn mismatched_rows_name_their_index() {
        let err = Dataset::build(
            Layout::Scalar,
            vec![Value::Scalar(1.0), Value::Bool(true)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("[1]"), "{err}");
    }
}
