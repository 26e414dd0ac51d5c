//! Structural description of how a value is laid out in a flat word buffer.
//!
//! A [`Layout`] describes the encoding of one structured value as a sequence
//! of 64-bit words. Scalars take the bit pattern of the double, booleans take
//! 0 or 1, symbols take their interned id, datetimes take microseconds since
//! the Unix epoch. Structs, tuples and lists concatenate their children in
//! declared order; struct field order is insertion order and is significant.
//!
//! The textual representation is tagged JSON and must round-trip exactly,
//! field order included.

use core::fmt;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, SerializationError};
use crate::types::Type;

/// Default textual form of a datetime: ISO-8601 with fractional seconds.
/// Parsing additionally accepts an RFC 3339 timezone suffix.
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

fn default_format() -> String {
    DEFAULT_DATETIME_FORMAT.to_string()
}

/// The layout algebra.
///
/// The derived serde form (externally tagged) is what the binary artifact
/// sections use; the documented JSON text form (`{"type":"scalar"}`, ...)
/// goes through [`Layout::to_json`]/[`Layout::from_json`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Zero words. The return layout of functions called only for their
    /// assertions.
    Unit,
    /// One word: an IEEE-754 double.
    Scalar,
    /// One word: 0 or 1.
    Bool,
    /// One word: an interned symbol id.
    Symbol,
    /// One word: microseconds since the Unix epoch, plus the textual format
    /// used when converting to and from host datetimes.
    DateTime {
        #[serde(default = "default_format")]
        format: String,
    },
    /// Named fields in declaration order.
    Struct { fields: Vec<(String, Layout)> },
    /// Anonymous fields in declaration order.
    Tuple { elements: Vec<Layout> },
    /// `size` repetitions of `element`. `size` may be zero.
    List { element: Box<Layout>, size: usize },
}

impl Layout {
    /// A datetime layout with the default format.
    pub fn datetime() -> Self {
        Layout::DateTime {
            format: default_format(),
        }
    }

    /// A datetime layout with an explicit `chrono` format string.
    pub fn datetime_fmt(format: impl Into<String>) -> Self {
        Layout::DateTime {
            format: format.into(),
        }
    }

    /// A struct layout from named fields, preserving order.
    pub fn struct_of<N: Into<String>>(fields: impl IntoIterator<Item = (N, Layout)>) -> Self {
        Layout::Struct {
            fields: fields.into_iter().map(|(n, l)| (n.into(), l)).collect(),
        }
    }

    /// A tuple layout.
    pub fn tuple_of(elements: impl IntoIterator<Item = Layout>) -> Self {
        Layout::Tuple {
            elements: elements.into_iter().collect(),
        }
    }

    /// A fixed-size list layout.
    pub fn list_of(element: Layout, size: usize) -> Self {
        Layout::List {
            element: Box::new(element),
            size,
        }
    }

    /// `tensor(&[d1, ..., dk])` is sugar for nested scalar lists, outermost
    /// dimension first.
    pub fn tensor(dims: &[usize]) -> Self {
        let mut layout = Layout::Scalar;
        for &dim in dims.iter().rev() {
            layout = Layout::list_of(layout, dim);
        }
        layout
    }

    /// Number of 64-bit words a value of this layout occupies.
    pub fn width(&self) -> usize {
        match self {
            Layout::Unit => 0,
            Layout::Scalar | Layout::Bool | Layout::Symbol | Layout::DateTime { .. } => 1,
            Layout::Struct { fields } => fields.iter().map(|(_, l)| l.width()).sum(),
            Layout::Tuple { elements } => elements.iter().map(Layout::width).sum(),
            Layout::List { element, size } => element.width() * size,
        }
    }

    /// The primitive type of each word, in encoding order.
    pub fn leaf_types(&self) -> Vec<Type> {
        let mut out = Vec::with_capacity(self.width());
        self.push_leaf_types(&mut out);
        out
    }

    fn push_leaf_types(&self, out: &mut Vec<Type>) {
        match self {
            Layout::Unit => {}
            Layout::Scalar => out.push(Type::Float),
            Layout::Bool => out.push(Type::Bool),
            Layout::Symbol => out.push(Type::Symbol),
            Layout::DateTime { .. } => out.push(Type::DateTime),
            Layout::Struct { fields } => {
                for (_, l) in fields {
                    l.push_leaf_types(out);
                }
            }
            Layout::Tuple { elements } => {
                for l in elements {
                    l.push_leaf_types(out);
                }
            }
            Layout::List { element, size } => {
                for _ in 0..*size {
                    element.push_leaf_types(out);
                }
            }
        }
    }

    /// Structural equality, ignoring datetime format strings.
    pub fn same_shape(&self, other: &Layout) -> bool {
        match (self, other) {
            (Layout::Unit, Layout::Unit)
            | (Layout::Scalar, Layout::Scalar)
            | (Layout::Bool, Layout::Bool)
            | (Layout::Symbol, Layout::Symbol)
            | (Layout::DateTime { .. }, Layout::DateTime { .. }) => true,
            (Layout::Struct { fields: a }, Layout::Struct { fields: b }) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((an, al), (bn, bl))| an == bn && al.same_shape(bl))
            }
            (Layout::Tuple { elements: a }, Layout::Tuple { elements: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(al, bl)| al.same_shape(bl))
            }
            (
                Layout::List {
                    element: a,
                    size: n,
                },
                Layout::List {
                    element: b,
                    size: m,
                },
            ) => n == m && a.same_shape(b),
            _ => false,
        }
    }

    /// The tagged JSON representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&JsonLayout::from(self)).expect("layout serialization is infallible")
    }

    /// The tagged JSON representation, as a JSON value.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(JsonLayout::from(self)).expect("layout serialization is infallible")
    }

    /// Parse the tagged JSON representation.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let parsed: JsonLayout = serde_json::from_str(json)
            .map_err(|e| SerializationError::Encoding(format!("layout: {e}")))?;
        Ok(parsed.into())
    }
}

/// The textual face of [`Layout`]: a tagged-union JSON shape,
/// `{"type":"struct","fields":[["a",{"type":"scalar"}]]}`. Only used with
/// JSON (the tagging style is not decodable by the binary section codec).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum JsonLayout {
    Unit,
    Scalar,
    Bool,
    Symbol,
    DateTime {
        #[serde(default = "default_format")]
        format: String,
    },
    Struct { fields: Vec<(String, JsonLayout)> },
    Tuple { elements: Vec<JsonLayout> },
    List { element: Box<JsonLayout>, size: usize },
}

impl From<&Layout> for JsonLayout {
    fn from(layout: &Layout) -> Self {
        match layout {
            Layout::Unit => JsonLayout::Unit,
            Layout::Scalar => JsonLayout::Scalar,
            Layout::Bool => JsonLayout::Bool,
            Layout::Symbol => JsonLayout::Symbol,
            Layout::DateTime { format } => JsonLayout::DateTime {
                format: format.clone(),
            },
            Layout::Struct { fields } => JsonLayout::Struct {
                fields: fields
                    .iter()
                    .map(|(name, layout)| (name.clone(), layout.into()))
                    .collect(),
            },
            Layout::Tuple { elements } => JsonLayout::Tuple {
                elements: elements.iter().map(Into::into).collect(),
            },
            Layout::List { element, size } => JsonLayout::List {
                element: Box::new(element.as_ref().into()),
                size: *size,
            },
        }
    }
}

impl From<JsonLayout> for Layout {
    fn from(layout: JsonLayout) -> Self {
        match layout {
            JsonLayout::Unit => Layout::Unit,
            JsonLayout::Scalar => Layout::Scalar,
            JsonLayout::Bool => Layout::Bool,
            JsonLayout::Symbol => Layout::Symbol,
            JsonLayout::DateTime { format } => Layout::DateTime { format },
            JsonLayout::Struct { fields } => Layout::Struct {
                fields: fields
                    .into_iter()
                    .map(|(name, layout)| (name, layout.into()))
                    .collect(),
            },
            JsonLayout::Tuple { elements } => Layout::Tuple {
                elements: elements.into_iter().map(Into::into).collect(),
            },
            JsonLayout::List { element, size } => Layout::List {
                element: Box::new((*element).into()),
                size,
            },
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Layout::Unit => f.write_str("()"),
            Layout::Scalar => f.write_str("scalar"),
            Layout::Bool => f.write_str("bool"),
            Layout::Symbol => f.write_str("symbol"),
            Layout::DateTime { format } => {
                if format == DEFAULT_DATETIME_FORMAT {
                    f.write_str("datetime")
                } else {
                    write!(f, "datetime<{format}>")
                }
            }
            Layout::Struct { fields } => {
                f.write_str("{")?;
                for (i, (name, layout)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {layout}")?;
                }
                f.write_str("}")
            }
            Layout::Tuple { elements } => {
                f.write_str("(")?;
                for (i, layout) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{layout}")?;
                }
                f.write_str(")")
            }
            Layout::List { element, size } => write!(f, "[{element}; {size}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths() {
        assert_eq!(Layout::Unit.width(), 0);
        assert_eq!(Layout::Scalar.width(), 1);
        assert_eq!(Layout::tensor(&[2, 3]).width(), 6);
        assert_eq!(Layout::list_of(Layout::Scalar, 0).width(), 0);
        let s = Layout::struct_of([
            ("a", Layout::Scalar),
            ("b", Layout::tuple_of([Layout::Bool, Layout::Symbol])),
        ]);
        assert_eq!(s.width(), 3);
    }

    #[test]
    fn json_round_trip() {
        let layouts = [
            Layout::Unit,
            Layout::Scalar,
            Layout::datetime_fmt("%Y-%m-%d"),
            Layout::struct_of([("a", Layout::Scalar), ("b", Layout::list_of(Layout::Bool, 2))]),
            Layout::tuple_of([Layout::Symbol, Layout::Scalar]),
        ];
        for layout in layouts {
            let round = Layout::from_json(&layout.to_json()).unwrap();
            assert_eq!(round, layout);
        }
    }

    #[test]
    fn struct_json_shape() {
        let s = Layout::struct_of([("result", Layout::Scalar)]);
        assert_eq!(
            s.to_json(),
            r#"{"type":"struct","fields":[["result",{"type":"scalar"}]]}"#
        );
    }

    #[test]
    fn field_order_is_preserved() {
        let json = r#"{"type":"struct","fields":[["b",{"type":"scalar"}],["a",{"type":"bool"}]]}"#;
        let layout = Layout::from_json(json).unwrap();
        assert_eq!(layout.to_json(), json);
        assert_eq!(layout.leaf_types(), vec![Type::Float, Type::Bool]);
    }

    #[test]
    fn shape_ignores_datetime_format() {
        assert!(Layout::datetime().same_shape(&Layout::datetime_fmt("%Y")));
        assert!(!Layout::datetime().same_shape(&Layout::Scalar));
    }
}
