//! Primitive type tags carried by graph nodes and references.

use core::fmt;
use serde_derive::{Deserialize, Serialize};

/// The type of a single graph value.
///
/// Every node produces exactly one value of one of these types. `Ptr` is
/// internal: it tags nodes that produce the address of a multi-word result
/// buffer (mapping lookups, resource calls, sub-graph calls) and never
/// appears in a layout or crosses the public builder surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// An IEEE-754 double.
    Float,
    /// A boolean, stored as 0 or 1 in a 64-bit word.
    Bool,
    /// An interned symbol id.
    Symbol,
    /// Microseconds since the Unix epoch, as a signed 64-bit integer.
    DateTime,
    /// Address of a multi-word result buffer. Internal.
    Ptr,
}

impl Type {
    /// Short lowercase name used in error messages and renderings.
    pub fn name(self) -> &'static str {
        match self {
            Type::Float => "scalar",
            Type::Bool => "bool",
            Type::Symbol => "symbol",
            Type::DateTime => "datetime",
            Type::Ptr => "ptr",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
