//! The closed set of graph operations.
//!
//! Every node carries one [`Op`]. Operand types are checked the moment a
//! node is appended; [`Op::result_type`] is that check. Ops over constant
//! operands can be evaluated host-side through [`Op::fold`], which is what
//! the compiler's constant-folding pass uses.

use serde_derive::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::types::Type;
use crate::value::{DateTimeField, datetime_field};

/// An immediate constant payload.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Scalar(f64),
    Bool(bool),
    /// An interned symbol id.
    Symbol(u64),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
}

impl Const {
    pub fn ty(&self) -> Type {
        match self {
            Const::Scalar(_) => Type::Float,
            Const::Bool(_) => Type::Bool,
            Const::Symbol(_) => Type::Symbol,
            Const::DateTime(_) => Type::DateTime,
        }
    }
}

/// Unary operations over scalars.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarUnary {
    Neg,
    Abs,
    Sqrt,
    Exp,
    /// Natural logarithm.
    Ln,
    /// Base-10 logarithm.
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Floor,
    Ceil,
    /// Round half away from zero.
    Round,
}

impl ScalarUnary {
    pub(crate) fn apply(self, x: f64) -> f64 {
        match self {
            ScalarUnary::Neg => -x,
            ScalarUnary::Abs => x.abs(),
            ScalarUnary::Sqrt => x.sqrt(),
            ScalarUnary::Exp => x.exp(),
            ScalarUnary::Ln => x.ln(),
            ScalarUnary::Log => x.log10(),
            ScalarUnary::Sin => x.sin(),
            ScalarUnary::Cos => x.cos(),
            ScalarUnary::Tan => x.tan(),
            ScalarUnary::Asin => x.asin(),
            ScalarUnary::Acos => x.acos(),
            ScalarUnary::Atan => x.atan(),
            ScalarUnary::Floor => x.floor(),
            ScalarUnary::Ceil => x.ceil(),
            ScalarUnary::Round => x.round(),
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ScalarUnary::Neg => "neg",
            ScalarUnary::Abs => "abs",
            ScalarUnary::Sqrt => "sqrt",
            ScalarUnary::Exp => "exp",
            ScalarUnary::Ln => "ln",
            ScalarUnary::Log => "log",
            ScalarUnary::Sin => "sin",
            ScalarUnary::Cos => "cos",
            ScalarUnary::Tan => "tan",
            ScalarUnary::Asin => "asin",
            ScalarUnary::Acos => "acos",
            ScalarUnary::Atan => "atan",
            ScalarUnary::Floor => "floor",
            ScalarUnary::Ceil => "ceil",
            ScalarUnary::Round => "round",
        }
    }
}

/// Predicates over scalars.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarTest {
    IsNan,
    IsFinite,
    IsInfinite,
}

impl ScalarTest {
    pub(crate) fn apply(self, x: f64) -> bool {
        match self {
            ScalarTest::IsNan => x.is_nan(),
            ScalarTest::IsFinite => x.is_finite(),
            ScalarTest::IsInfinite => x.is_infinite(),
        }
    }
}

/// Binary operations over scalars.
///
/// `Min` and `Max` follow IEEE-754 minNum/maxNum: when exactly one operand
/// is NaN the other operand is returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarBinary {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Atan2,
    Min,
    Max,
}

impl ScalarBinary {
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ScalarBinary::Add => a + b,
            ScalarBinary::Sub => a - b,
            ScalarBinary::Mul => a * b,
            ScalarBinary::Div => a / b,
            ScalarBinary::Rem => a % b,
            ScalarBinary::Pow => a.powf(b),
            ScalarBinary::Atan2 => a.atan2(b),
            ScalarBinary::Min => a.min(b),
            ScalarBinary::Max => a.max(b),
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ScalarBinary::Add => "add",
            ScalarBinary::Sub => "sub",
            ScalarBinary::Mul => "mul",
            ScalarBinary::Div => "div",
            ScalarBinary::Rem => "rem",
            ScalarBinary::Pow => "pow",
            ScalarBinary::Atan2 => "atan2",
            ScalarBinary::Min => "min",
            ScalarBinary::Max => "max",
        }
    }
}

/// Scalar comparisons. NaN compares false against everything except through
/// `Ne`, per IEEE-754.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub(crate) fn apply(self, a: f64, b: f64) -> bool {
        match self {
            Comparison::Eq => a == b,
            Comparison::Ne => a != b,
            Comparison::Lt => a < b,
            Comparison::Le => a <= b,
            Comparison::Gt => a > b,
            Comparison::Ge => a >= b,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
        }
    }
}

/// Boolean connectives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolBinary {
    And,
    Or,
    Xor,
}

impl BoolBinary {
    pub(crate) fn apply(self, a: bool, b: bool) -> bool {
        match self {
            BoolBinary::And => a & b,
            BoolBinary::Or => a | b,
            BoolBinary::Xor => a ^ b,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            BoolBinary::And => "and",
            BoolBinary::Or => "or",
            BoolBinary::Xor => "xor",
        }
    }
}

/// A graph operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Reads word `slot` of the input buffer.
    Input { slot: u32, ty: Type },
    Const(Const),
    ScalarUnary(ScalarUnary),
    ScalarTest(ScalarTest),
    ScalarBinary(ScalarBinary),
    Compare(Comparison),
    /// Symbol equality by id.
    SymbolEq,
    SymbolNe,
    BoolBinary(BoolBinary),
    Not,
    /// `choose(cond, then, else)`: the graph-level ternary. Both branches
    /// must share a type, which is also the result type.
    Choose,
    /// Aborts the call with the message at `message` in the graph's
    /// assertion table when the operand is false. Produces no usable value.
    Assert { message: u32 },
    /// Seconds-since-epoch scalar to datetime.
    FromTimestamp,
    /// Datetime to seconds-since-epoch scalar.
    Timestamp,
    /// Calendar field extraction.
    Extract(DateTimeField),
    /// Parse a symbol with the format string interned at `format`.
    ParseDateTime { format: u64 },
    /// Render a datetime with the format string interned at `format`,
    /// producing a (dynamic) symbol.
    FormatDateTime { format: u64 },
    /// `operands = [index, e_0, ..., e_{len-1}]`: select element
    /// `trunc(index)` with a bounds check.
    ListGet { len: u32 },
    /// Mapping lookup; operands are the flattened key. Produces a pointer
    /// to the value words. A missing key aborts the call.
    MapGet {
        mapping: u32,
        key_width: u32,
        value_width: u32,
    },
    /// Mapping lookup with default; operands are the flattened key followed
    /// by the flattened default value.
    MapGetOr {
        mapping: u32,
        key_width: u32,
        value_width: u32,
    },
    /// Invoke a resource method; operands are the flattened input.
    ResourceCall {
        resource: u32,
        method: u32,
        input_width: u32,
        output_width: u32,
    },
    /// Invoke an embedded sub-graph; operands are the flattened arguments.
    CallGraph {
        subgraph: u32,
        input_width: u32,
        output_width: u32,
    },
    /// Read word `offset` of the buffer behind a pointer-typed operand.
    LoadSlot { offset: u32, ty: Type },
}

impl Op {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Const(_) => "const",
            Op::ScalarUnary(op) => op.name(),
            Op::ScalarTest(ScalarTest::IsNan) => "is_nan",
            Op::ScalarTest(ScalarTest::IsFinite) => "is_finite",
            Op::ScalarTest(ScalarTest::IsInfinite) => "is_infinite",
            Op::ScalarBinary(op) => op.name(),
            Op::Compare(op) => op.name(),
            Op::SymbolEq => "sym_eq",
            Op::SymbolNe => "sym_ne",
            Op::BoolBinary(op) => op.name(),
            Op::Not => "not",
            Op::Choose => "choose",
            Op::Assert { .. } => "assert",
            Op::FromTimestamp => "fromtimestamp",
            Op::Timestamp => "timestamp",
            Op::Extract(field) => field.name(),
            Op::ParseDateTime { .. } => "parse_datetime",
            Op::FormatDateTime { .. } => "format_datetime",
            Op::ListGet { .. } => "list_get",
            Op::MapGet { .. } => "map_get",
            Op::MapGetOr { .. } => "map_get_or",
            Op::ResourceCall { .. } => "resource_call",
            Op::CallGraph { .. } => "call_graph",
            Op::LoadSlot { .. } => "load",
        }
    }

    /// Check operand types and arity, returning the result type.
    ///
    /// Container operations (`MapGet`, `ResourceCall`, ...) check widths
    /// here; the precise leaf types of their flattened operands are checked
    /// by the builder against the relevant layouts, which live on the graph.
    pub(crate) fn result_type(&self, operands: &[Type]) -> Result<Type, BuildError> {
        let want = |position: usize, expected: Type| -> Result<(), BuildError> {
            let got = operands[position];
            if got == expected {
                Ok(())
            } else {
                Err(BuildError::TypeMismatch {
                    op: self.name(),
                    position,
                    expected,
                    got,
                })
            }
        };
        let arity = |expected: usize| -> Result<(), BuildError> {
            if operands.len() == expected {
                Ok(())
            } else {
                Err(BuildError::ArityMismatch {
                    op: self.name(),
                    expected,
                    got: operands.len(),
                })
            }
        };

        match self {
            Op::Input { ty, .. } => {
                arity(0)?;
                Ok(*ty)
            }
            Op::Const(c) => {
                arity(0)?;
                Ok(c.ty())
            }
            Op::ScalarUnary(_) => {
                arity(1)?;
                want(0, Type::Float)?;
                Ok(Type::Float)
            }
            Op::ScalarTest(_) => {
                arity(1)?;
                want(0, Type::Float)?;
                Ok(Type::Bool)
            }
            Op::ScalarBinary(_) => {
                arity(2)?;
                want(0, Type::Float)?;
                want(1, Type::Float)?;
                Ok(Type::Float)
            }
            Op::Compare(_) => {
                arity(2)?;
                want(0, Type::Float)?;
                want(1, Type::Float)?;
                Ok(Type::Bool)
            }
            Op::SymbolEq | Op::SymbolNe => {
                arity(2)?;
                want(0, Type::Symbol)?;
                want(1, Type::Symbol)?;
                Ok(Type::Bool)
            }
            Op::BoolBinary(_) => {
                arity(2)?;
                want(0, Type::Bool)?;
                want(1, Type::Bool)?;
                Ok(Type::Bool)
            }
            Op::Not => {
                arity(1)?;
                want(0, Type::Bool)?;
                Ok(Type::Bool)
            }
            Op::Choose => {
                arity(3)?;
                want(0, Type::Bool)?;
                let then = operands[1];
                if then == Type::Ptr {
                    return Err(BuildError::TypeMismatch {
                        op: self.name(),
                        position: 1,
                        expected: Type::Float,
                        got: then,
                    });
                }
                want(2, then)?;
                Ok(then)
            }
            Op::Assert { .. } => {
                arity(1)?;
                want(0, Type::Bool)?;
                Ok(Type::Bool)
            }
            Op::FromTimestamp => {
                arity(1)?;
                want(0, Type::Float)?;
                Ok(Type::DateTime)
            }
            Op::Timestamp => {
                arity(1)?;
                want(0, Type::DateTime)?;
                Ok(Type::Float)
            }
            Op::Extract(_) => {
                arity(1)?;
                want(0, Type::DateTime)?;
                Ok(Type::Float)
            }
            Op::ParseDateTime { .. } => {
                arity(1)?;
                want(0, Type::Symbol)?;
                Ok(Type::DateTime)
            }
            Op::FormatDateTime { .. } => {
                arity(1)?;
                want(0, Type::DateTime)?;
                Ok(Type::Symbol)
            }
            Op::ListGet { len } => {
                arity(*len as usize + 1)?;
                want(0, Type::Float)?;
                if *len == 0 {
                    return Err(BuildError::EmptyFold { op: "list_get" });
                }
                let element = operands[1];
                if element == Type::Ptr {
                    return Err(BuildError::TypeMismatch {
                        op: self.name(),
                        position: 1,
                        expected: Type::Float,
                        got: element,
                    });
                }
                for position in 2..operands.len() {
                    want(position, element)?;
                }
                Ok(element)
            }
            Op::MapGet { key_width, .. } => {
                arity(*key_width as usize)?;
                Ok(Type::Ptr)
            }
            Op::MapGetOr {
                key_width,
                value_width,
                ..
            } => {
                arity((*key_width + *value_width) as usize)?;
                Ok(Type::Ptr)
            }
            Op::ResourceCall { input_width, .. } => {
                arity(*input_width as usize)?;
                Ok(Type::Ptr)
            }
            Op::CallGraph { input_width, .. } => {
                arity(*input_width as usize)?;
                Ok(Type::Ptr)
            }
            Op::LoadSlot { ty, .. } => {
                arity(1)?;
                want(0, Type::Ptr)?;
                Ok(*ty)
            }
        }
    }

    /// Evaluate the operation over constant operands. `None` means the
    /// operation is not evaluated at build time (containers, fallible
    /// datetime text conversions, selections — `choose` and `assert` fold
    /// structurally in the compiler instead).
    pub(crate) fn fold(&self, args: &[Const]) -> Option<Const> {
        match (self, args) {
            (Op::ScalarUnary(op), [Const::Scalar(x)]) => Some(Const::Scalar(op.apply(*x))),
            (Op::ScalarTest(op), [Const::Scalar(x)]) => Some(Const::Bool(op.apply(*x))),
            (Op::ScalarBinary(op), [Const::Scalar(a), Const::Scalar(b)]) => {
                Some(Const::Scalar(op.apply(*a, *b)))
            }
            (Op::Compare(op), [Const::Scalar(a), Const::Scalar(b)]) => {
                Some(Const::Bool(op.apply(*a, *b)))
            }
            (Op::SymbolEq, [Const::Symbol(a), Const::Symbol(b)]) => Some(Const::Bool(a == b)),
            (Op::SymbolNe, [Const::Symbol(a), Const::Symbol(b)]) => Some(Const::Bool(a != b)),
            (Op::BoolBinary(op), [Const::Bool(a), Const::Bool(b)]) => {
                Some(Const::Bool(op.apply(*a, *b)))
            }
            (Op::Not, [Const::Bool(a)]) => Some(Const::Bool(!a)),
            (Op::FromTimestamp, [Const::Scalar(secs)]) => {
                Some(Const::DateTime((secs * 1e6) as i64))
            }
            (Op::Timestamp, [Const::DateTime(micros)]) => {
                Some(Const::Scalar(*micros as f64 / 1e6))
            }
            (Op::Extract(field), [Const::DateTime(micros)]) => {
                Some(Const::Scalar(datetime_field(*micros, *field)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_checked() {
        assert_eq!(
            Op::ScalarBinary(ScalarBinary::Add)
                .result_type(&[Type::Float, Type::Float])
                .unwrap(),
            Type::Float
        );
        let err = Op::ScalarBinary(ScalarBinary::Add)
            .result_type(&[Type::Float, Type::Bool])
            .unwrap_err();
        assert!(err.to_string().contains("operand 1 is bool"));
        assert!(
            Op::Choose
                .result_type(&[Type::Bool, Type::Symbol, Type::Float])
                .is_err()
        );
        assert_eq!(
            Op::Choose
                .result_type(&[Type::Bool, Type::Symbol, Type::Symbol])
                .unwrap(),
            Type::Symbol
        );
    }

    #[test]
    fn folding_matches_host_math() {
        let two = Const::Scalar(2.0);
        let nan = Const::Scalar(f64::NAN);
        assert_eq!(
            Op::ScalarBinary(ScalarBinary::Pow).fold(&[two, Const::Scalar(10.0)]),
            Some(Const::Scalar(1024.0))
        );
        // minNum semantics: one-sided NaN yields the other operand.
        assert_eq!(
            Op::ScalarBinary(ScalarBinary::Min).fold(&[nan, two]),
            Some(Const::Scalar(2.0))
        );
        assert_eq!(
            Op::Compare(Comparison::Eq).fold(&[nan, nan]),
            Some(Const::Bool(false))
        );
        assert_eq!(Op::Choose.fold(&[Const::Bool(true), two, two]), None);
    }
}
