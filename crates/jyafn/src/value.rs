//! Host-side values and their codecs.
//!
//! A [`Value`] is the host-native form of anything a layout can describe. It
//! exists on both sides of a call: arguments are encoded against the input
//! layout into a flat word buffer, results are decoded from the output buffer
//! against the output layout. A JSON codec sits on top so callers can pass
//! and receive plain JSON strings.
//!
//! All codec errors carry the layout path of the offending leaf, e.g.
//! `.a.b[3]: expected scalar, got bool`.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::InvocationError;
use crate::layout::{DEFAULT_DATETIME_FORMAT, Layout};
use crate::symbols::{DYNAMIC_SYMBOL_BIT, SymbolTable};

/// A host-native structured value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Unit,
    Scalar(f64),
    Bool(bool),
    Symbol(String),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
    List(Vec<Value>),
    Struct(Vec<(String, Value)>),
    Tuple(Vec<Value>),
}

impl Value {
    /// A struct value from named fields, preserving order.
    pub fn struct_of<N: Into<String>>(fields: impl IntoIterator<Item = (N, Value)>) -> Self {
        Value::Struct(fields.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Scalar(_) => "scalar",
            Value::Bool(_) => "bool",
            Value::Symbol(_) => "symbol",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Tuple(_) => "tuple",
        }
    }

    /// Convenience accessor for scalar results.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    /// Convenience accessor for struct fields.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Convenience accessor for tuple and list elements.
    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Value::List(items) | Value::Tuple(items) => items.get(index),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Symbol(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Symbol(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::DateTime(t.timestamp_micros())
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Parse a datetime string with a `chrono` format, yielding microseconds
/// since the epoch. Accepts, in order: zoned formats (when the format names a
/// timezone), naive datetimes, bare dates (midnight), and — for the default
/// format — an RFC 3339 fallback so zoned ISO-8601 inputs keep working.
pub(crate) fn parse_datetime(text: &str, format: &str) -> Result<i64, String> {
    if format.contains("%z") || format.contains("%:z") || format.contains("%#z") {
        if let Ok(t) = DateTime::parse_from_str(text, format) {
            return Ok(t.timestamp_micros());
        }
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
        return Ok(t.and_utc().timestamp_micros());
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, format) {
        return Ok(d
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc()
            .timestamp_micros());
    }
    if format == DEFAULT_DATETIME_FORMAT {
        if let Ok(t) = DateTime::parse_from_rfc3339(text) {
            return Ok(t.timestamp_micros());
        }
    }
    Err(format!("`{text}` does not match datetime format `{format}`"))
}

/// Render microseconds since the epoch with a `chrono` format.
pub(crate) fn format_datetime(micros: i64, format: &str) -> Result<String, String> {
    let t = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| format!("timestamp {micros}us is out of range"))?;
    let mut out = String::new();
    use std::fmt::Write;
    write!(out, "{}", t.format(format))
        .map_err(|_| format!("invalid datetime format `{format}`"))?;
    Ok(out)
}

/// Extract a calendar field from microseconds since the epoch.
pub(crate) fn datetime_field(micros: i64, field: DateTimeField) -> f64 {
    let Some(t) = DateTime::<Utc>::from_timestamp_micros(micros) else {
        return f64::NAN;
    };
    match field {
        DateTimeField::Year => t.year() as f64,
        DateTimeField::Month => t.month() as f64,
        DateTimeField::Day => t.day() as f64,
        DateTimeField::Hour => t.hour() as f64,
        DateTimeField::Minute => t.minute() as f64,
        DateTimeField::Second => t.second() as f64,
        DateTimeField::Microsecond => t.timestamp_subsec_micros() as f64,
    }
}

/// A calendar field extractable from a datetime.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize,
)]
pub enum DateTimeField {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Microsecond,
}

impl DateTimeField {
    pub(crate) fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => DateTimeField::Year,
            1 => DateTimeField::Month,
            2 => DateTimeField::Day,
            3 => DateTimeField::Hour,
            4 => DateTimeField::Minute,
            5 => DateTimeField::Second,
            6 => DateTimeField::Microsecond,
            _ => return None,
        })
    }

    pub(crate) fn code(self) -> u64 {
        match self {
            DateTimeField::Year => 0,
            DateTimeField::Month => 1,
            DateTimeField::Day => 2,
            DateTimeField::Hour => 3,
            DateTimeField::Minute => 4,
            DateTimeField::Second => 5,
            DateTimeField::Microsecond => 6,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            DateTimeField::Year => "year",
            DateTimeField::Month => "month",
            DateTimeField::Day => "day",
            DateTimeField::Hour => "hour",
            DateTimeField::Minute => "minute",
            DateTimeField::Second => "second",
            DateTimeField::Microsecond => "microsecond",
        }
    }
}

/// Intern every symbol occurring in `value` into `symbols`.
pub(crate) fn intern_symbols(value: &Value, symbols: &mut SymbolTable) {
    match value {
        Value::Symbol(s) => {
            symbols.intern(s);
        }
        Value::List(items) | Value::Tuple(items) => {
            for item in items {
                intern_symbols(item, symbols);
            }
        }
        Value::Struct(fields) => {
            for (_, item) in fields {
                intern_symbols(item, symbols);
            }
        }
        _ => {}
    }
}

fn mismatch(path: &str, expected: &Layout, got: &Value) -> InvocationError {
    InvocationError::InputEncoding {
        path: if path.is_empty() { ".".into() } else { path.into() },
        message: format!("expected {expected}, got {}", got.kind()),
    }
}

/// Encode `value` against `layout`, appending `layout.width()` words to
/// `out`. Symbols missing from `symbols` are interned into `dynamic` and
/// encoded as per-call dynamic ids.
pub(crate) fn encode_value(
    value: &Value,
    layout: &Layout,
    out: &mut Vec<u64>,
    symbols: &SymbolTable,
    dynamic: &mut Vec<String>,
    path: &mut String,
) -> Result<(), InvocationError> {
    match (layout, value) {
        (Layout::Unit, Value::Unit) => Ok(()),
        (Layout::Scalar, Value::Scalar(x)) => {
            out.push(x.to_bits());
            Ok(())
        }
        (Layout::Bool, Value::Bool(b)) => {
            out.push(*b as u64);
            Ok(())
        }
        (Layout::Symbol, Value::Symbol(s)) => {
            let id = match symbols.get(s) {
                Some(id) => id,
                None => match dynamic.iter().position(|d| d == s) {
                    Some(i) => DYNAMIC_SYMBOL_BIT | i as u64,
                    None => {
                        dynamic.push(s.clone());
                        DYNAMIC_SYMBOL_BIT | (dynamic.len() - 1) as u64
                    }
                },
            };
            out.push(id);
            Ok(())
        }
        (Layout::DateTime { .. }, Value::DateTime(micros)) => {
            out.push(*micros as u64);
            Ok(())
        }
        (Layout::Struct { fields }, Value::Struct(values)) => {
            for (name, field_layout) in fields {
                let value = values
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| InvocationError::InputEncoding {
                        path: path.clone(),
                        message: format!("missing field `{name}`"),
                    })?;
                let len = path.len();
                path.push('.');
                path.push_str(name);
                encode_value(value, field_layout, out, symbols, dynamic, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (Layout::Tuple { elements }, Value::Tuple(values)) if elements.len() == values.len() => {
            for (i, (element, value)) in elements.iter().zip(values).enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                encode_value(value, element, out, symbols, dynamic, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (Layout::List { element, size }, Value::List(values)) => {
            if values.len() != *size {
                return Err(InvocationError::InputEncoding {
                    path: path.clone(),
                    message: format!("expected {size} elements, got {}", values.len()),
                });
            }
            for (i, value) in values.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                encode_value(value, element, out, symbols, dynamic, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (layout, value) => Err(mismatch(path, layout, value)),
    }
}

/// Decode `layout.width()` words into a [`Value`], consuming from the front
/// of `words`.
pub(crate) fn decode_value(
    words: &mut &[u64],
    layout: &Layout,
    symbols: &SymbolTable,
    dynamic: &[String],
    path: &mut String,
) -> Result<Value, InvocationError> {
    let mut take = || -> Result<u64, InvocationError> {
        let (first, rest) = words.split_first().ok_or(InvocationError::OutputDecoding {
            path: path_or_root(path),
            message: "output buffer exhausted".into(),
        })?;
        *words = rest;
        Ok(*first)
    };
    match layout {
        Layout::Unit => Ok(Value::Unit),
        Layout::Scalar => Ok(Value::Scalar(f64::from_bits(take()?))),
        Layout::Bool => Ok(Value::Bool(take()? != 0)),
        Layout::Symbol => {
            let id = take()?;
            let text = if id & DYNAMIC_SYMBOL_BIT != 0 {
                dynamic.get((id & !DYNAMIC_SYMBOL_BIT) as usize).cloned()
            } else {
                symbols.text(id).map(str::to_string)
            };
            text.map(Value::Symbol)
                .ok_or_else(|| InvocationError::OutputDecoding {
                    path: path_or_root(path),
                    message: format!("unknown symbol id {id:#x}"),
                })
        }
        Layout::DateTime { .. } => Ok(Value::DateTime(take()? as i64)),
        Layout::Struct { fields } => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, field_layout) in fields {
                let len = path.len();
                path.push('.');
                path.push_str(name);
                let value = decode_value(words, field_layout, symbols, dynamic, path)?;
                path.truncate(len);
                out.push((name.clone(), value));
            }
            Ok(Value::Struct(out))
        }
        Layout::Tuple { elements } => {
            let mut out = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                out.push(decode_value(words, element, symbols, dynamic, path)?);
                path.truncate(len);
            }
            Ok(Value::Tuple(out))
        }
        Layout::List { element, size } => {
            let mut out = Vec::with_capacity(*size);
            for i in 0..*size {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                out.push(decode_value(words, element, symbols, dynamic, path)?);
                path.truncate(len);
            }
            Ok(Value::List(out))
        }
    }
}

fn path_or_root(path: &str) -> String {
    if path.is_empty() {
        ".".into()
    } else {
        path.into()
    }
}

impl Value {
    /// Convert a JSON value into a [`Value`], guided by `layout` (JSON alone
    /// cannot distinguish symbols from datetimes from plain strings).
    pub fn from_json(json: &serde_json::Value, layout: &Layout) -> Result<Self, InvocationError> {
        let mut path = String::new();
        Self::from_json_inner(json, layout, &mut path)
    }

    fn from_json_inner(
        json: &serde_json::Value,
        layout: &Layout,
        path: &mut String,
    ) -> Result<Self, InvocationError> {
        use serde_json::Value as Json;
        let bad = |expected: &str, got: &Json| InvocationError::InputEncoding {
            path: path_or_root(path),
            message: format!("expected {expected}, got JSON {got}"),
        };
        match (layout, json) {
            (Layout::Unit, Json::Null) => Ok(Value::Unit),
            (Layout::Scalar, Json::Number(n)) => n
                .as_f64()
                .map(Value::Scalar)
                .ok_or_else(|| bad("scalar", json)),
            (Layout::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (Layout::Symbol, Json::String(s)) => Ok(Value::Symbol(s.clone())),
            (Layout::DateTime { format }, Json::String(s)) => parse_datetime(s, format)
                .map(Value::DateTime)
                .map_err(|message| InvocationError::InputEncoding {
                    path: path_or_root(path),
                    message,
                }),
            (Layout::Struct { fields }, Json::Object(object)) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, field_layout) in fields {
                    let field = object.get(name).ok_or_else(|| {
                        InvocationError::InputEncoding {
                            path: path_or_root(path),
                            message: format!("missing field `{name}`"),
                        }
                    })?;
                    let len = path.len();
                    path.push('.');
                    path.push_str(name);
                    out.push((name.clone(), Self::from_json_inner(field, field_layout, path)?));
                    path.truncate(len);
                }
                Ok(Value::Struct(out))
            }
            (Layout::Tuple { elements }, Json::Array(items)) if elements.len() == items.len() => {
                let mut out = Vec::with_capacity(items.len());
                for (i, (item, element)) in items.iter().zip(elements).enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    out.push(Self::from_json_inner(item, element, path)?);
                    path.truncate(len);
                }
                Ok(Value::Tuple(out))
            }
            (Layout::List { element, size }, Json::Array(items)) => {
                if items.len() != *size {
                    return Err(InvocationError::InputEncoding {
                        path: path_or_root(path),
                        message: format!("expected {size} elements, got {}", items.len()),
                    });
                }
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    out.push(Self::from_json_inner(item, element, path)?);
                    path.truncate(len);
                }
                Ok(Value::List(out))
            }
            _ => Err(bad(&layout.to_string(), json)),
        }
    }

    /// Convert into a JSON value, guided by `layout` (datetime rendering
    /// needs the layout's format string).
    pub fn to_json(&self, layout: &Layout) -> Result<serde_json::Value, InvocationError> {
        use serde_json::Value as Json;
        match (layout, self) {
            (Layout::Unit, Value::Unit) => Ok(Json::Null),
            (Layout::Scalar, Value::Scalar(x)) => Ok(serde_json::Number::from_f64(*x)
                .map(Json::Number)
                .unwrap_or(Json::Null)),
            (Layout::Bool, Value::Bool(b)) => Ok(Json::Bool(*b)),
            (Layout::Symbol, Value::Symbol(s)) => Ok(Json::String(s.clone())),
            (Layout::DateTime { format }, Value::DateTime(micros)) => {
                format_datetime(*micros, format)
                    .map(Json::String)
                    .map_err(|message| InvocationError::OutputDecoding {
                        path: ".".into(),
                        message,
                    })
            }
            (Layout::Struct { fields }, Value::Struct(values)) => {
                let mut object = serde_json::Map::new();
                for ((name, field_layout), (_, value)) in fields.iter().zip(values) {
                    object.insert(name.clone(), value.to_json(field_layout)?);
                }
                Ok(Json::Object(object))
            }
            (Layout::Tuple { elements }, Value::Tuple(values)) => Ok(Json::Array(
                elements
                    .iter()
                    .zip(values)
                    .map(|(l, v)| v.to_json(l))
                    .collect::<Result<_, _>>()?,
            )),
            (Layout::List { element, .. }, Value::List(values)) => Ok(Json::Array(
                values
                    .iter()
                    .map(|v| v.to_json(element))
                    .collect::<Result<_, _>>()?,
            )),
            (layout, value) => Err(InvocationError::OutputDecoding {
                path: ".".into(),
                message: format!("expected {layout}, got {}", value.kind()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, layout: Layout) {
        let mut symbols = SymbolTable::new();
        symbols.intern("on");
        symbols.intern("off");
        let mut dynamic = Vec::new();
        let mut words = Vec::new();
        let mut path = String::new();
        encode_value(&value, &layout, &mut words, &symbols, &mut dynamic, &mut path).unwrap();
        assert_eq!(words.len(), layout.width());
        let mut slice = words.as_slice();
        let decoded = decode_value(&mut slice, &layout, &symbols, &dynamic, &mut path).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, value);
    }

    #[test]
    fn encode_decode_round_trips() {
        round_trip(Value::Scalar(2.5), Layout::Scalar);
        round_trip(Value::Bool(true), Layout::Bool);
        round_trip(Value::Symbol("on".into()), Layout::Symbol);
        round_trip(Value::DateTime(1_234_567), Layout::datetime());
        round_trip(
            Value::struct_of([
                ("a", Value::Scalar(1.0)),
                ("b", Value::Tuple(vec![Value::Bool(false), Value::Symbol("off".into())])),
            ]),
            Layout::struct_of([
                ("a", Layout::Scalar),
                ("b", Layout::tuple_of([Layout::Bool, Layout::Symbol])),
            ]),
        );
        round_trip(Value::List(vec![]), Layout::list_of(Layout::Scalar, 0));
    }

    #[test]
    fn unknown_symbols_become_dynamic() {
        let symbols = SymbolTable::new();
        let mut dynamic = Vec::new();
        let mut words = Vec::new();
        let mut path = String::new();
        encode_value(
            &Value::Symbol("novel".into()),
            &Layout::Symbol,
            &mut words,
            &symbols,
            &mut dynamic,
            &mut path,
        )
        .unwrap();
        assert_eq!(words[0], DYNAMIC_SYMBOL_BIT);
        assert_eq!(dynamic, vec!["novel".to_string()]);
    }

    #[test]
    fn errors_carry_layout_paths() {
        let layout = Layout::struct_of([(
            "a",
            Layout::struct_of([("b", Layout::list_of(Layout::Scalar, 4))]),
        )]);
        let value = Value::struct_of([(
            "a",
            Value::struct_of([(
                "b",
                Value::List(vec![
                    Value::Scalar(0.0),
                    Value::Scalar(1.0),
                    Value::Scalar(2.0),
                    Value::Bool(true),
                ]),
            )]),
        )]);
        let mut words = Vec::new();
        let mut path = String::new();
        let err = encode_value(
            &value,
            &layout,
            &mut words,
            &SymbolTable::new(),
            &mut Vec::new(),
            &mut path,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(".a.b[3]"), "{message}");
        assert!(message.contains("expected scalar, got bool"), "{message}");
    }

    #[test]
    fn tuple_encoding_is_flat() {
        let layout = Layout::tuple_of([Layout::Scalar, Layout::Scalar]);
        let value = Value::Tuple(vec![Value::Scalar(1.0), Value::Scalar(3.0)]);
        let mut words = Vec::new();
        let mut path = String::new();
        encode_value(
            &value,
            &layout,
            &mut words,
            &SymbolTable::new(),
            &mut Vec::new(),
            &mut path,
        )
        .unwrap();
        assert_eq!(words, vec![1.0f64.to_bits(), 3.0f64.to_bits()]);
    }

    #[test]
    fn datetime_parse_and_format() {
        let micros = parse_datetime("2024-05-14T12:00:00.250", DEFAULT_DATETIME_FORMAT).unwrap();
        assert_eq!(micros % 1_000_000, 250_000);
        let text = format_datetime(micros, "%Y-%m-%d").unwrap();
        assert_eq!(text, "2024-05-14");
        let date_only = parse_datetime("2024-05-14", "%Y-%m-%d").unwrap();
        assert_eq!(datetime_field(date_only, DateTimeField::Hour), 0.0);
        assert!(parse_datetime("not a date", DEFAULT_DATETIME_FORMAT).is_err());
        // RFC 3339 fallback for zoned inputs against the default format.
        assert!(parse_datetime("2024-05-14T12:00:00.250+02:00", DEFAULT_DATETIME_FORMAT).is_ok());
    }
}
