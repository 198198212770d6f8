//! Value marshalling between the engine and Rust
//!
//! [`Value`] is the closed union of the engine's five storage classes. Values
//! travel into the engine as bound parameters and function results, and out
//! of it as column reads and function arguments. All conversions are explicit
//! about narrowing: integers are range-checked, floats never silently become
//! integers.

use super::engine::Bindings;
use super::error::{Error, Result};
use libsqlite3_sys as ffi;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::os::raw::c_int;
use thiserror::Error;

/// Storage class of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Integer => "integer",
            ValueType::Real => "real",
            ValueType::Text => "text",
            ValueType::Blob => "blob",
        }
    }

    fn from_raw(kind: c_int) -> Self {
        match kind {
            ffi::SQLITE_INTEGER => ValueType::Integer,
            ffi::SQLITE_FLOAT => ValueType::Real,
            ffi::SQLITE_TEXT => ValueType::Text,
            ffi::SQLITE_BLOB => ValueType::Blob,
            _ => ValueType::Null,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An owned engine value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A borrowed engine value, valid only until the statement advances
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Real(f64),
    /// Raw text bytes as stored; usually UTF-8
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Real(_) => ValueType::Real,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_ref(&self) -> ValueRef<'_> {
        match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(f) => ValueRef::Real(*f),
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        }
    }

    /// Convert into a Rust type with the same rules as column reads
    pub fn get<T: FromValue>(&self) -> std::result::Result<T, FromValueError> {
        T::from_value(self.as_ref())
    }
}

impl<'a> ValueRef<'a> {
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueRef::Null => ValueType::Null,
            ValueRef::Integer(_) => ValueType::Integer,
            ValueRef::Real(_) => ValueType::Real,
            ValueRef::Text(_) => ValueType::Text,
            ValueRef::Blob(_) => ValueType::Blob,
        }
    }

    /// Text as `&str`, replacing invalid UTF-8 when needed
    pub fn as_str(&self) -> Option<Cow<'a, str>> {
        match *self {
            ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl<'a> From<ValueRef<'a>> for Value {
    fn from(value: ValueRef<'a>) -> Self {
        value.to_value()
    }
}

/// Failure converting an engine value into a Rust type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FromValueError {
    #[error("value has type {found}, expected {expected}")]
    InvalidType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("integer {0} does not fit the requested type")]
    OutOfRange(i128),
}

impl FromValueError {
    fn invalid(expected: &'static str, found: ValueRef<'_>) -> Self {
        FromValueError::InvalidType {
            expected,
            found: found.value_type().name(),
        }
    }

    /// Attach the column index the failing value was read from
    pub fn at_column(self, index: usize) -> Error {
        match self {
            FromValueError::InvalidType { expected, found } => Error::InvalidColumnType {
                index,
                expected,
                found,
            },
            FromValueError::OutOfRange(i) => Error::IntegerOverflow(i),
        }
    }
}

/// Types readable from an engine value
pub trait FromValue: Sized {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError>;
}

impl FromValue for i64 {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        match value {
            ValueRef::Integer(i) => Ok(i),
            other => Err(FromValueError::invalid("integer", other)),
        }
    }
}

macro_rules! from_value_narrow {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
                    let i = i64::from_value(value)?;
                    <$t>::try_from(i).map_err(|_| FromValueError::OutOfRange(i as i128))
                }
            }
        )*
    };
}

from_value_narrow!(i8, i16, i32, u8, u16, u32, u64, usize, isize);

impl FromValue for f64 {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        match value {
            ValueRef::Real(f) => Ok(f),
            ValueRef::Integer(i) => Ok(i as f64),
            other => Err(FromValueError::invalid("real", other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        Ok(i64::from_value(value)? != 0)
    }
}

impl FromValue for String {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        match value.as_str() {
            Some(text) => Ok(text.into_owned()),
            None => Err(FromValueError::invalid("text", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        match value {
            ValueRef::Blob(bytes) => Ok(bytes.to_vec()),
            other => Err(FromValueError::invalid("blob", other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        Ok(value.to_value())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: ValueRef<'_>) -> std::result::Result<Self, FromValueError> {
        match value {
            ValueRef::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(i: $t) -> Self {
                    Value::Integer(i as i64)
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl TryFrom<u64> for Value {
    type Error = Error;

    fn try_from(i: u64) -> Result<Self> {
        i64::try_from(i)
            .map(Value::Integer)
            .map_err(|_| Error::IntegerOverflow(i as i128))
    }
}

impl TryFrom<usize> for Value {
    type Error = Error;

    fn try_from(i: usize) -> Result<Self> {
        i64::try_from(i)
            .map(Value::Integer)
            .map_err(|_| Error::IntegerOverflow(i as i128))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(b as i64)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Real(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Blob(b.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Build a positional parameter list
///
/// ```
/// use sqlbridge_rs::{params, Value};
/// let p: &[Value] = params![1, "two", 3.0, None::<i64>];
/// assert_eq!(p.len(), 4);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::Value]
    };
    ($($param:expr),+ $(,)?) => {
        &[$($crate::Value::from($param)),+] as &[$crate::Value]
    };
}

// Engine boundary

unsafe fn raw_bytes<'a>(ptr: *const u8, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

/// Bind `value` to the 1-based parameter `index`
///
/// # Safety
///
/// `stmt` must be a live statement of the engine behind `bindings`.
pub(crate) unsafe fn bind(
    bindings: &dyn Bindings,
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    value: &Value,
) -> c_int {
    match value {
        Value::Null => bindings.bind_null(stmt, index),
        Value::Integer(i) => bindings.bind_int64(stmt, index, *i),
        Value::Real(f) => bindings.bind_double(stmt, index, *f),
        Value::Text(s) => bindings.bind_text(stmt, index, s),
        Value::Blob(b) => bindings.bind_blob(stmt, index, b),
    }
}

/// Borrow column `index` of the current row
///
/// # Safety
///
/// `stmt` must be positioned on a row; the result is invalidated by the next
/// step, reset or finalize.
pub(crate) unsafe fn column<'a>(
    bindings: &dyn Bindings,
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
) -> ValueRef<'a> {
    match ValueType::from_raw(bindings.column_type(stmt, index)) {
        ValueType::Null => ValueRef::Null,
        ValueType::Integer => ValueRef::Integer(bindings.column_int64(stmt, index)),
        ValueType::Real => ValueRef::Real(bindings.column_double(stmt, index)),
        ValueType::Text => {
            // pointer first, then length
            let ptr = bindings.column_text(stmt, index);
            ValueRef::Text(raw_bytes(ptr, bindings.column_bytes(stmt, index)))
        }
        ValueType::Blob => {
            let ptr = bindings.column_blob(stmt, index);
            ValueRef::Blob(raw_bytes(ptr, bindings.column_bytes(stmt, index)))
        }
    }
}

/// Deep-copy a function argument
///
/// # Safety
///
/// `value` must be a protected value valid for the duration of the call.
pub(crate) unsafe fn from_raw(bindings: &dyn Bindings, value: *mut ffi::sqlite3_value) -> Value {
    match ValueType::from_raw(bindings.value_type(value)) {
        ValueType::Null => Value::Null,
        ValueType::Integer => Value::Integer(bindings.value_int64(value)),
        ValueType::Real => Value::Real(bindings.value_double(value)),
        ValueType::Text => {
            let ptr = bindings.value_text(value);
            let bytes = raw_bytes(ptr, bindings.value_bytes(value));
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueType::Blob => {
            let ptr = bindings.value_blob(value);
            Value::Blob(raw_bytes(ptr, bindings.value_bytes(value)).to_vec())
        }
    }
}

/// Set a function result
///
/// # Safety
///
/// `ctx` must be the context of the running function invocation.
pub(crate) unsafe fn set_result(
    bindings: &dyn Bindings,
    ctx: *mut ffi::sqlite3_context,
    value: &Value,
) {
    match value {
        Value::Null => bindings.result_null(ctx),
        Value::Integer(i) => bindings.result_int64(ctx, *i),
        Value::Real(f) => bindings.result_double(ctx, *f),
        Value::Text(s) => bindings.result_text(ctx, s),
        Value::Blob(b) => bindings.result_blob(ctx, b),
    }
}

/// Convert a column read failure into a host error
pub(crate) fn column_error(index: usize) -> impl FnOnce(FromValueError) -> Error {
    move |e| e.at_column(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_narrowing_is_checked() {
        let v = Value::Integer(300);
        assert_eq!(v.get::<i32>().unwrap(), 300);
        assert_eq!(v.get::<u8>(), Err(FromValueError::OutOfRange(300)));
        assert_eq!(Value::Integer(-1).get::<u64>(), Err(FromValueError::OutOfRange(-1)));
    }

    #[test]
    fn test_float_never_becomes_integer() {
        assert!(matches!(
            Value::Real(1.0).get::<i64>(),
            Err(FromValueError::InvalidType { expected: "integer", found: "real" })
        ));
        assert_eq!(Value::Integer(2).get::<f64>().unwrap(), 2.0);
    }

    #[test]
    fn test_option_maps_null() {
        assert_eq!(Value::Null.get::<Option<String>>().unwrap(), None);
        assert_eq!(
            Value::Text("x".into()).get::<Option<String>>().unwrap(),
            Some("x".to_string())
        );
        assert!(Value::Null.get::<String>().is_err());
    }

    #[test]
    fn test_unsigned_into_value() {
        assert_eq!(Value::try_from(5u64).unwrap(), Value::Integer(5));
        assert!(matches!(
            Value::try_from(u64::MAX),
            Err(Error::IntegerOverflow(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_text_is_lossy() {
        let raw = ValueRef::Text(&[0x66, 0xff, 0x6f]);
        assert_eq!(raw.to_value(), Value::Text("f\u{fffd}o".into()));
    }

    #[test]
    fn test_params_macro() {
        let p: &[Value] = params![1, "two", 2.5, vec![1u8, 2], None::<i64>];
        assert_eq!(
            p,
            &[
                Value::Integer(1),
                Value::Text("two".into()),
                Value::Real(2.5),
                Value::Blob(vec![1, 2]),
                Value::Null,
            ]
        );
        assert!(params![].is_empty());
    }

    #[test]
    fn test_column_error_carries_index() {
        let err = FromValueError::InvalidType {
            expected: "blob",
            found: "text",
        }
        .at_column(3);
        assert!(matches!(err, Error::InvalidColumnType { index: 3, .. }));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let json = serde_json::to_string(&vec![Value::Integer(1), Value::Null, Value::Text("a".into())]).unwrap();
        assert_eq!(json, r#"[1,null,"a"]"#);
    }
}
