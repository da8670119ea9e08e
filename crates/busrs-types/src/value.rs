//! The typed value domain carried in message bodies.

use crate::names::validate_object_path;
use crate::signature::{CompleteType, Signature};
use crate::TypeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// A validated object path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self, TypeError> {
        let path = path.into();
        validate_object_path(&path)?;
        Ok(Self(path))
    }

    pub fn root() -> Self {
        Self("/".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_owned())),
            None => None,
        }
    }
}

impl Deref for ObjectPath {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ObjectPath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ObjectPath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = TypeError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = TypeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.0
    }
}

/// Representation choices applied when reading arguments out of a message.
///
/// Neither flag changes the wire type: `utf8_strings` returns strings in their
/// encoded byte form and `byte_arrays` returns `ay` as one compact buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArgOptions {
    #[serde(default)]
    pub utf8_strings: bool,
    #[serde(default)]
    pub byte_arrays: bool,
}

impl ArgOptions {
    pub const UTF8: ArgOptions = ArgOptions {
        utf8_strings: true,
        byte_arrays: false,
    };
}

/// An array whose element type is always known, even when it is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: CompleteType,
    items: Vec<Value>,
}

impl Array {
    pub fn new(element: CompleteType, items: Vec<Value>) -> Result<Self, TypeError> {
        for item in &items {
            if item.type_of() != element {
                return Err(TypeError::marshal(item, &element));
            }
        }
        Ok(Self { element, items })
    }

    pub fn element(&self) -> &CompleteType {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A dictionary with basic-typed, unique keys. Entry order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: CompleteType,
    value: CompleteType,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new(
        key: CompleteType,
        value: CompleteType,
        entries: Vec<(Value, Value)>,
    ) -> Result<Self, TypeError> {
        if !key.is_basic() {
            return Err(TypeError::InvalidSignature {
                signature: format!("a{{{key}{value}}}"),
                reason: "dict key must be a basic type".to_owned(),
            });
        }
        for (idx, (k, v)) in entries.iter().enumerate() {
            if k.type_of() != key {
                return Err(TypeError::marshal(k, &key));
            }
            if v.type_of() != value {
                return Err(TypeError::marshal(v, &value));
            }
            if entries[..idx].iter().any(|(other, _)| other.same_key(k)) {
                return Err(TypeError::InvalidValue {
                    kind: "dictionary",
                    value: format!("{k:?}"),
                    reason: "duplicate key".to_owned(),
                });
            }
        }
        Ok(Self {
            key,
            value,
            entries,
        })
    }

    pub fn key_type(&self) -> &CompleteType {
        &self.key
    }

    pub fn value_type(&self) -> &CompleteType {
        &self.value
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.same_key(key))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A fully typed D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    /// A string kept in its validated UTF-8 encoding; type `s`.
    Utf8String(Vec<u8>),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array(Array),
    /// Compact form of an `ay` array.
    Bytes(Vec<u8>),
    Struct(Vec<Value>),
    Dict(Dict),
    /// One level of variant wrapping. Nesting depth is the number of
    /// consecutive `Variant` layers, see [`Value::variant_level`].
    Variant(Box<Value>),
}

macro_rules! checked_int {
    ($(#[$meta:meta])* $fn_name:ident, $variant:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(n: i128) -> Result<Value, TypeError> {
            <$ty>::try_from(n)
                .map(Value::$variant)
                .map_err(|_| TypeError::Range {
                    type_name: stringify!($variant),
                    value: n.to_string(),
                })
        }
    };
}

impl Value {
    checked_int!(
        /// Byte in `[0, 255]`.
        byte, Byte, u8
    );
    checked_int!(
        /// Int16 in `[-32768, 32767]`.
        int16, Int16, i16
    );
    checked_int!(uint16, UInt16, u16);
    checked_int!(int32, Int32, i32);
    checked_int!(uint32, UInt32, u32);
    checked_int!(int64, Int64, i64);
    checked_int!(uint64, UInt64, u64);

    /// A string without embedded NUL bytes.
    pub fn string(s: impl Into<String>) -> Result<Value, TypeError> {
        let s = s.into();
        check_no_nul(s.as_bytes(), &s)?;
        Ok(Value::String(s))
    }

    pub fn utf8_string(bytes: impl Into<Vec<u8>>) -> Result<Value, TypeError> {
        let bytes = bytes.into();
        let text = std::str::from_utf8(&bytes).map_err(|e| TypeError::InvalidValue {
            kind: "string",
            value: String::from_utf8_lossy(&bytes).into_owned(),
            reason: e.to_string(),
        })?;
        check_no_nul(&bytes, text)?;
        Ok(Value::Utf8String(bytes))
    }

    pub fn object_path(path: impl Into<String>) -> Result<Value, TypeError> {
        ObjectPath::new(path).map(Value::ObjectPath)
    }

    pub fn signature(sig: &str) -> Result<Value, TypeError> {
        Signature::parse(sig).map(Value::Signature)
    }

    pub fn array(element: CompleteType, items: Vec<Value>) -> Result<Value, TypeError> {
        Array::new(element, items).map(Value::Array)
    }

    pub fn dict(
        key: CompleteType,
        value: CompleteType,
        entries: Vec<(Value, Value)>,
    ) -> Result<Value, TypeError> {
        Dict::new(key, value, entries).map(Value::Dict)
    }

    pub fn structure(fields: Vec<Value>) -> Result<Value, TypeError> {
        if fields.is_empty() {
            return Err(TypeError::InvalidValue {
                kind: "struct",
                value: "()".to_owned(),
                reason: "structs must have at least one field".to_owned(),
            });
        }
        Ok(Value::Struct(fields))
    }

    pub fn variant(inner: Value) -> Value {
        Value::Variant(Box::new(inner))
    }

    /// Wrap `inner` in `levels` variants.
    pub fn wrap(inner: Value, levels: u32) -> Value {
        (0..levels).fold(inner, |acc, _| Value::variant(acc))
    }

    /// Number of variant layers around the innermost value.
    pub fn variant_level(&self) -> u32 {
        let mut level = 0;
        let mut current = self;
        while let Value::Variant(inner) = current {
            level += 1;
            current = inner;
        }
        level
    }

    /// The value inside every variant layer.
    pub fn innermost(&self) -> &Value {
        let mut current = self;
        while let Value::Variant(inner) = current {
            current = inner;
        }
        current
    }

    pub fn type_of(&self) -> CompleteType {
        match self {
            Value::Byte(_) => CompleteType::Byte,
            Value::Boolean(_) => CompleteType::Boolean,
            Value::Int16(_) => CompleteType::Int16,
            Value::UInt16(_) => CompleteType::UInt16,
            Value::Int32(_) => CompleteType::Int32,
            Value::UInt32(_) => CompleteType::UInt32,
            Value::Int64(_) => CompleteType::Int64,
            Value::UInt64(_) => CompleteType::UInt64,
            Value::Double(_) => CompleteType::Double,
            Value::String(_) | Value::Utf8String(_) => CompleteType::String,
            Value::ObjectPath(_) => CompleteType::ObjectPath,
            Value::Signature(_) => CompleteType::Signature,
            Value::Array(a) => CompleteType::Array(Box::new(a.element.clone())),
            Value::Bytes(_) => CompleteType::Array(Box::new(CompleteType::Byte)),
            Value::Struct(fields) => CompleteType::Struct(fields.iter().map(Value::type_of).collect()),
            Value::Dict(d) => CompleteType::Dict(Box::new(d.key.clone()), Box::new(d.value.clone())),
            Value::Variant(_) => CompleteType::Variant,
        }
    }

    pub fn signature_of(&self) -> Signature {
        Signature::from(self.type_of())
    }

    /// Check the invariants the public variants cannot enforce by construction.
    pub fn validate(&self) -> Result<(), TypeError> {
        match self {
            Value::String(s) => check_no_nul(s.as_bytes(), s),
            Value::Utf8String(bytes) => Value::utf8_string(bytes.clone()).map(drop),
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Value::structure(Vec::new()).map(drop);
                }
                fields.iter().try_for_each(Value::validate)
            }
            Value::Array(a) => a.items.iter().try_for_each(Value::validate),
            Value::Dict(d) => d
                .entries
                .iter()
                .try_for_each(|(k, v)| k.validate().and_then(|()| v.validate())),
            Value::Variant(inner) => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Convert between the string and byte-array representations.
    #[must_use]
    pub fn with_options(self, options: ArgOptions) -> Value {
        match self {
            Value::String(s) if options.utf8_strings => Value::Utf8String(s.into_bytes()),
            Value::Utf8String(bytes) if !options.utf8_strings => match String::from_utf8(bytes) {
                Ok(s) => Value::String(s),
                Err(e) => Value::String(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            Value::Bytes(bytes) if !options.byte_arrays => Value::Array(Array {
                element: CompleteType::Byte,
                items: bytes.into_iter().map(Value::Byte).collect(),
            }),
            Value::Array(a) => {
                if options.byte_arrays && a.element == CompleteType::Byte {
                    let bytes = a
                        .items
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::Byte(b) => Some(b),
                            _ => None,
                        })
                        .collect();
                    Value::Bytes(bytes)
                } else {
                    Value::Array(Array {
                        element: a.element,
                        items: a.items.into_iter().map(|v| v.with_options(options)).collect(),
                    })
                }
            }
            Value::Struct(fields) => {
                Value::Struct(fields.into_iter().map(|v| v.with_options(options)).collect())
            }
            Value::Dict(d) => Value::Dict(Dict {
                key: d.key,
                value: d.value,
                entries: d
                    .entries
                    .into_iter()
                    .map(|(k, v)| (k.with_options(options), v.with_options(options)))
                    .collect(),
            }),
            Value::Variant(inner) => Value::Variant(Box::new(inner.with_options(options))),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Utf8String(bytes) => std::str::from_utf8(bytes).ok(),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(n) => Some(i64::from(n)),
            Value::Int16(n) => Some(i64::from(n)),
            Value::UInt16(n) => Some(i64::from(n)),
            Value::Int32(n) => Some(i64::from(n)),
            Value::UInt32(n) => Some(i64::from(n)),
            Value::Int64(n) => Some(n),
            Value::UInt64(n) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt64(n) => Some(n),
            _ => self.as_i64().and_then(|n| u64::try_from(n).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    /// Key equality for dictionaries: strings compare by content regardless
    /// of representation.
    fn same_key(&self, other: &Value) -> bool {
        match (self.as_str(), other.as_str()) {
            (Some(a), Some(b)) => a == b && self.type_of() == other.type_of(),
            _ => self == other,
        }
    }
}

fn check_no_nul(bytes: &[u8], shown: &str) -> Result<(), TypeError> {
    if bytes.contains(&0) {
        return Err(TypeError::InvalidValue {
            kind: "string",
            value: shown.replace('\0', "\\0"),
            reason: "embedded NUL byte".to_owned(),
        });
    }
    Ok(())
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::ObjectPath(v)
    }
}

impl From<Signature> for Value {
    fn from(v: Signature) -> Self {
        Value::Signature(v)
    }
}
