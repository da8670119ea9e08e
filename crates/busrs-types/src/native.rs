//! Untyped input values, signature guessing and strict coercion.
//!
//! `Native` is what callers hand to a message when they do not want to spell
//! out D-Bus types. Without a signature each argument's type is guessed with
//! [`guess_signature`]; with one, every argument is coerced strictly by
//! [`coerce`].

use crate::signature::CompleteType;
use crate::value::{Array, Dict, ObjectPath, Value};
use crate::{Signature, TypeError};

#[derive(Debug, Clone, PartialEq)]
pub enum Native {
    /// The absence of a value; only meaningful as a method return.
    Unit,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// A homogeneous sequence, guessed as an array.
    List(Vec<Native>),
    /// A fixed-length heterogeneous sequence, guessed as a struct.
    Tuple(Vec<Native>),
    Map(Vec<(Native, Native)>),
    /// An explicitly typed value, passed through as-is.
    Typed(Value),
}

impl Native {
    pub fn tuple(items: impl IntoIterator<Item = impl Into<Native>>) -> Self {
        Native::Tuple(items.into_iter().map(Into::into).collect())
    }

    pub fn list(items: impl IntoIterator<Item = impl Into<Native>>) -> Self {
        Native::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<K: Into<Native>, V: Into<Native>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Native::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Native::Bytes(bytes.into())
    }

    /// Convert to a typed value, guessing the type unless it is already typed.
    pub fn into_value(self) -> Result<Value, TypeError> {
        match self {
            Native::Typed(v) => {
                v.validate()?;
                Ok(v)
            }
            other => {
                let ty = guess_signature(&other)?;
                coerce(other, &ty)
            }
        }
    }
}

/// Infer the D-Bus type of an untyped value.
pub fn guess_signature(native: &Native) -> Result<CompleteType, TypeError> {
    match native {
        Native::Typed(v) => Ok(v.type_of()),
        Native::Str(_) => Ok(CompleteType::String),
        Native::Bytes(_) => Ok(CompleteType::Array(Box::new(CompleteType::Byte))),
        Native::Bool(_) => Ok(CompleteType::Boolean),
        Native::Float(_) => Ok(CompleteType::Double),
        Native::Int(n) => guess_integer(*n),
        Native::Tuple(items) => {
            if items.is_empty() {
                return Err(TypeError::marshal(native, "a non-empty struct"));
            }
            let fields = items
                .iter()
                .map(guess_signature)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompleteType::Struct(fields))
        }
        Native::List(items) => match items.first() {
            Some(first) => Ok(CompleteType::Array(Box::new(guess_signature(first)?))),
            None => Err(TypeError::AmbiguousSignature(
                "an empty list without an explicit signature".to_owned(),
            )),
        },
        Native::Map(entries) => match entries.first() {
            Some((k, v)) => {
                let key = guess_signature(k)?;
                if !key.is_basic() {
                    return Err(TypeError::marshal(k, "a basic dict key"));
                }
                Ok(CompleteType::Dict(Box::new(key), Box::new(guess_signature(v)?)))
            }
            None => Err(TypeError::AmbiguousSignature(
                "an empty map without an explicit signature".to_owned(),
            )),
        },
        Native::Unit => Err(TypeError::marshal(native, "any D-Bus type")),
    }
}

fn guess_integer(n: i128) -> Result<CompleteType, TypeError> {
    if i32::try_from(n).is_ok() {
        Ok(CompleteType::Int32)
    } else if i64::try_from(n).is_ok() {
        Ok(CompleteType::Int64)
    } else if u64::try_from(n).is_ok() {
        Ok(CompleteType::UInt64)
    } else {
        Err(TypeError::Range {
            type_name: "UInt64",
            value: n.to_string(),
        })
    }
}

/// Coerce an untyped value into `ty`, failing on any mismatch.
pub fn coerce(native: Native, ty: &CompleteType) -> Result<Value, TypeError> {
    if *ty == CompleteType::Variant {
        return match native {
            Native::Typed(v @ Value::Variant(_)) => {
                v.validate()?;
                Ok(v)
            }
            other => Ok(Value::variant(other.into_value()?)),
        };
    }

    match (ty, native) {
        (_, Native::Typed(v)) => {
            let actual = v.type_of();
            if actual != *ty {
                return Err(TypeError::marshal(&v, ty));
            }
            v.validate()?;
            Ok(v)
        }
        (CompleteType::Byte, Native::Int(n)) => Value::byte(n),
        (CompleteType::Boolean, Native::Bool(b)) => Ok(Value::Boolean(b)),
        (CompleteType::Int16, Native::Int(n)) => Value::int16(n),
        (CompleteType::UInt16, Native::Int(n)) => Value::uint16(n),
        (CompleteType::Int32, Native::Int(n)) => Value::int32(n),
        (CompleteType::UInt32, Native::Int(n)) => Value::uint32(n),
        (CompleteType::Int64, Native::Int(n)) => Value::int64(n),
        (CompleteType::UInt64, Native::Int(n)) => Value::uint64(n),
        (CompleteType::Double, Native::Float(f)) => Ok(Value::Double(f)),
        (CompleteType::Double, Native::Int(n)) => Ok(Value::Double(n as f64)),
        (CompleteType::String, Native::Str(s)) => Value::string(s),
        (CompleteType::String, Native::Bytes(b)) => Value::utf8_string(b),
        (CompleteType::ObjectPath, Native::Str(s)) => ObjectPath::new(s).map(Value::ObjectPath),
        (CompleteType::Signature, Native::Str(s)) => Signature::parse(&s).map(Value::Signature),
        (CompleteType::Array(element), Native::Bytes(b)) if **element == CompleteType::Byte => {
            Ok(Value::Bytes(b))
        }
        (CompleteType::Array(element), Native::List(items) | Native::Tuple(items)) => {
            let items = items
                .into_iter()
                .map(|item| coerce(item, element))
                .collect::<Result<Vec<_>, _>>()?;
            Array::new((**element).clone(), items).map(Value::Array)
        }
        (CompleteType::Dict(key, value), Native::Map(entries)) => {
            let entries = entries
                .into_iter()
                .map(|(k, v)| Ok((coerce(k, key)?, coerce(v, value)?)))
                .collect::<Result<Vec<_>, TypeError>>()?;
            Dict::new((**key).clone(), (**value).clone(), entries).map(Value::Dict)
        }
        (CompleteType::Struct(fields), Native::Tuple(items) | Native::List(items))
            if fields.len() == items.len() =>
        {
            let values = items
                .into_iter()
                .zip(fields)
                .map(|(item, field)| coerce(item, field))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Struct(values))
        }
        (_, other) => Err(TypeError::marshal(&other, ty)),
    }
}

macro_rules! native_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Native {
                fn from(n: $ty) -> Self {
                    Native::Int(i128::from(n))
                }
            }
        )*
    };
}

native_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<bool> for Native {
    fn from(b: bool) -> Self {
        Native::Bool(b)
    }
}

impl From<f64> for Native {
    fn from(f: f64) -> Self {
        Native::Float(f)
    }
}

impl From<f32> for Native {
    fn from(f: f32) -> Self {
        Native::Float(f64::from(f))
    }
}

impl From<&str> for Native {
    fn from(s: &str) -> Self {
        Native::Str(s.to_owned())
    }
}

impl From<String> for Native {
    fn from(s: String) -> Self {
        Native::Str(s)
    }
}

impl From<Value> for Native {
    fn from(v: Value) -> Self {
        Native::Typed(v)
    }
}

impl From<()> for Native {
    fn from((): ()) -> Self {
        Native::Unit
    }
}

impl From<Vec<Native>> for Native {
    fn from(items: Vec<Native>) -> Self {
        Native::List(items)
    }
}

impl<T: Into<Native>> From<Option<T>> for Native {
    fn from(v: Option<T>) -> Self {
        v.map_or(Native::Unit, Into::into)
    }
}

/// JSON arrays become lists and objects become string-keyed maps; `null`
/// becomes [`Native::Unit`].
impl From<serde_json::Value> for Native {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Native::Unit,
            serde_json::Value::Bool(b) => Native::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Native::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    Native::Int(i128::from(u))
                } else {
                    Native::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Native::Str(s),
            serde_json::Value::Array(items) => {
                Native::List(items.into_iter().map(Native::from).collect())
            }
            serde_json::Value::Object(map) => Native::Map(
                map.into_iter()
                    .map(|(k, v)| (Native::Str(k), Native::from(v)))
                    .collect(),
            ),
        }
    }
}
