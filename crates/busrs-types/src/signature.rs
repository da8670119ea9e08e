//! The D-Bus signature grammar.
//!
//! A signature is a sequence of complete types. Parsing is strict: every
//! bracket must balance, dict entries may only appear directly inside an
//! array, dict keys must be basic types and structs may not be empty.

use crate::TypeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_SIGNATURE_LEN: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;

/// One complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompleteType {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<CompleteType>),
    Dict(Box<CompleteType>, Box<CompleteType>),
    Struct(Vec<CompleteType>),
}

impl CompleteType {
    /// Basic types are the ones allowed as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            CompleteType::Variant
                | CompleteType::Array(_)
                | CompleteType::Dict(_, _)
                | CompleteType::Struct(_)
        )
    }

    /// Wire alignment in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            CompleteType::Byte | CompleteType::Signature | CompleteType::Variant => 1,
            CompleteType::Int16 | CompleteType::UInt16 => 2,
            CompleteType::Boolean
            | CompleteType::Int32
            | CompleteType::UInt32
            | CompleteType::String
            | CompleteType::ObjectPath
            | CompleteType::Array(_)
            | CompleteType::Dict(_, _) => 4,
            CompleteType::Int64
            | CompleteType::UInt64
            | CompleteType::Double
            | CompleteType::Struct(_) => 8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CompleteType::Byte => "Byte",
            CompleteType::Boolean => "Boolean",
            CompleteType::Int16 => "Int16",
            CompleteType::UInt16 => "UInt16",
            CompleteType::Int32 => "Int32",
            CompleteType::UInt32 => "UInt32",
            CompleteType::Int64 => "Int64",
            CompleteType::UInt64 => "UInt64",
            CompleteType::Double => "Double",
            CompleteType::String => "String",
            CompleteType::ObjectPath => "ObjectPath",
            CompleteType::Signature => "Signature",
            CompleteType::Variant => "Variant",
            CompleteType::Array(_) => "Array",
            CompleteType::Dict(_, _) => "Dictionary",
            CompleteType::Struct(_) => "Struct",
        }
    }

    fn write_to(&self, out: &mut String) {
        match self {
            CompleteType::Byte => out.push('y'),
            CompleteType::Boolean => out.push('b'),
            CompleteType::Int16 => out.push('n'),
            CompleteType::UInt16 => out.push('q'),
            CompleteType::Int32 => out.push('i'),
            CompleteType::UInt32 => out.push('u'),
            CompleteType::Int64 => out.push('x'),
            CompleteType::UInt64 => out.push('t'),
            CompleteType::Double => out.push('d'),
            CompleteType::String => out.push('s'),
            CompleteType::ObjectPath => out.push('o'),
            CompleteType::Signature => out.push('g'),
            CompleteType::Variant => out.push('v'),
            CompleteType::Array(element) => {
                out.push('a');
                element.write_to(out);
            }
            CompleteType::Dict(key, value) => {
                out.push_str("a{");
                key.write_to(out);
                value.write_to(out);
                out.push('}');
            }
            CompleteType::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_to(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for CompleteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        f.write_str(&out)
    }
}

impl FromStr for CompleteType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = Signature::single(s)?.types;
        Ok(types.remove(0))
    }
}

/// Parse a signature into its complete types. The empty signature parses to
/// an empty sequence; use [`Signature::single`] where exactly one type is
/// required.
pub fn parse_signature(signature: &str) -> Result<Vec<CompleteType>, TypeError> {
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(TypeError::InvalidSignature {
            signature: signature.to_owned(),
            reason: format!("longer than {MAX_SIGNATURE_LEN} bytes"),
        });
    }
    let mut parser = Parser {
        text: signature,
        bytes: signature.as_bytes(),
        pos: 0,
        arrays: 0,
        structs: 0,
    };
    let mut types = Vec::new();
    while parser.pos < parser.bytes.len() {
        types.push(parser.complete_type()?);
    }
    Ok(types)
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    arrays: usize,
    structs: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> TypeError {
        TypeError::InvalidSignature {
            signature: self.text.to_owned(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn complete_type(&mut self) -> Result<CompleteType, TypeError> {
        let Some(code) = self.peek() else {
            return Err(self.error("expected a complete type, found end of signature"));
        };
        self.pos += 1;
        match code {
            b'y' => Ok(CompleteType::Byte),
            b'b' => Ok(CompleteType::Boolean),
            b'n' => Ok(CompleteType::Int16),
            b'q' => Ok(CompleteType::UInt16),
            b'i' => Ok(CompleteType::Int32),
            b'u' => Ok(CompleteType::UInt32),
            b'x' => Ok(CompleteType::Int64),
            b't' => Ok(CompleteType::UInt64),
            b'd' => Ok(CompleteType::Double),
            b's' => Ok(CompleteType::String),
            b'o' => Ok(CompleteType::ObjectPath),
            b'g' => Ok(CompleteType::Signature),
            b'v' => Ok(CompleteType::Variant),
            b'a' => self.array(),
            b'(' => self.structure(),
            b'{' => Err(self.error("dict entry outside of an array")),
            b')' | b'}' => Err(self.error(format!(
                "unbalanced '{}' at offset {}",
                code as char,
                self.pos - 1
            ))),
            other => Err(self.error(format!("unknown type code '{}'", other as char))),
        }
    }

    fn array(&mut self) -> Result<CompleteType, TypeError> {
        self.arrays += 1;
        if self.arrays > MAX_ARRAY_DEPTH {
            return Err(self.error(format!("more than {MAX_ARRAY_DEPTH} nested arrays")));
        }
        let ty = if self.peek() == Some(b'{') {
            self.pos += 1;
            self.dict_entry()?
        } else {
            CompleteType::Array(Box::new(self.complete_type()?))
        };
        self.arrays -= 1;
        Ok(ty)
    }

    fn dict_entry(&mut self) -> Result<CompleteType, TypeError> {
        self.enter_struct()?;
        if self.peek() == Some(b'}') {
            return Err(self.error("empty dict entry"));
        }
        let key = self.complete_type()?;
        if !key.is_basic() {
            return Err(self.error(format!("dict key must be a basic type, found '{key}'")));
        }
        if self.peek() == Some(b'}') {
            return Err(self.error("dict entry must contain exactly two types"));
        }
        let value = self.complete_type()?;
        match self.peek() {
            Some(b'}') => self.pos += 1,
            Some(_) => return Err(self.error("dict entry must contain exactly two types")),
            None => return Err(self.error("unterminated dict entry")),
        }
        self.structs -= 1;
        Ok(CompleteType::Dict(Box::new(key), Box::new(value)))
    }

    fn structure(&mut self) -> Result<CompleteType, TypeError> {
        self.enter_struct()?;
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.error("unterminated struct")),
                Some(_) => fields.push(self.complete_type()?),
            }
        }
        if fields.is_empty() {
            return Err(self.error("empty struct"));
        }
        self.structs -= 1;
        Ok(CompleteType::Struct(fields))
    }

    fn enter_struct(&mut self) -> Result<(), TypeError> {
        self.structs += 1;
        if self.structs > MAX_STRUCT_DEPTH {
            return Err(self.error(format!("more than {MAX_STRUCT_DEPTH} nested structs")));
        }
        Ok(())
    }
}

/// A validated, immutable signature: zero or more complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    text: String,
    types: Vec<CompleteType>,
}

impl Signature {
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let types = parse_signature(s)?;
        Ok(Self {
            text: s.to_owned(),
            types,
        })
    }

    /// Parse a signature that must hold exactly one complete type.
    pub fn single(s: &str) -> Result<Self, TypeError> {
        let sig = Self::parse(s)?;
        match sig.types.len() {
            1 => Ok(sig),
            0 => Err(TypeError::InvalidSignature {
                signature: s.to_owned(),
                reason: "expected one complete type, found none".to_owned(),
            }),
            n => Err(TypeError::InvalidSignature {
                signature: s.to_owned(),
                reason: format!("expected one complete type, found {n}"),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a signature from already-parsed types.
    pub fn from_types(types: Vec<CompleteType>) -> Result<Self, TypeError> {
        let mut text = String::new();
        for ty in &types {
            ty.write_to(&mut text);
        }
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(TypeError::InvalidSignature {
                signature: text,
                reason: format!("longer than {MAX_SIGNATURE_LEN} bytes"),
            });
        }
        Ok(Self { text, types })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[CompleteType] {
        &self.types
    }

    pub fn into_types(self) -> Vec<CompleteType> {
        self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompleteType> {
        self.types.iter()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = TypeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.text
    }
}

impl From<CompleteType> for Signature {
    fn from(ty: CompleteType) -> Self {
        let text = ty.to_string();
        Self {
            text,
            types: vec![ty],
        }
    }
}

impl<'a> IntoIterator for &'a Signature {
    type Item = &'a CompleteType;
    type IntoIter = std::slice::Iter<'a, CompleteType>;

    fn into_iter(self) -> Self::IntoIter {
        self.types.iter()
    }
}
