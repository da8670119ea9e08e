//! D-Bus type model for busrs.
//!
//! This crate defines the leaf layer every other busrs crate builds on: the
//! signature grammar (`Signature`, `CompleteType`), the typed value domain
//! (`Value`, `Array`, `Dict`, `ObjectPath`), the untyped `Native` input domain
//! with its signature-guessing and strict coercion rules, and validation of
//! bus, interface, member and error names.

pub mod names;
pub mod native;
pub mod signature;
pub mod value;

pub use names::{
    is_unique_name, validate_bus_name, validate_error_name, validate_interface_name,
    validate_member_name, validate_object_path,
};
pub use native::{coerce, guess_signature, Native};
pub use signature::{
    parse_signature, CompleteType, Signature, MAX_ARRAY_DEPTH, MAX_SIGNATURE_LEN,
    MAX_STRUCT_DEPTH,
};
pub use value::{ArgOptions, Array, Dict, ObjectPath, Value};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("invalid signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },
    #[error("cannot marshal {value} as '{expected}'")]
    Marshal { value: String, expected: String },
    #[error("{value} is out of range for {type_name}")]
    Range {
        type_name: &'static str,
        value: String,
    },
    #[error("cannot guess a signature for {0}")]
    AmbiguousSignature(String),
    #[error("invalid {kind} '{value}': {reason}")]
    InvalidValue {
        kind: &'static str,
        value: String,
        reason: String,
    },
}

impl TypeError {
    pub(crate) fn marshal(value: impl std::fmt::Debug, expected: impl std::fmt::Display) -> Self {
        TypeError::Marshal {
            value: format!("{value:?}"),
            expected: expected.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_error_names_value_and_type() {
        let e = TypeError::marshal("x", "i");
        let msg = e.to_string();
        assert!(msg.contains("\"x\""));
        assert!(msg.contains("'i'"));
    }

    #[test]
    fn range_error_display() {
        let e = TypeError::Range {
            type_name: "Int16",
            value: "-32769".to_owned(),
        };
        assert_eq!(e.to_string(), "-32769 is out of range for Int16");
    }

    #[test]
    fn invalid_signature_display() {
        let e = TypeError::InvalidSignature {
            signature: "a{s}".to_owned(),
            reason: "dict entry must contain exactly two types".to_owned(),
        };
        assert!(e.to_string().contains("a{s}"));
    }
}
