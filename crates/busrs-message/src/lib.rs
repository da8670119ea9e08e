//! D-Bus messages and their wire encoding.
//!
//! This crate provides the `Message` type shared by every layer above it:
//! construction of method calls, returns, errors and signals, incremental
//! argument appending (strict against a signature, or guessed per argument),
//! argument reading with representation options, and the little-endian wire
//! codec for bodies (`marshal_body` / `unmarshal_body`) and complete messages
//! (`Message::encode` / `Message::decode`).

pub mod frame;
pub mod marshal;
pub mod message;
pub mod unmarshal;

pub use busrs_types::{ArgOptions, Native, ObjectPath, Signature, TypeError, Value};
pub use marshal::marshal_body;
pub use message::{Message, MessageFlags, MessageType};
pub use unmarshal::unmarshal_body;

use thiserror::Error;

/// Largest array the wire format allows, in bytes.
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;
/// Largest complete message the wire format allows, in bytes.
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;
/// Variant values nested deeper than this are refused when decoding.
pub const MAX_VARIANT_DEPTH: u32 = 64;
/// Containers of any kind (arrays, structs, dict entries and variants)
/// nested deeper than this are refused when decoding.
pub const MAX_CONTAINER_DEPTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("message is read-only once sent or received")]
    ReadOnly,
    #[error("signature '{signature}' describes {expected} arguments, got {actual}")]
    ArgumentCount {
        signature: String,
        expected: usize,
        actual: usize,
    },
    #[error("cannot reply to a message without a serial number")]
    MissingSerial,
    #[error("{kind} message is missing its {field} header")]
    MissingHeader {
        kind: MessageType,
        field: &'static str,
    },
    #[error("truncated message: {0}")]
    Truncated(String),
    #[error("invalid message header: {0}")]
    InvalidHeader(String),
    #[error("invalid message body: {0}")]
    InvalidBody(String),
}
