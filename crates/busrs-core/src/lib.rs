//! Connection-level D-Bus machinery for busrs.
//!
//! This crate sits on top of `busrs-message` and provides the pieces that
//! make a connection useful: the `Transport` seam with an in-memory
//! `LoopbackBus`, the signal match-rule tree, the `Connection` dispatcher
//! that routes inbound traffic, the object export registry with
//! introspection XML, bus-name and connection pools with RAII release, and
//! `Proxy` objects for outgoing calls.

pub mod bus_name;
pub mod config;
pub mod connection;
pub mod export;
pub mod introspect;
pub mod logging;
pub mod loopback;
pub mod matching;
pub mod pool;
pub mod proxy;
pub mod transport;

pub use bus_name::{
    BusName, RequestNameFlags, RELEASE_NAME_NON_EXISTENT, RELEASE_NAME_NOT_OWNER,
    RELEASE_NAME_RELEASED, REQUEST_NAME_ALREADY_OWNER, REQUEST_NAME_EXISTS,
    REQUEST_NAME_IN_QUEUE, REQUEST_NAME_PRIMARY_OWNER,
};
pub use config::{ConfigError, ConnectionConfig};
pub use connection::{Connection, FilterId, FilterVerdict, MessageFilter, WeakConnection};
pub use export::{
    ExportedObject, MessageHandler, MethodContext, MethodError, MethodSpec, ObjectRegistry,
    ObjectType, ObjectTypeBuilder, ReplyHandle, Resolution, SignalSpec, UnregisterHook,
};
pub use introspect::{ArgInfo, Direction, InterfaceInfo, MethodInfo, NodeInfo, SignalInfo};
pub use loopback::{LoopbackBus, LoopbackTransport};
pub use matching::{
    signal_handler, HandlerError, MatchRule, MatchSpec, MatchTree, SignalEvent, SignalHandler,
};
pub use pool::{BusPool, BusType, Connector};
pub use proxy::Proxy;
pub use transport::{InboundHandler, PendingCall, Transport};

pub use busrs_message::{
    ArgOptions, Message, MessageError, MessageFlags, MessageType, Native, ObjectPath, Signature,
    TypeError, Value,
};

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub const BUS_DAEMON_NAME: &str = "org.freedesktop.DBus";
pub const BUS_DAEMON_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_DAEMON_IFACE: &str = "org.freedesktop.DBus";
pub const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

/// An error reported by a remote peer: its D-Bus error name and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBusError {
    pub name: String,
    pub message: String,
}

impl DBusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build from an Error message. Non-error messages yield a `Failed` error.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            name: msg.error_name().unwrap_or(ERROR_FAILED).to_owned(),
            message: msg.error_text().unwrap_or_default().to_owned(),
        }
    }
}

impl fmt::Display for DBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for DBusError {}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("type error: {0}")]
    Type(#[from] TypeError),
    #[error("no method {member} on interface {interface} at {path}")]
    UnknownMethod {
        path: String,
        interface: String,
        member: String,
    },
    #[error("a handler is already registered at {0}")]
    DuplicateHandler(String),
    #[error("nothing registered at {0}")]
    NotFound(String),
    #[error("malformed introspection data: {0}")]
    IntrospectionParse(String),
    #[error("{0}")]
    Remote(DBusError),
    #[error("no reply received: {0}")]
    NoReply(String),
    #[error("connection is closed")]
    Disconnected,
    #[error("bus name {0} is owned by another connection")]
    NameExists(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BusError {
    /// The D-Bus error name used when this error is sent as a reply.
    pub fn dbus_name(&self) -> &str {
        match self {
            BusError::UnknownMethod { .. } => ERROR_UNKNOWN_METHOD,
            BusError::Message(_) | BusError::Type(_) => ERROR_INVALID_ARGS,
            BusError::Remote(e) => &e.name,
            BusError::NoReply(_) => ERROR_NO_REPLY,
            _ => ERROR_FAILED,
        }
    }

    /// Convert an Error reply into the matching `BusError`.
    pub fn from_error_reply(msg: &Message) -> Self {
        let remote = DBusError::from_message(msg);
        if remote.name == ERROR_NO_REPLY {
            BusError::NoReply(remote.message)
        } else {
            BusError::Remote(remote)
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Handlers never run under these locks, so a poisoned guard still holds
    // consistent data.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn describe_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("timed out after {} ms", t.as_millis()),
        None => "no reply will arrive".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbus_error_display() {
        let e = DBusError::new("com.example.Error.Nope", "not today");
        assert_eq!(e.to_string(), "com.example.Error.Nope: not today");
        let bare = DBusError::new("com.example.Error.Nope", "");
        assert_eq!(bare.to_string(), "com.example.Error.Nope");
    }

    #[test]
    fn error_reply_names() {
        let e = BusError::UnknownMethod {
            path: "/x".to_owned(),
            interface: "a.b".to_owned(),
            member: "M".to_owned(),
        };
        assert_eq!(e.dbus_name(), ERROR_UNKNOWN_METHOD);
        assert!(e.to_string().contains("/x"));
        assert_eq!(BusError::Disconnected.dbus_name(), ERROR_FAILED);
        let remote = BusError::Remote(DBusError::new("com.example.E", "x"));
        assert_eq!(remote.dbus_name(), "com.example.E");
    }

    #[test]
    fn from_error_reply_maps_no_reply() {
        let mut call = Message::method_call(None, "/", None, "Ping").unwrap();
        call.set_serial(1).unwrap();
        let reply = Message::error(&call, ERROR_NO_REPLY, Some("timed out")).unwrap();
        assert!(matches!(
            BusError::from_error_reply(&reply),
            BusError::NoReply(_)
        ));
        let reply = Message::error(&call, ERROR_FAILED, Some("boom")).unwrap();
        match BusError::from_error_reply(&reply) {
            BusError::Remote(e) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
