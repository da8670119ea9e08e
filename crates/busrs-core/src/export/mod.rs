//! Exporting objects on a connection.
//!
//! [`ObjectRegistry`] maps object paths to [`MessageHandler`]s. On top of it,
//! [`ObjectType`] describes typed interfaces once and [`ExportedObject`]
//! answers calls for an instance of it, including
//! `org.freedesktop.DBus.Introspectable`.

mod object;
mod registry;

pub use object::{
    ExportedObject, MethodContext, MethodError, MethodSpec, ObjectType, ObjectTypeBuilder,
    ReplyHandle, SignalSpec,
};
pub use registry::{MessageHandler, ObjectRegistry, Resolution, UnregisterHook};
