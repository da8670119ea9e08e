//! Validation of the named header fields of a message.
//!
//! The grammar checks themselves come from `zbus::names` and
//! `zbus::zvariant`; this module only adapts their errors to [`TypeError`].

use crate::TypeError;
use zbus::names::{BusName, ErrorName, InterfaceName, MemberName};
use zbus::zvariant::ObjectPath as WireObjectPath;

fn invalid(kind: &'static str, value: &str, reason: impl std::fmt::Display) -> TypeError {
    TypeError::InvalidValue {
        kind,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

pub fn validate_object_path(path: &str) -> Result<(), TypeError> {
    WireObjectPath::try_from(path)
        .map(drop)
        .map_err(|e| invalid("object path", path, e))
}

pub fn validate_interface_name(name: &str) -> Result<(), TypeError> {
    InterfaceName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("interface name", name, e))
}

pub fn validate_member_name(name: &str) -> Result<(), TypeError> {
    MemberName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("member name", name, e))
}

pub fn validate_error_name(name: &str) -> Result<(), TypeError> {
    ErrorName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("error name", name, e))
}

/// Accepts both unique (`:1.42`) and well-known (`com.example.App`) names.
pub fn validate_bus_name(name: &str) -> Result<(), TypeError> {
    BusName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("bus name", name, e))
}

/// Unique names are assigned by the bus and never change owner.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}
