use crate::connection::Connection;
use crate::{lock, BusError, Native, TypeError};
use busrs_types::{is_unique_name, validate_bus_name};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// `RequestName` reply codes.
pub const REQUEST_NAME_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_IN_QUEUE: u32 = 2;
pub const REQUEST_NAME_EXISTS: u32 = 3;
pub const REQUEST_NAME_ALREADY_OWNER: u32 = 4;

/// `ReleaseName` reply codes.
pub const RELEASE_NAME_RELEASED: u32 = 1;
pub const RELEASE_NAME_NON_EXISTENT: u32 = 2;
pub const RELEASE_NAME_NOT_OWNER: u32 = 3;

/// Flags for `RequestName`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestNameFlags(u32);

impl RequestNameFlags {
    pub const ALLOW_REPLACEMENT: RequestNameFlags = RequestNameFlags(0x1);
    pub const REPLACE_EXISTING: RequestNameFlags = RequestNameFlags(0x2);
    pub const DO_NOT_QUEUE: RequestNameFlags = RequestNameFlags(0x4);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RequestNameFlags {
    type Output = RequestNameFlags;

    fn bitor(self, rhs: Self) -> Self {
        RequestNameFlags(self.0 | rhs.0)
    }
}

pub(crate) struct NameInner {
    conn: Connection,
    name: String,
}

impl Drop for NameInner {
    fn drop(&mut self) {
        {
            let mut names = lock(self.conn.names());
            if names
                .get(&self.name)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                names.remove(&self.name);
            }
        }
        self.conn.notify_bus("ReleaseName", &self.name);
        debug!("released bus name {}", self.name);
    }
}

/// A claimed well-known name.
///
/// Handles for the same name on the same connection share one claim; the
/// name is released as soon as the last of them is dropped.
#[derive(Clone)]
pub struct BusName {
    inner: Arc<NameInner>,
}

impl BusName {
    pub(crate) fn request(
        conn: &Connection,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<BusName, BusError> {
        validate_bus_name(name)?;
        if is_unique_name(name) {
            return Err(TypeError::InvalidValue {
                kind: "bus name",
                value: name.to_owned(),
                reason: "unique names cannot be requested".to_owned(),
            }
            .into());
        }
        if let Some(inner) = Self::existing(conn, name) {
            return Ok(BusName { inner });
        }

        let args = vec![Native::from(name), Native::from(flags.bits())];
        let reply = conn.call_bus("RequestName", args, "su")?;
        let code = reply.args().first().and_then(|v| v.as_u64());
        if code == Some(u64::from(REQUEST_NAME_EXISTS)) {
            return Err(BusError::NameExists(name.to_owned()));
        }
        info!("acquired bus name {name} (reply code {code:?})");

        let mut names = lock(conn.names());
        if let Some(inner) = names.get(name).and_then(Weak::upgrade) {
            return Ok(BusName { inner });
        }
        let inner = Arc::new(NameInner {
            conn: conn.clone(),
            name: name.to_owned(),
        });
        names.insert(name.to_owned(), Arc::downgrade(&inner));
        Ok(BusName { inner })
    }

    fn existing(conn: &Connection, name: &str) -> Option<Arc<NameInner>> {
        lock(conn.names()).get(name).and_then(Weak::upgrade)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Number of live handles sharing this claim.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusName")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBus;
    use crate::ConnectionConfig;

    fn connect(bus: &LoopbackBus) -> Connection {
        Connection::new(bus.connect(), ConnectionConfig::default())
    }

    #[test]
    fn name_held_elsewhere_is_reported_as_existing() {
        let bus = LoopbackBus::new();
        let owner = connect(&bus);
        let other = connect(&bus);
        let _held = owner
            .request_name("com.example.Held", RequestNameFlags::DO_NOT_QUEUE)
            .unwrap();
        let err = other
            .request_name("com.example.Held", RequestNameFlags::DO_NOT_QUEUE)
            .unwrap_err();
        assert!(matches!(err, BusError::NameExists(ref name) if name == "com.example.Held"));
    }

    #[test]
    fn handles_share_one_claim() {
        let bus = LoopbackBus::new();
        let conn = connect(&bus);
        let first = conn
            .request_name("com.example.Svc", RequestNameFlags::default())
            .unwrap();
        let second = conn
            .request_name("com.example.Svc", RequestNameFlags::DO_NOT_QUEUE)
            .unwrap();
        assert_eq!(first.handle_count(), 2);
        assert_eq!(second.name(), "com.example.Svc");
        assert_eq!(bus.name_owner("com.example.Svc"), conn.unique_name());

        drop(first);
        bus.run_until_idle();
        assert_eq!(bus.name_owner("com.example.Svc"), conn.unique_name());
        drop(second);
        bus.run_until_idle();
        assert_eq!(bus.name_owner("com.example.Svc"), None);
        assert!(lock(conn.names()).is_empty());
    }

    #[test]
    fn taken_name_is_refused() {
        let bus = LoopbackBus::new();
        let owner = connect(&bus);
        let other = connect(&bus);
        let _name = owner
            .request_name("com.example.Svc", RequestNameFlags::default())
            .unwrap();
        let err = other
            .request_name("com.example.Svc", RequestNameFlags::DO_NOT_QUEUE)
            .unwrap_err();
        assert!(matches!(err, BusError::NameExists(n) if n == "com.example.Svc"));
    }

    #[test]
    fn unique_names_cannot_be_requested() {
        let bus = LoopbackBus::new();
        let conn = connect(&bus);
        assert!(conn
            .request_name(":1.42", RequestNameFlags::default())
            .is_err());
    }

    #[test]
    fn flags_combine() {
        let flags = RequestNameFlags::ALLOW_REPLACEMENT | RequestNameFlags::DO_NOT_QUEUE;
        assert_eq!(flags.bits(), 0x5);
    }
}
