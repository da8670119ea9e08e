//! Shared connections, one per bus type.

use crate::connection::{Connection, WeakConnection};
use crate::{lock, BusError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Environment variable naming the bus that started this process.
pub const STARTER_BUS_ENV: &str = "DBUS_STARTER_BUS_TYPE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
    Session,
    System,
    /// The bus that activated this process.
    Starter,
}

impl BusType {
    /// Resolve `Starter` through the environment when it names a known bus.
    pub fn resolve(self) -> BusType {
        if self != BusType::Starter {
            return self;
        }
        match std::env::var(STARTER_BUS_ENV).as_deref() {
            Ok("session") => BusType::Session,
            Ok("system") => BusType::System,
            _ => BusType::Starter,
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Session => write!(f, "session"),
            BusType::System => write!(f, "system"),
            BusType::Starter => write!(f, "starter"),
        }
    }
}

/// Opens a new connection to the given bus.
pub type Connector = Box<dyn Fn(BusType) -> Result<Connection, BusError> + Send + Sync>;

/// Hands out one shared connection per bus type. The pool only holds weak
/// references: once every handle is dropped the connection closes and the
/// next `acquire` opens a fresh one.
pub struct BusPool {
    connector: Connector,
    shared: Mutex<HashMap<BusType, WeakConnection>>,
}

impl BusPool {
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn(BusType) -> Result<Connection, BusError> + Send + Sync + 'static,
    {
        Self {
            connector: Box::new(connector),
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// The shared connection for `bus_type`, opened on first use.
    pub fn acquire(&self, bus_type: BusType) -> Result<Connection, BusError> {
        let bus_type = bus_type.resolve();
        if let Some(conn) = self.live(bus_type) {
            return Ok(conn);
        }
        let conn = (self.connector)(bus_type)?;
        let mut shared = lock(&self.shared);
        // Another thread may have connected while we did.
        if let Some(existing) = shared.get(&bus_type).and_then(WeakConnection::upgrade) {
            return Ok(existing);
        }
        shared.insert(bus_type, conn.downgrade());
        debug!("opened shared {bus_type} bus connection");
        Ok(conn)
    }

    /// A connection that is never shared with other callers.
    pub fn acquire_private(&self, bus_type: BusType) -> Result<Connection, BusError> {
        (self.connector)(bus_type.resolve())
    }

    fn live(&self, bus_type: BusType) -> Option<Connection> {
        lock(&self.shared)
            .get(&bus_type)
            .and_then(WeakConnection::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBus;
    use crate::ConnectionConfig;

    fn pool(bus: &LoopbackBus) -> BusPool {
        let bus = bus.clone();
        BusPool::new(move |_| Ok(Connection::new(bus.connect(), ConnectionConfig::default())))
    }

    #[test]
    fn acquire_shares_a_connection() {
        let bus = LoopbackBus::new();
        let pool = pool(&bus);
        let a = pool.acquire(BusType::Session).unwrap();
        let b = pool.acquire(BusType::Session).unwrap();
        assert_eq!(a.unique_name(), b.unique_name());
        assert_eq!(bus.endpoint_count(), 1);

        let system = pool.acquire(BusType::System).unwrap();
        assert_ne!(system.unique_name(), a.unique_name());
        assert_eq!(bus.endpoint_count(), 2);
    }

    #[test]
    fn last_drop_releases_the_connection() {
        let bus = LoopbackBus::new();
        let pool = pool(&bus);
        let a = pool.acquire(BusType::Session).unwrap();
        let first = a.unique_name();
        drop(a);
        assert_eq!(bus.endpoint_count(), 0);
        let again = pool.acquire(BusType::Session).unwrap();
        assert_ne!(again.unique_name(), first);
    }

    #[test]
    fn private_connections_are_not_shared() {
        let bus = LoopbackBus::new();
        let pool = pool(&bus);
        let shared = pool.acquire(BusType::Session).unwrap();
        let private = pool.acquire_private(BusType::Session).unwrap();
        assert_ne!(shared.unique_name(), private.unique_name());
        let again = pool.acquire(BusType::Session).unwrap();
        assert_eq!(again.unique_name(), shared.unique_name());
    }

    #[test]
    fn concrete_bus_types_resolve_to_themselves() {
        assert_eq!(BusType::Session.resolve(), BusType::Session);
        assert_eq!(BusType::System.resolve(), BusType::System);
        assert_eq!(BusType::System.to_string(), "system");
    }
}
