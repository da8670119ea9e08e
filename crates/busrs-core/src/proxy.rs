//! Client-side handles for remote objects.
//!
//! A [`Proxy`] introspects its object the first time it is used and uses
//! the declared in-signatures to type call arguments. Calls made while
//! introspection is outstanding are queued (async) or wait for it
//! (blocking). If introspection fails the proxy falls back to guessing
//! argument types for good.

use crate::connection::Connection;
use crate::introspect::NodeInfo;
use crate::matching::{MatchRule, MatchSpec, SignalHandler};
use crate::transport::PendingCall;
use crate::{lock, BusError, Message, Native, ObjectPath, Value, INTROSPECTABLE_IFACE};
use busrs_types::validate_bus_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// In-signatures keyed by `interface.member`.
type SignatureTable = HashMap<String, String>;

type QueuedCall = Box<dyn FnOnce(Option<&SignatureTable>) + Send>;

enum Introspection {
    Idle,
    Pending {
        call: Option<PendingCall>,
        queued: Vec<QueuedCall>,
    },
    Ready(SignatureTable),
    Failed,
}

#[derive(Clone)]
pub struct Proxy {
    conn: Connection,
    destination: Option<String>,
    path: ObjectPath,
    state: Arc<Mutex<Introspection>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("destination", &self.destination)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(conn: &Connection, destination: Option<&str>, path: &str) -> Result<Self, BusError> {
        if let Some(dest) = destination {
            validate_bus_name(dest)?;
        }
        Ok(Self {
            conn: conn.clone(),
            destination: destination.map(str::to_owned),
            path: ObjectPath::new(path)?,
            state: Arc::new(Mutex::new(Introspection::Idle)),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn is_introspected(&self) -> bool {
        matches!(*lock(&self.state), Introspection::Ready(_))
    }

    pub fn introspection_failed(&self) -> bool {
        matches!(*lock(&self.state), Introspection::Failed)
    }

    /// Call a method and wait for its reply arguments.
    ///
    /// Arguments are typed by `signature` if given, else by the introspected
    /// signature, else guessed. `None` for `timeout` uses the connection's
    /// default.
    pub fn call_blocking(
        &self,
        interface: Option<&str>,
        member: &str,
        args: Vec<Native>,
        signature: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, BusError> {
        self.start_introspection();
        let pending = match &*lock(&self.state) {
            Introspection::Pending {
                call: Some(call), ..
            } => Some(call.clone()),
            _ => None,
        };
        if let Some(call) = pending {
            if let Err(e) = self.conn.wait(&call, timeout) {
                debug!("introspection of {} did not finish: {e}", self.path);
                call.cancel();
                finish(&self.state, Introspection::Failed);
            }
        }
        let table = self.table();
        let msg = self.build_call(interface, member, args, signature, table.as_ref())?;
        let reply = self.conn.call_blocking(msg, timeout)?;
        Ok(reply.args().to_vec())
    }

    /// Call a method and run one of the continuations with the outcome.
    pub fn call_async<R, E>(
        &self,
        interface: Option<&str>,
        member: &str,
        args: Vec<Native>,
        signature: Option<&str>,
        on_reply: R,
        on_error: E,
    ) -> Result<(), BusError>
    where
        R: FnOnce(Vec<Value>) + Send + 'static,
        E: FnOnce(BusError) + Send + 'static,
    {
        let proxy = self.clone();
        let interface = interface.map(str::to_owned);
        let member = member.to_owned();
        let signature = signature.map(str::to_owned);
        self.when_introspected(Box::new(move |table| {
            let on_error = Arc::new(Mutex::new(Some(on_error)));
            let async_error = Arc::clone(&on_error);
            let sent = proxy
                .build_call(
                    interface.as_deref(),
                    &member,
                    args,
                    signature.as_deref(),
                    table,
                )
                .and_then(|msg| {
                    proxy.conn.call_async(
                        msg,
                        None,
                        move |reply| on_reply(reply.args().to_vec()),
                        move |e| report(&async_error, e),
                    )
                });
            if let Err(e) = sent {
                report(&on_error, e);
            }
        }));
        Ok(())
    }

    /// Send a call that expects no reply.
    pub fn call_no_reply(
        &self,
        interface: Option<&str>,
        member: &str,
        args: Vec<Native>,
        signature: Option<&str>,
    ) -> Result<(), BusError> {
        let proxy = self.clone();
        let interface = interface.map(str::to_owned);
        let member = member.to_owned();
        let signature = signature.map(str::to_owned);
        self.when_introspected(Box::new(move |table| {
            let sent = proxy
                .build_call(
                    interface.as_deref(),
                    &member,
                    args,
                    signature.as_deref(),
                    table,
                )
                .and_then(|mut msg| {
                    msg.set_no_reply_expected(true)?;
                    proxy.conn.send(msg)
                });
            if let Err(e) = sent {
                warn!("{member} on {} was not sent: {e}", proxy.path);
            }
        }));
        Ok(())
    }

    /// Subscribe to a signal from this object.
    pub fn connect_to_signal(
        &self,
        interface: Option<&str>,
        member: &str,
        handler: SignalHandler,
    ) -> Result<Arc<MatchRule>, BusError> {
        let mut spec = MatchSpec::new().member(member).path(self.path.as_str());
        if let Some(iface) = interface {
            spec = spec.interface(iface);
        }
        if let Some(dest) = &self.destination {
            spec = spec.sender(dest);
        }
        self.conn.add_signal_receiver(spec, handler)
    }

    fn table(&self) -> Option<SignatureTable> {
        match &*lock(&self.state) {
            Introspection::Ready(table) => Some(table.clone()),
            _ => None,
        }
    }

    fn build_call(
        &self,
        interface: Option<&str>,
        member: &str,
        args: Vec<Native>,
        signature: Option<&str>,
        table: Option<&SignatureTable>,
    ) -> Result<Message, BusError> {
        let introspected = match signature {
            Some(_) => None,
            None => table.and_then(|t| lookup_signature(t, interface, member)),
        };
        let destination = self.destination.as_deref();
        let mut msg = Message::method_call(destination, self.path.as_str(), interface, member)?;
        msg.append(args, signature.or(introspected.as_deref()))?;
        Ok(msg)
    }

    /// Run `f` now if introspection is settled, or once it is.
    fn when_introspected(&self, f: QueuedCall) {
        self.start_introspection();
        let table = {
            let mut state = lock(&self.state);
            match &mut *state {
                Introspection::Pending { queued, .. } => {
                    queued.push(f);
                    return;
                }
                Introspection::Ready(table) => Some(table.clone()),
                Introspection::Idle | Introspection::Failed => None,
            }
        };
        f(table.as_ref());
    }

    fn start_introspection(&self) {
        if !self.conn.config().introspect_proxies {
            return;
        }
        {
            let mut state = lock(&self.state);
            if !matches!(*state, Introspection::Idle) {
                return;
            }
            *state = Introspection::Pending {
                call: None,
                queued: Vec::new(),
            };
        }

        let on_reply_state = Arc::clone(&self.state);
        let on_error_state = Arc::clone(&self.state);
        let path = self.path.to_string();
        let sent = Message::method_call(
            self.destination.as_deref(),
            self.path.as_str(),
            Some(INTROSPECTABLE_IFACE),
            "Introspect",
        )
        .map_err(BusError::from)
        .and_then(|msg| {
            self.conn.call_async(
                msg,
                None,
                move |reply| {
                    let parsed = reply
                        .args()
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            BusError::IntrospectionParse("Introspect returned no string".into())
                        })
                        .and_then(NodeInfo::parse);
                    let next = match parsed {
                        Ok(node) => Introspection::Ready(node.in_signatures()),
                        Err(e) => {
                            debug!("introspection data for {path} unusable: {e}");
                            Introspection::Failed
                        }
                    };
                    finish(&on_reply_state, next);
                },
                move |e| {
                    debug!("introspection failed: {e}");
                    finish(&on_error_state, Introspection::Failed);
                },
            )
        });

        match sent {
            Ok(pending) => {
                if let Introspection::Pending { call, .. } = &mut *lock(&self.state) {
                    *call = Some(pending);
                }
            }
            Err(e) => {
                debug!("cannot introspect {}: {e}", self.path);
                finish(&self.state, Introspection::Failed);
            }
        }
    }
}

/// Run the error continuation unless it already ran.
fn report<E: FnOnce(BusError)>(slot: &Mutex<Option<E>>, err: BusError) {
    let callback = lock(slot).take();
    if let Some(callback) = callback {
        callback(err);
    }
}

/// Settle introspection and run everything queued behind it. A proxy
/// that gave up on introspection stays failed.
fn finish(state: &Mutex<Introspection>, next: Introspection) {
    let (queued, table) = {
        let mut state = lock(state);
        if matches!(*state, Introspection::Failed) {
            return;
        }
        let previous = std::mem::replace(&mut *state, next);
        let table = match &*state {
            Introspection::Ready(table) => Some(table.clone()),
            _ => None,
        };
        match previous {
            Introspection::Pending { queued, .. } => (queued, table),
            _ => (Vec::new(), table),
        }
    };
    for call in queued {
        call(table.as_ref());
    }
}

/// The in-signature for `member`. Without an interface the member must be
/// unambiguous across interfaces.
fn lookup_signature(
    table: &SignatureTable,
    interface: Option<&str>,
    member: &str,
) -> Option<String> {
    if let Some(iface) = interface {
        return table.get(&format!("{iface}.{member}")).cloned();
    }
    let suffix = format!(".{member}");
    let mut matches = table
        .iter()
        .filter(|(key, _)| key.ends_with(&suffix))
        .map(|(_, sig)| sig);
    match (matches.next(), matches.next()) {
        (Some(sig), None) => Some(sig.clone()),
        _ => None,
    }
}
