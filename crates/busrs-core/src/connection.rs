//! The connection dispatcher.
//!
//! Every inbound message that is not a reply to one of our own calls goes
//! through [`Connection::dispatch`] in a fixed order: the `Peer` interface,
//! signal delivery through the match tree, user filters, and finally the
//! object registry. Nothing that goes wrong in a handler escapes to the
//! transport.

use crate::bus_name::{BusName, NameInner, RequestNameFlags};
use crate::export::{
    ExportedObject, MessageHandler, ObjectRegistry, ObjectType, Resolution, UnregisterHook,
};
use crate::introspect::NodeInfo;
use crate::matching::{signal_handler, MatchRule, MatchSpec, MatchTree, SignalHandler};
use crate::transport::{PendingCall, Transport};
use crate::{
    lock, BusError, ConnectionConfig, Message, MessageType, Native, ObjectPath, Value,
    BUS_DAEMON_IFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH, ERROR_FAILED, INTROSPECTABLE_IFACE,
    PEER_IFACE,
};
use busrs_types::is_unique_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of a message filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Stop processing the message.
    Handled,
    /// Pass the message on to the next filter.
    NotYetHandled,
}

/// A filter sees every inbound message after signal delivery and before
/// method dispatch. Errors and panics count as `NotYetHandled`.
pub type MessageFilter =
    Arc<dyn Fn(&Connection, &Message) -> Result<FilterVerdict, BusError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// Tracks the owner of a well-known name some match rules subscribe to.
struct NameWatch {
    /// Tree key the subscribed rules currently live under: the owner's
    /// unique name, or the well-known name while it is unowned.
    key: String,
    refs: usize,
    rule: Arc<MatchRule>,
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    machine_id: String,
    matches: Mutex<MatchTree>,
    watches: Mutex<HashMap<String, NameWatch>>,
    filters: Mutex<Vec<(FilterId, MessageFilter)>>,
    registry: Mutex<ObjectRegistry>,
    names: Mutex<HashMap<String, Weak<NameInner>>>,
    next_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// A shared handle to one bus connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A non-owning handle, for callbacks that must not keep a connection alive.
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap `transport` and start receiving inbound messages from it.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Connection {
        let machine_id = config.resolve_machine_id();
        let inner = Arc::new(Inner {
            transport,
            config,
            machine_id,
            matches: Mutex::new(MatchTree::new()),
            watches: Mutex::new(HashMap::new()),
            filters: Mutex::new(Vec::new()),
            registry: Mutex::new(ObjectRegistry::new()),
            names: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&inner);
        inner.transport.set_inbound_handler(Arc::new(move |msg: &Message| {
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.dispatch(msg);
            }
        }));
        let conn = Connection { inner };
        debug!("connection {} ready", conn.describe());
        conn
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn unique_name(&self) -> Option<String> {
        self.inner.transport.unique_name()
    }

    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn close(&self) {
        self.inner.transport.close();
    }

    fn describe(&self) -> String {
        self.unique_name()
            .unwrap_or_else(|| "(peer-to-peer)".to_owned())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn names(&self) -> &Mutex<HashMap<String, Weak<NameInner>>> {
        &self.inner.names
    }

    pub fn send(&self, msg: Message) -> Result<u32, BusError> {
        self.inner.transport.send(msg)
    }

    /// Send `msg` and block until the reply arrives. `None` uses the
    /// configured default timeout. An Error reply becomes `Err`.
    pub fn call_blocking(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let timeout = timeout.or_else(|| self.inner.config.default_timeout());
        let reply = self
            .inner
            .transport
            .send_with_reply_and_block(msg, timeout)?;
        if reply.kind() == MessageType::Error {
            return Err(BusError::from_error_reply(&reply));
        }
        Ok(reply)
    }

    /// Send `msg` and run exactly one continuation when the reply arrives.
    /// Cancelling the returned call drops the reply.
    pub fn call_async<R, E>(
        &self,
        msg: Message,
        timeout: Option<Duration>,
        on_reply: R,
        on_error: E,
    ) -> Result<PendingCall, BusError>
    where
        R: FnOnce(Message) + Send + 'static,
        E: FnOnce(BusError) + Send + 'static,
    {
        let timeout = timeout.or_else(|| self.inner.config.default_timeout());
        let pending = self.inner.transport.send_with_reply(msg, timeout)?;
        pending.on_complete(move |reply| {
            if reply.kind() == MessageType::Error {
                on_error(BusError::from_error_reply(&reply));
            } else {
                on_reply(reply);
            }
        });
        Ok(pending)
    }

    /// Process traffic until `pending` completes or `timeout` expires.
    pub fn wait(&self, pending: &PendingCall, timeout: Option<Duration>) -> Result<(), BusError> {
        self.inner.transport.wait(pending, timeout)
    }

    pub fn emit_signal<I, T>(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: I,
        signature: Option<&str>,
    ) -> Result<u32, BusError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Native>,
    {
        let mut msg = Message::signal(path, interface, member)?;
        msg.append(args, signature)?;
        self.send(msg)
    }

    fn bus_message(
        &self,
        member: &str,
        args: Vec<Native>,
        signature: &str,
    ) -> Result<Message, BusError> {
        let mut msg = Message::method_call(
            Some(BUS_DAEMON_NAME),
            BUS_DAEMON_PATH,
            Some(BUS_DAEMON_IFACE),
            member,
        )?;
        msg.append(args, Some(signature))?;
        Ok(msg)
    }

    /// Blocking call to the bus daemon.
    pub(crate) fn call_bus(
        &self,
        member: &str,
        args: Vec<Native>,
        signature: &str,
    ) -> Result<Message, BusError> {
        let msg = self.bus_message(member, args, signature)?;
        self.call_blocking(msg, None)
    }

    /// Fire-and-forget call to the bus daemon with one string argument.
    /// Skipped on peer-to-peer links.
    pub(crate) fn notify_bus(&self, member: &str, arg: &str) {
        if self.unique_name().is_none() {
            return;
        }
        let sent = self
            .bus_message(member, vec![Native::from(arg)], "s")
            .and_then(|mut msg| {
                msg.set_no_reply_expected(true)?;
                self.send(msg)
            });
        if let Err(e) = sent {
            warn!("{member} to the bus failed: {e}");
        }
    }

    /// Subscribe `handler` to signals selected by `spec`.
    ///
    /// A well-known `sender` is tracked by its current owner: the owner is
    /// looked up once and then followed through `NameOwnerChanged`.
    pub fn add_signal_receiver(
        &self,
        spec: MatchSpec,
        handler: SignalHandler,
    ) -> Result<Arc<MatchRule>, BusError> {
        spec.validate()?;
        let rule = Arc::new(MatchRule::new(self.next_id(), spec, handler));
        let new_watch = {
            let mut watches = lock(&self.inner.watches);
            let (key, new_watch) = match rule.spec().sender.as_deref() {
                Some(sender) if self.follows_owner(sender) => {
                    let (key, new_watch) = self.watch_name(&mut watches, sender);
                    (Some(key), new_watch)
                }
                other => (other.map(str::to_owned), None),
            };
            lock(&self.inner.matches).add(key.as_deref(), Arc::clone(&rule));
            new_watch
        };
        debug!("added match {}", rule.rule_string());

        if let Some((name, watch_rule)) = new_watch {
            self.notify_bus("AddMatch", watch_rule.rule_string());
            self.lookup_owner(&name);
        }
        self.notify_bus("AddMatch", rule.rule_string());
        Ok(rule)
    }

    /// Remove every subscription with this spec (and handler, when given).
    /// Returns how many were removed; zero is not an error.
    pub fn remove_signal_receiver(
        &self,
        spec: &MatchSpec,
        handler: Option<&SignalHandler>,
    ) -> usize {
        let (removed, dropped_watch) = {
            let mut watches = lock(&self.inner.watches);
            let key = Self::sender_key(&watches, spec.sender.as_deref());
            let removed = lock(&self.inner.matches).remove(key.as_deref(), spec, handler);
            let dropped = self.release_watch(&mut watches, spec.sender.as_deref(), removed.len());
            (removed, dropped)
        };
        self.after_removal(&removed, dropped_watch);
        removed.len()
    }

    /// Remove exactly this subscription.
    pub fn remove_match(&self, rule: &Arc<MatchRule>) -> bool {
        let sender = rule.spec().sender.as_deref();
        let (removed, dropped_watch) = {
            let mut watches = lock(&self.inner.watches);
            let key = Self::sender_key(&watches, sender);
            let removed = lock(&self.inner.matches).remove_rule(key.as_deref(), rule);
            let dropped = self.release_watch(&mut watches, sender, usize::from(removed));
            (removed, dropped)
        };
        let removed: Vec<Arc<MatchRule>> = if removed {
            vec![Arc::clone(rule)]
        } else {
            Vec::new()
        };
        self.after_removal(&removed, dropped_watch);
        !removed.is_empty()
    }

    fn after_removal(&self, removed: &[Arc<MatchRule>], dropped_watch: Option<Arc<MatchRule>>) {
        for rule in removed {
            debug!("removed match {}", rule.rule_string());
            self.notify_bus("RemoveMatch", rule.rule_string());
        }
        if let Some(watch_rule) = dropped_watch {
            self.notify_bus("RemoveMatch", watch_rule.rule_string());
        }
    }

    fn follows_owner(&self, sender: &str) -> bool {
        !is_unique_name(sender) && sender != BUS_DAEMON_NAME && self.unique_name().is_some()
    }

    fn sender_key(watches: &HashMap<String, NameWatch>, sender: Option<&str>) -> Option<String> {
        sender.map(|s| {
            watches
                .get(s)
                .map_or_else(|| s.to_owned(), |w| w.key.clone())
        })
    }

    /// Take a reference on the watch for `name`, creating it if needed.
    /// Returns the current tree key and, for a new watch, its rule.
    fn watch_name(
        &self,
        watches: &mut HashMap<String, NameWatch>,
        name: &str,
    ) -> (String, Option<(String, Arc<MatchRule>)>) {
        if let Some(watch) = watches.get_mut(name) {
            watch.refs += 1;
            return (watch.key.clone(), None);
        }
        let spec = MatchSpec::new()
            .sender(BUS_DAEMON_NAME)
            .interface(BUS_DAEMON_IFACE)
            .member("NameOwnerChanged")
            .path(BUS_DAEMON_PATH)
            .arg(0, name);
        let weak = self.downgrade();
        let handler = signal_handler(move |event| {
            let (Some(name), Some(owner)) = (
                event.args().first().and_then(Value::as_str),
                event.args().get(2).and_then(Value::as_str),
            ) else {
                return Ok(());
            };
            if let Some(conn) = weak.upgrade() {
                conn.set_name_owner(name, owner);
            }
            Ok(())
        });
        let rule = Arc::new(MatchRule::new(self.next_id(), spec, handler));
        lock(&self.inner.matches).add(Some(BUS_DAEMON_NAME), Arc::clone(&rule));
        watches.insert(
            name.to_owned(),
            NameWatch {
                key: name.to_owned(),
                refs: 1,
                rule: Arc::clone(&rule),
            },
        );
        (name.to_owned(), Some((name.to_owned(), rule)))
    }

    fn release_watch(
        &self,
        watches: &mut HashMap<String, NameWatch>,
        sender: Option<&str>,
        count: usize,
    ) -> Option<Arc<MatchRule>> {
        let name = sender?;
        let watch = watches.get_mut(name)?;
        watch.refs = watch.refs.saturating_sub(count);
        if watch.refs > 0 {
            return None;
        }
        let watch = watches.remove(name)?;
        lock(&self.inner.matches).remove_rule(Some(BUS_DAEMON_NAME), &watch.rule);
        Some(watch.rule)
    }

    fn lookup_owner(&self, name: &str) {
        let weak = self.downgrade();
        let owned_name = name.to_owned();
        let call = self
            .bus_message("GetNameOwner", vec![Native::from(name)], "s")
            .and_then(|msg| {
                self.call_async(
                    msg,
                    None,
                    move |reply| {
                        let owner = reply.args().first().and_then(Value::as_str);
                        if let (Some(owner), Some(conn)) = (owner, weak.upgrade()) {
                            conn.set_name_owner(&owned_name, owner);
                        }
                    },
                    |e| debug!("owner lookup failed: {e}"),
                )
            });
        if let Err(e) = call {
            warn!("cannot look up the owner of {name}: {e}");
        }
    }

    /// Re-key the rules subscribed to `name` under its new owner. An empty
    /// owner parks them under the well-known name again.
    fn set_name_owner(&self, name: &str, owner: &str) {
        let mut watches = lock(&self.inner.watches);
        let Some(watch) = watches.get_mut(name) else {
            return;
        };
        let to = if owner.is_empty() { name } else { owner };
        let from = std::mem::replace(&mut watch.key, to.to_owned());
        let moved = lock(&self.inner.matches).rekey_sender(name, &from, to);
        debug!("{name} is now owned by '{owner}', moved {moved} match rules");
    }

    pub fn add_message_filter<F>(&self, filter: F) -> FilterId
    where
        F: Fn(&Connection, &Message) -> Result<FilterVerdict, BusError> + Send + Sync + 'static,
    {
        let id = FilterId(self.next_id());
        lock(&self.inner.filters).push((id, Arc::new(filter)));
        id
    }

    pub fn remove_message_filter(&self, id: FilterId) -> bool {
        let mut filters = lock(&self.inner.filters);
        let before = filters.len();
        filters.retain(|(fid, _)| *fid != id);
        filters.len() != before
    }

    /// Register `handler` at `path`. A fallback handler also receives calls
    /// for every path below it that has no handler of its own.
    pub fn register(
        &self,
        path: &str,
        handler: Arc<dyn MessageHandler>,
        hook: Option<UnregisterHook>,
        fallback: bool,
    ) -> Result<(), BusError> {
        let path = ObjectPath::new(path)?;
        lock(&self.inner.registry).register(&path, handler, hook, fallback)?;
        info!("registered object at {path}");
        Ok(())
    }

    /// Remove the handler at `path` and run its unregister hook.
    pub fn unregister(&self, path: &str) -> Result<(), BusError> {
        let path = ObjectPath::new(path)?;
        let hook = lock(&self.inner.registry).unregister(&path)?;
        info!("unregistered object at {path}");
        if let Some(hook) = hook {
            hook(&path);
        }
        Ok(())
    }

    /// Export an instance of `object_type` at `path`.
    pub fn export(
        &self,
        path: &str,
        object_type: &Arc<ObjectType>,
        fallback: bool,
    ) -> Result<Arc<ExportedObject>, BusError> {
        let object = Arc::new(ExportedObject::new(Arc::clone(object_type), ObjectPath::new(path)?));
        self.register(path, Arc::clone(&object) as Arc<dyn MessageHandler>, None, fallback)?;
        Ok(object)
    }

    /// Names of the direct children of `path` in the export tree.
    pub fn list_exported_child_objects(&self, path: &str) -> Result<Vec<String>, BusError> {
        let path = ObjectPath::new(path)?;
        Ok(lock(&self.inner.registry).children(&path))
    }

    /// Claim a well-known name. The name is released when the last handle
    /// for it is dropped.
    pub fn request_name(&self, name: &str, flags: RequestNameFlags) -> Result<BusName, BusError> {
        BusName::request(self, name, flags)
    }

    /// Route one inbound message. Never fails: handler problems are logged
    /// or turned into error replies.
    pub fn dispatch(&self, msg: &Message) {
        if msg.kind() == MessageType::MethodCall && msg.interface() == Some(PEER_IFACE) {
            self.handle_peer(msg);
            return;
        }
        if msg.kind() == MessageType::Signal {
            self.dispatch_signal(msg);
        }
        if self.run_filters(msg) == FilterVerdict::Handled {
            return;
        }
        if msg.kind() == MessageType::MethodCall {
            self.dispatch_method_call(msg);
        }
    }

    fn handle_peer(&self, msg: &Message) {
        let reply = match msg.member() {
            Some("Ping") => Message::method_return(msg),
            Some("GetMachineId") => Message::method_return(msg).and_then(|mut reply| {
                reply.append([self.machine_id()], Some("s"))?;
                Ok(reply)
            }),
            _ => {
                self.reply_error(msg, &unknown_method(msg));
                return;
            }
        };
        match reply {
            Ok(reply) if msg.expects_reply() => self.send_reply(reply),
            Ok(_) => {}
            Err(e) => warn!("cannot answer peer call: {e}"),
        }
    }

    fn dispatch_signal(&self, msg: &Message) {
        let rules = lock(&self.inner.matches).collect_matches(msg);
        for rule in rules {
            rule.deliver(msg);
        }
    }

    fn run_filters(&self, msg: &Message) -> FilterVerdict {
        let filters: Vec<MessageFilter> = lock(&self.inner.filters)
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for filter in filters {
            match catch_unwind(AssertUnwindSafe(|| filter(self, msg))) {
                Ok(Ok(FilterVerdict::Handled)) => return FilterVerdict::Handled,
                Ok(Ok(FilterVerdict::NotYetHandled)) => {}
                Ok(Err(e)) => warn!("message filter failed: {e}"),
                Err(_) => error!("message filter panicked on {msg}"),
            }
        }
        FilterVerdict::NotYetHandled
    }

    fn dispatch_method_call(&self, msg: &Message) {
        let Some(path) = msg.path().cloned() else {
            return;
        };
        let resolution = lock(&self.inner.registry).resolve(&path);
        match resolution {
            Resolution::Missing => self.reply_error(msg, &unknown_method(msg)),
            Resolution::Synthetic(children) => {
                let is_introspect = msg.member() == Some("Introspect")
                    && msg.interface().map_or(true, |i| i == INTROSPECTABLE_IFACE);
                if !is_introspect {
                    self.reply_error(msg, &unknown_method(msg));
                    return;
                }
                let xml = NodeInfo::synthetic(path.as_str(), children).to_xml();
                let reply = Message::method_return(msg).and_then(|mut reply| {
                    reply.append([xml], Some("s"))?;
                    Ok(reply)
                });
                match reply {
                    Ok(reply) if msg.expects_reply() => self.send_reply(reply),
                    Ok(_) => {}
                    Err(e) => warn!("cannot answer Introspect on {path}: {e}"),
                }
            }
            Resolution::Handler { handler, .. } => {
                match catch_unwind(AssertUnwindSafe(|| handler.handle_message(self, msg))) {
                    Ok(Ok(Some(reply))) => {
                        if msg.expects_reply() {
                            self.send_reply(reply);
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        debug!("handler at {path} failed: {e}");
                        self.reply_error(msg, &e);
                    }
                    Err(_) => {
                        error!("handler at {path} panicked on {msg}");
                        self.reply_error_named(msg, ERROR_FAILED, "method handler panicked");
                    }
                }
            }
        }
    }

    fn reply_error(&self, call: &Message, err: &BusError) {
        self.reply_error_named(call, err.dbus_name(), &err.to_string());
    }

    pub(crate) fn reply_error_named(&self, call: &Message, name: &str, text: &str) {
        if !call.expects_reply() {
            return;
        }
        match Message::error(call, name, Some(text)) {
            Ok(reply) => self.send_reply(reply),
            Err(e) => warn!("cannot build error reply {name}: {e}"),
        }
    }

    pub(crate) fn send_reply(&self, reply: Message) {
        if let Err(e) = self.send(reply) {
            warn!("cannot send reply: {e}");
        }
    }
}

fn unknown_method(msg: &Message) -> BusError {
    BusError::UnknownMethod {
        path: msg.path().map(|p| p.to_string()).unwrap_or_default(),
        interface: msg.interface().unwrap_or("(none)").to_owned(),
        member: msg.member().unwrap_or_default().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBus;
    use crate::{ERROR_INVALID_ARGS, ERROR_UNKNOWN_METHOD as UNKNOWN};
    use std::sync::atomic::AtomicUsize;

    fn pair() -> (LoopbackBus, Connection, Connection) {
        let bus = LoopbackBus::new();
        let config = ConnectionConfig::default();
        let a = Connection::new(bus.connect(), config.clone());
        let b = Connection::new(bus.connect(), config);
        bus.run_until_idle();
        (bus, a, b)
    }

    fn call_to(conn: &Connection, path: &str, iface: Option<&str>, member: &str) -> Message {
        let dest = conn.unique_name().unwrap();
        Message::method_call(Some(&dest), path, iface, member).unwrap()
    }

    #[test]
    fn unknown_object_gets_unknown_method() {
        let (_bus, a, b) = pair();
        let err = a
            .call_blocking(call_to(&b, "/nowhere", Some("com.example.X"), "Go"), None)
            .unwrap_err();
        match err {
            BusError::Remote(e) => {
                assert_eq!(e.name, UNKNOWN);
                assert!(e.message.contains("/nowhere"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn raw_handler_replies() {
        let (_bus, a, b) = pair();
        let handler = |_conn: &Connection, msg: &Message| -> Result<Option<Message>, BusError> {
            let mut reply = Message::method_return(msg)?;
            reply.append([42i32], None)?;
            Ok(Some(reply))
        };
        b.register("/obj", Arc::new(handler), None, false).unwrap();
        let reply = a
            .call_blocking(call_to(&b, "/obj", Some("com.example.X"), "Go"), None)
            .unwrap();
        assert_eq!(reply.args()[0].as_i64(), Some(42));
    }

    #[test]
    fn handler_errors_become_error_replies() {
        let (_bus, a, b) = pair();
        let handler = |_conn: &Connection, _msg: &Message| -> Result<Option<Message>, BusError> {
            Err(BusError::Type(crate::TypeError::AmbiguousSignature("x".into())))
        };
        b.register("/obj", Arc::new(handler), None, false).unwrap();
        let err = a
            .call_blocking(call_to(&b, "/obj", None, "Go"), None)
            .unwrap_err();
        assert!(matches!(err, BusError::Remote(e) if e.name == ERROR_INVALID_ARGS));
    }

    #[test]
    fn panicking_handler_answers_failed() {
        let (_bus, a, b) = pair();
        let handler = |_conn: &Connection, _msg: &Message| -> Result<Option<Message>, BusError> {
            panic!("handler bug")
        };
        b.register("/obj", Arc::new(handler), None, false).unwrap();
        let err = a
            .call_blocking(call_to(&b, "/obj", None, "Go"), None)
            .unwrap_err();
        assert!(matches!(err, BusError::Remote(e) if e.name == ERROR_FAILED));
    }

    #[test]
    fn unregister_runs_hook_once() {
        let (_bus, _a, b) = pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handler = |_conn: &Connection, _msg: &Message| -> Result<Option<Message>, BusError> {
            Ok(None)
        };
        let hook: UnregisterHook = Box::new(move |path: &ObjectPath| {
            assert_eq!(path.as_str(), "/obj");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        b.register("/obj", Arc::new(handler), Some(hook), false).unwrap();
        b.unregister("/obj").unwrap();
        assert!(matches!(b.unregister("/obj"), Err(BusError::NotFound(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_receiver_registers_match_with_bus() {
        let (bus, a, _b) = pair();
        let spec = MatchSpec::new().member("Done");
        let rule = a
            .add_signal_receiver(spec.clone(), signal_handler(|_| Ok(())))
            .unwrap();
        bus.run_until_idle();
        let unique = a.unique_name().unwrap();
        assert_eq!(bus.match_rules(&unique), vec![rule.rule_string().to_owned()]);

        assert_eq!(a.remove_signal_receiver(&spec, None), 1);
        assert_eq!(a.remove_signal_receiver(&spec, None), 0);
        bus.run_until_idle();
        assert!(bus.match_rules(&unique).is_empty());
    }

    #[test]
    fn signal_handler_may_remove_itself() {
        let (bus, a, b) = pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let weak = a.downgrade();
        let spec = MatchSpec::new().member("Tick");
        let inner_spec = spec.clone();
        a.add_signal_receiver(
            spec,
            signal_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(conn) = weak.upgrade() {
                    conn.remove_signal_receiver(&inner_spec, None);
                }
                Ok(())
            }),
        )
        .unwrap();
        for _ in 0..2 {
            b.emit_signal("/x", "com.example.Clock", "Tick", Vec::<Native>::new(), None)
                .unwrap();
        }
        bus.run_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_filter_no_longer_runs() {
        let (bus, a, b) = pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = a.add_message_filter(move |_conn: &Connection, _msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FilterVerdict::NotYetHandled)
        });
        b.emit_signal("/x", "com.example.Clock", "Tick", Vec::<Native>::new(), None)
            .unwrap();
        bus.run_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(a.remove_message_filter(id));
        assert!(!a.remove_message_filter(id));
        b.emit_signal("/x", "com.example.Clock", "Tick", Vec::<Native>::new(), None)
            .unwrap();
        bus.run_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn call_async_runs_error_continuation() {
        let (bus, a, b) = pair();
        let failed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failed);
        a.call_async(
            call_to(&b, "/missing", None, "Go"),
            None,
            |_| panic!("no reply expected"),
            move |e| {
                assert_eq!(e.dbus_name(), UNKNOWN);
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        bus.run_until_idle();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_call_runs_no_continuation() {
        let (bus, a, b) = pair();
        let pending = a
            .call_async(
                call_to(&b, "/missing", None, "Go"),
                None,
                |_| panic!("cancelled"),
                |_| panic!("cancelled"),
            )
            .unwrap();
        pending.cancel();
        bus.run_until_idle();
        assert!(pending.is_cancelled());
    }

    #[test]
    fn dropping_connection_detaches_endpoint() {
        let (bus, a, b) = pair();
        assert_eq!(bus.endpoint_count(), 2);
        drop(b);
        assert_eq!(bus.endpoint_count(), 1);
        drop(a);
        assert_eq!(bus.endpoint_count(), 0);
    }
}
