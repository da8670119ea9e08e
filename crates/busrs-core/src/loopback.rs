//! In-memory bus for tests and in-process peers.
//!
//! Every message is encoded to wire bytes on send and decoded again on
//! delivery, so the loopback exercises the same codec a socket transport
//! would. The bus answers the subset of `org.freedesktop.DBus` the core
//! relies on. Signals without a destination are delivered to every attached
//! endpoint; match rules are only recorded.

use crate::bus_name::{
    RELEASE_NAME_NON_EXISTENT, RELEASE_NAME_NOT_OWNER, RELEASE_NAME_RELEASED,
    REQUEST_NAME_ALREADY_OWNER, REQUEST_NAME_EXISTS, REQUEST_NAME_PRIMARY_OWNER,
};
use crate::transport::{InboundHandler, PendingCall, Transport};
use crate::{
    describe_timeout, lock, BusError, ConnectionConfig, Message, MessageType, Value,
    BUS_DAEMON_IFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH, ERROR_INVALID_ARGS,
    ERROR_MATCH_RULE_NOT_FOUND, ERROR_NAME_HAS_NO_OWNER, ERROR_NO_REPLY, ERROR_SERVICE_UNKNOWN,
    ERROR_UNKNOWN_METHOD,
};
use busrs_types::{is_unique_name, validate_bus_name, CompleteType};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const IDLE_POLL: Duration = Duration::from_millis(1);

struct PendingEntry {
    call: PendingCall,
    deadline: Option<Instant>,
    request: Message,
}

#[derive(Default)]
struct Endpoint {
    handler: Option<InboundHandler>,
    pending: HashMap<u32, PendingEntry>,
    matches: Vec<String>,
}

type DaemonResult = Result<Vec<Value>, (&'static str, String)>;

struct BusState {
    prefix: String,
    next_id: u64,
    daemon_serial: u32,
    queue: VecDeque<Vec<u8>>,
    endpoints: BTreeMap<String, Endpoint>,
    names: BTreeMap<String, String>,
}

impl BusState {
    fn resolve(&self, name: &str) -> Option<String> {
        if is_unique_name(name) {
            return self
                .endpoints
                .contains_key(name)
                .then(|| name.to_owned());
        }
        self.names.get(name).cloned()
    }

    fn daemon_emit(&mut self, mut msg: Message) {
        self.daemon_serial = self.daemon_serial.wrapping_add(1).max(1);
        let serial = self.daemon_serial;
        let encoded = msg
            .set_sender(BUS_DAEMON_NAME)
            .and_then(|()| msg.set_serial(serial))
            .and_then(|()| msg.encode(serial));
        match encoded {
            Ok(bytes) => self.queue.push_back(bytes),
            Err(e) => warn!("loopback: cannot encode bus message: {e}"),
        }
    }

    fn name_owner_changed(&mut self, name: &str, old: &str, new: &str) {
        let signal = Message::signal(BUS_DAEMON_PATH, BUS_DAEMON_IFACE, "NameOwnerChanged")
            .and_then(|mut msg| msg.append([name, old, new], Some("sss")).map(|()| msg));
        match signal {
            Ok(msg) => self.daemon_emit(msg),
            Err(e) => warn!("loopback: cannot build NameOwnerChanged: {e}"),
        }
    }

    fn reply(&mut self, call: &Message, result: DaemonResult) {
        if !call.expects_reply() {
            return;
        }
        let built = match result {
            Ok(values) => Message::method_return(call).and_then(|mut msg| {
                values
                    .into_iter()
                    .try_for_each(|v| msg.append_value(v))
                    .map(|()| msg)
            }),
            Err((name, text)) => Message::error(call, name, Some(&text)),
        };
        match built {
            Ok(msg) => self.daemon_emit(msg),
            Err(e) => warn!("loopback: cannot build reply to {call}: {e}"),
        }
    }

    fn daemon_method(&mut self, sender: &str, member: &str, args: &[Value]) -> DaemonResult {
        let arg = |idx: usize| -> Result<String, (&'static str, String)> {
            args.get(idx)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| {
                    (
                        ERROR_INVALID_ARGS,
                        format!("{member} expects a string argument {idx}"),
                    )
                })
        };
        match member {
            "Hello" => Ok(vec![Value::String(sender.to_owned())]),
            "RequestName" => {
                let name = arg(0)?;
                if validate_bus_name(&name).is_err() || is_unique_name(&name) {
                    return Err((ERROR_INVALID_ARGS, format!("cannot acquire name '{name}'")));
                }
                let code = match self.names.get(&name) {
                    Some(owner) if owner == sender => REQUEST_NAME_ALREADY_OWNER,
                    Some(_) => REQUEST_NAME_EXISTS,
                    None => {
                        self.names.insert(name.clone(), sender.to_owned());
                        self.name_owner_changed(&name, "", sender);
                        REQUEST_NAME_PRIMARY_OWNER
                    }
                };
                Ok(vec![Value::UInt32(code)])
            }
            "ReleaseName" => {
                let name = arg(0)?;
                let code = match self.names.get(&name) {
                    None => RELEASE_NAME_NON_EXISTENT,
                    Some(owner) if owner != sender => RELEASE_NAME_NOT_OWNER,
                    Some(_) => {
                        self.names.remove(&name);
                        self.name_owner_changed(&name, sender, "");
                        RELEASE_NAME_RELEASED
                    }
                };
                Ok(vec![Value::UInt32(code)])
            }
            "GetNameOwner" => {
                let name = arg(0)?;
                if name == BUS_DAEMON_NAME {
                    return Ok(vec![Value::String(name)]);
                }
                match self.resolve(&name) {
                    Some(owner) => Ok(vec![Value::String(owner)]),
                    None => Err((
                        ERROR_NAME_HAS_NO_OWNER,
                        format!("Could not get owner of name '{name}': no such name"),
                    )),
                }
            }
            "NameHasOwner" => {
                let name = arg(0)?;
                let owned = name == BUS_DAEMON_NAME || self.resolve(&name).is_some();
                Ok(vec![Value::Boolean(owned)])
            }
            "ListNames" => {
                let names = std::iter::once(BUS_DAEMON_NAME.to_owned())
                    .chain(self.endpoints.keys().cloned())
                    .chain(self.names.keys().cloned())
                    .map(Value::String)
                    .collect();
                let list = Value::array(CompleteType::String, names)
                    .map_err(|e| (ERROR_INVALID_ARGS, e.to_string()))?;
                Ok(vec![list])
            }
            "AddMatch" => {
                let rule = arg(0)?;
                if let Some(ep) = self.endpoints.get_mut(sender) {
                    ep.matches.push(rule);
                }
                Ok(Vec::new())
            }
            "RemoveMatch" => {
                let rule = arg(0)?;
                let ep = self.endpoints.get_mut(sender);
                match ep.and_then(|ep| {
                    let idx = ep.matches.iter().position(|r| *r == rule)?;
                    Some(ep.matches.remove(idx))
                }) {
                    Some(_) => Ok(Vec::new()),
                    None => Err((
                        ERROR_MATCH_RULE_NOT_FOUND,
                        "The given match rule wasn't found and can't be removed".to_owned(),
                    )),
                }
            }
            other => Err((
                ERROR_UNKNOWN_METHOD,
                format!("{BUS_DAEMON_IFACE} does not understand message {other}"),
            )),
        }
    }
}

/// A shared in-memory bus. Clones refer to the same bus.
#[derive(Clone)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::with_prefix(":1.")
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: &ConnectionConfig) -> Self {
        Self::with_prefix(&config.unique_name_prefix)
    }

    fn with_prefix(prefix: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                prefix: prefix.to_owned(),
                next_id: 0,
                daemon_serial: 0,
                queue: VecDeque::new(),
                endpoints: BTreeMap::new(),
                names: BTreeMap::new(),
            })),
        }
    }

    /// Attach a new endpoint and assign it a unique name.
    pub fn connect(&self) -> Arc<LoopbackTransport> {
        let unique = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let unique = format!("{}{}", state.prefix, state.next_id);
            state.endpoints.insert(unique.clone(), Endpoint::default());
            state.name_owner_changed(&unique, "", &unique);
            unique
        };
        debug!("loopback: attached {unique}");
        Arc::new(LoopbackTransport {
            bus: self.clone(),
            unique,
            next_serial: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver one queued message. Returns `false` when the queue is empty.
    pub fn dispatch_one(&self) -> bool {
        self.expire_pending();
        let Some(bytes) = lock(&self.state).queue.pop_front() else {
            return false;
        };
        match Message::decode(&bytes) {
            Ok(msg) => self.route(msg),
            Err(e) => warn!("loopback: dropping undecodable message: {e}"),
        }
        true
    }

    /// Deliver messages until the queue is empty; returns how many were
    /// delivered.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while self.dispatch_one() {
            delivered += 1;
        }
        delivered
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn endpoint_count(&self) -> usize {
        lock(&self.state).endpoints.len()
    }

    pub fn name_owner(&self, name: &str) -> Option<String> {
        lock(&self.state).resolve(name)
    }

    /// Match rules registered through AddMatch by `unique`, in order.
    pub fn match_rules(&self, unique: &str) -> Vec<String> {
        lock(&self.state)
            .endpoints
            .get(unique)
            .map(|ep| ep.matches.clone())
            .unwrap_or_default()
    }

    fn post(&self, from: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if !state.endpoints.contains_key(from) {
            return Err(BusError::Disconnected);
        }
        state.queue.push_back(bytes);
        Ok(())
    }

    fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<PendingEntry> = {
            let mut state = lock(&self.state);
            let mut expired = Vec::new();
            for ep in state.endpoints.values_mut() {
                let due: Vec<u32> = ep
                    .pending
                    .iter()
                    .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
                    .map(|(serial, _)| *serial)
                    .collect();
                expired.extend(due.iter().filter_map(|serial| ep.pending.remove(serial)));
            }
            expired
        };
        for entry in expired {
            let text = "Did not receive a reply before the timeout expired";
            match Message::error(&entry.request, ERROR_NO_REPLY, Some(text)) {
                Ok(reply) => entry.call.complete(reply),
                Err(e) => {
                    warn!("loopback: cannot build timeout reply: {e}");
                    entry.call.cancel();
                }
            }
        }
    }

    fn forget_pending(&self, unique: &str, serial: u32) {
        if let Some(ep) = lock(&self.state).endpoints.get_mut(unique) {
            ep.pending.remove(&serial);
        }
    }

    fn route(&self, msg: Message) {
        if msg.destination() == Some(BUS_DAEMON_NAME) {
            self.handle_daemon_call(&msg);
            return;
        }
        match msg.kind() {
            MessageType::MethodReturn | MessageType::Error => self.deliver_reply(msg),
            MessageType::Signal if msg.destination().is_none() => self.broadcast(&msg),
            _ => self.deliver_unicast(&msg),
        }
    }

    fn handle_daemon_call(&self, msg: &Message) {
        if msg.kind() != MessageType::MethodCall {
            return;
        }
        let sender = msg.sender().unwrap_or_default().to_owned();
        let member = msg.member().unwrap_or_default();
        debug!("loopback: {sender} called {member} on the bus");
        let mut state = lock(&self.state);
        let result = state.daemon_method(&sender, member, msg.args());
        state.reply(msg, result);
    }

    fn deliver_reply(&self, msg: Message) {
        let Some(dest) = msg.destination() else {
            debug!("loopback: dropping reply without destination: {msg}");
            return;
        };
        let (pending, handler) = {
            let mut state = lock(&self.state);
            let Some(unique) = state.resolve(dest) else {
                debug!("loopback: reply for vanished {dest}");
                return;
            };
            let Some(ep) = state.endpoints.get_mut(&unique) else {
                return;
            };
            let pending = msg.reply_serial().and_then(|s| ep.pending.remove(&s));
            (pending, ep.handler.clone())
        };
        match (pending, handler) {
            (Some(entry), _) => entry.call.complete(msg),
            (None, Some(handler)) => handler(&msg),
            (None, None) => {}
        }
    }

    fn broadcast(&self, msg: &Message) {
        let handlers: Vec<InboundHandler> = lock(&self.state)
            .endpoints
            .values()
            .filter_map(|ep| ep.handler.clone())
            .collect();
        for handler in handlers {
            handler(msg);
        }
    }

    fn deliver_unicast(&self, msg: &Message) {
        let dest = msg.destination().unwrap_or_default();
        let target = {
            let state = lock(&self.state);
            state
                .resolve(dest)
                .and_then(|unique| state.endpoints.get(&unique))
                .map(|ep| ep.handler.clone())
        };
        match target {
            Some(Some(handler)) => handler(msg),
            Some(None) => debug!("loopback: {dest} has no inbound handler"),
            None => {
                debug!("loopback: no owner for '{dest}'");
                if msg.kind() == MessageType::MethodCall {
                    let text = format!("The name {dest} was not provided by any .service files");
                    lock(&self.state).reply(msg, Err((ERROR_SERVICE_UNKNOWN, text)));
                }
            }
        }
    }

    fn detach(&self, unique: &str) {
        let pending = {
            let mut state = lock(&self.state);
            let Some(ep) = state.endpoints.remove(unique) else {
                return;
            };
            let owned: Vec<String> = state
                .names
                .iter()
                .filter(|(_, owner)| *owner == unique)
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                state.names.remove(&name);
                state.name_owner_changed(&name, unique, "");
            }
            state.name_owner_changed(unique, unique, "");
            ep.pending
        };
        for entry in pending.into_values() {
            entry.call.cancel();
        }
        debug!("loopback: detached {unique}");
    }
}

/// One endpoint of a [`LoopbackBus`].
pub struct LoopbackTransport {
    bus: LoopbackBus,
    unique: String,
    next_serial: AtomicU32,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    fn stamp(&self, msg: &mut Message) -> Result<u32, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        msg.set_serial(serial)?;
        msg.set_sender(&self.unique)?;
        Ok(serial)
    }
}

impl Transport for LoopbackTransport {
    fn unique_name(&self) -> Option<String> {
        Some(self.unique.clone())
    }

    fn send(&self, mut msg: Message) -> Result<u32, BusError> {
        let serial = self.stamp(&mut msg)?;
        let bytes = msg.encode(serial)?;
        self.bus.post(&self.unique, bytes)?;
        Ok(serial)
    }

    fn send_with_reply(
        &self,
        mut msg: Message,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, BusError> {
        let serial = self.stamp(&mut msg)?;
        let bytes = msg.encode(serial)?;
        let pending = PendingCall::new(serial);
        let mut state = lock(&self.bus.state);
        let ep = state
            .endpoints
            .get_mut(&self.unique)
            .ok_or(BusError::Disconnected)?;
        ep.pending.insert(
            serial,
            PendingEntry {
                call: pending.clone(),
                deadline: timeout.map(|t| Instant::now() + t),
                request: msg,
            },
        );
        state.queue.push_back(bytes);
        Ok(pending)
    }

    fn wait(&self, pending: &PendingCall, timeout: Option<Duration>) -> Result<(), BusError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if pending.is_complete() {
                return Ok(());
            }
            if pending.is_cancelled() {
                return Err(BusError::NoReply("call was cancelled".to_owned()));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(BusError::Disconnected);
            }
            if self.bus.dispatch_one() {
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.bus.forget_pending(&self.unique, pending.serial());
                pending.cancel();
                return Err(BusError::NoReply(describe_timeout(timeout)));
            }
            std::thread::sleep(IDLE_POLL);
        }
    }

    fn set_inbound_handler(&self, handler: InboundHandler) {
        if let Some(ep) = lock(&self.bus.state).endpoints.get_mut(&self.unique) {
            ep.handler = Some(handler);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.detach(&self.unique);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}
