use super::registry::MessageHandler;
use crate::connection::Connection;
use crate::introspect::{ArgInfo, Direction, InterfaceInfo, MethodInfo, NodeInfo, SignalInfo};
use crate::{
    lock, ArgOptions, BusError, Message, MessageError, Native, ObjectPath, Signature, TypeError,
    Value, ERROR_FAILED, ERROR_INVALID_ARGS, INTROSPECTABLE_IFACE,
};
use busrs_types::{validate_error_name, validate_interface_name, validate_member_name};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

type MethodFn = dyn Fn(&MethodContext<'_>, Vec<Value>) -> Result<Native, MethodError> + Send + Sync;
type DeferredFn =
    dyn Fn(&MethodContext<'_>, Vec<Value>, ReplyHandle) -> Result<(), MethodError> + Send + Sync;

#[derive(Clone)]
enum Invoke {
    Immediate(Arc<MethodFn>),
    Deferred(Arc<DeferredFn>),
}

/// Declaration of one exported method.
pub struct MethodSpec {
    interface: String,
    name: String,
    in_signature: Option<String>,
    out_signature: Option<String>,
    arg_names: Vec<String>,
    out_names: Vec<String>,
    options: ArgOptions,
    invoke: Invoke,
}

impl MethodSpec {
    /// A method whose return value is the handler's result.
    pub fn new<F>(interface: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&MethodContext<'_>, Vec<Value>) -> Result<Native, MethodError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_invoke(interface, name, Invoke::Immediate(Arc::new(handler)))
    }

    /// A method that replies later through the [`ReplyHandle`] it is given.
    pub fn deferred<F>(interface: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&MethodContext<'_>, Vec<Value>, ReplyHandle) -> Result<(), MethodError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_invoke(interface, name, Invoke::Deferred(Arc::new(handler)))
    }

    fn with_invoke(interface: &str, name: &str, invoke: Invoke) -> Self {
        Self {
            interface: interface.to_owned(),
            name: name.to_owned(),
            in_signature: None,
            out_signature: None,
            arg_names: Vec::new(),
            out_names: Vec::new(),
            options: ArgOptions::default(),
            invoke,
        }
    }

    /// Calls whose body does not have this signature get `InvalidArgs`.
    #[must_use]
    pub fn in_signature(mut self, signature: &str) -> Self {
        self.in_signature = Some(signature.to_owned());
        self
    }

    /// Return values are coerced to this signature.
    #[must_use]
    pub fn out_signature(mut self, signature: &str) -> Self {
        self.out_signature = Some(signature.to_owned());
        self
    }

    #[must_use]
    pub fn arg_names(mut self, names: &[&str]) -> Self {
        self.arg_names = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn out_names(mut self, names: &[&str]) -> Self {
        self.out_names = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn options(mut self, options: ArgOptions) -> Self {
        self.options = options;
        self
    }
}

/// Declaration of one signal an object type may emit.
pub struct SignalSpec {
    interface: String,
    name: String,
    signature: String,
    arg_names: Vec<String>,
}

impl SignalSpec {
    pub fn new(interface: &str, name: &str, signature: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            name: name.to_owned(),
            signature: signature.to_owned(),
            arg_names: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg_names(mut self, names: &[&str]) -> Self {
        self.arg_names = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }
}

struct Method {
    name: String,
    in_signature: Option<Signature>,
    out_signature: Option<Signature>,
    arg_names: Vec<String>,
    out_names: Vec<String>,
    options: ArgOptions,
    invoke: Invoke,
}

struct Signal {
    name: String,
    signature: Signature,
    arg_names: Vec<String>,
}

struct InterfaceTable {
    name: String,
    methods: Vec<Arc<Method>>,
    signals: Vec<Arc<Signal>>,
}

impl InterfaceTable {
    fn method(&self, member: &str) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.name == member)
    }

    fn signal(&self, member: &str) -> Option<&Arc<Signal>> {
        self.signals.iter().find(|s| s.name == member)
    }
}

/// An immutable table of the interfaces, methods and signals an exported
/// object answers, built once by [`ObjectTypeBuilder`].
pub struct ObjectType {
    name: String,
    interfaces: Vec<InterfaceTable>,
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interfaces: Vec<&str> = self.interfaces.iter().map(|i| i.name.as_str()).collect();
        f.debug_struct("ObjectType")
            .field("name", &self.name)
            .field("interfaces", &interfaces)
            .finish()
    }
}

pub struct ObjectTypeBuilder {
    name: String,
    methods: Vec<MethodSpec>,
    signals: Vec<SignalSpec>,
    bases: Vec<Arc<ObjectType>>,
}

impl ObjectType {
    pub fn builder(name: &str) -> ObjectTypeBuilder {
        ObjectTypeBuilder {
            name: name.to_owned(),
            methods: Vec::new(),
            signals: Vec::new(),
            bases: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self, interface: &str) -> Option<&InterfaceTable> {
        self.interfaces.iter().find(|t| t.name == interface)
    }

    /// Find a method. Without an interface the first interface, in
    /// declaration order, that has the member wins.
    fn lookup(&self, interface: Option<&str>, member: &str) -> Option<&Arc<Method>> {
        match interface {
            Some(iface) => self.table(iface)?.method(member),
            None => self.interfaces.iter().find_map(|t| t.method(member)),
        }
    }

    pub fn has_method(&self, interface: Option<&str>, member: &str) -> bool {
        self.lookup(interface, member).is_some()
    }

    pub fn interface_names(&self) -> Vec<&str> {
        self.interfaces.iter().map(|t| t.name.as_str()).collect()
    }

    /// Emit a declared signal with its declared signature.
    pub fn emit_signal(
        &self,
        conn: &Connection,
        path: &str,
        interface: &str,
        name: &str,
        args: Vec<Native>,
    ) -> Result<u32, BusError> {
        let signal = self
            .table(interface)
            .and_then(|t| t.signal(name))
            .ok_or_else(|| {
                BusError::NotFound(format!("signal {interface}.{name} on type {}", self.name))
            })?;
        conn.emit_signal(path, interface, name, args, Some(signal.signature.as_str()))
    }

    /// Introspection data for the declared interfaces, preceded by
    /// `org.freedesktop.DBus.Introspectable`.
    pub fn introspect_interfaces(&self) -> Vec<InterfaceInfo> {
        let introspectable = InterfaceInfo {
            name: INTROSPECTABLE_IFACE.to_owned(),
            methods: vec![MethodInfo {
                name: "Introspect".to_owned(),
                args: vec![ArgInfo {
                    name: Some("xml_data".to_owned()),
                    signature: "s".to_owned(),
                    direction: Direction::Out,
                }],
            }],
            signals: Vec::new(),
        };
        let declared = self.interfaces.iter().map(|table| InterfaceInfo {
            name: table.name.clone(),
            methods: table
                .methods
                .iter()
                .map(|m| MethodInfo {
                    name: m.name.clone(),
                    args: arg_infos(m.in_signature.as_ref(), &m.arg_names, Direction::In)
                        .into_iter()
                        .chain(arg_infos(
                            m.out_signature.as_ref(),
                            &m.out_names,
                            Direction::Out,
                        ))
                        .collect(),
                })
                .collect(),
            signals: table
                .signals
                .iter()
                .map(|s| SignalInfo {
                    name: s.name.clone(),
                    args: arg_infos(Some(&s.signature), &s.arg_names, Direction::Out),
                })
                .collect(),
        });
        std::iter::once(introspectable).chain(declared).collect()
    }
}

fn arg_infos(
    signature: Option<&Signature>,
    names: &[String],
    direction: Direction,
) -> Vec<ArgInfo> {
    let Some(signature) = signature else {
        return Vec::new();
    };
    signature
        .iter()
        .enumerate()
        .map(|(i, ty)| ArgInfo {
            name: names.get(i).cloned(),
            signature: ty.to_string(),
            direction,
        })
        .collect()
}

fn parse_optional(signature: Option<&str>) -> Result<Option<Signature>, TypeError> {
    signature.map(Signature::parse).transpose()
}

fn declaration_error(kind: &'static str, value: String, reason: &str) -> BusError {
    BusError::Type(TypeError::InvalidValue {
        kind,
        value,
        reason: reason.to_owned(),
    })
}

impl ObjectTypeBuilder {
    #[must_use]
    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.methods.push(spec);
        self
    }

    #[must_use]
    pub fn signal(mut self, spec: SignalSpec) -> Self {
        self.signals.push(spec);
        self
    }

    /// Inherit the methods and signals of `base`. Members declared here
    /// shadow base members with the same interface and name.
    #[must_use]
    pub fn extends(mut self, base: &Arc<ObjectType>) -> Self {
        self.bases.push(Arc::clone(base));
        self
    }

    /// Validate every declaration and build the lookup table.
    pub fn build(self) -> Result<Arc<ObjectType>, BusError> {
        let mut interfaces: Vec<InterfaceTable> = Vec::new();

        for spec in self.methods {
            validate_interface_name(&spec.interface)?;
            validate_member_name(&spec.name)?;
            let method = Method {
                in_signature: parse_optional(spec.in_signature.as_deref())?,
                out_signature: parse_optional(spec.out_signature.as_deref())?,
                name: spec.name,
                arg_names: spec.arg_names,
                out_names: spec.out_names,
                options: spec.options,
                invoke: spec.invoke,
            };
            let table = table_mut(&mut interfaces, &spec.interface);
            if table.method(&method.name).is_some() {
                return Err(declaration_error(
                    "method",
                    format!("{}.{}", spec.interface, method.name),
                    "declared twice",
                ));
            }
            table.methods.push(Arc::new(method));
        }

        for spec in self.signals {
            validate_interface_name(&spec.interface)?;
            validate_member_name(&spec.name)?;
            let signal = Signal {
                signature: Signature::parse(&spec.signature)?,
                name: spec.name,
                arg_names: spec.arg_names,
            };
            let table = table_mut(&mut interfaces, &spec.interface);
            if table.signal(&signal.name).is_some() {
                return Err(declaration_error(
                    "signal",
                    format!("{}.{}", spec.interface, signal.name),
                    "declared twice",
                ));
            }
            table.signals.push(Arc::new(signal));
        }

        for base in &self.bases {
            for base_table in &base.interfaces {
                let table = table_mut(&mut interfaces, &base_table.name);
                for method in &base_table.methods {
                    if table.method(&method.name).is_none() {
                        table.methods.push(Arc::clone(method));
                    }
                }
                for signal in &base_table.signals {
                    if table.signal(&signal.name).is_none() {
                        table.signals.push(Arc::clone(signal));
                    }
                }
            }
        }

        debug!(
            "built object type {} with {} interfaces",
            self.name,
            interfaces.len()
        );
        Ok(Arc::new(ObjectType {
            name: self.name,
            interfaces,
        }))
    }
}

fn table_mut<'a>(interfaces: &'a mut Vec<InterfaceTable>, name: &str) -> &'a mut InterfaceTable {
    let idx = match interfaces.iter().position(|t| t.name == name) {
        Some(idx) => idx,
        None => {
            interfaces.push(InterfaceTable {
                name: name.to_owned(),
                methods: Vec::new(),
                signals: Vec::new(),
            });
            interfaces.len() - 1
        }
    };
    &mut interfaces[idx]
}

/// An error returned by a method handler, sent back as an Error reply.
///
/// Any `std::error::Error` converts into one: the D-Bus name is derived from
/// the error's Rust type path (`my_crate::Oops` becomes `my_crate.Oops`) and
/// the message is the error followed by its source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    name: String,
    message: String,
}

impl MethodError {
    /// An error with an explicit D-Bus name. Invalid names fall back to
    /// `org.freedesktop.DBus.Error.Failed`.
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        let name = if validate_error_name(name).is_ok() {
            name.to_owned()
        } else {
            ERROR_FAILED.to_owned()
        };
        Self {
            name,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ERROR_FAILED, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_ARGS, message)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn to_reply(&self, call: &Message) -> Result<Message, MessageError> {
        Message::error(call, &self.name, Some(&self.message))
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        Self::failed(format!("method handler panicked: {detail}"))
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E: std::error::Error + 'static> From<E> for MethodError {
    fn from(err: E) -> Self {
        Self::from_error(&err)
    }
}

impl MethodError {
    fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let path = type_name.split('<').next().unwrap_or(type_name);
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        Self::new(&path.replace("::", "."), message)
    }
}

/// What a method handler sees besides its arguments.
pub struct MethodContext<'a> {
    conn: &'a Connection,
    message: &'a Message,
    registered: &'a ObjectPath,
}

impl<'a> MethodContext<'a> {
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn message(&self) -> &'a Message {
        self.message
    }

    pub fn sender(&self) -> Option<&'a str> {
        self.message.sender()
    }

    pub fn destination(&self) -> Option<&'a str> {
        self.message.destination()
    }

    /// The path the call was addressed to.
    pub fn path(&self) -> &'a str {
        self.message.path().map_or("/", |p| p.as_str())
    }

    /// The path the handling object is registered at.
    pub fn registered_path(&self) -> &'a ObjectPath {
        self.registered
    }

    /// The call's path below the registered path, `/` for the object itself.
    pub fn relative_path(&self) -> String {
        let path = self.path();
        let base = self.registered.as_str();
        if base == "/" {
            return path.to_owned();
        }
        match path.strip_prefix(base) {
            Some("") | None => "/".to_owned(),
            Some(rest) => rest.to_owned(),
        }
    }
}

struct ReplyState {
    replied: bool,
    in_dispatch: bool,
}

/// The single reply owed to a deferred method call.
///
/// Dropping the handle without replying answers the caller with
/// `org.freedesktop.DBus.Error.Failed`.
pub struct ReplyHandle {
    conn: Connection,
    call: Message,
    out_signature: Option<Signature>,
    state: Arc<Mutex<ReplyState>>,
}

impl ReplyHandle {
    /// Reply with a return value, packed per the declared out-signature.
    pub fn reply(self, value: impl Into<Native>) -> Result<(), BusError> {
        if !self.claim() {
            return Ok(());
        }
        match pack_return(&self.call, value.into(), self.out_signature.as_ref()) {
            Ok(reply) => {
                self.send(reply);
                Ok(())
            }
            Err(e) => {
                self.send_error(&MethodError::from_error(&e));
                Err(e.into())
            }
        }
    }

    pub fn error(self, err: MethodError) {
        if self.claim() {
            self.send_error(&err);
        }
    }

    /// Mark the call as answered. Returns `false` if it already was.
    fn claim(&self) -> bool {
        let mut state = lock(&self.state);
        !std::mem::replace(&mut state.replied, true)
    }

    fn send(&self, reply: Message) {
        if self.call.expects_reply() {
            self.conn.send_reply(reply);
        }
    }

    fn send_error(&self, err: &MethodError) {
        match err.to_reply(&self.call) {
            Ok(reply) => self.send(reply),
            Err(e) => warn!("cannot build error reply {}: {e}", err.name),
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = lock(&self.state);
            let abandoned = !state.replied && !state.in_dispatch;
            if abandoned {
                state.replied = true;
            }
            abandoned
        };
        if abandoned {
            warn!("deferred reply to {} dropped without an answer", self.call);
            self.send_error(&MethodError::failed("method handler dropped its reply"));
        }
    }
}

/// Build the return message for `value` according to `out`.
fn pack_return(
    call: &Message,
    value: Native,
    out: Option<&Signature>,
) -> Result<Message, MessageError> {
    let mut reply = Message::method_return(call)?;
    let Some(signature) = out else {
        match value {
            Native::Unit => {}
            Native::Tuple(items) => reply.append(items, None)?,
            other => reply.append([other], None)?,
        }
        return Ok(reply);
    };
    match (signature.len(), value) {
        (0, Native::Unit) => {}
        (0, other) => {
            return Err(return_mismatch(&other, "no return value"));
        }
        (1, value) => reply.append([value], Some(signature.as_str()))?,
        (n, Native::Tuple(items) | Native::List(items)) if items.len() == n => {
            reply.append(items, Some(signature.as_str()))?;
        }
        (n, other) => {
            return Err(return_mismatch(&other, &format!("{n} return values")));
        }
    }
    Ok(reply)
}

fn return_mismatch(value: &Native, expected: &str) -> MessageError {
    MessageError::Type(TypeError::InvalidValue {
        kind: "return value",
        value: format!("{value:?}"),
        reason: format!("the method declares {expected}"),
    })
}

/// An [`ObjectType`] instance registered at a path.
pub struct ExportedObject {
    object_type: Arc<ObjectType>,
    path: ObjectPath,
}

impl ExportedObject {
    pub fn new(object_type: Arc<ObjectType>, path: ObjectPath) -> Self {
        Self { object_type, path }
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.object_type
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Emit one of the type's declared signals from this object's path.
    pub fn emit_signal(
        &self,
        conn: &Connection,
        interface: &str,
        name: &str,
        args: Vec<Native>,
    ) -> Result<u32, BusError> {
        self.object_type
            .emit_signal(conn, self.path.as_str(), interface, name, args)
    }

    /// Full introspection XML for the object at `path`.
    pub fn introspect(&self, conn: &Connection, path: &str) -> Result<String, BusError> {
        let node = NodeInfo {
            name: Some(path.to_owned()),
            interfaces: self.object_type.introspect_interfaces(),
            children: conn.list_exported_child_objects(path)?,
        };
        Ok(node.to_xml())
    }

    fn is_builtin_introspect(&self, msg: &Message) -> bool {
        if msg.member() != Some("Introspect") {
            return false;
        }
        match msg.interface() {
            Some(iface) => iface == INTROSPECTABLE_IFACE,
            None => !self.object_type.has_method(None, "Introspect"),
        }
    }

    fn invoke(&self, conn: &Connection, msg: &Message, method: &Method) -> Option<Message> {
        if let Some(expected) = &method.in_signature {
            if msg.signature().as_str() != expected.as_str() {
                let err = MethodError::invalid_args(format!(
                    "{} expects arguments '{expected}', got '{}'",
                    method.name,
                    msg.signature()
                ));
                return self.error_reply(msg, &err);
            }
        }
        let ctx = MethodContext {
            conn,
            message: msg,
            registered: &self.path,
        };
        let args = msg.get_args(method.options);

        match &method.invoke {
            Invoke::Immediate(handler) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&ctx, args)));
                let result = match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        error!("method {} at {} panicked", method.name, ctx.path());
                        Err(MethodError::from_panic(payload.as_ref()))
                    }
                };
                let packed = result.and_then(|value| {
                    pack_return(msg, value, method.out_signature.as_ref())
                        .map_err(MethodError::from)
                });
                match packed {
                    Ok(reply) => Some(reply),
                    Err(err) => self.error_reply(msg, &err),
                }
            }
            Invoke::Deferred(handler) => {
                let state = Arc::new(Mutex::new(ReplyState {
                    replied: false,
                    in_dispatch: true,
                }));
                let handle = ReplyHandle {
                    conn: conn.clone(),
                    call: msg.clone(),
                    out_signature: method.out_signature.clone(),
                    state: Arc::clone(&state),
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&ctx, args, handle)));
                let failure = {
                    let mut st = lock(&state);
                    st.in_dispatch = false;
                    let failure = match outcome {
                        _ if st.replied => None,
                        Ok(Ok(())) if Arc::strong_count(&state) > 1 => None,
                        Ok(Ok(())) => {
                            Some(MethodError::failed("method handler dropped its reply"))
                        }
                        Ok(Err(err)) => Some(err),
                        Err(payload) => {
                            error!("method {} at {} panicked", method.name, ctx.path());
                            Some(MethodError::from_panic(payload.as_ref()))
                        }
                    };
                    if failure.is_some() {
                        st.replied = true;
                    }
                    failure
                };
                failure.and_then(|err| self.error_reply(msg, &err))
            }
        }
    }

    fn error_reply(&self, msg: &Message, err: &MethodError) -> Option<Message> {
        debug!("{} at {} failed: {err}", msg.member().unwrap_or_default(), self.path);
        match err.to_reply(msg) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("cannot build error reply {}: {e}", err.name);
                None
            }
        }
    }
}

impl MessageHandler for ExportedObject {
    fn handle_message(
        &self,
        conn: &Connection,
        msg: &Message,
    ) -> Result<Option<Message>, BusError> {
        let path = msg.path().map_or("/", |p| p.as_str());
        if self.is_builtin_introspect(msg) {
            let xml = self.introspect(conn, path)?;
            let mut reply = Message::method_return(msg)?;
            reply.append([xml], Some("s"))?;
            return Ok(Some(reply));
        }
        let member = msg.member().unwrap_or_default();
        let Some(method) = self.object_type.lookup(msg.interface(), member) else {
            return Err(BusError::UnknownMethod {
                path: path.to_owned(),
                interface: msg.interface().unwrap_or("(none)").to_owned(),
                member: member.to_owned(),
            });
        };
        Ok(self.invoke(conn, msg, method))
    }
}
