use crate::{ArgOptions, Message, ObjectPath, TypeError, Value};
use busrs_types::{
    validate_bus_name, validate_interface_name, validate_member_name, validate_object_path,
};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Highest argument index a match rule may constrain.
pub const MAX_MATCH_ARG: u8 = 63;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A signal callback. Errors and panics are logged, never propagated.
pub type SignalHandler = Arc<dyn Fn(&SignalEvent<'_>) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a [`SignalHandler`].
pub fn signal_handler<F>(f: F) -> SignalHandler
where
    F: Fn(&SignalEvent<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a signal subscription selects. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    /// `argN` constraints: string equality on positional arguments.
    pub args: BTreeMap<u8, String>,
    /// Representation of the arguments handed to the handler.
    pub options: ArgOptions,
}

impl MatchSpec {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    #[must_use]
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    #[must_use]
    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_owned());
        self
    }

    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    #[must_use]
    pub fn arg(mut self, index: u8, value: &str) -> Self {
        self.args.insert(index, value.to_owned());
        self
    }

    #[must_use]
    pub fn options(mut self, options: ArgOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), TypeError> {
        if let Some(sender) = &self.sender {
            validate_bus_name(sender)?;
        }
        if let Some(interface) = &self.interface {
            validate_interface_name(interface)?;
        }
        if let Some(member) = &self.member {
            validate_member_name(member)?;
        }
        if let Some(path) = &self.path {
            validate_object_path(path)?;
        }
        if let Some((&index, _)) = self.args.iter().find(|(&i, _)| i > MAX_MATCH_ARG) {
            return Err(TypeError::InvalidValue {
                kind: "match rule",
                value: format!("arg{index}"),
                reason: format!("argument index must be at most {MAX_MATCH_ARG}"),
            });
        }
        Ok(())
    }

    /// The rule in bus daemon syntax, e.g. `type='signal',member='Done'`.
    pub fn rule_string(&self) -> String {
        let mut rule = String::from("type='signal'");
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                rule.push_str(&format!(",{key}={}", quote(value)));
            }
        }
        for (index, value) in &self.args {
            rule.push_str(&format!(",arg{index}={}", quote(value)));
        }
        rule
    }

    /// `argN` constraints against arguments read with UTF-8 strings.
    pub fn matches_args(&self, args: &[Value]) -> bool {
        self.args.iter().all(|(&index, expected)| {
            args.get(usize::from(index)).and_then(Value::as_str) == Some(expected.as_str())
        })
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// One subscription: a spec plus the handler it feeds.
pub struct MatchRule {
    id: u64,
    spec: MatchSpec,
    handler: SignalHandler,
    rule_string: String,
}

impl MatchRule {
    pub(crate) fn new(id: u64, spec: MatchSpec, handler: SignalHandler) -> Self {
        let rule_string = spec.rule_string();
        Self {
            id,
            spec,
            handler,
            rule_string,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn spec(&self) -> &MatchSpec {
        &self.spec
    }

    pub fn handler(&self) -> &SignalHandler {
        &self.handler
    }

    /// Exactly the string registered with the bus through AddMatch.
    pub fn rule_string(&self) -> &str {
        &self.rule_string
    }

    /// Structural equality: same spec and, when given, the same handler.
    pub fn is_same(&self, spec: &MatchSpec, handler: Option<&SignalHandler>) -> bool {
        self.spec == *spec && handler.map_or(true, |h| Arc::ptr_eq(h, &self.handler))
    }

    /// Run the handler for `msg`. Returns `false` if it failed or panicked.
    pub(crate) fn deliver(&self, msg: &Message) -> bool {
        let event = SignalEvent {
            message: msg,
            args: msg.get_args(self.spec.options),
        };
        match catch_unwind(AssertUnwindSafe(|| (self.handler)(&event))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("signal handler for {} failed: {e}", self.rule_string);
                false
            }
            Err(_) => {
                error!("signal handler for {} panicked", self.rule_string);
                false
            }
        }
    }
}

impl fmt::Debug for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRule")
            .field("id", &self.id)
            .field("rule", &self.rule_string)
            .finish_non_exhaustive()
    }
}

/// A signal as seen by a handler.
pub struct SignalEvent<'a> {
    message: &'a Message,
    args: Vec<Value>,
}

impl<'a> SignalEvent<'a> {
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn message(&self) -> &'a Message {
        self.message
    }

    pub fn sender(&self) -> Option<&'a str> {
        self.message.sender()
    }

    pub fn path(&self) -> Option<&'a ObjectPath> {
        self.message.path()
    }

    pub fn interface(&self) -> Option<&'a str> {
        self.message.interface()
    }

    pub fn member(&self) -> Option<&'a str> {
        self.message.member()
    }

    pub fn destination(&self) -> Option<&'a str> {
        self.message.destination()
    }
}
