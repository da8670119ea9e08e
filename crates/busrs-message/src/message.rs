use crate::MessageError;
use busrs_types::{
    coerce, validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
    ArgOptions, CompleteType, Native, ObjectPath, Signature, Value,
};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::MethodCall => write!(f, "method_call"),
            MessageType::MethodReturn => write!(f, "method_return"),
            MessageType::Error => write!(f, "error"),
            MessageType::Signal => write!(f, "signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x1);
    pub const NO_AUTO_START: MessageFlags = MessageFlags(0x2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: MessageFlags = MessageFlags(0x4);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: MessageFlags, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// A D-Bus message: header fields plus an ordered, typed argument list.
///
/// The signature is derived from the arguments and always matches them.
/// Messages produced by [`Message::decode`] are sealed and refuse mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) kind: MessageType,
    pub(crate) flags: MessageFlags,
    pub(crate) serial: Option<u32>,
    pub(crate) path: Option<ObjectPath>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) reply_serial: Option<u32>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) body: Vec<Value>,
    pub(crate) signature: Signature,
    pub(crate) sealed: bool,
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            flags: MessageFlags::default(),
            serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body: Vec::new(),
            signature: Signature::empty(),
            sealed: false,
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Self, MessageError> {
        let mut msg = Self::empty(MessageType::MethodCall);
        if let Some(dest) = destination {
            validate_bus_name(dest)?;
            msg.destination = Some(dest.to_owned());
        }
        msg.path = Some(ObjectPath::new(path)?);
        if let Some(iface) = interface {
            validate_interface_name(iface)?;
            msg.interface = Some(iface.to_owned());
        }
        validate_member_name(member)?;
        msg.member = Some(member.to_owned());
        Ok(msg)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self, MessageError> {
        let mut msg = Self::empty(MessageType::Signal);
        msg.path = Some(ObjectPath::new(path)?);
        validate_interface_name(interface)?;
        msg.interface = Some(interface.to_owned());
        validate_member_name(member)?;
        msg.member = Some(member.to_owned());
        Ok(msg)
    }

    pub fn method_return(call: &Message) -> Result<Self, MessageError> {
        let mut msg = Self::empty(MessageType::MethodReturn);
        msg.reply_serial = Some(call.serial.ok_or(MessageError::MissingSerial)?);
        msg.destination.clone_from(&call.sender);
        Ok(msg)
    }

    /// An error reply. `text`, when given, becomes the single string argument.
    pub fn error(call: &Message, name: &str, text: Option<&str>) -> Result<Self, MessageError> {
        validate_error_name(name)?;
        let mut msg = Self::empty(MessageType::Error);
        msg.reply_serial = Some(call.serial.ok_or(MessageError::MissingSerial)?);
        msg.destination.clone_from(&call.sender);
        msg.error_name = Some(name.to_owned());
        if let Some(text) = text {
            msg.append_value(Value::string(text.replace('\0', "\u{fffd}"))?)?;
        }
        Ok(msg)
    }

    /// Append arguments. With a signature each value is coerced strictly to
    /// the matching complete type; without one each value's type is guessed.
    /// On error the message is left unchanged.
    pub fn append<I, T>(&mut self, values: I, signature: Option<&str>) -> Result<(), MessageError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Native>,
    {
        self.ensure_writable()?;
        let natives: Vec<Native> = values.into_iter().map(Into::into).collect();
        let converted = match signature {
            Some(sig) => {
                let sig = Signature::parse(sig)?;
                if sig.len() != natives.len() {
                    return Err(MessageError::ArgumentCount {
                        signature: sig.to_string(),
                        expected: sig.len(),
                        actual: natives.len(),
                    });
                }
                natives
                    .into_iter()
                    .zip(sig.iter())
                    .map(|(native, ty)| coerce(native, ty))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => natives
                .into_iter()
                .map(Native::into_value)
                .collect::<Result<Vec<_>, _>>()?,
        };
        self.push_values(converted)
    }

    pub fn append_value(&mut self, value: Value) -> Result<(), MessageError> {
        self.ensure_writable()?;
        value.validate()?;
        self.push_values(vec![value])
    }

    fn push_values(&mut self, values: Vec<Value>) -> Result<(), MessageError> {
        let types: Vec<CompleteType> = self
            .signature
            .iter()
            .cloned()
            .chain(values.iter().map(Value::type_of))
            .collect();
        self.signature = Signature::from_types(types)?;
        self.body.extend(values);
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), MessageError> {
        if self.sealed {
            return Err(MessageError::ReadOnly);
        }
        Ok(())
    }

    /// The arguments in the requested representation.
    pub fn get_args(&self, options: ArgOptions) -> Vec<Value> {
        self.body
            .iter()
            .cloned()
            .map(|v| v.with_options(options))
            .collect()
    }

    pub fn args(&self) -> &[Value] {
        &self.body
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The human-readable text of an error message: its first string argument.
    pub fn error_text(&self) -> Option<&str> {
        self.body.first().and_then(Value::as_str)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn expects_reply(&self) -> bool {
        self.kind == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    pub fn is_method_call(&self, interface: &str, member: &str) -> bool {
        self.kind == MessageType::MethodCall
            && self.interface.as_deref() == Some(interface)
            && self.member.as_deref() == Some(member)
    }

    pub fn is_signal(&self, interface: &str, member: &str) -> bool {
        self.kind == MessageType::Signal
            && self.interface.as_deref() == Some(interface)
            && self.member.as_deref() == Some(member)
    }

    pub fn set_no_reply_expected(&mut self, value: bool) -> Result<(), MessageError> {
        self.ensure_writable()?;
        self.flags.set(MessageFlags::NO_REPLY_EXPECTED, value);
        Ok(())
    }

    pub fn set_auto_start(&mut self, value: bool) -> Result<(), MessageError> {
        self.ensure_writable()?;
        self.flags.set(MessageFlags::NO_AUTO_START, !value);
        Ok(())
    }

    pub fn set_destination(&mut self, destination: Option<&str>) -> Result<(), MessageError> {
        self.ensure_writable()?;
        if let Some(dest) = destination {
            validate_bus_name(dest)?;
        }
        self.destination = destination.map(str::to_owned);
        Ok(())
    }

    /// Stamp the serial number. Called by transports when sending.
    pub fn set_serial(&mut self, serial: u32) -> Result<(), MessageError> {
        self.ensure_writable()?;
        self.serial = Some(serial);
        Ok(())
    }

    /// Stamp the sender. Called by transports (or the bus) when routing.
    pub fn set_sender(&mut self, sender: &str) -> Result<(), MessageError> {
        self.ensure_writable()?;
        validate_bus_name(sender)?;
        self.sender = Some(sender.to_owned());
        Ok(())
    }

    /// Mark the message read-only.
    pub fn seal(&mut self) {
        self.sealed = true;
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(serial) = self.serial {
            write!(f, " serial={serial}")?;
        }
        if let Some(reply) = self.reply_serial {
            write!(f, " reply_serial={reply}")?;
        }
        if let Some(sender) = &self.sender {
            write!(f, " sender={sender}")?;
        }
        if let Some(dest) = &self.destination {
            write!(f, " destination={dest}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        if let Some(iface) = &self.interface {
            write!(f, " interface={iface}")?;
        }
        if let Some(member) = &self.member {
            write!(f, " member={member}")?;
        }
        if let Some(name) = &self.error_name {
            write!(f, " error_name={name}")?;
        }
        write!(f, " signature='{}'", self.signature)
    }
}
