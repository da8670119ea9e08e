//! Whole-message encoding: the fixed header, the `a(yv)` header field
//! array, and the 8-aligned body.

use crate::marshal::{marshal_body, Writer};
use crate::unmarshal::{read_body, Endian, Reader};
use crate::{Message, MessageError, MessageFlags, MessageType, MAX_MESSAGE_LEN};
use busrs_types::{
    validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
    ArgOptions, Array, CompleteType, Signature, Value,
};
use tracing::debug;

const PROTOCOL_VERSION: u8 = 1;
const FIXED_HEADER_LEN: usize = 16;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

fn field_array_type() -> CompleteType {
    CompleteType::Struct(vec![CompleteType::Byte, CompleteType::Variant])
}

fn field(code: u8, value: Value) -> Value {
    Value::Struct(vec![Value::Byte(code), Value::variant(value)])
}

impl Message {
    /// Check that the header fields required for this message type are set.
    pub fn check_required_headers(&self) -> Result<(), MessageError> {
        let missing = |field| MessageError::MissingHeader {
            kind: self.kind,
            field,
        };
        match self.kind {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                if self.member.is_none() {
                    return Err(missing("member"));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                if self.interface.is_none() {
                    return Err(missing("interface"));
                }
                if self.member.is_none() {
                    return Err(missing("member"));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return Err(missing("error_name"));
                }
                if self.reply_serial.is_none() {
                    return Err(missing("reply_serial"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(missing("reply_serial"));
                }
            }
        }
        Ok(())
    }

    /// Encode the message in little-endian wire format with `serial`.
    pub fn encode(&self, serial: u32) -> Result<Vec<u8>, MessageError> {
        if serial == 0 {
            return Err(MessageError::InvalidHeader("serial must be non-zero".to_owned()));
        }
        self.check_required_headers()?;
        let body = marshal_body(&self.body)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| MessageError::InvalidBody("body longer than 4 GiB".to_owned()))?;

        let mut fields = Vec::new();
        if let Some(path) = &self.path {
            fields.push(field(FIELD_PATH, Value::ObjectPath(path.clone())));
        }
        let strings = [
            (FIELD_INTERFACE, &self.interface),
            (FIELD_MEMBER, &self.member),
            (FIELD_ERROR_NAME, &self.error_name),
            (FIELD_DESTINATION, &self.destination),
            (FIELD_SENDER, &self.sender),
        ];
        for (code, text) in strings {
            if let Some(text) = text {
                fields.push(field(code, Value::String(text.clone())));
            }
        }
        if let Some(reply) = self.reply_serial {
            fields.push(field(FIELD_REPLY_SERIAL, Value::UInt32(reply)));
        }
        if !self.signature.is_empty() {
            fields.push(field(FIELD_SIGNATURE, Value::Signature(self.signature.clone())));
        }
        let fields = Value::Array(Array::new(field_array_type(), fields)?);

        let mut w = Writer::new();
        w.put_u8(b'l');
        w.put_u8(self.kind.code());
        w.put_u8(self.flags.bits());
        w.put_u8(PROTOCOL_VERSION);
        w.put_u32(body_len);
        w.put_u32(serial);
        w.put_value(&fields)?;
        w.pad(8);
        w.put_bytes(&body);
        if w.len() > MAX_MESSAGE_LEN {
            return Err(MessageError::InvalidBody(format!(
                "message of {} bytes exceeds the {MAX_MESSAGE_LEN} byte limit",
                w.len()
            )));
        }
        Ok(w.into_bytes())
    }

    /// Decode exactly one message. The result is sealed.
    pub fn decode(data: &[u8]) -> Result<Message, MessageError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(MessageError::Truncated(format!(
                "{} bytes is shorter than the fixed header",
                data.len()
            )));
        }
        if data.len() > MAX_MESSAGE_LEN {
            return Err(MessageError::InvalidHeader(format!(
                "message of {} bytes exceeds the {MAX_MESSAGE_LEN} byte limit",
                data.len()
            )));
        }
        let endian = Endian::from_marker(data[0]).ok_or_else(|| {
            MessageError::InvalidHeader(format!("unknown endianness marker {:#04x}", data[0]))
        })?;
        let kind = MessageType::from_code(data[1]).ok_or_else(|| {
            MessageError::InvalidHeader(format!("unknown message type {}", data[1]))
        })?;
        let flags = MessageFlags::from_bits(data[2]);
        if data[3] != PROTOCOL_VERSION {
            return Err(MessageError::InvalidHeader(format!(
                "unsupported protocol version {}",
                data[3]
            )));
        }

        let mut r = Reader::new(data, endian, ArgOptions::default());
        r.seek(4);
        let body_len = r.read_u32()? as usize;
        let serial = r.read_u32()?;
        if serial == 0 {
            return Err(MessageError::InvalidHeader("serial must be non-zero".to_owned()));
        }

        let mut msg = Message {
            kind,
            flags,
            serial: Some(serial),
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
        };

        let fields = r.read_value(&CompleteType::Array(Box::new(field_array_type())))?;
        let Value::Array(fields) = fields else {
            return Err(MessageError::InvalidHeader("malformed header field array".to_owned()));
        };
        for entry in fields.into_items() {
            let Value::Struct(mut pair) = entry else {
                continue;
            };
            let (Some(Value::Variant(value)), Some(Value::Byte(code))) = (pair.pop(), pair.pop())
            else {
                continue;
            };
            apply_field(&mut msg, code, *value)?;
        }

        r.align(8)?;
        let start = r.pos();
        let end = start + body_len;
        if end > data.len() {
            return Err(MessageError::Truncated(format!(
                "body of {body_len} bytes runs past the end of the message"
            )));
        }
        if end < data.len() {
            return Err(MessageError::InvalidHeader(format!(
                "{} trailing bytes after the body",
                data.len() - end
            )));
        }
        msg.body = read_body(&data[start..end], &msg.signature, endian, ArgOptions::default())?;
        msg.check_required_headers()?;
        msg.seal();
        Ok(msg)
    }
}

fn wrong_type(code: u8, value: &Value) -> MessageError {
    MessageError::InvalidHeader(format!(
        "header field {code} has type '{}'",
        value.type_of()
    ))
}

fn text_field(code: u8, value: Value) -> Result<String, MessageError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(wrong_type(code, &other)),
    }
}

fn apply_field(msg: &mut Message, code: u8, value: Value) -> Result<(), MessageError> {
    match code {
        FIELD_PATH => match value {
            Value::ObjectPath(p) => msg.path = Some(p),
            other => return Err(wrong_type(code, &other)),
        },
        FIELD_INTERFACE => {
            let name = text_field(code, value)?;
            validate_interface_name(&name)?;
            msg.interface = Some(name);
        }
        FIELD_MEMBER => {
            let name = text_field(code, value)?;
            validate_member_name(&name)?;
            msg.member = Some(name);
        }
        FIELD_ERROR_NAME => {
            let name = text_field(code, value)?;
            validate_error_name(&name)?;
            msg.error_name = Some(name);
        }
        FIELD_DESTINATION => {
            let name = text_field(code, value)?;
            validate_bus_name(&name)?;
            msg.destination = Some(name);
        }
        FIELD_SENDER => {
            let name = text_field(code, value)?;
            validate_bus_name(&name)?;
            msg.sender = Some(name);
        }
        FIELD_REPLY_SERIAL => match value {
            Value::UInt32(n) if n != 0 => msg.reply_serial = Some(n),
            other => return Err(wrong_type(code, &other)),
        },
        FIELD_SIGNATURE => match value {
            Value::Signature(sig) => msg.signature = sig,
            other => return Err(wrong_type(code, &other)),
        },
        FIELD_UNIX_FDS => match value {
            Value::UInt32(0) => {}
            _ => {
                return Err(MessageError::InvalidHeader(
                    "file descriptor passing is not supported".to_owned(),
                ))
            }
        },
        _ => debug!("ignoring unknown header field {code}"),
    }
    Ok(())
}

impl TryFrom<&[u8]> for Message {
    type Error = MessageError;
    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Message::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrs_types::Native;

    fn sample_call() -> Message {
        let mut msg = Message::method_call(
            Some("com.example.Service"),
            "/com/example/Obj",
            Some("com.example.Iface"),
            "Frobnicate",
        )
        .unwrap();
        msg.set_sender(":1.7").unwrap();
        msg.append(
            [
                Native::from("hello"),
                Native::from(42),
                Native::Typed(Value::wrap(Value::Int32(5), 2)),
            ],
            None,
        )
        .unwrap();
        msg
    }

    #[test]
    fn fixed_header_layout() {
        let bytes = sample_call().encode(3).unwrap();
        assert_eq!(bytes[0], b'l');
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());
        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!((bytes.len() - body_len) % 8, 0);
    }

    #[test]
    fn decode_restores_headers_and_body() {
        let original = sample_call();
        let bytes = original.encode(11).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert!(decoded.is_sealed());
        assert_eq!(decoded.serial(), Some(11));
        assert_eq!(decoded.kind(), MessageType::MethodCall);
        assert_eq!(decoded.path().unwrap(), "/com/example/Obj");
        assert_eq!(decoded.interface(), Some("com.example.Iface"));
        assert_eq!(decoded.member(), Some("Frobnicate"));
        assert_eq!(decoded.destination(), Some("com.example.Service"));
        assert_eq!(decoded.sender(), Some(":1.7"));
        assert_eq!(decoded.signature().as_str(), "siv");
        assert_eq!(decoded.args(), original.args());
        assert_eq!(decoded.args()[2].variant_level(), 2);
    }

    #[test]
    fn error_reply_round_trips() {
        let mut call = sample_call();
        call.set_serial(4).unwrap();
        let err = Message::error(&call, "com.example.Error.Nope", Some("no")).unwrap();
        let decoded = Message::decode(&err.encode(5).unwrap()).unwrap();
        assert_eq!(decoded.kind(), MessageType::Error);
        assert_eq!(decoded.reply_serial(), Some(4));
        assert_eq!(decoded.error_name(), Some("com.example.Error.Nope"));
        assert_eq!(decoded.error_text(), Some("no"));
        assert_eq!(decoded.destination(), Some(":1.7"));
    }

    #[test]
    fn flags_survive_encoding() {
        let mut msg = sample_call();
        msg.set_no_reply_expected(true).unwrap();
        let decoded = Message::decode(&msg.encode(1).unwrap()).unwrap();
        assert!(!decoded.expects_reply());
    }

    #[test]
    fn decoded_messages_are_read_only() {
        let mut decoded = Message::decode(&sample_call().encode(1).unwrap()).unwrap();
        assert_eq!(decoded.append([1], None), Err(MessageError::ReadOnly));
    }

    #[test]
    fn rejects_bad_framing() {
        let bytes = sample_call().encode(1).unwrap();
        assert!(matches!(
            Message::decode(&bytes[..10]),
            Err(MessageError::Truncated(_))
        ));
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(MessageError::Truncated(_))
        ));
        let mut bad = bytes.clone();
        bad[0] = b'x';
        assert!(matches!(Message::decode(&bad), Err(MessageError::InvalidHeader(_))));
        let mut bad = bytes.clone();
        bad[3] = 2;
        assert!(matches!(Message::decode(&bad), Err(MessageError::InvalidHeader(_))));
        let mut long = bytes;
        long.push(0);
        assert!(Message::decode(&long).is_err());
    }

    #[test]
    fn encode_requires_headers_and_serial() {
        assert!(sample_call().encode(0).is_err());
        let mut call = sample_call();
        call.set_serial(2).unwrap();
        let ret = Message::method_return(&call).unwrap();
        assert!(ret.encode(3).is_ok());
    }
}
