use crate::{MessageError, MAX_ARRAY_LEN, MAX_CONTAINER_DEPTH, MAX_VARIANT_DEPTH};
use busrs_types::{ArgOptions, Array, CompleteType, Dict, ObjectPath, Signature, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    pub(crate) fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

/// How deep the value being read sits inside containers.
#[derive(Debug, Clone, Copy, Default)]
struct Nesting {
    containers: u32,
    variants: u32,
}

impl Nesting {
    fn enter(self, levels: u32) -> Result<Nesting, MessageError> {
        let containers = self.containers + levels;
        if containers > MAX_CONTAINER_DEPTH {
            return Err(MessageError::InvalidBody(format!(
                "containers nested deeper than {MAX_CONTAINER_DEPTH}"
            )));
        }
        Ok(Nesting { containers, ..self })
    }

    fn enter_variant(self) -> Result<Nesting, MessageError> {
        if self.variants >= MAX_VARIANT_DEPTH {
            return Err(MessageError::InvalidBody(format!(
                "variants nested deeper than {MAX_VARIANT_DEPTH}"
            )));
        }
        let inner = self.enter(1)?;
        Ok(Nesting {
            variants: self.variants + 1,
            ..inner
        })
    }
}

/// Wire reader over a buffer whose offset 0 is 8-byte aligned in the message.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    options: ArgOptions,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], endian: Endian, options: ArgOptions) -> Self {
        Self {
            data,
            pos: 0,
            endian,
            options,
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                MessageError::Truncated(format!(
                    "needed {n} bytes at offset {}, only {} available",
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn align(&mut self, alignment: usize) -> Result<(), MessageError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            let padding = self.take(alignment - rem)?;
            if padding.iter().any(|b| *b != 0) {
                return Err(MessageError::InvalidBody(format!(
                    "non-zero padding before offset {}",
                    self.pos
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MessageError> {
        self.align(2)?;
        let b: [u8; 2] = self.take(2)?.try_into().map_err(|_| short())?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, MessageError> {
        self.align(4)?;
        let b: [u8; 4] = self.take(4)?.try_into().map_err(|_| short())?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    fn read_u64(&mut self) -> Result<u64, MessageError> {
        self.align(8)?;
        let b: [u8; 8] = self.take(8)?.try_into().map_err(|_| short())?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    fn read_string_bytes(&mut self) -> Result<&'a [u8], MessageError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(MessageError::InvalidBody(
                "string is not NUL-terminated".to_owned(),
            ));
        }
        Ok(bytes)
    }

    pub(crate) fn read_signature(&mut self) -> Result<Signature, MessageError> {
        let len = usize::from(self.read_u8()?);
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(MessageError::InvalidBody(
                "signature is not NUL-terminated".to_owned(),
            ));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| MessageError::InvalidBody("signature is not ASCII".to_owned()))?;
        Ok(Signature::parse(text)?)
    }

    fn read_text(&mut self) -> Result<String, MessageError> {
        let bytes = self.read_string_bytes()?;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MessageError::InvalidBody(format!("string is not UTF-8: {e}")))?;
        Ok(text.to_owned())
    }

    pub(crate) fn read_value(&mut self, ty: &CompleteType) -> Result<Value, MessageError> {
        self.read_nested(ty, Nesting::default())
    }

    fn read_nested(&mut self, ty: &CompleteType, depth: Nesting) -> Result<Value, MessageError> {
        let value = match ty {
            CompleteType::Byte => Value::Byte(self.read_u8()?),
            CompleteType::Boolean => match self.read_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(MessageError::InvalidBody(format!(
                        "boolean encoded as {other}"
                    )))
                }
            },
            CompleteType::Int16 => Value::Int16(self.read_u16()? as i16),
            CompleteType::UInt16 => Value::UInt16(self.read_u16()?),
            CompleteType::Int32 => Value::Int32(self.read_u32()? as i32),
            CompleteType::UInt32 => Value::UInt32(self.read_u32()?),
            CompleteType::Int64 => Value::Int64(self.read_u64()? as i64),
            CompleteType::UInt64 => Value::UInt64(self.read_u64()?),
            CompleteType::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            CompleteType::String => {
                let text = self.read_text()?;
                let value = Value::string(text)?;
                value.with_options(self.options)
            }
            CompleteType::ObjectPath => Value::ObjectPath(ObjectPath::new(self.read_text()?)?),
            CompleteType::Signature => Value::Signature(self.read_signature()?),
            CompleteType::Array(element) => self.read_array(element, depth.enter(1)?)?,
            CompleteType::Dict(key, value) => self.read_dict(key, value, depth.enter(2)?)?,
            CompleteType::Struct(fields) => {
                let inner = depth.enter(1)?;
                self.align(8)?;
                let values = fields
                    .iter()
                    .map(|f| self.read_nested(f, inner))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Struct(values)
            }
            CompleteType::Variant => {
                let inner_depth = depth.enter_variant()?;
                let sig = self.read_signature()?;
                let inner = match sig.types() {
                    [single] => single.clone(),
                    _ => {
                        return Err(MessageError::InvalidBody(format!(
                            "variant signature '{sig}' is not a single complete type"
                        )))
                    }
                };
                Value::variant(self.read_nested(&inner, inner_depth)?)
            }
        };
        Ok(value)
    }

    /// Returns the offset one past the last element.
    fn array_bounds(&mut self, element: &CompleteType) -> Result<usize, MessageError> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(MessageError::InvalidBody(format!(
                "array of {len} bytes exceeds the {MAX_ARRAY_LEN} byte limit"
            )));
        }
        self.align(element.alignment())?;
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(MessageError::Truncated(format!(
                "array of {len} bytes runs past the end of the buffer"
            )));
        }
        Ok(end)
    }

    fn check_array_end(&self, end: usize) -> Result<(), MessageError> {
        if self.pos != end {
            return Err(MessageError::InvalidBody(
                "array elements overrun the declared length".to_owned(),
            ));
        }
        Ok(())
    }

    fn read_array(&mut self, element: &CompleteType, depth: Nesting) -> Result<Value, MessageError> {
        let end = self.array_bounds(element)?;
        if *element == CompleteType::Byte {
            let bytes = self.take(end - self.pos)?.to_vec();
            let compact = Value::Bytes(bytes);
            return Ok(compact.with_options(self.options));
        }
        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.read_nested(element, depth)?);
        }
        self.check_array_end(end)?;
        Ok(Value::Array(Array::new(element.clone(), items)?))
    }

    fn read_dict(
        &mut self,
        key: &CompleteType,
        value: &CompleteType,
        depth: Nesting,
    ) -> Result<Value, MessageError> {
        let end = self.array_bounds(&CompleteType::Struct(Vec::new()))?;
        let mut entries = Vec::new();
        while self.pos < end {
            self.align(8)?;
            let k = self.read_nested(key, depth)?;
            let v = self.read_nested(value, depth)?;
            entries.push((k, v));
        }
        self.check_array_end(end)?;
        Ok(Value::Dict(Dict::new(key.clone(), value.clone(), entries)?))
    }
}

fn short() -> MessageError {
    MessageError::Truncated("short read".to_owned())
}

pub(crate) fn read_body(
    data: &[u8],
    signature: &Signature,
    endian: Endian,
    options: ArgOptions,
) -> Result<Vec<Value>, MessageError> {
    let mut r = Reader::new(data, endian, options);
    let values = signature
        .iter()
        .map(|ty| r.read_value(ty))
        .collect::<Result<Vec<_>, _>>()?;
    if !r.is_at_end() {
        return Err(MessageError::InvalidBody(format!(
            "{} trailing bytes after the last argument",
            data.len() - r.pos()
        )));
    }
    Ok(values)
}

/// Deserialize a little-endian body described by `signature`.
pub fn unmarshal_body(
    data: &[u8],
    signature: &Signature,
    options: ArgOptions,
) -> Result<Vec<Value>, MessageError> {
    read_body(data, signature, Endian::Little, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal_body;

    fn sig(s: &str) -> Signature {
        Signature::parse(s).unwrap()
    }

    #[test]
    fn reads_back_a_compound_body() {
        let dict = Value::dict(
            CompleteType::String,
            CompleteType::Variant,
            vec![
                (Value::String("n".into()), Value::variant(Value::Int64(-3))),
                (
                    Value::String("p".into()),
                    Value::variant(Value::object_path("/a/b").unwrap()),
                ),
            ],
        )
        .unwrap();
        let body = vec![
            Value::Byte(9),
            dict,
            Value::Struct(vec![Value::Boolean(true), Value::Double(1.5)]),
            Value::signature("a(ii)").unwrap(),
        ];
        let bytes = marshal_body(&body).unwrap();
        let decoded = unmarshal_body(&bytes, &sig("ya{sv}(bd)g"), ArgOptions::default()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn byte_arrays_follow_options() {
        let bytes = marshal_body(&[Value::Bytes(vec![4, 5])]).unwrap();
        let expanded = unmarshal_body(&bytes, &sig("ay"), ArgOptions::default()).unwrap();
        assert_eq!(
            expanded[0],
            Value::array(CompleteType::Byte, vec![Value::Byte(4), Value::Byte(5)]).unwrap()
        );
        let compact = unmarshal_body(
            &bytes,
            &sig("ay"),
            ArgOptions {
                byte_arrays: true,
                utf8_strings: false,
            },
        )
        .unwrap();
        assert_eq!(compact[0], Value::Bytes(vec![4, 5]));
    }

    #[test]
    fn utf8_option_keeps_encoded_form() {
        let bytes = marshal_body(&[Value::String("é".into())]).unwrap();
        let out = unmarshal_body(&bytes, &sig("s"), ArgOptions::UTF8).unwrap();
        assert_eq!(out[0], Value::Utf8String("é".as_bytes().to_vec()));
    }

    #[test]
    fn variant_depth_is_preserved() {
        let v = Value::wrap(Value::String("deep".into()), 4);
        let bytes = marshal_body(&[v.clone()]).unwrap();
        let out = unmarshal_body(&bytes, &sig("v"), ArgOptions::default()).unwrap();
        assert_eq!(out[0].variant_level(), 4);
        assert_eq!(out[0], v);
    }

    #[test]
    fn rejects_excessive_variant_nesting() {
        let v = Value::wrap(Value::Byte(0), MAX_VARIANT_DEPTH + 1);
        let bytes = marshal_body(&[v]).unwrap();
        let err = unmarshal_body(&bytes, &sig("v"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));
    }

    #[test]
    fn rejects_excessive_container_nesting() {
        // Each level is an array of variants, so variants alone stay under
        // their own limit while the combined depth does not.
        let nest = |levels: u32| {
            (0..levels).fold(Value::Byte(0), |inner, _| {
                Value::array(CompleteType::Variant, vec![Value::variant(inner)]).unwrap()
            })
        };
        let allowed = nest(MAX_CONTAINER_DEPTH / 2);
        let bytes = marshal_body(&[allowed.clone()]).unwrap();
        let out = unmarshal_body(&bytes, &sig("av"), ArgOptions::default()).unwrap();
        assert_eq!(out[0], allowed);

        let hostile = nest(MAX_CONTAINER_DEPTH / 2 + 1);
        let bytes = marshal_body(&[hostile]).unwrap();
        let err = unmarshal_body(&bytes, &sig("av"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(ref m) if m.contains("containers")));
    }

    #[test]
    fn dict_entries_count_toward_container_depth() {
        let mut value = Value::Byte(1);
        for _ in 0..MAX_CONTAINER_DEPTH / 2 {
            value = Value::variant(
                Value::dict(CompleteType::Byte, CompleteType::Variant, vec![(Value::Byte(0), value)])
                    .unwrap(),
            );
        }
        let bytes = marshal_body(&[value]).unwrap();
        let err = unmarshal_body(&bytes, &sig("v"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));
    }

    #[test]
    fn rejects_malformed_input() {
        // bool must be 0 or 1
        let err = unmarshal_body(&[2, 0, 0, 0], &sig("b"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));

        // non-zero padding
        let err =
            unmarshal_body(&[1, 9, 0, 0, 2, 0, 0, 0], &sig("yu"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));

        // truncated
        let err = unmarshal_body(&[1, 0], &sig("u"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::Truncated(_)));

        // invalid UTF-8
        let err = unmarshal_body(&[1, 0, 0, 0, 0xff, 0], &sig("s"), ArgOptions::default())
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));

        // trailing data
        let err = unmarshal_body(&[1, 2], &sig("y"), ArgOptions::default()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidBody(_)));
    }

    #[test]
    fn reads_big_endian() {
        let data = [0, 0, 0, 7, 0, 0, 0, 1, b'x', 0];
        let values = read_body(&data, &sig("us"), Endian::Big, ArgOptions::default()).unwrap();
        assert_eq!(values, vec![Value::UInt32(7), Value::String("x".into())]);
    }
}
