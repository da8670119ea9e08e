use crate::{MessageError, MAX_ARRAY_LEN};
use busrs_types::{CompleteType, Signature, Value};

/// Little-endian wire writer. Offsets are relative to the start of the
/// buffer, which must itself sit on an 8-byte boundary of the message.
#[derive(Debug, Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn pad(&mut self, alignment: usize) {
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + alignment - rem, 0);
        }
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &[u8]) -> Result<(), MessageError> {
        let len = u32::try_from(s.len())
            .map_err(|_| MessageError::InvalidBody("string longer than 4 GiB".to_owned()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(s);
        self.buf.push(0);
        Ok(())
    }

    pub(crate) fn put_signature(&mut self, sig: &str) {
        // Signatures are at most 255 bytes by construction.
        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn put_value(&mut self, value: &Value) -> Result<(), MessageError> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_u16(*v as u16),
            Value::UInt16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_u32(*v as u32),
            Value::UInt32(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_u64(*v as u64),
            Value::UInt64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_u64(v.to_bits()),
            Value::String(s) => self.put_str(s.as_bytes())?,
            Value::Utf8String(bytes) => self.put_str(bytes)?,
            Value::ObjectPath(p) => self.put_str(p.as_bytes())?,
            Value::Signature(sig) => self.put_signature(sig.as_str()),
            Value::Bytes(bytes) => {
                self.put_array(&CompleteType::Byte, |w| {
                    w.buf.extend_from_slice(bytes);
                    Ok(())
                })?;
            }
            Value::Array(array) => {
                self.put_array(array.element(), |w| {
                    array.items().iter().try_for_each(|item| w.put_value(item))
                })?;
            }
            Value::Dict(dict) => {
                self.put_array(&CompleteType::Struct(Vec::new()), |w| {
                    for (k, v) in dict.entries() {
                        w.pad(8);
                        w.put_value(k)?;
                        w.put_value(v)?;
                    }
                    Ok(())
                })?;
            }
            Value::Struct(fields) => {
                self.pad(8);
                fields.iter().try_for_each(|f| self.put_value(f))?;
            }
            Value::Variant(inner) => {
                let sig = Signature::from(inner.type_of());
                self.put_signature(sig.as_str());
                self.put_value(inner)?;
            }
        }
        Ok(())
    }

    /// Writes the length prefix, the padding up to the first element, then
    /// the elements. The length excludes that padding.
    fn put_array(
        &mut self,
        element: &CompleteType,
        body: impl FnOnce(&mut Self) -> Result<(), MessageError>,
    ) -> Result<(), MessageError> {
        self.pad(4);
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.pad(element.alignment());
        let start = self.buf.len();
        body(self)?;
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(MessageError::InvalidBody(format!(
                "array of {len} bytes exceeds the {MAX_ARRAY_LEN} byte limit"
            )));
        }
        self.buf[len_at..len_at + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Serialize a body. The values are validated first.
pub fn marshal_body(values: &[Value]) -> Result<Vec<u8>, MessageError> {
    let mut w = Writer::new();
    for value in values {
        value.validate()?;
        w.put_value(value)?;
    }
    Ok(w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_alignment() {
        let bytes = marshal_body(&[Value::Byte(1), Value::UInt32(2)]).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 2, 0, 0, 0]);

        let bytes = marshal_body(&[Value::Byte(1), Value::Int16(-1)]).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xff, 0xff]);
    }

    #[test]
    fn strings_carry_length_and_nul() {
        let bytes = marshal_body(&[Value::String("ab".into())]).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, b'a', b'b', 0]);
        let bytes = marshal_body(&[Value::Utf8String(b"ab".to_vec())]).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn array_length_excludes_leading_padding() {
        let arr = Value::array(CompleteType::UInt64, vec![Value::UInt64(7)]).unwrap();
        let bytes = marshal_body(&[arr]).unwrap();
        assert_eq!(&bytes[..4], &[8, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &[7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn empty_array_still_pads_to_element() {
        let arr = Value::array(CompleteType::Double, Vec::new()).unwrap();
        assert_eq!(marshal_body(&[arr]).unwrap(), vec![0; 8]);
    }

    #[test]
    fn compact_and_expanded_byte_arrays_agree() {
        let compact = marshal_body(&[Value::Bytes(vec![1, 2, 3])]).unwrap();
        let expanded = marshal_body(&[Value::array(
            CompleteType::Byte,
            vec![Value::Byte(1), Value::Byte(2), Value::Byte(3)],
        )
        .unwrap()])
        .unwrap();
        assert_eq!(compact, expanded);
        assert_eq!(compact, vec![3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn variant_writes_inner_signature() {
        let bytes = marshal_body(&[Value::variant(Value::Int32(7))]).unwrap();
        assert_eq!(bytes, vec![1, b'i', 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn dict_entries_align_to_eight() {
        let dict = Value::dict(
            CompleteType::Byte,
            CompleteType::Byte,
            vec![(Value::Byte(1), Value::Byte(2)), (Value::Byte(3), Value::Byte(4))],
        )
        .unwrap();
        let bytes = marshal_body(&[dict]).unwrap();
        // length, pad to 8, entry, pad to 8, entry
        assert_eq!(
            bytes,
            vec![10, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 0, 0, 0, 0, 3, 4]
        );
    }

    #[test]
    fn invalid_values_are_refused() {
        assert!(marshal_body(&[Value::String("nul\0".into())]).is_err());
        assert!(marshal_body(&[Value::Struct(Vec::new())]).is_err());
    }
}
