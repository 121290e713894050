use crate::error::{PersistitError, Result};

/// Maximum number of prefix bytes copied into a long-record descriptor.
pub const LONG_RECORD_PREFIX: usize = 16;

/// Envelope tags for values as stored in a page tail.
pub const TAG_INLINE: u8 = 0x00;
pub const TAG_LONG_RECORD: u8 = 0x01;
pub const TAG_MVV: u8 = 0x02;

/// A mutable value buffer bound to an exchange.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Value {
    bytes: Vec<u8>,
    defined: bool,
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self.defined = false;
        self
    }

    /// Whether the last fetch found a value at the key.
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
        self.defined = true;
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_bytes(s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn set_fetched(&mut self, bytes: Option<&[u8]>) {
        self.bytes.clear();
        match bytes {
            Some(b) => {
                self.bytes.extend_from_slice(b);
                self.defined = true;
            }
            None => self.defined = false,
        }
    }
}

/// Inline descriptor for a value spilled to a LONG_RECORD page chain.
///
/// The descriptor lives in the page tail at the key; the chain pages hold
/// the payload, linked through their right-sibling pointers. The short
/// prefix lets multi-version comparisons avoid chasing the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LongRecordDescriptor {
    pub chain_head: u64,
    pub total_size: u64,
    pub prefix: Vec<u8>,
}

impl LongRecordDescriptor {
    pub fn new(chain_head: u64, payload: &[u8]) -> Self {
        Self {
            chain_head,
            total_size: payload.len() as u64,
            prefix: payload[..payload.len().min(LONG_RECORD_PREFIX)].to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.prefix.len());
        out.push(TAG_LONG_RECORD);
        out.extend_from_slice(&self.chain_head.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.push(self.prefix.len() as u8);
        out.extend_from_slice(&self.prefix);
        out
    }

    /// Decodes from a stored value beginning with [`TAG_LONG_RECORD`].
    pub fn decode(stored: &[u8]) -> Result<Self> {
        if stored.len() < 18 || stored[0] != TAG_LONG_RECORD {
            return Err(PersistitError::Corrupt(
                "malformed long-record descriptor".into(),
            ));
        }
        let chain_head = u64::from_le_bytes(stored[1..9].try_into().expect("8 bytes"));
        let total_size = u64::from_le_bytes(stored[9..17].try_into().expect("8 bytes"));
        let prefix_len = stored[17] as usize;
        if stored.len() < 18 + prefix_len || prefix_len > LONG_RECORD_PREFIX {
            return Err(PersistitError::Corrupt(
                "long-record descriptor prefix truncated".into(),
            ));
        }
        Ok(Self {
            chain_head,
            total_size,
            prefix: stored[18..18 + prefix_len].to_vec(),
        })
    }
}

/// Wraps raw payload bytes as an inline stored value.
pub fn encode_inline(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(TAG_INLINE);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let mut v = Value::new();
        assert!(!v.is_defined());
        v.put_str("hello");
        assert_eq!(v.as_bytes(), b"hello");
        assert!(v.is_defined());
        v.clear();
        assert!(!v.is_defined());
    }

    #[test]
    fn long_record_descriptor_roundtrip() -> Result<()> {
        let payload = vec![7u8; 100_000];
        let descriptor = LongRecordDescriptor::new(42, &payload);
        assert_eq!(descriptor.total_size, 100_000);
        assert_eq!(descriptor.prefix.len(), LONG_RECORD_PREFIX);
        let encoded = descriptor.encode();
        assert_eq!(LongRecordDescriptor::decode(&encoded)?, descriptor);
        Ok(())
    }

    #[test]
    fn short_payload_prefix_is_whole_payload() {
        let descriptor = LongRecordDescriptor::new(7, b"tiny");
        assert_eq!(descriptor.prefix, b"tiny");
    }
}
