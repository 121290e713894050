use std::cmp::Ordering;
use std::fmt;

use crate::error::{PersistitError, Result};

/// Segment type tags. Chosen so that unsigned byte comparison of encoded
/// keys matches the natural ordering null < bool < integers < strings <
/// byte arrays, with guard bytes below and above every real tag.
const TAG_NULL: u8 = 0x20;
const TAG_FALSE: u8 = 0x22;
const TAG_TRUE: u8 = 0x23;
const TAG_INT_BASE: u8 = 0x30;
const TAG_STRING: u8 = 0x60;
const TAG_BYTES: u8 = 0x70;

/// Segment terminator. Never occurs inside an encoded segment body.
const TERMINATOR: u8 = 0x00;
/// Escape byte for 0x00/0x01 occurring inside string/bytes payloads.
const ESCAPE: u8 = 0x01;

const LEFT_GUARD_BYTE: u8 = 0x00;
const RIGHT_GUARD_BYTE: u8 = 0xFF;

/// Hard cap on an encoded key, independent of page size.
pub const MAX_KEY_LENGTH: usize = 2047;

/// An ordered, segmented key.
///
/// Each appended segment is encoded with a type tag, an order-preserving
/// body, and a terminator byte, so that unsigned byte comparison of the
/// whole encoding equals segment-wise logical comparison. The reserved
/// guard keys bracket every page and sort below/above all real keys.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Key {
    bytes: Vec<u8>,
}

/// A decoded segment, for display and filter evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl Key {
    /// An empty key (zero segments). Sorts before every non-empty key.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// The reserved key that sorts before every real key.
    pub fn left_guard() -> Self {
        Self {
            bytes: vec![LEFT_GUARD_BYTE],
        }
    }

    /// The reserved key that sorts after every real key.
    pub fn right_guard() -> Self {
        Self {
            bytes: vec![RIGHT_GUARD_BYTE],
        }
    }

    pub fn is_left_guard(&self) -> bool {
        self.bytes == [LEFT_GUARD_BYTE]
    }

    pub fn is_right_guard(&self) -> bool {
        self.bytes == [RIGHT_GUARD_BYTE]
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self
    }

    /// Raw encoded form; totally ordered by unsigned byte compare.
    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    /// Rebuilds a key from its encoded form.
    pub fn from_encoded(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    fn check_room(&self, additional: usize) -> Result<()> {
        if self.bytes.len() + additional > MAX_KEY_LENGTH {
            return Err(PersistitError::IllegalState("key exceeds maximum length"));
        }
        Ok(())
    }

    pub fn append_null(&mut self) -> Result<&mut Self> {
        self.check_room(2)?;
        self.bytes.push(TAG_NULL);
        self.bytes.push(TERMINATOR);
        Ok(self)
    }

    pub fn append_bool(&mut self, value: bool) -> Result<&mut Self> {
        self.check_room(2)?;
        self.bytes.push(if value { TAG_TRUE } else { TAG_FALSE });
        self.bytes.push(TERMINATOR);
        Ok(self)
    }

    /// Appends a signed integer with an order-preserving variable-width
    /// encoding: the tag byte carries the sign and magnitude width, the
    /// body holds the magnitude big-endian (ones-complemented when
    /// negative so that more-negative sorts lower).
    pub fn append_int(&mut self, value: i64) -> Result<&mut Self> {
        let negative = value < 0;
        let magnitude = if negative { !(value as u64) } else { value as u64 };
        let width = ((64 - magnitude.leading_zeros() as usize) + 7) / 8;
        let width = width.max(1);
        self.check_room(2 + width)?;
        // Tags: negative numbers descend below TAG_INT_BASE+8 by width so
        // that wider (more negative) magnitudes sort first.
        let tag = if negative {
            TAG_INT_BASE + 8 - width as u8
        } else {
            TAG_INT_BASE + 8 + width as u8
        };
        self.bytes.push(tag);
        let be = magnitude.to_be_bytes();
        // Complemented bodies sort ascending with value; 0x00/0x01 bytes are
        // escaped like string bodies so the terminator stays unambiguous.
        for &raw in &be[8 - width..] {
            let b = if negative { !raw } else { raw };
            if b == TERMINATOR || b == ESCAPE {
                self.check_room(3)?;
                self.bytes.push(ESCAPE);
                self.bytes.push(b + 0x20);
            } else {
                self.check_room(2)?;
                self.bytes.push(b);
            }
        }
        self.bytes.push(TERMINATOR);
        Ok(self)
    }

    pub fn append_str(&mut self, value: &str) -> Result<&mut Self> {
        self.append_body(TAG_STRING, value.as_bytes())
    }

    pub fn append_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.append_body(TAG_BYTES, value)
    }

    fn append_body(&mut self, tag: u8, body: &[u8]) -> Result<&mut Self> {
        self.check_room(2 + body.len())?;
        self.bytes.push(tag);
        for &b in body {
            if b == TERMINATOR || b == ESCAPE {
                self.check_room(2)?;
                self.bytes.push(ESCAPE);
                self.bytes.push(b + 0x20);
            } else {
                self.check_room(1)?;
                self.bytes.push(b);
            }
        }
        self.bytes.push(TERMINATOR);
        Ok(self)
    }

    /// Decodes all segments. Fails on guard keys and malformed encodings.
    pub fn decode_segments(&self) -> Result<Vec<KeySegment>> {
        let mut out = Vec::new();
        let mut pos = 0;
        let bytes = &self.bytes;
        while pos < bytes.len() {
            let tag = bytes[pos];
            pos += 1;
            let mut body = Vec::new();
            loop {
                if pos >= bytes.len() {
                    return Err(PersistitError::Corrupt("unterminated key segment".into()));
                }
                match bytes[pos] {
                    TERMINATOR => {
                        pos += 1;
                        break;
                    }
                    ESCAPE => {
                        if pos + 1 >= bytes.len() {
                            return Err(PersistitError::Corrupt("dangling key escape".into()));
                        }
                        body.push(bytes[pos + 1].wrapping_sub(0x20));
                        pos += 2;
                    }
                    b => {
                        body.push(b);
                        pos += 1;
                    }
                }
            }
            out.push(decode_segment(tag, &body)?);
        }
        Ok(out)
    }

    /// Number of encoded segments.
    pub fn segment_count(&self) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while pos < self.bytes.len() {
            pos += 1; // tag
            while pos < self.bytes.len() {
                match self.bytes[pos] {
                    TERMINATOR => {
                        pos += 1;
                        break;
                    }
                    ESCAPE => pos += 2,
                    _ => pos += 1,
                }
            }
            count += 1;
        }
        count
    }

    /// Returns the encoded byte ranges of each segment (tag through
    /// terminator inclusive), used by filter evaluation.
    pub fn segment_spans(&self) -> Vec<std::ops::Range<usize>> {
        let mut spans = Vec::new();
        let mut pos = 0;
        while pos < self.bytes.len() {
            let start = pos;
            pos += 1;
            while pos < self.bytes.len() {
                match self.bytes[pos] {
                    TERMINATOR => {
                        pos += 1;
                        break;
                    }
                    ESCAPE => pos += 2,
                    _ => pos += 1,
                }
            }
            spans.push(start..pos);
        }
        spans
    }
}

fn decode_segment(tag: u8, body: &[u8]) -> Result<KeySegment> {
    match tag {
        TAG_NULL => Ok(KeySegment::Null),
        TAG_FALSE => Ok(KeySegment::Bool(false)),
        TAG_TRUE => Ok(KeySegment::Bool(true)),
        TAG_STRING => Ok(KeySegment::String(
            String::from_utf8(body.to_vec())
                .map_err(|_| PersistitError::Corrupt("non-utf8 string segment".into()))?,
        )),
        TAG_BYTES => Ok(KeySegment::Bytes(body.to_vec())),
        t if (TAG_INT_BASE..=TAG_INT_BASE + 16).contains(&t) => {
            let negative = t < TAG_INT_BASE + 8;
            let width = if negative {
                (TAG_INT_BASE + 8 - t) as usize
            } else {
                (t - TAG_INT_BASE - 8) as usize
            };
            if body.len() != width {
                return Err(PersistitError::Corrupt("integer segment width mismatch".into()));
            }
            let mut be = [0u8; 8];
            for (i, &b) in body.iter().enumerate() {
                be[8 - width + i] = if negative { !b } else { b };
            }
            let magnitude = u64::from_be_bytes(be);
            // Encoding stored !value for negatives, value for positives.
            let value = if negative {
                !magnitude as i64
            } else {
                magnitude as i64
            };
            Ok(KeySegment::Int(value))
        }
        _ => Err(PersistitError::Corrupt("unknown key segment tag".into())),
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_left_guard() {
            return write!(f, "{{LEFT_GUARD}}");
        }
        if self.is_right_guard() {
            return write!(f, "{{RIGHT_GUARD}}");
        }
        match self.decode_segments() {
            Ok(segments) => {
                write!(f, "{{")?;
                for (i, seg) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match seg {
                        KeySegment::Null => write!(f, "null")?,
                        KeySegment::Bool(b) => write!(f, "{b}")?,
                        KeySegment::Int(v) => write!(f, "{v}")?,
                        KeySegment::String(s) => write!(f, "\"{s}\"")?,
                        KeySegment::Bytes(b) => write!(f, "0x{b:02x?}")?,
                    }
                }
                write!(f, "}}")
            }
            Err(_) => write!(f, "{:02x?}", self.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key_of_int(v: i64) -> Key {
        let mut k = Key::new();
        k.append_int(v).unwrap();
        k
    }

    #[test]
    fn guards_bracket_all_keys() -> Result<()> {
        let mut k = Key::new();
        k.append_str("anything")?;
        assert!(Key::left_guard() < k);
        assert!(k < Key::right_guard());
        assert!(Key::left_guard() < key_of_int(i64::MIN));
        assert!(key_of_int(i64::MAX) < Key::right_guard());
        Ok(())
    }

    #[test]
    fn string_order_matches_encoded_order() -> Result<()> {
        let mut a = Key::new();
        a.append_str("apple")?;
        let mut b = Key::new();
        b.append_str("banana")?;
        assert!(a < b);
        assert!(a.encoded() < b.encoded());
        Ok(())
    }

    #[test]
    fn int_roundtrip_and_order() -> Result<()> {
        let samples = [i64::MIN, -65536, -256, -2, -1, 0, 1, 255, 256, 1 << 40, i64::MAX];
        for window in samples.windows(2) {
            assert!(
                key_of_int(window[0]) < key_of_int(window[1]),
                "{} should sort before {}",
                window[0],
                window[1]
            );
        }
        for v in samples {
            let segs = key_of_int(v).decode_segments()?;
            assert_eq!(segs, vec![KeySegment::Int(v)]);
        }
        Ok(())
    }

    #[test]
    fn multi_segment_keys_compare_segmentwise() -> Result<()> {
        let mut a = Key::new();
        a.append_str("byName")?.append_str("alpha")?;
        let mut b = Key::new();
        b.append_str("byName")?.append_str("beta")?;
        let mut c = Key::new();
        c.append_str("byName")?;
        assert!(c < a);
        assert!(a < b);
        Ok(())
    }

    #[test]
    fn embedded_zero_bytes_are_escaped() -> Result<()> {
        let mut a = Key::new();
        a.append_bytes(&[0x00, 0x01, 0x02])?;
        let segs = a.decode_segments()?;
        assert_eq!(segs, vec![KeySegment::Bytes(vec![0x00, 0x01, 0x02])]);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_int_order_preserving(a in any::<i64>(), b in any::<i64>()) {
            let ka = key_of_int(a);
            let kb = key_of_int(b);
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn prop_string_roundtrip(s in "\\PC{0,40}") {
            let mut k = Key::new();
            k.append_str(&s).unwrap();
            let segs = k.decode_segments().unwrap();
            prop_assert_eq!(segs, vec![KeySegment::String(s)]);
        }

        #[test]
        fn prop_bytes_order_preserving(a in proptest::collection::vec(any::<u8>(), 0..32),
                                       b in proptest::collection::vec(any::<u8>(), 0..32)) {
            let mut ka = Key::new();
            ka.append_bytes(&a).unwrap();
            let mut kb = Key::new();
            kb.append_bytes(&b).unwrap();
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
