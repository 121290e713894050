//! Key filters: per-segment range predicates over traversal candidates.
//!
//! The textual form is a brace-wrapped, comma-separated list of terms, one
//! per key segment: `*` (any), a literal (`42`, `"name"`), or a range
//! `low:high` with either bound optional, e.g. `{"byName",*}` or
//! `{10:20,*}`. Bounds are inclusive.

use smallvec::SmallVec;

use crate::error::{PersistitError, Result};
use crate::key::Key;

/// One bound of a range term, pre-encoded in key-segment form.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Bound {
    encoded: Vec<u8>,
}

/// A per-segment predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Term {
    Any,
    Literal(Vec<u8>),
    Range {
        low: Option<Bound>,
        high: Option<Bound>,
    },
}

/// A sequence of per-segment predicates.
///
/// An empty filter matches nothing; an all-wildcard filter is equivalent to
/// unfiltered traversal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFilter {
    terms: SmallVec<[Term; 4]>,
}

impl KeyFilter {
    /// The filter matching nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A filter of `depth` wildcard terms, matching every key with at
    /// least that many segments.
    pub fn all(depth: usize) -> Self {
        Self {
            terms: (0..depth.max(1)).map(|_| Term::Any).collect(),
        }
    }

    /// Parses the textual form. The error carries the offset of the first
    /// offending character.
    pub fn parse(text: &str) -> Result<Self> {
        match Self::parse_inner(text) {
            Ok(filter) => Ok(filter),
            Err(offset) => Err(PersistitError::InvalidKeyFilter(offset)),
        }
    }

    /// Validation per the management contract: `-1` when valid, else the
    /// index of the first offending character.
    pub fn validate(text: &str) -> i64 {
        match Self::parse_inner(text) {
            Ok(_) => -1,
            Err(offset) => offset as i64,
        }
    }

    fn parse_inner(text: &str) -> std::result::Result<Self, usize> {
        let bytes = text.as_bytes();
        let mut pos = 0;
        skip_spaces(bytes, &mut pos);
        expect(bytes, &mut pos, b'{')?;
        let mut terms = SmallVec::new();
        skip_spaces(bytes, &mut pos);
        if peek(bytes, pos) == Some(b'}') {
            pos += 1;
            return finish(bytes, pos, terms);
        }
        loop {
            skip_spaces(bytes, &mut pos);
            terms.push(parse_term(bytes, &mut pos)?);
            skip_spaces(bytes, &mut pos);
            match peek(bytes, pos) {
                Some(b',') => pos += 1,
                Some(b'}') => {
                    pos += 1;
                    return finish(bytes, pos, terms);
                }
                _ => return Err(pos),
            }
        }
    }

    /// Whether `key` satisfies every term. Keys with fewer segments than
    /// terms never match.
    pub fn matches(&self, key: &Key) -> bool {
        if self.terms.is_empty() {
            return false;
        }
        let spans = key.segment_spans();
        if spans.len() < self.terms.len() {
            return false;
        }
        let encoded = key.encoded();
        for (term, span) in self.terms.iter().zip(spans.iter()) {
            // Compare on the encoded segment without its terminator; the
            // encoding is order-preserving so byte compare is value compare.
            let segment = &encoded[span.start..span.end - 1];
            let ok = match term {
                Term::Any => true,
                Term::Literal(lit) => segment == lit.as_slice(),
                Term::Range { low, high } => {
                    low.as_ref().map_or(true, |b| segment >= b.encoded.as_slice())
                        && high.as_ref().map_or(true, |b| segment <= b.encoded.as_slice())
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }
}

fn finish(
    bytes: &[u8],
    mut pos: usize,
    terms: SmallVec<[Term; 4]>,
) -> std::result::Result<KeyFilter, usize> {
    skip_spaces(bytes, &mut pos);
    if pos != bytes.len() {
        return Err(pos);
    }
    Ok(KeyFilter { terms })
}

fn parse_term(bytes: &[u8], pos: &mut usize) -> std::result::Result<Term, usize> {
    if peek(bytes, *pos) == Some(b'*') {
        *pos += 1;
        return Ok(Term::Any);
    }
    let low = if matches!(peek(bytes, *pos), Some(b':')) {
        None
    } else {
        Some(parse_value(bytes, pos)?)
    };
    if peek(bytes, *pos) == Some(b':') {
        *pos += 1;
        let high = match peek(bytes, *pos) {
            Some(b',') | Some(b'}') | None => None,
            _ => Some(parse_value(bytes, pos)?),
        };
        Ok(Term::Range {
            low: low.map(|encoded| Bound { encoded }),
            high: high.map(|encoded| Bound { encoded }),
        })
    } else {
        match low {
            Some(encoded) => Ok(Term::Literal(encoded)),
            None => Err(*pos),
        }
    }
}

/// Parses a literal and returns its encoded-segment bytes (no terminator).
fn parse_value(bytes: &[u8], pos: &mut usize) -> std::result::Result<Vec<u8>, usize> {
    match peek(bytes, *pos) {
        Some(b'"') => {
            let start = *pos;
            *pos += 1;
            let mut value = String::new();
            loop {
                match peek(bytes, *pos) {
                    Some(b'"') => {
                        *pos += 1;
                        break;
                    }
                    Some(b) => {
                        value.push(b as char);
                        *pos += 1;
                    }
                    None => return Err(start),
                }
            }
            let mut key = Key::new();
            key.append_str(&value).map_err(|_| start)?;
            Ok(strip_terminator(key))
        }
        Some(b) if b == b'-' || b.is_ascii_digit() => {
            let start = *pos;
            if b == b'-' {
                *pos += 1;
            }
            while matches!(peek(bytes, *pos), Some(d) if d.is_ascii_digit()) {
                *pos += 1;
            }
            let text = std::str::from_utf8(&bytes[start..*pos]).map_err(|_| start)?;
            let value: i64 = text.parse().map_err(|_| start)?;
            let mut key = Key::new();
            key.append_int(value).map_err(|_| start)?;
            Ok(strip_terminator(key))
        }
        _ => Err(*pos),
    }
}

fn strip_terminator(key: Key) -> Vec<u8> {
    let encoded = key.encoded();
    encoded[..encoded.len() - 1].to_vec()
}

fn skip_spaces(bytes: &[u8], pos: &mut usize) {
    while matches!(peek(bytes, *pos), Some(b' ')) {
        *pos += 1;
    }
}

fn peek(bytes: &[u8], pos: usize) -> Option<u8> {
    bytes.get(pos).copied()
}

fn expect(bytes: &[u8], pos: &mut usize, expected: u8) -> std::result::Result<(), usize> {
    if peek(bytes, *pos) == Some(expected) {
        *pos += 1;
        Ok(())
    } else {
        Err(*pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> Key {
        let mut k = Key::new();
        for p in parts {
            k.append_str(p).unwrap();
        }
        k
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = KeyFilter::empty();
        assert!(!filter.matches(&key(&["anything"])));
    }

    #[test]
    fn wildcard_filter_matches_everything() {
        let filter = KeyFilter::parse("{*}").expect("parse");
        assert!(filter.matches(&key(&["a"])));
        assert!(filter.matches(&key(&["a", "b"])));
    }

    #[test]
    fn literal_term_matches_exactly() {
        let filter = KeyFilter::parse("{\"byName\",*}").expect("parse");
        assert!(filter.matches(&key(&["byName", "users"])));
        assert!(!filter.matches(&key(&["byIndex", "users"])));
        assert!(!filter.matches(&key(&["byName"])));
    }

    #[test]
    fn integer_range_bounds_inclusive() {
        let filter = KeyFilter::parse("{10:20}").expect("parse");
        let int_key = |v: i64| {
            let mut k = Key::new();
            k.append_int(v).unwrap();
            k
        };
        assert!(filter.matches(&int_key(10)));
        assert!(filter.matches(&int_key(15)));
        assert!(filter.matches(&int_key(20)));
        assert!(!filter.matches(&int_key(9)));
        assert!(!filter.matches(&int_key(21)));
    }

    #[test]
    fn open_ended_ranges() {
        let filter = KeyFilter::parse("{\"m\":}").expect("parse");
        assert!(filter.matches(&key(&["m"])));
        assert!(filter.matches(&key(&["z"])));
        assert!(!filter.matches(&key(&["a"])));
    }

    #[test]
    fn validate_reports_offending_character() {
        assert_eq!(KeyFilter::validate("{*}"), -1);
        assert_eq!(KeyFilter::validate("{"), 1);
        assert_eq!(KeyFilter::validate("no brace"), 0);
        let offset = KeyFilter::validate("{*,#}");
        assert_eq!(offset, 3);
    }
}
