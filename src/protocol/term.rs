//! # Tagged-term codec for the host protocol.
//!
//! Frames exchanged with the host carry one structured term in the host
//! runtime's external term format: a version byte (`131`) followed by a
//! tagged tree of integers, atoms, tuples, lists and binaries.
//!
//! [`Term`] is the in-memory shape. [`decode`] and [`encode`] are pure
//! functions over byte buffers; both return `Result` so malformed wire data
//! surfaces as a value, never as a panic or unwind through the event loop.
//!
//! ## Supported tags
//! ```text
//! decode: 97 98 110 (ints)  100 115 118 119 (atoms)  104 105 (tuples)
//!         106 107 108 (lists)  109 (binaries)
//! encode: smallest faithful form is chosen per value; a list whose
//!         elements are all bytes is emitted as STRING_EXT, matching the
//!         host's own encoder.
//! ```
//!
//! ## Example
//! ```rust
//! use procvisor::protocol::term::{decode, encode, Term};
//!
//! let term = Term::tuple(vec![Term::atom("ok"), Term::Int(42)]);
//! let bytes = encode(&term);
//! assert_eq!(decode(&bytes).unwrap(), term);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const VERSION: u8 = 131;

const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const SMALL_ATOM_EXT: u8 = 115;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Errors raised while decoding or encoding a term.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TermError {
    /// Input ended before the term was complete.
    #[error("truncated term")]
    Truncated,

    /// The payload does not start with the expected version byte.
    #[error("bad term version: {0}")]
    BadVersion(u8),

    /// A tag the codec does not understand.
    #[error("unsupported term tag: {0}")]
    UnknownTag(u8),

    /// Structurally invalid data (improper list, oversized atom, huge big).
    #[error("malformed term: {0}")]
    Malformed(&'static str),
}

/// One structured protocol term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Any integer the protocol carries (pids, signals, statuses).
    Int(i64),
    /// An atom (`ok`, `error`, command names, option names).
    Atom(String),
    /// Raw bytes (stdin payloads, stdout/stderr chunks).
    Binary(Vec<u8>),
    /// A proper list. Charlists decode into this shape too.
    List(Vec<Term>),
    /// A tuple of fixed arity.
    Tuple(Vec<Term>),
}

impl Term {
    /// Atom constructor.
    pub fn atom(name: impl Into<String>) -> Term {
        Term::Atom(name.into())
    }

    /// Tuple constructor.
    pub fn tuple(items: Vec<Term>) -> Term {
        Term::Tuple(items)
    }

    /// Charlist constructor: the conventional wire shape for strings.
    pub fn string(text: impl AsRef<str>) -> Term {
        Term::List(
            text.as_ref()
                .bytes()
                .map(|b| Term::Int(i64::from(b)))
                .collect(),
        )
    }

    /// Integer value, if this is an integer term.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Atom name, if this is an atom.
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Tuple elements, if this is a tuple.
    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// List elements, if this is a (possibly empty) list.
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    /// Byte content of a binary or a charlist.
    ///
    /// Returns `None` when any list element is outside `0..=255`.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Term::Binary(bytes) => Some(bytes.clone()),
            Term::List(items) => items
                .iter()
                .map(|item| match item.as_int() {
                    Some(b @ 0..=255) => Some(b as u8),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// UTF-8 text content of a binary or charlist.
    pub fn to_text(&self) -> Option<String> {
        String::from_utf8(self.to_bytes()?).ok()
    }
}

/// Decodes one versioned term from `payload`.
pub fn decode(payload: &[u8]) -> Result<Term, TermError> {
    let mut buf = payload;
    if buf.remaining() < 1 {
        return Err(TermError::Truncated);
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(TermError::BadVersion(version));
    }
    let term = decode_term(&mut buf)?;
    Ok(term)
}

fn need(buf: &impl Buf, n: usize) -> Result<(), TermError> {
    if buf.remaining() < n {
        Err(TermError::Truncated)
    } else {
        Ok(())
    }
}

fn decode_term(buf: &mut &[u8]) -> Result<Term, TermError> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    match tag {
        SMALL_INTEGER_EXT => {
            need(buf, 1)?;
            Ok(Term::Int(i64::from(buf.get_u8())))
        }
        INTEGER_EXT => {
            need(buf, 4)?;
            Ok(Term::Int(i64::from(buf.get_i32())))
        }
        SMALL_BIG_EXT => {
            need(buf, 2)?;
            let n = buf.get_u8() as usize;
            let sign = buf.get_u8();
            if n > 8 {
                return Err(TermError::Malformed("big integer exceeds 64 bits"));
            }
            need(buf, n)?;
            let mut magnitude: u64 = 0;
            for i in 0..n {
                magnitude |= u64::from(buf.get_u8()) << (8 * i);
            }
            if magnitude > i64::MAX as u64 {
                return Err(TermError::Malformed("big integer exceeds 64 bits"));
            }
            let value = magnitude as i64;
            Ok(Term::Int(if sign == 0 { value } else { -value }))
        }
        ATOM_EXT | ATOM_UTF8_EXT => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            decode_atom_bytes(buf, len)
        }
        SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
            need(buf, 1)?;
            let len = buf.get_u8() as usize;
            decode_atom_bytes(buf, len)
        }
        SMALL_TUPLE_EXT => {
            need(buf, 1)?;
            let arity = buf.get_u8() as usize;
            decode_tuple(buf, arity)
        }
        LARGE_TUPLE_EXT => {
            need(buf, 4)?;
            let arity = buf.get_u32() as usize;
            decode_tuple(buf, arity)
        }
        NIL_EXT => Ok(Term::List(Vec::new())),
        STRING_EXT => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            need(buf, len)?;
            let items = buf[..len]
                .iter()
                .map(|b| Term::Int(i64::from(*b)))
                .collect();
            buf.advance(len);
            Ok(Term::List(items))
        }
        LIST_EXT => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_term(buf)?);
            }
            need(buf, 1)?;
            if buf.get_u8() != NIL_EXT {
                return Err(TermError::Malformed("improper list tail"));
            }
            Ok(Term::List(items))
        }
        BINARY_EXT => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            Ok(Term::Binary(bytes))
        }
        other => Err(TermError::UnknownTag(other)),
    }
}

fn decode_atom_bytes(buf: &mut &[u8], len: usize) -> Result<Term, TermError> {
    need(buf, len)?;
    let name = std::str::from_utf8(&buf[..len])
        .map_err(|_| TermError::Malformed("atom is not valid utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(Term::Atom(name))
}

fn decode_tuple(buf: &mut &[u8], arity: usize) -> Result<Term, TermError> {
    let mut items = Vec::with_capacity(arity.min(4096));
    for _ in 0..arity {
        items.push(decode_term(buf)?);
    }
    Ok(Term::Tuple(items))
}

/// Encodes one versioned term.
pub fn encode(term: &Term) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(VERSION);
    encode_term(term, &mut buf);
    buf.to_vec()
}

fn encode_term(term: &Term, buf: &mut BytesMut) {
    match term {
        Term::Int(value) => encode_int(*value, buf),
        Term::Atom(name) => {
            // Atoms the daemon emits are short protocol words.
            debug_assert!(name.len() <= 255, "atom too long: {name}");
            buf.put_u8(SMALL_ATOM_UTF8_EXT);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
        Term::Binary(bytes) => {
            buf.put_u8(BINARY_EXT);
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(bytes);
        }
        Term::List(items) if items.is_empty() => buf.put_u8(NIL_EXT),
        Term::List(items) => {
            if let Some(bytes) = byte_list(items) {
                buf.put_u8(STRING_EXT);
                buf.put_u16(bytes.len() as u16);
                buf.put_slice(&bytes);
            } else {
                buf.put_u8(LIST_EXT);
                buf.put_u32(items.len() as u32);
                for item in items {
                    encode_term(item, buf);
                }
                buf.put_u8(NIL_EXT);
            }
        }
        Term::Tuple(items) => {
            if items.len() <= 255 {
                buf.put_u8(SMALL_TUPLE_EXT);
                buf.put_u8(items.len() as u8);
            } else {
                buf.put_u8(LARGE_TUPLE_EXT);
                buf.put_u32(items.len() as u32);
            }
            for item in items {
                encode_term(item, buf);
            }
        }
    }
}

fn encode_int(value: i64, buf: &mut BytesMut) {
    if (0..=255).contains(&value) {
        buf.put_u8(SMALL_INTEGER_EXT);
        buf.put_u8(value as u8);
    } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&value) {
        buf.put_u8(INTEGER_EXT);
        buf.put_i32(value as i32);
    } else {
        let sign = if value < 0 { 1u8 } else { 0u8 };
        let mut magnitude = value.unsigned_abs();
        let mut bytes = Vec::with_capacity(8);
        while magnitude > 0 {
            bytes.push((magnitude & 0xff) as u8);
            magnitude >>= 8;
        }
        buf.put_u8(SMALL_BIG_EXT);
        buf.put_u8(bytes.len() as u8);
        buf.put_u8(sign);
        buf.put_slice(&bytes);
    }
}

/// Returns the byte values when every list element fits `0..=255` and the
/// list is short enough for STRING_EXT.
fn byte_list(items: &[Term]) -> Option<Vec<u8>> {
    if items.len() > usize::from(u16::MAX) {
        return None;
    }
    items
        .iter()
        .map(|item| match item.as_int() {
            Some(b @ 0..=255) => Some(b as u8),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_reply_shapes() {
        let terms = [
            Term::atom("ok"),
            Term::tuple(vec![Term::Int(7), Term::atom("ok")]),
            Term::tuple(vec![
                Term::Int(0),
                Term::tuple(vec![
                    Term::atom("exit_status"),
                    Term::Int(12345),
                    Term::Int(9),
                ]),
            ]),
            Term::tuple(vec![
                Term::atom("error"),
                Term::string("duplicate stdout option specified"),
            ]),
            Term::List(vec![Term::Int(1), Term::Int(70000), Term::Int(-3)]),
            Term::Binary(b"hello\n".to_vec()),
        ];
        for term in terms {
            assert_eq!(decode(&encode(&term)).unwrap(), term);
        }
    }

    #[test]
    fn known_encoding_ok_tuple() {
        let term = Term::tuple(vec![Term::atom("ok"), Term::Int(5)]);
        assert_eq!(
            encode(&term),
            vec![131, 104, 2, 119, 2, b'o', b'k', 97, 5]
        );
    }

    #[test]
    fn charlists_use_string_ext() {
        let encoded = encode(&Term::string("hi"));
        assert_eq!(encoded, vec![131, 107, 0, 2, b'h', b'i']);
        assert_eq!(decode(&encoded).unwrap().to_text().unwrap(), "hi");
    }

    #[test]
    fn accepts_legacy_and_utf8_atoms() {
        // ATOM_EXT and SMALL_ATOM_UTF8_EXT spell the same atom.
        let legacy = [131, 100, 0, 3, b'r', b'u', b'n'];
        let utf8 = [131, 119, 3, b'r', b'u', b'n'];
        assert_eq!(decode(&legacy).unwrap(), Term::atom("run"));
        assert_eq!(decode(&utf8).unwrap(), Term::atom("run"));
    }

    #[test]
    fn big_integers_roundtrip() {
        for value in [i64::from(i32::MAX) + 1, -(1 << 40), i64::MAX] {
            assert_eq!(decode(&encode(&Term::Int(value))).unwrap(), Term::Int(value));
        }
    }

    #[test]
    fn truncated_input_is_an_error_not_a_panic() {
        let full = encode(&Term::tuple(vec![Term::atom("list")]));
        for cut in 0..full.len() {
            assert!(decode(&full[..cut]).is_err());
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        assert_eq!(decode(&[130, 106]), Err(TermError::BadVersion(130)));
    }

    #[test]
    fn improper_lists_are_rejected() {
        // LIST_EXT with a non-nil tail.
        let bytes = [131, 108, 0, 0, 0, 1, 97, 1, 97, 2];
        assert_eq!(
            decode(&bytes),
            Err(TermError::Malformed("improper list tail"))
        );
    }
}
