//! Bencode envelope codec for the pod protocol.
//!
//! Every message exchanged with a pod is one bencode value: a 64-bit integer,
//! a byte string, a list, or a dictionary keyed by byte strings. Dictionaries
//! are written with keys in sorted order; any key order is accepted on decode.

use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input ends before one complete value could be read.
    #[error("envelope is truncated")]
    Truncated,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("expected envelope {expected} but found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single envelope value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Bytes(_) => "byte string",
            Value::List(_) => "list",
            Value::Dict(_) => "dictionary",
        }
    }

    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(unexpected("integer", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], Error> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(unexpected("byte string", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        let b = self.as_bytes()?;
        std::str::from_utf8(b).map_err(|_| Error::Malformed("byte string is not UTF-8".to_string()))
    }

    pub fn as_list(&self) -> Result<&[Value], Error> {
        match self {
            Value::List(l) => Ok(l),
            other => Err(unexpected("list", other)),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>, Error> {
        match self {
            Value::Dict(d) => Ok(d),
            other => Err(unexpected("dictionary", other)),
        }
    }

    /// Look up `key` in a dictionary value.
    pub fn field(&self, key: &str) -> Result<Option<&Value>, Error> {
        Ok(self.as_dict()?.get(key.as_bytes()))
    }

    /// Look up `key` in a dictionary value, requiring its presence.
    pub fn expect_field(&self, key: &str) -> Result<&Value, Error> {
        self.field(key)?
            .ok_or_else(|| Error::Malformed(format!("dictionary is missing key '{key}'")))
    }

    /// Build a dictionary from (key, value) pairs.
    pub fn dict<K, I>(pairs: I) -> Value
    where
        K: Into<Vec<u8>>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Encode this value onto `w`, flushing when complete.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        self.encode_inner(w)?;
        w.flush()?;
        Ok(())
    }

    fn encode_inner<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        match self {
            Value::Int(i) => write!(w, "i{i}e")?,
            Value::Bytes(b) => {
                write!(w, "{}:", b.len())?;
                w.write_all(b)?;
            }
            Value::List(items) => {
                w.write_all(b"l")?;
                for item in items {
                    item.encode_inner(w)?;
                }
                w.write_all(b"e")?;
            }
            // BTreeMap iteration yields keys in sorted order, as the wire
            // format requires.
            Value::Dict(entries) => {
                w.write_all(b"d")?;
                for (key, value) in entries {
                    write!(w, "{}:", key.len())?;
                    w.write_all(key)?;
                    value.encode_inner(w)?;
                }
                w.write_all(b"e")?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_inner(&mut buf)
            .expect("writes to a Vec cannot fail");
        buf
    }
}

fn unexpected(expected: &'static str, found: &Value) -> Error {
    Error::UnexpectedType {
        expected,
        found: found.kind(),
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

/// Decode one complete value from the front of `buf`, returning it along with
/// the number of bytes consumed. `Error::Truncated` means `buf` holds a prefix
/// of a valid value and the caller should read more input and retry.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), Error> {
    let (value, rest) = decode_at(buf)?;
    Ok((value, buf.len() - rest.len()))
}

fn decode_at(buf: &[u8]) -> Result<(Value, &[u8]), Error> {
    match buf.first() {
        None => Err(Error::Truncated),
        Some(b'i') => decode_int(&buf[1..]),
        Some(b'l') => decode_list(&buf[1..]),
        Some(b'd') => decode_dict(&buf[1..]),
        Some(b'0'..=b'9') => decode_bytes(buf),
        Some(c) => Err(Error::Malformed(format!(
            "unexpected envelope prefix byte {:?}",
            *c as char
        ))),
    }
}

fn decode_int(buf: &[u8]) -> Result<(Value, &[u8]), Error> {
    let end = match buf.iter().position(|b| *b == b'e') {
        Some(end) => end,
        None if buf.len() > 21 => {
            // Longer than any "-9223372036854775808" could be.
            return Err(Error::Malformed("unterminated integer".to_string()));
        }
        None => return Err(Error::Truncated),
    };
    let digits = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::Malformed("integer contains non-ASCII bytes".to_string()))?;
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::Malformed(format!("invalid integer literal {digits:?}")))?;
    Ok((Value::Int(value), &buf[end + 1..]))
}

fn decode_bytes(buf: &[u8]) -> Result<(Value, &[u8]), Error> {
    let colon = match buf.iter().position(|b| *b == b':') {
        Some(colon) => colon,
        // A 20-digit length prefix already exceeds any sane message.
        None if buf.len() > 20 => {
            return Err(Error::Malformed("unterminated byte string length".to_string()))
        }
        None => return Err(Error::Truncated),
    };
    let digits = std::str::from_utf8(&buf[..colon])
        .map_err(|_| Error::Malformed("byte string length contains non-ASCII bytes".to_string()))?;
    let length: usize = digits
        .parse()
        .map_err(|_| Error::Malformed(format!("invalid byte string length {digits:?}")))?;

    let body = &buf[colon + 1..];
    if body.len() < length {
        return Err(Error::Truncated);
    }
    Ok((Value::Bytes(body[..length].to_vec()), &body[length..]))
}

fn decode_list(mut buf: &[u8]) -> Result<(Value, &[u8]), Error> {
    let mut items = Vec::new();
    loop {
        match buf.first() {
            None => return Err(Error::Truncated),
            Some(b'e') => return Ok((Value::List(items), &buf[1..])),
            Some(_) => {
                let (item, rest) = decode_at(buf)?;
                items.push(item);
                buf = rest;
            }
        }
    }
}

fn decode_dict(mut buf: &[u8]) -> Result<(Value, &[u8]), Error> {
    let mut entries = BTreeMap::new();
    loop {
        match buf.first() {
            None => return Err(Error::Truncated),
            Some(b'e') => return Ok((Value::Dict(entries), &buf[1..])),
            Some(b'0'..=b'9') => {
                let (key, rest) = decode_bytes(buf)?;
                let Value::Bytes(key) = key else { unreachable!() };
                let (value, rest) = decode_at(rest)?;
                entries.insert(key, value);
                buf = rest;
            }
            Some(c) => {
                return Err(Error::Malformed(format!(
                    "dictionary key must be a byte string, found prefix {:?}",
                    *c as char
                )))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{decode, Error, Value};

    fn round_trip(value: Value) {
        let bytes = value.to_bytes();
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::Int(0));
        round_trip(Value::Int(42));
        round_trip(Value::Int(-42));
        round_trip(Value::Int(i64::MAX));
        round_trip(Value::Int(i64::MIN));
        round_trip(Value::Bytes(Vec::new()));
        round_trip(Value::from("hello"));
        round_trip(Value::Bytes(vec![0, 1, 2, 0xff]));
    }

    #[test]
    fn test_composite_round_trips() {
        round_trip(Value::List(vec![]));
        round_trip(Value::List(vec![
            Value::Int(1),
            Value::from("two"),
            Value::List(vec![Value::Int(3)]),
        ]));
        round_trip(Value::dict(vec![
            ("op", Value::from("invoke")),
            ("id", Value::from("1")),
            (
                "args",
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            ),
        ]));
    }

    #[test]
    fn test_encoded_keys_are_sorted() {
        let value = Value::dict(vec![
            ("zebra", Value::Int(1)),
            ("alpha", Value::Int(2)),
            ("mango", Value::Int(3)),
        ]);
        assert_eq!(
            String::from_utf8(value.to_bytes()).unwrap(),
            "d5:alphai2e5:mangoi3e5:zebrai1ee",
        );
    }

    #[test]
    fn test_decode_accepts_unsorted_keys() {
        let (value, _) = decode(b"d5:zebrai1e5:alphai2ee").unwrap();
        assert_eq!(
            value,
            Value::dict(vec![("alpha", Value::Int(2)), ("zebra", Value::Int(1))]),
        );
    }

    #[test]
    fn test_decode_yields_tail_position() {
        let mut bytes = Value::from("first").to_bytes();
        let first_len = bytes.len();
        bytes.extend_from_slice(&Value::from("second").to_bytes());

        let (value, consumed) = decode(&bytes).unwrap();
        assert_eq!(value, Value::from("first"));
        assert_eq!(consumed, first_len);

        let (value, consumed) = decode(&bytes[consumed..]).unwrap();
        assert_eq!(value, Value::from("second"));
        assert_eq!(consumed, bytes.len() - first_len);
    }

    #[test]
    fn test_truncated_inputs() {
        for fixture in [
            &b""[..],
            b"i42",
            b"4:abc",
            b"42",
            b"l",
            b"li1e",
            b"d",
            b"d2:op",
            b"d2:opi1e",
        ] {
            match decode(fixture) {
                Err(Error::Truncated) => (),
                other => panic!("expected Truncated for {fixture:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_inputs() {
        let fixtures: &[&[u8]] = &[
            b"x",                           // Unknown prefix.
            b"i4x2e",                       // Junk inside integer.
            b"ie",                          // Empty integer.
            b"i9223372036854775808e",       // Out of 64-bit range.
            b"di1ei2ee",                    // Non-bytestring dictionary key.
        ];
        for fixture in fixtures {
            match decode(fixture) {
                Err(Error::Malformed(_)) => (),
                other => panic!("expected Malformed for {fixture:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_accessor_type_errors() {
        let value = Value::Int(1);
        insta::assert_snapshot!(
            value.as_bytes().unwrap_err(),
            @"expected envelope byte string but found integer"
        );
        let value = Value::dict(vec![("op", Value::from("describe"))]);
        insta::assert_snapshot!(
            value.expect_field("id").unwrap_err(),
            @"malformed envelope: dictionary is missing key 'id'"
        );
    }
}
