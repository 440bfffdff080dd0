//! The symbolic-data payload format: an EDN reader and printer.
//!
//! The reader is a small recursive descent over the textual form. Tagged
//! values consult the pod's read-handler table; unknown tags are preserved as
//! `Value::Tagged`. The printer consults the type-keyed write-handler table
//! for `Value::Foreign`.

use crate::{Error, Handlers, Value};

pub fn decode(input: &str, handlers: &Handlers) -> Result<Value, Error> {
    let mut parser = Parser {
        input,
        pos: 0,
        handlers,
    };
    parser.skip_ws();
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(decode_err(format!(
            "trailing content after value at offset {}",
            parser.pos
        )));
    }
    Ok(value)
}

/// Print one value as EDN text.
pub fn encode(value: &Value, handlers: &Handlers) -> Result<String, Error> {
    let mut out = String::new();
    write_value(&mut out, value, handlers)?;
    Ok(out)
}

/// Print an argument sequence as one EDN vector.
pub fn encode_args(args: &[Value], handlers: &Handlers) -> Result<String, Error> {
    let mut out = String::from("[");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_value(&mut out, arg, handlers)?;
    }
    out.push(']');
    Ok(out)
}

fn decode_err(detail: impl Into<String>) -> Error {
    Error::Decode {
        format: "edn",
        detail: detail.into(),
    }
}

const DELIMITERS: &[char] = &['(', ')', '[', ']', '{', '}', '"', ';', ','];

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    handlers: &'a Handlers,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == ',' => {
                    self.bump();
                }
                Some(';') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, Error> {
        match self.peek() {
            None => Err(decode_err("unexpected end of input")),
            Some('(') => {
                self.bump();
                Ok(Value::List(self.parse_seq(')')?))
            }
            Some('[') => {
                self.bump();
                Ok(Value::Vector(self.parse_seq(']')?))
            }
            Some('{') => {
                self.bump();
                self.parse_map()
            }
            Some('"') => {
                self.bump();
                Ok(Value::String(self.parse_string()?))
            }
            Some(':') => {
                self.bump();
                let name = self.read_token();
                if name.is_empty() {
                    return Err(decode_err("empty keyword"));
                }
                Ok(Value::Keyword(name.to_string()))
            }
            Some('\\') => {
                self.bump();
                self.parse_char()
            }
            Some('#') => {
                self.bump();
                self.parse_dispatch()
            }
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some('+' | '-')
                if self
                    .rest()
                    .chars()
                    .nth(1)
                    .map_or(false, |d| d.is_ascii_digit()) =>
            {
                self.parse_number()
            }
            Some(_) => self.parse_symbol(),
        }
    }

    fn parse_seq(&mut self, close: char) -> Result<Vec<Value>, Error> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(decode_err(format!("unterminated sequence, expected {close:?}"))),
                Some(c) if c == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(_) => items.push(self.parse_value()?),
            }
        }
    }

    fn parse_map(&mut self) -> Result<Value, Error> {
        let items = self.parse_seq('}')?;
        if items.len() % 2 != 0 {
            return Err(decode_err("map literal with an odd number of forms"));
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            entries.push((k, v));
        }
        Ok(Value::Map(entries))
    }

    fn parse_string(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(decode_err("unterminated string")),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    None => return Err(decode_err("unterminated string escape")),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('u') => out.push(self.parse_unicode_escape()?),
                    Some(c) => return Err(decode_err(format!("invalid string escape \\{c}"))),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> Result<char, Error> {
        let mut code = 0u32;
        for _ in 0..4 {
            let c = self
                .bump()
                .ok_or_else(|| decode_err("unterminated unicode escape"))?;
            let digit = c
                .to_digit(16)
                .ok_or_else(|| decode_err(format!("invalid unicode escape digit {c:?}")))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| decode_err(format!("invalid unicode escape {code:#x}")))
    }

    fn parse_char(&mut self) -> Result<Value, Error> {
        let first = self
            .bump()
            .ok_or_else(|| decode_err("unterminated character literal"))?;
        let mut name = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() {
                self.bump();
                name.push(c);
            } else {
                break;
            }
        }
        if name.chars().count() == 1 {
            return Ok(Value::Char(first));
        }
        match name.as_str() {
            "newline" => Ok(Value::Char('\n')),
            "space" => Ok(Value::Char(' ')),
            "tab" => Ok(Value::Char('\t')),
            "return" => Ok(Value::Char('\r')),
            "backspace" => Ok(Value::Char('\u{8}')),
            "formfeed" => Ok(Value::Char('\u{c}')),
            _ if name.starts_with('u') && name.len() == 5 => {
                let code = u32::from_str_radix(&name[1..], 16)
                    .map_err(|_| decode_err(format!("invalid character literal \\{name}")))?;
                char::from_u32(code)
                    .map(Value::Char)
                    .ok_or_else(|| decode_err(format!("invalid character literal \\{name}")))
            }
            _ => Err(decode_err(format!("unknown character literal \\{name}"))),
        }
    }

    fn parse_dispatch(&mut self) -> Result<Value, Error> {
        match self.peek() {
            Some('{') => {
                self.bump();
                Ok(Value::Set(self.parse_seq('}')?))
            }
            Some('_') => {
                // Discard form: drop the next value, then read the one after.
                self.bump();
                self.skip_ws();
                let _ = self.parse_value()?;
                self.skip_ws();
                self.parse_value()
            }
            Some('#') => {
                self.bump();
                match self.read_token() {
                    "Inf" => Ok(Value::Float(f64::INFINITY)),
                    "-Inf" => Ok(Value::Float(f64::NEG_INFINITY)),
                    "NaN" => Ok(Value::Float(f64::NAN)),
                    other => Err(decode_err(format!("unknown symbolic value ##{other}"))),
                }
            }
            _ => {
                let tag = self.read_token().to_string();
                if tag.is_empty() {
                    return Err(decode_err("missing tag after '#'"));
                }
                self.skip_ws();
                let value = self.parse_value()?;
                self.resolve_tag(tag, value)
            }
        }
    }

    fn resolve_tag(&self, tag: String, value: Value) -> Result<Value, Error> {
        // Registered handlers shadow the built-in tags.
        if let Some(handler) = self.handlers.edn_read.get(&tag) {
            return handler(value);
        }
        match tag.as_str() {
            "uuid" => {
                let s = value
                    .as_str()
                    .ok_or_else(|| decode_err("#uuid requires a string"))?;
                let parsed = uuid::Uuid::parse_str(s)
                    .map_err(|err| decode_err(format!("invalid #uuid literal: {err}")))?;
                Ok(Value::Uuid(parsed))
            }
            "local-date-time" => {
                let s = value
                    .as_str()
                    .ok_or_else(|| decode_err("#local-date-time requires a string"))?;
                let parsed = crate::parse_local_date_time(s)
                    .map_err(|err| decode_err(format!("invalid #local-date-time literal: {err}")))?;
                Ok(Value::LocalDateTime(parsed))
            }
            _ => Ok(Value::tagged(tag, value)),
        }
    }

    fn parse_number(&mut self) -> Result<Value, Error> {
        let token = self.read_token();
        // Arbitrary-precision suffixes are tolerated but values must fit the
        // model's 64-bit types.
        let trimmed = token
            .strip_suffix('N')
            .or_else(|| token.strip_suffix('M'))
            .unwrap_or(token);
        if trimmed.contains(['.', 'e', 'E']) {
            trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| decode_err(format!("invalid number literal {token:?}")))
        } else {
            trimmed
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| decode_err(format!("invalid number literal {token:?}")))
        }
    }

    fn parse_symbol(&mut self) -> Result<Value, Error> {
        let token = self.read_token();
        match token {
            "" => Err(decode_err(format!(
                "unexpected character {:?}",
                self.peek().unwrap_or('\0')
            ))),
            "nil" => Ok(Value::Nil),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Ok(Value::Symbol(token.to_string())),
        }
    }

    fn read_token(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || DELIMITERS.contains(&c) {
                break;
            }
            self.bump();
        }
        &self.input[start..self.pos]
    }
}

fn write_value(out: &mut String, value: &Value, handlers: &Handlers) -> Result<(), Error> {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => {
            if f.is_nan() {
                out.push_str("##NaN");
            } else if f.is_infinite() {
                out.push_str(if *f > 0.0 { "##Inf" } else { "##-Inf" });
            } else {
                out.push_str(&format!("{f:?}"));
            }
        }
        Value::String(s) => write_string(out, s),
        Value::Keyword(k) => {
            out.push(':');
            out.push_str(k);
        }
        Value::Symbol(s) => out.push_str(s),
        Value::Char(c) => match c {
            '\n' => out.push_str("\\newline"),
            ' ' => out.push_str("\\space"),
            '\t' => out.push_str("\\tab"),
            '\r' => out.push_str("\\return"),
            _ => {
                out.push('\\');
                out.push(*c);
            }
        },
        Value::List(items) => write_seq(out, "(", items, ")", handlers)?,
        Value::Vector(items) => write_seq(out, "[", items, "]", handlers)?,
        Value::Set(items) => write_seq(out, "#{", items, "}", handlers)?,
        Value::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, k, handlers)?;
                out.push(' ');
                write_value(out, v, handlers)?;
            }
            out.push('}');
        }
        Value::Tagged(tagged) => {
            out.push('#');
            out.push_str(&tagged.tag);
            out.push(' ');
            write_value(out, &tagged.value, handlers)?;
        }
        // EDN has no metadata convention on the wire; the value travels bare.
        Value::WithMeta(wm) => write_value(out, &wm.value, handlers)?,
        Value::Uuid(u) => {
            out.push_str("#uuid \"");
            out.push_str(&u.to_string());
            out.push('"');
        }
        Value::LocalDateTime(dt) => {
            out.push_str("#local-date-time \"");
            out.push_str(&crate::format_local_date_time(dt));
            out.push('"');
        }
        Value::Foreign(any) => {
            let handler = handlers
                .edn_write
                .get(&any.as_ref().type_id())
                .ok_or_else(|| Error::Encode {
                    format: "edn",
                    detail: "no EDN write handler registered for host type".to_string(),
                })?;
            let symbolic = handler(any.as_ref())?;
            write_value(out, &symbolic, handlers)?;
        }
    }
    Ok(())
}

fn write_seq(
    out: &mut String,
    open: &str,
    items: &[Value],
    close: &str,
    handlers: &Handlers,
) -> Result<(), Error> {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write_value(out, item, handlers)?;
    }
    out.push_str(close);
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}
