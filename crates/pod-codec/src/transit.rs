//! The tagged-typed payload format: transit over a JSON ground.
//!
//! Scalars use the `~`-prefix conventions (`~:kw`, `~$sym`, `~uUUID`, `~~`
//! escape); composites use `["~#tag", rep]` or a single-entry object. Maps
//! arrive either as JSON objects or in the `["^ ", k1, v1, …]` array form.
//! The reader honors the writer cache (`^N` substitution codes); the writer
//! emits none, which every conforming reader accepts.

use crate::handlers::TagRep;
use crate::{Error, Handlers, Value};

pub fn decode(bytes: &[u8], handlers: &Handlers) -> Result<Value, Error> {
    let ground: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| Error::Decode {
        format: "transit+json",
        detail: err.to_string(),
    })?;
    Reader {
        handlers,
        cache: Vec::new(),
    }
    .decode_value(&ground, false)
}

pub fn encode(value: &Value, handlers: &Handlers) -> Result<Vec<u8>, Error> {
    let ground = encode_value(value, handlers, false)?;
    // Top-level scalars are wrapped in the quote tag, as transit requires.
    let ground = match ground {
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => ground,
        scalar => serde_json::json!(["~#'", scalar]),
    };
    serde_json::to_vec(&ground).map_err(|err| encode_err(err.to_string()))
}

pub fn encode_args(args: &[Value], handlers: &Handlers) -> Result<Vec<u8>, Error> {
    let ground = args
        .iter()
        .map(|arg| encode_value(arg, handlers, false))
        .collect::<Result<Vec<_>, _>>()?;
    serde_json::to_vec(&ground).map_err(|err| encode_err(err.to_string()))
}

fn decode_err(detail: impl Into<String>) -> Error {
    Error::Decode {
        format: "transit+json",
        detail: detail.into(),
    }
}

fn encode_err(detail: impl Into<String>) -> Error {
    Error::Encode {
        format: "transit+json",
        detail: detail.into(),
    }
}

// Writer cache parameters from the transit spec.
const CACHE_BASE: u8 = b'0';
const CACHE_DIGITS: usize = 44;

struct Reader<'a> {
    handlers: &'a Handlers,
    /// Raw strings in the order a caching writer would have assigned codes.
    cache: Vec<String>,
}

impl<'a> Reader<'a> {
    fn decode_value(&mut self, ground: &serde_json::Value, as_key: bool) -> Result<Value, Error> {
        match ground {
            serde_json::Value::Null => Ok(Value::Nil),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => {
                let raw = self.resolve_str(s, as_key)?;
                self.decode_string(&raw)
            }
            serde_json::Value::Array(items) => self.decode_array(items),
            serde_json::Value::Object(entries) => self.decode_object(entries),
        }
    }

    /// Resolve a cache code to the raw string it stands for, or record a
    /// cacheable first occurrence. Recording follows the writer's rule
    /// exactly so assigned indices stay aligned.
    fn resolve_str(&mut self, s: &str, as_key: bool) -> Result<String, Error> {
        if let Some(code) = s.strip_prefix('^') {
            if code != " " {
                let index = cache_index(code)
                    .ok_or_else(|| decode_err(format!("invalid cache code {s:?}")))?;
                return self
                    .cache
                    .get(index)
                    .cloned()
                    .ok_or_else(|| decode_err(format!("cache code {s:?} has no entry")));
            }
        }
        if is_cacheable(s, as_key) {
            self.cache.push(s.to_string());
        }
        Ok(s.to_string())
    }

    fn decode_string(&self, raw: &str) -> Result<Value, Error> {
        let Some(rest) = raw.strip_prefix('~') else {
            return Ok(Value::String(raw.to_string()));
        };
        let mut chars = rest.chars();
        let tag = chars
            .next()
            .ok_or_else(|| decode_err("dangling '~' in string"))?;
        let rep = chars.as_str();

        // One-character escapes.
        if matches!(tag, '~' | '^' | '`') {
            return Ok(Value::String(rest.to_string()));
        }
        if tag == ':' {
            return Ok(Value::Keyword(rep.to_string()));
        }
        if tag == '$' {
            return Ok(Value::Symbol(rep.to_string()));
        }

        // Registered handlers shadow the built-in scalar tags.
        if let Some(handler) = self.handlers.transit_read.get(&tag.to_string()) {
            return handler(Value::String(rep.to_string()));
        }
        match tag {
            'u' => uuid::Uuid::parse_str(rep)
                .map(Value::Uuid)
                .map_err(|err| decode_err(format!("invalid ~u uuid: {err}"))),
            'i' | 'n' => rep
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| decode_err(format!("integer {rep:?} does not fit in 64 bits"))),
            'd' | 'f' => rep
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| decode_err(format!("invalid floating literal {rep:?}"))),
            'z' => match rep {
                "NaN" => Ok(Value::Float(f64::NAN)),
                "INF" => Ok(Value::Float(f64::INFINITY)),
                "-INF" => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => Err(decode_err(format!("unknown special number {rep:?}"))),
            },
            '?' => match rep {
                "t" => Ok(Value::Bool(true)),
                "f" => Ok(Value::Bool(false)),
                _ => Err(decode_err(format!("invalid boolean rep {rep:?}"))),
            },
            '_' => Ok(Value::Nil),
            'c' => {
                let mut rep_chars = rep.chars();
                match (rep_chars.next(), rep_chars.next()) {
                    (Some(c), None) => Ok(Value::Char(c)),
                    _ => Err(decode_err(format!("invalid character rep {rep:?}"))),
                }
            }
            other => Ok(Value::tagged(
                other.to_string(),
                Value::String(rep.to_string()),
            )),
        }
    }

    fn decode_array(&mut self, items: &[serde_json::Value]) -> Result<Value, Error> {
        // Check the head for the map marker or a composite tag.
        if let Some(serde_json::Value::String(head)) = items.first() {
            if head == "^ " {
                let pairs = &items[1..];
                if pairs.len() % 2 != 0 {
                    return Err(decode_err("map-as-array has an odd number of forms"));
                }
                let mut entries = Vec::with_capacity(pairs.len() / 2);
                for pair in pairs.chunks(2) {
                    let key = self.decode_value(&pair[0], true)?;
                    let value = self.decode_value(&pair[1], false)?;
                    entries.push((key, value));
                }
                return Ok(Value::Map(entries));
            }

            let raw = self.resolve_str(head, false)?;
            if let Some(tag) = raw.strip_prefix("~#") {
                let tag = tag.to_string();
                if items.len() != 2 {
                    return Err(decode_err(format!(
                        "tag {tag:?} expects exactly one representation"
                    )));
                }
                return self.decode_tagged(&tag, &items[1]);
            }
            // An ordinary string head: it was already recorded in the cache
            // by resolve_str above, so fall through using the raw form.
            let mut decoded = Vec::with_capacity(items.len());
            decoded.push(self.decode_string(&raw)?);
            for item in &items[1..] {
                decoded.push(self.decode_value(item, false)?);
            }
            return Ok(Value::Vector(decoded));
        }

        let decoded = items
            .iter()
            .map(|item| self.decode_value(item, false))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Vector(decoded))
    }

    fn decode_object(
        &mut self,
        entries: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Value, Error> {
        // A single-entry object whose key is a tag is the verbose composite
        // form. The key is resolved exactly once either way, so the cache
        // stays aligned with the writer's.
        if entries.len() == 1 {
            let (key, rep) = entries.iter().next().expect("len is 1");
            let raw = self.resolve_str(key, true)?;
            if let Some(tag) = raw.strip_prefix("~#") {
                let tag = tag.to_string();
                return self.decode_tagged(&tag, rep);
            }
            return Ok(Value::Map(vec![(
                self.decode_string(&raw)?,
                self.decode_value(rep, false)?,
            )]));
        }
        let mut decoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let raw = self.resolve_str(key, true)?;
            decoded.push((self.decode_string(&raw)?, self.decode_value(value, false)?));
        }
        Ok(Value::Map(decoded))
    }

    fn decode_tagged(&mut self, tag: &str, rep: &serde_json::Value) -> Result<Value, Error> {
        // Registered handlers shadow the built-in tags.
        if let Some(handler) = self.handlers.transit_read.get(tag) {
            let rep = self.decode_value(rep, false)?;
            return handler(rep);
        }
        match tag {
            // Quote wraps a bare top-level scalar.
            "'" => self.decode_value(rep, false),
            "list" => match self.decode_value(rep, false)? {
                Value::Vector(items) => Ok(Value::List(items)),
                other => Err(decode_err(format!("~#list rep must be an array, got {other:?}"))),
            },
            "set" => match self.decode_value(rep, false)? {
                Value::Vector(items) => Ok(Value::Set(items)),
                other => Err(decode_err(format!("~#set rep must be an array, got {other:?}"))),
            },
            "cmap" => {
                let items = match self.decode_value(rep, false)? {
                    Value::Vector(items) => items,
                    other => {
                        return Err(decode_err(format!(
                            "~#cmap rep must be an array, got {other:?}"
                        )))
                    }
                };
                if items.len() % 2 != 0 {
                    return Err(decode_err("~#cmap rep has an odd number of forms"));
                }
                let mut entries = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    entries.push((k, v));
                }
                Ok(Value::Map(entries))
            }
            "with-meta" => {
                let rep = self.decode_value(rep, false)?;
                let items = rep
                    .items()
                    .filter(|items| items.len() == 2)
                    .ok_or_else(|| decode_err("~#with-meta rep must be a [value, meta] pair"))?;
                Ok(Value::with_meta(items[0].clone(), items[1].clone()))
            }
            "u" => match self.decode_value(rep, false)? {
                Value::String(s) => uuid::Uuid::parse_str(&s)
                    .map(Value::Uuid)
                    .map_err(|err| decode_err(format!("invalid ~#u uuid: {err}"))),
                Value::Uuid(u) => Ok(Value::Uuid(u)),
                other => Err(decode_err(format!("~#u rep must be a string, got {other:?}"))),
            },
            "local-date-time" => match self.decode_value(rep, false)? {
                Value::String(s) => crate::parse_local_date_time(&s)
                    .map(Value::LocalDateTime)
                    .map_err(|err| decode_err(format!("invalid local date-time: {err}"))),
                other => Err(decode_err(format!(
                    "~#local-date-time rep must be a string, got {other:?}"
                ))),
            },
            _ => {
                let rep = self.decode_value(rep, false)?;
                Ok(Value::tagged(tag.to_string(), rep))
            }
        }
    }
}

fn cache_index(code: &str) -> Option<usize> {
    match code.as_bytes() {
        [c] if *c >= CACHE_BASE => Some((c - CACHE_BASE) as usize),
        [c0, c1] if *c0 >= CACHE_BASE && *c1 >= CACHE_BASE => {
            Some((c0 - CACHE_BASE) as usize * CACHE_DIGITS + (c1 - CACHE_BASE) as usize)
        }
        _ => None,
    }
}

fn is_cacheable(s: &str, as_key: bool) -> bool {
    s.len() >= 4
        && (as_key || s.starts_with("~:") || s.starts_with("~$") || s.starts_with("~#"))
}

fn encode_value(
    value: &Value,
    handlers: &Handlers,
    as_key: bool,
) -> Result<serde_json::Value, Error> {
    let encoded = match value {
        Value::Nil if as_key => serde_json::Value::String("~_".to_string()),
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) if as_key => {
            serde_json::Value::String(format!("~?{}", if *b { "t" } else { "f" }))
        }
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) if as_key => serde_json::Value::String(format!("~i{i}")),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => {
            if f.is_nan() {
                serde_json::Value::String("~zNaN".to_string())
            } else if f.is_infinite() {
                serde_json::Value::String(
                    if *f > 0.0 { "~zINF" } else { "~z-INF" }.to_string(),
                )
            } else if as_key {
                serde_json::Value::String(format!("~d{f:?}"))
            } else {
                serde_json::Value::from(*f)
            }
        }
        Value::String(s) => {
            if s.starts_with(['~', '^', '`']) {
                serde_json::Value::String(format!("~{s}"))
            } else {
                serde_json::Value::String(s.clone())
            }
        }
        Value::Keyword(name) => serde_json::Value::String(format!("~:{name}")),
        Value::Symbol(name) => serde_json::Value::String(format!("~${name}")),
        Value::Char(c) => serde_json::Value::String(format!("~c{c}")),
        Value::Uuid(u) => serde_json::Value::String(format!("~u{u}")),
        Value::LocalDateTime(dt) => serde_json::json!([
            "~#local-date-time",
            crate::format_local_date_time(dt)
        ]),
        Value::Vector(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| encode_value(item, handlers, false))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::List(items) => tagged_array("list", encode_items(items, handlers)?),
        Value::Set(items) => tagged_array("set", encode_items(items, handlers)?),
        Value::Map(entries) => encode_map(entries, handlers)?,
        Value::Tagged(tagged) => tagged_array(
            &tagged.tag,
            encode_value(&tagged.value, handlers, false)?,
        ),
        Value::WithMeta(wm) => serde_json::json!([
            "~#with-meta",
            [
                encode_value(&wm.value, handlers, false)?,
                encode_value(&wm.meta, handlers, false)?
            ]
        ]),
        Value::Foreign(any) => {
            let handler = handlers
                .transit_write
                .get(&any.as_ref().type_id())
                .or(handlers.transit_write_default.as_ref())
                .ok_or_else(|| {
                    encode_err("no transit write handler registered for host type")
                })?;
            let TagRep { tag, rep } = handler(any.as_ref())?;
            tagged_array(&tag, encode_value(&rep, handlers, false)?)
        }
    };

    if as_key && !encoded.is_string() {
        return Err(encode_err(format!(
            "map key {value:?} has no scalar transit form; use a cmap-compatible key"
        )));
    }
    Ok(encoded)
}

fn encode_items(items: &[Value], handlers: &Handlers) -> Result<serde_json::Value, Error> {
    Ok(serde_json::Value::Array(
        items
            .iter()
            .map(|item| encode_value(item, handlers, false))
            .collect::<Result<Vec<_>, _>>()?,
    ))
}

fn tagged_array(tag: &str, rep: serde_json::Value) -> serde_json::Value {
    serde_json::json!([format!("~#{tag}"), rep])
}

fn encode_map(
    entries: &[(Value, Value)],
    handlers: &Handlers,
) -> Result<serde_json::Value, Error> {
    // Keys with a scalar form use the standard map-as-array shape; any
    // composite key forces the cmap form.
    let scalar_keys = entries.iter().all(|(k, _)| {
        matches!(
            k,
            Value::Nil
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::String(_)
                | Value::Keyword(_)
                | Value::Symbol(_)
                | Value::Char(_)
                | Value::Uuid(_)
        )
    });

    if scalar_keys {
        let mut ground = Vec::with_capacity(1 + entries.len() * 2);
        ground.push(serde_json::Value::String("^ ".to_string()));
        for (k, v) in entries {
            ground.push(encode_value(k, handlers, true)?);
            ground.push(encode_value(v, handlers, false)?);
        }
        Ok(serde_json::Value::Array(ground))
    } else {
        let mut rep = Vec::with_capacity(entries.len() * 2);
        for (k, v) in entries {
            rep.push(encode_value(k, handlers, false)?);
            rep.push(encode_value(v, handlers, false)?);
        }
        Ok(tagged_array("cmap", serde_json::Value::Array(rep)))
    }
}
