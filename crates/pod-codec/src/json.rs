//! The plain-tree payload format, bridged over `serde_json::Value`.
//!
//! JSON carries no tags: keywords and symbols flatten to their names, sets
//! flatten to arrays, and metadata travels bare. Integer and floating numbers
//! are distinguished at decode.

use crate::{Error, Value};

pub fn decode(bytes: &[u8]) -> Result<Value, Error> {
    let ground: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| Error::Decode {
        format: "json",
        detail: err.to_string(),
    })?;
    Ok(from_json(ground))
}

pub fn encode(value: &Value) -> Result<Vec<u8>, Error> {
    let ground = to_json(value)?;
    serde_json::to_vec(&ground).map_err(|err| Error::Encode {
        format: "json",
        detail: err.to_string(),
    })
}

pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, Error> {
    let ground = args.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
    serde_json::to_vec(&ground).map_err(|err| Error::Encode {
        format: "json",
        detail: err.to_string(),
    })
}

pub(crate) fn from_json(ground: serde_json::Value) -> Value {
    match ground {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                // u64 values beyond i64::MAX also land here; the payload
                // contract is 64-bit signed.
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Vector(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k), from_json(v)))
                .collect(),
        ),
    }
}

pub(crate) fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    let encoded = match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| encode_err("non-finite float is not representable in JSON"))?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Keyword(name) | Value::Symbol(name) => serde_json::Value::String(name.clone()),
        Value::Char(c) => serde_json::Value::String(c.to_string()),
        Value::List(items) | Value::Vector(items) | Value::Set(items) => serde_json::Value::Array(
            items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                object.insert(object_key(k)?, to_json(v)?);
            }
            serde_json::Value::Object(object)
        }
        Value::Tagged(_) => {
            return Err(encode_err("tagged values are not representable in JSON"))
        }
        Value::WithMeta(wm) => to_json(&wm.value)?,
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::LocalDateTime(dt) => {
            serde_json::Value::String(crate::format_local_date_time(dt))
        }
        Value::Foreign(_) => {
            return Err(encode_err(
                "foreign host values are not representable in JSON",
            ))
        }
    };
    Ok(encoded)
}

fn object_key(key: &Value) -> Result<String, Error> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Keyword(name) | Value::Symbol(name) => Ok(name.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(encode_err(format!(
            "map key {other:?} is not representable as a JSON object key"
        ))),
    }
}

fn encode_err(detail: impl Into<String>) -> Error {
    Error::Encode {
        format: "json",
        detail: detail.into(),
    }
}
