//! The host-side value model shared by all payload formats.

use std::any::Any;
use std::sync::Arc;

/// A payload value. One model covers all three wire formats; each codec maps
/// the subset it can express. `Foreign` holds an arbitrary host value that
/// only a registered write handler knows how to serialize.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Keyword name without the leading ':'. May contain a namespace
    /// ("ns/name").
    Keyword(String),
    Symbol(String),
    Char(char),
    List(Vec<Value>),
    Vector(Vec<Value>),
    Set(Vec<Value>),
    /// Entry order is preserved through decode and encode.
    Map(Vec<(Value, Value)>),
    /// A tagged value with no registered read handler.
    Tagged(Box<Tagged>),
    /// A value carrying metadata across the pod boundary.
    WithMeta(Box<WithMeta>),
    Uuid(uuid::Uuid),
    LocalDateTime(time::PrimitiveDateTime),
    /// An arbitrary host value, serializable only through a write handler
    /// registered for its concrete type.
    Foreign(Arc<dyn Any + Send + Sync>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub tag: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithMeta {
    pub value: Value,
    pub meta: Value,
}

impl Value {
    pub fn keyword(name: impl Into<String>) -> Value {
        Value::Keyword(name.into())
    }

    pub fn symbol(name: impl Into<String>) -> Value {
        Value::Symbol(name.into())
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn tagged(tag: impl Into<String>, value: Value) -> Value {
        Value::Tagged(Box::new(Tagged {
            tag: tag.into(),
            value,
        }))
    }

    pub fn with_meta(value: Value, meta: Value) -> Value {
        Value::WithMeta(Box::new(WithMeta { value, meta }))
    }

    pub fn foreign<T: Any + Send + Sync>(value: T) -> Value {
        Value::Foreign(Arc::new(value))
    }

    pub fn downcast_foreign<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Value::Foreign(any) => any.downcast_ref(),
            _ => None,
        }
    }

    /// Linear map lookup. Maps preserve entry order and are typically small.
    pub fn map_get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_kw(&self, name: &str) -> Option<&Value> {
        self.map_get(&Value::Keyword(name.to_string()))
    }

    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.map_get(&Value::String(name.to_string()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The items of a list, vector, or set.
    pub fn items(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) | Value::Vector(v) | Value::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Value::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Value::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Value::String(v) => f.debug_tuple("String").field(v).finish(),
            Value::Keyword(v) => f.debug_tuple("Keyword").field(v).finish(),
            Value::Symbol(v) => f.debug_tuple("Symbol").field(v).finish(),
            Value::Char(v) => f.debug_tuple("Char").field(v).finish(),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Vector(v) => f.debug_tuple("Vector").field(v).finish(),
            Value::Set(v) => f.debug_tuple("Set").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Value::Tagged(v) => f.debug_tuple("Tagged").field(v).finish(),
            Value::WithMeta(v) => f.debug_tuple("WithMeta").field(v).finish(),
            Value::Uuid(v) => f.debug_tuple("Uuid").field(v).finish(),
            Value::LocalDateTime(v) => f.debug_tuple("LocalDateTime").field(v).finish(),
            Value::Foreign(_) => f.write_str("Foreign(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Keyword(a), Keyword(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Vector(a), Vector(b)) => a == b,
            (Set(a), Set(b)) => {
                // Sets compare without regard to entry order.
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| other.map_get(k).map_or(false, |ov| ov == v))
            }
            (Tagged(a), Tagged(b)) => a == b,
            (WithMeta(a), WithMeta(b)) => a == b,
            (Uuid(a), Uuid(b)) => a == b,
            (LocalDateTime(a), LocalDateTime(b)) => a == b,
            (Foreign(a), Foreign(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Vector(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v)
    }
}
