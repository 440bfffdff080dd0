//! Per-pod read and write handler tables.
//!
//! Read handlers are keyed by tag and transform a decoded representation into
//! a host value. Write handlers are keyed by the concrete type inside a
//! `Value::Foreign` and produce the serializable representation.

use crate::{Error, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Transforms the decoded representation of a tagged value.
pub type ReadHandler = Arc<dyn Fn(Value) -> Result<Value, Error> + Send + Sync>;

/// Maps a foreign host value to the symbolic form the EDN printer emits.
pub type EdnWriteHandler =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Value, Error> + Send + Sync>;

/// Maps a foreign host value to a transit `{tag, rep}` pair.
pub type TransitWriteHandler =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<TagRep, Error> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct TagRep {
    pub tag: String,
    pub rep: Value,
}

#[derive(Default, Clone)]
pub struct Handlers {
    pub edn_read: HashMap<String, ReadHandler>,
    pub edn_write: HashMap<TypeId, EdnWriteHandler>,
    pub transit_read: HashMap<String, ReadHandler>,
    pub transit_write: HashMap<TypeId, TransitWriteHandler>,
    /// Catches foreign values with no type-keyed transit handler.
    pub transit_write_default: Option<TransitWriteHandler>,
}

impl Handlers {
    pub fn add_edn_read(&mut self, tag: impl Into<String>, handler: ReadHandler) {
        self.edn_read.insert(tag.into(), handler);
    }

    pub fn add_edn_write<T: Any + Send + Sync>(
        &mut self,
        handler: impl Fn(&T) -> Result<Value, Error> + Send + Sync + 'static,
    ) {
        self.edn_write.insert(
            TypeId::of::<T>(),
            Arc::new(move |any| {
                let value = any.downcast_ref::<T>().expect("registered under TypeId of T");
                handler(value)
            }),
        );
    }

    pub fn add_transit_read(&mut self, tag: impl Into<String>, handler: ReadHandler) {
        self.transit_read.insert(tag.into(), handler);
    }

    pub fn add_transit_write<T: Any + Send + Sync>(
        &mut self,
        handler: impl Fn(&T) -> Result<TagRep, Error> + Send + Sync + 'static,
    ) {
        self.transit_write.insert(
            TypeId::of::<T>(),
            Arc::new(move |any| {
                let value = any.downcast_ref::<T>().expect("registered under TypeId of T");
                handler(value)
            }),
        );
    }

    pub fn set_transit_write_default(&mut self, handler: TransitWriteHandler) {
        self.transit_write_default = Some(handler);
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("edn_read", &self.edn_read.keys().collect::<Vec<_>>())
            .field("edn_write", &self.edn_write.len())
            .field("transit_read", &self.transit_read.keys().collect::<Vec<_>>())
            .field("transit_write", &self.transit_write.len())
            .field(
                "transit_write_default",
                &self.transit_write_default.is_some(),
            )
            .finish()
    }
}
