//! Payload codecs for the pod protocol.
//!
//! A pod negotiates one of three payload formats at describe time. All three
//! decode into (and encode from) the same host [`Value`] model; the EDN and
//! transit formats additionally consult per-pod [`Handlers`] tables for
//! user-defined tags and host types.

pub mod edn;
mod handlers;
pub mod json;
pub mod transit;
mod value;

pub use handlers::{EdnWriteHandler, Handlers, ReadHandler, TagRep, TransitWriteHandler};
pub use value::{Tagged, Value, WithMeta};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to decode {format} payload: {detail}")]
    Decode {
        format: &'static str,
        detail: String,
    },
    #[error("failed to encode {format} payload: {detail}")]
    Encode {
        format: &'static str,
        detail: String,
    },
}

/// The payload format negotiated with a pod. Fixed at describe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Edn,
    Json,
    TransitJson,
}

impl Format {
    /// Parse the `format` field of a describe reply.
    pub fn from_wire(name: &str) -> Option<Format> {
        match name {
            "edn" => Some(Format::Edn),
            "json" => Some(Format::Json),
            "transit+json" => Some(Format::TransitJson),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Format::Edn => "edn",
            Format::Json => "json",
            Format::TransitJson => "transit+json",
        }
    }

    /// Serialize an invocation argument list.
    pub fn encode_args(&self, args: &[Value], handlers: &Handlers) -> Result<Vec<u8>, Error> {
        match self {
            Format::Edn => edn::encode_args(args, handlers).map(String::into_bytes),
            Format::Json => json::encode_args(args),
            Format::TransitJson => transit::encode_args(args, handlers),
        }
    }

    /// Serialize one value (used for reply fixtures and tests).
    pub fn encode(&self, value: &Value, handlers: &Handlers) -> Result<Vec<u8>, Error> {
        match self {
            Format::Edn => edn::encode(value, handlers).map(String::into_bytes),
            Format::Json => json::encode(value),
            Format::TransitJson => transit::encode(value, handlers),
        }
    }

    /// Deserialize one payload value (a reply `value` or `ex-data` field).
    pub fn decode(&self, bytes: &[u8], handlers: &Handlers) -> Result<Value, Error> {
        match self {
            Format::Edn => {
                let text = std::str::from_utf8(bytes).map_err(|_| Error::Decode {
                    format: "edn",
                    detail: "payload is not UTF-8".to_string(),
                })?;
                edn::decode(text, handlers)
            }
            Format::Json => json::decode(bytes),
            Format::TransitJson => transit::decode(bytes, handlers),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

const LOCAL_DATE_TIME: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Format a local date-time as ISO-8601 without an offset.
pub(crate) fn format_local_date_time(dt: &time::PrimitiveDateTime) -> String {
    dt.format(&LOCAL_DATE_TIME)
        .expect("format description covers all date-time components")
}

/// Parse an ISO-8601 local date-time, tolerating fractional seconds.
pub(crate) fn parse_local_date_time(s: &str) -> Result<time::PrimitiveDateTime, String> {
    let truncated = match s.find('.') {
        Some(dot) => &s[..dot],
        None => s,
    };
    time::PrimitiveDateTime::parse(truncated, &LOCAL_DATE_TIME).map_err(|err| err.to_string())
}
