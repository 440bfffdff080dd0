//! Parsing of `describe` (and describe-shaped `load-ns`) replies.

use crate::Error;
use pod_codec::Format;
use pod_envelope as envelope;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct DescribeReply {
    pub format: Format,
    pub namespaces: Vec<NamespaceDecl>,
    /// Host-dialect → tag → reader-function source.
    pub readers: BTreeMap<String, BTreeMap<String, String>>,
    /// Namespaces declared but not materialized until explicitly loaded.
    pub defer: HashSet<String>,
    /// Extension op names the pod supports.
    pub ops: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceDecl {
    pub name: String,
    pub vars: Vec<VarDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub doc: Option<String>,
    pub is_async: bool,
    pub arg_meta: bool,
    /// Source of a host-evaluated var. A var without code is remote.
    pub code: Option<String>,
}

impl DescribeReply {
    pub fn parse(reply: &envelope::Value) -> Result<DescribeReply, Error> {
        let format_name = reply.expect_field("format").map_err(handshake)?;
        let format_name = format_name.as_str().map_err(handshake)?;
        let format = Format::from_wire(format_name).ok_or_else(|| Error::PodHandshake {
            detail: format!("pod announced unknown payload format {format_name:?}"),
        })?;

        let mut parsed = DescribeReply {
            format,
            namespaces: parse_namespaces(reply)?,
            readers: BTreeMap::new(),
            defer: HashSet::new(),
            ops: HashSet::new(),
        };

        if let Some(readers) = reply.field("readers").map_err(handshake)? {
            for (dialect, table) in readers.as_dict().map_err(handshake)? {
                let dialect = String::from_utf8_lossy(dialect).to_string();
                let mut tags = BTreeMap::new();
                for (tag, source) in table.as_dict().map_err(handshake)? {
                    tags.insert(
                        String::from_utf8_lossy(tag).to_string(),
                        source.as_str().map_err(handshake)?.to_string(),
                    );
                }
                parsed.readers.insert(dialect, tags);
            }
        }

        if let Some(defer) = reply.field("defer").map_err(handshake)? {
            for name in defer.as_list().map_err(handshake)? {
                parsed.defer.insert(name.as_str().map_err(handshake)?.to_string());
            }
        }

        if let Some(ops) = reply.field("ops").map_err(handshake)? {
            for op in ops.as_dict().map_err(handshake)?.keys() {
                parsed.ops.insert(String::from_utf8_lossy(op).to_string());
            }
        }

        Ok(parsed)
    }
}

/// Parse the `namespaces` list shared by describe and load-ns replies.
pub fn parse_namespaces(reply: &envelope::Value) -> Result<Vec<NamespaceDecl>, Error> {
    let Some(namespaces) = reply.field("namespaces").map_err(handshake)? else {
        return Ok(Vec::new());
    };

    namespaces
        .as_list()
        .map_err(handshake)?
        .iter()
        .map(|ns| {
            let name = ns
                .expect_field("name")
                .and_then(|name| name.as_str().map(str::to_string))
                .map_err(handshake)?;

            let vars = match ns.field("vars").map_err(handshake)? {
                None => Vec::new(),
                Some(vars) => vars
                    .as_list()
                    .map_err(handshake)?
                    .iter()
                    .map(parse_var)
                    .collect::<Result<Vec<_>, _>>()?,
            };

            Ok(NamespaceDecl { name, vars })
        })
        .collect()
}

fn parse_var(var: &envelope::Value) -> Result<VarDecl, Error> {
    let name = var
        .expect_field("name")
        .and_then(|name| name.as_str().map(str::to_string))
        .map_err(handshake)?;

    let string_field = |key: &str| -> Result<Option<String>, Error> {
        match var.field(key).map_err(handshake)? {
            None => Ok(None),
            Some(value) => Ok(Some(value.as_str().map_err(handshake)?.to_string())),
        }
    };

    // Flags arrive as the byte strings "true"/"false".
    let flag = |key: &str| -> Result<bool, Error> {
        Ok(matches!(string_field(key)?.as_deref(), Some("true")))
    };

    Ok(VarDecl {
        name,
        doc: string_field("doc")?,
        is_async: flag("async")?,
        arg_meta: flag("arg-meta")?,
        code: string_field("code")?,
    })
}

fn handshake(err: pod_envelope::Error) -> Error {
    Error::PodHandshake {
        detail: format!("malformed describe reply: {err}"),
    }
}

#[cfg(test)]
mod test {
    use super::DescribeReply;
    use pod_codec::Format;
    use pod_envelope::Value;

    fn describe_fixture() -> Value {
        Value::dict(vec![
            ("format", Value::from("edn")),
            (
                "namespaces",
                Value::List(vec![
                    Value::dict(vec![
                        ("name", Value::from("pod.test-pod")),
                        (
                            "vars",
                            Value::List(vec![
                                Value::dict(vec![("name", Value::from("add-one"))]),
                                Value::dict(vec![
                                    ("name", Value::from("async-countdown")),
                                    ("async", Value::from("true")),
                                    ("doc", Value::from("Counts down.")),
                                ]),
                                Value::dict(vec![
                                    ("name", Value::from("helper")),
                                    ("code", Value::from("(defn helper [x] x)")),
                                ]),
                            ]),
                        ),
                    ]),
                    Value::dict(vec![("name", Value::from("pod.test-pod.extras"))]),
                ]),
            ),
            (
                "readers",
                Value::dict(vec![(
                    "rust",
                    Value::dict(vec![("person", Value::from("|v| v"))]),
                )]),
            ),
            (
                "defer",
                Value::List(vec![Value::from("pod.test-pod.extras")]),
            ),
            (
                "ops",
                Value::dict(vec![("shutdown", Value::dict::<&str, _>(vec![]))]),
            ),
        ])
    }

    #[test]
    fn test_parse_describe() {
        let parsed = DescribeReply::parse(&describe_fixture()).unwrap();
        assert_eq!(parsed.format, Format::Edn);
        assert_eq!(parsed.namespaces.len(), 2);

        let vars = &parsed.namespaces[0].vars;
        assert_eq!(vars[0].name, "add-one");
        assert!(!vars[0].is_async);
        assert!(vars[1].is_async);
        assert_eq!(vars[1].doc.as_deref(), Some("Counts down."));
        assert_eq!(vars[2].code.as_deref(), Some("(defn helper [x] x)"));

        assert!(parsed.defer.contains("pod.test-pod.extras"));
        assert!(parsed.ops.contains("shutdown"));
        assert_eq!(parsed.readers["rust"]["person"], "|v| v");
    }

    #[test]
    fn test_parse_rejects_unknown_format() {
        let reply = Value::dict(vec![("format", Value::from("msgpack"))]);
        let err = DescribeReply::parse(&reply).unwrap_err();
        insta::assert_snapshot!(
            err,
            @r#"pod handshake failed: pod announced unknown payload format "msgpack""#
        );
    }

    #[test]
    fn test_parse_rejects_missing_format() {
        let reply = Value::dict(vec![("ops", Value::dict::<&str, _>(vec![]))]);
        assert!(DescribeReply::parse(&reply).is_err());
    }
}
