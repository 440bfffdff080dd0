//! Declarative pod configuration.
//!
//! Pods are declared under the `tool.python-pods.pods` table of a
//! pyproject-style TOML file:
//!
//! ```toml
//! [tool.python-pods]
//! pods = [
//!     { name = "org.babashka/instaparse", version = "0.0.6" },
//!     { name = "local/echo", path = "./bin/echo-pod", opts = { transport = "socket" } },
//! ]
//! ```

use crate::process::StderrSink;
use crate::transport::TransportKind;
use crate::{Error, LoadOpts, PodSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct PodEntry {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// `cache = false` forces a fresh download on every load.
    #[serde(default)]
    pub cache: Option<bool>,
    #[serde(default)]
    pub opts: Option<PodEntryOpts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodEntryOpts {
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl PodEntry {
    /// Exactly one of `version` (registry coordinate) and `path` (local
    /// binary) must be set.
    pub fn validate(&self) -> Result<(), Error> {
        match (&self.version, &self.path) {
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "pod {:?} sets both version and path",
                self.name
            ))),
            (None, None) => Err(Error::Config(format!(
                "pod {:?} sets neither version nor path",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    pub fn to_spec(&self) -> (PodSpec, LoadOpts) {
        let spec = match &self.path {
            Some(path) => PodSpec::Path(path.clone()),
            None => PodSpec::Registry(self.name.clone()),
        };

        let opts = self.opts.clone().unwrap_or_default();
        let load = LoadOpts {
            transport: match opts.transport.as_deref() {
                Some("socket") => TransportKind::Socket,
                _ => TransportKind::Stdio,
            },
            version: self.version.clone(),
            force: opts.force.unwrap_or(false) || self.cache == Some(false),
            stderr: match opts.stderr.as_deref() {
                Some("log") => StderrSink::Log,
                _ => StderrSink::Discard,
            },
            patches: Vec::new(),
        };
        (spec, load)
    }
}

/// Parse the pod declarations out of a pyproject document. A missing table
/// means no pods.
pub fn parse(text: &str) -> Result<Vec<PodEntry>, Error> {
    let doc: toml::Value = toml::from_str(text)
        .map_err(|err| Error::Config(format!("invalid TOML: {err}")))?;

    let Some(pods) = doc
        .get("tool")
        .and_then(|tool| tool.get("python-pods"))
        .and_then(|section| section.get("pods"))
    else {
        return Ok(Vec::new());
    };

    pods.clone()
        .try_into()
        .map_err(|err| Error::Config(format!("invalid tool.python-pods.pods table: {err}")))
}

pub fn read_file(path: &Path) -> Result<Vec<PodEntry>, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
    parse(&text)
}

/// Filter entries by name. No selectors selects everything.
pub fn select<'e>(entries: &'e [PodEntry], selectors: &[&str]) -> Vec<&'e PodEntry> {
    entries
        .iter()
        .filter(|entry| selectors.is_empty() || selectors.contains(&entry.name.as_str()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::{parse, select};
    use crate::transport::TransportKind;
    use crate::PodSpec;

    const FIXTURE: &str = r#"
[project]
name = "irrelevant"

[tool.python-pods]
pods = [
    { name = "org.babashka/instaparse", version = "0.0.6" },
    { name = "local/echo", path = "./bin/echo-pod", opts = { transport = "socket" } },
    { name = "org.babashka/hsqldb", version = "0.1.0", cache = false },
]
"#;

    #[test]
    fn test_parse_entries() {
        let entries = parse(FIXTURE).unwrap();
        assert_eq!(entries.len(), 3);

        entries.iter().for_each(|e| e.validate().unwrap());

        let (spec, opts) = entries[0].to_spec();
        assert!(matches!(spec, PodSpec::Registry(ref c) if c == "org.babashka/instaparse"));
        assert_eq!(opts.version.as_deref(), Some("0.0.6"));
        assert!(!opts.force);

        let (spec, opts) = entries[1].to_spec();
        assert!(matches!(spec, PodSpec::Path(_)));
        assert_eq!(opts.transport, TransportKind::Socket);

        // cache = false re-downloads.
        let (_, opts) = entries[2].to_spec();
        assert!(opts.force);
    }

    #[test]
    fn test_validation() {
        let entries = parse(
            r#"
[tool.python-pods]
pods = [{ name = "broken/pod" }]
"#,
        )
        .unwrap();
        assert!(entries[0].validate().is_err());

        let entries = parse(
            r#"
[tool.python-pods]
pods = [{ name = "broken/pod", version = "1", path = "x" }]
"#,
        )
        .unwrap();
        assert!(entries[0].validate().is_err());
    }

    #[test]
    fn test_missing_table_is_empty() {
        assert!(parse("[project]\nname = \"x\"\n").unwrap().is_empty());
    }

    #[test]
    fn test_selectors() {
        let entries = parse(FIXTURE).unwrap();
        assert_eq!(select(&entries, &[]).len(), 3);
        let picked = select(&entries, &["local/echo"]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "local/echo");
    }
}
