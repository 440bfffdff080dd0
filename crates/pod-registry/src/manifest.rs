//! Registry manifest parsing.
//!
//! Manifests are EDN documents keyed by namespaced keywords:
//!
//! ```edn
//! {:pod/name org.babashka/instaparse
//!  :pod/version "0.0.6"
//!  :pod/artifacts
//!  [{:os {:name "Linux" :arch "x86_64"}
//!    :artifact/url "https://…/instaparse-bb-0.0.6-linux-x86_64.tar.gz"
//!    :artifact/sha256 "…"
//!    :artifact/executable "instaparse-bb"}]}
//! ```

use crate::platform::Platform;
use crate::Error;
use pod_codec::{edn, Handlers, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub os_name: String,
    pub os_arch: String,
    pub url: String,
    pub sha256: Option<String>,
    pub executable: Option<String>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Manifest, Error> {
        let root = edn::decode(text, &Handlers::default())
            .map_err(|err| invalid(format!("not valid EDN: {err}")))?;

        let name = match root.get_kw("pod/name") {
            Some(Value::Symbol(s)) => s.clone(),
            Some(Value::String(s)) => s.clone(),
            _ => return Err(invalid("missing :pod/name")),
        };
        let version = match root.get_kw("pod/version") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(invalid("missing :pod/version")),
        };

        let artifacts = root
            .get_kw("pod/artifacts")
            .and_then(Value::items)
            .ok_or_else(|| invalid("missing :pod/artifacts"))?
            .iter()
            .map(Artifact::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Manifest {
            name,
            version,
            artifacts,
        })
    }

    /// The first artifact usable on `platform`, trying its fallback
    /// candidates in order. Returns the artifact and the platform slot it
    /// was selected for.
    pub fn select(&self, platform: &Platform) -> Option<(&Artifact, Platform)> {
        for candidate in platform.candidates() {
            let found = self.artifacts.iter().find(|artifact| {
                candidate.os.matches(&artifact.os_name) && candidate.arch.matches(&artifact.os_arch)
            });
            if let Some(artifact) = found {
                return Some((artifact, candidate));
            }
        }
        None
    }
}

impl Artifact {
    fn parse(value: &Value) -> Result<Artifact, Error> {
        let os = value
            .get_kw("os")
            .ok_or_else(|| invalid("artifact is missing :os"))?;
        let os_name = string_field(os.get_kw("name"))
            .ok_or_else(|| invalid("artifact :os is missing :name"))?;
        let os_arch = string_field(os.get_kw("arch"))
            .ok_or_else(|| invalid("artifact :os is missing :arch"))?;
        let url = string_field(value.get_kw("artifact/url"))
            .ok_or_else(|| invalid("artifact is missing :artifact/url"))?;

        Ok(Artifact {
            os_name,
            os_arch,
            url,
            sha256: string_field(value.get_kw("artifact/sha256")),
            executable: string_field(value.get_kw("artifact/executable")),
        })
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn invalid(detail: impl Into<String>) -> Error {
    Error::ManifestInvalid {
        detail: detail.into(),
    }
}

#[cfg(test)]
mod test {
    use super::Manifest;
    use crate::platform::{Arch, Os, Platform};

    const FIXTURE: &str = r#"
    {:pod/name org.babashka/instaparse
     :pod/description "Instaparse as a pod"
     :pod/version "0.0.6"
     :pod/artifacts
     [{:os {:name "Linux" :arch "x86_64"}
       :artifact/url "https://example.com/instaparse-linux-x86_64.tar.gz"
       :artifact/sha256 "aabbcc"
       :artifact/executable "instaparse-bb"}
      {:os {:name "Mac.*" :arch "x86_64"}
       :artifact/url "https://example.com/instaparse-macos-x86_64.zip"
       :artifact/executable "instaparse-bb"}]}
    "#;

    #[test]
    fn test_parse() {
        let manifest = Manifest::parse(FIXTURE).unwrap();
        assert_eq!(manifest.name, "org.babashka/instaparse");
        assert_eq!(manifest.version, "0.0.6");
        assert_eq!(manifest.artifacts.len(), 2);
        assert_eq!(manifest.artifacts[0].sha256.as_deref(), Some("aabbcc"));
        assert_eq!(
            manifest.artifacts[1].executable.as_deref(),
            Some("instaparse-bb")
        );
    }

    #[test]
    fn test_select_native_and_fallback() {
        let manifest = Manifest::parse(FIXTURE).unwrap();

        let linux = Platform {
            os: Os::Linux,
            arch: Arch::X86_64,
        };
        let (artifact, used) = manifest.select(&linux).unwrap();
        assert!(artifact.url.contains("linux"));
        assert_eq!(used, linux);

        // Apple silicon has no native artifact; Rosetta fallback selects the
        // x86_64 build.
        let apple = Platform {
            os: Os::Macos,
            arch: Arch::Aarch64,
        };
        let (artifact, used) = manifest.select(&apple).unwrap();
        assert!(artifact.url.contains("macos"));
        assert_eq!(used.arch, Arch::X86_64);

        let windows = Platform {
            os: Os::Windows,
            arch: Arch::X86_64,
        };
        assert!(manifest.select(&windows).is_none());
    }

    #[test]
    fn test_parse_errors() {
        for fixture in [
            "not a map",
            "{:pod/version \"1\"}",
            "{:pod/name a/b :pod/version \"1\"}",
        ] {
            assert!(Manifest::parse(fixture).is_err(), "fixture: {fixture}");
        }
    }
}
