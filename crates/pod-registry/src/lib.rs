//! Resolver for the remote pod registry.
//!
//! A coordinate like `org.babashka/instaparse` plus a version resolves to a
//! locally cached, executable pod binary: the resolver fetches the registry
//! manifest, picks the artifact matching the host platform, downloads and
//! checksums it, and installs it atomically under the cache.

pub mod cache;
pub mod fetch;
pub mod manifest;
pub mod platform;

use manifest::Manifest;
use platform::Platform;
use std::path::PathBuf;

pub const DEFAULT_REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/babashka/pod-registry/master/manifests";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pod coordinate {0:?}, expected \"qualifier/name\"")]
    InvalidCoordinate(String),
    #[error("no manifest in the pod registry for {coordinate} version {version}")]
    ManifestMissing { coordinate: String, version: String },
    #[error("malformed pod manifest: {detail}")]
    ManifestInvalid { detail: String },
    #[error("no pod artifact published for {os}/{arch}")]
    PlatformUnsupported { os: String, arch: String },
    #[error("artifact checksum mismatch: expected sha256 {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to install pod artifact")]
    Install(#[source] std::io::Error),
}

/// A registry coordinate: `qualifier/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub qualifier: String,
    pub name: String,
}

impl Coordinate {
    pub fn parse(coordinate: &str) -> Result<Coordinate, Error> {
        match coordinate.split_once('/') {
            Some((qualifier, name)) if !qualifier.is_empty() && !name.is_empty() => {
                Ok(Coordinate {
                    qualifier: qualifier.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::InvalidCoordinate(coordinate.to_string())),
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.qualifier, self.name)
    }
}

pub struct Resolver {
    http: reqwest::Client,
    registry_url: String,
    cache_root: PathBuf,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_URL.to_string(), cache::cache_root())
    }
}

impl Resolver {
    pub fn new(registry_url: String, cache_root: PathBuf) -> Resolver {
        Resolver {
            http: reqwest::Client::new(),
            registry_url,
            cache_root,
        }
    }

    /// Resolve `coordinate` at `version` to an executable entrypoint path,
    /// downloading and installing into the cache when needed. An existing
    /// install is reused unless `force`.
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve(
        &self,
        coordinate: &str,
        version: &str,
        force: bool,
    ) -> Result<PathBuf, Error> {
        let coordinate = Coordinate::parse(coordinate)?;
        let platform = Platform::current()?;

        let manifest = self.fetch_manifest(&coordinate, version).await?;
        let (artifact, slot) =
            manifest
                .select(&platform)
                .ok_or_else(|| Error::PlatformUnsupported {
                    os: platform.os.name().to_string(),
                    arch: platform.arch.name().to_string(),
                })?;

        let file_name = fetch::artifact_file_name(&artifact.url);
        let entrypoint_name = artifact
            .executable
            .clone()
            .unwrap_or_else(|| fetch::default_entrypoint(&file_name));

        let install_dir = cache::install_dir(&self.cache_root, &coordinate, version, &slot);
        let entrypoint = install_dir.join(&entrypoint_name);
        if entrypoint.exists() && !force {
            tracing::debug!(entrypoint = %entrypoint.display(), "pod already installed");
            return Ok(entrypoint);
        }

        let bytes = self.fetch_bytes(&artifact.url).await?;
        if let Some(expected) = &artifact.sha256 {
            fetch::verify_sha256(&bytes, expected)?;
        }
        tracing::info!(
            %coordinate,
            version,
            url = %artifact.url,
            dest = %install_dir.display(),
            "installing pod artifact"
        );

        // Archive extraction is blocking filesystem work.
        let entrypoint = tokio::task::spawn_blocking(move || {
            fetch::install(&bytes, &file_name, &install_dir, &entrypoint_name)
        })
        .await
        .expect("install does not panic")?;

        Ok(entrypoint)
    }

    async fn fetch_manifest(
        &self,
        coordinate: &Coordinate,
        version: &str,
    ) -> Result<Manifest, Error> {
        let url = format!(
            "{}/{}/{}/{}/manifest.edn",
            self.registry_url, coordinate.qualifier, coordinate.name, version
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| Error::Fetch {
                url: url.clone(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ManifestMissing {
                coordinate: coordinate.to_string(),
                version: version.to_string(),
            });
        }
        let text = response
            .error_for_status()
            .map_err(|source| Error::Fetch {
                url: url.clone(),
                source,
            })?
            .text()
            .await
            .map_err(|source| Error::Fetch { url, source })?;

        Manifest::parse(&text)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| Error::Fetch {
                url: url.to_string(),
                source,
            })?;
        let bytes = response.bytes().await.map_err(|source| Error::Fetch {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}
