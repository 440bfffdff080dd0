//! Local cache layout for downloaded pods.

use crate::platform::Platform;
use crate::Coordinate;
use std::path::PathBuf;

/// The cache root: `$BABASHKA_PODS_DIR`, else `$XDG_CACHE_HOME/babashka/pods`,
/// else `~/.cache/babashka/pods`.
pub fn cache_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("BABASHKA_PODS_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("babashka").join("pods");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("babashka")
        .join("pods")
}

/// Where one resolved artifact installs:
/// `<root>/repository/<qualifier>/<name>/<version>/<os>/<arch>`.
pub fn install_dir(
    root: &std::path::Path,
    coordinate: &Coordinate,
    version: &str,
    platform: &Platform,
) -> PathBuf {
    root.join("repository")
        .join(&coordinate.qualifier)
        .join(&coordinate.name)
        .join(version)
        .join(platform.os.name())
        .join(platform.arch.name())
}
