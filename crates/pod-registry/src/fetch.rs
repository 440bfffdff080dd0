//! Artifact download, checksum verification, and atomic install.

use crate::Error;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Verify `bytes` against a hex SHA-256 digest, case-insensitively.
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<(), Error> {
    let actual = hex::encode(Sha256::digest(bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
    None,
}

fn archive_kind(file_name: &str) -> ArchiveKind {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        ArchiveKind::Zip
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else if lower.ends_with(".tar") {
        ArchiveKind::Tar
    } else {
        ArchiveKind::None
    }
}

/// The artifact's file name, from the last segment of its URL.
pub fn artifact_file_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_string()
}

/// The name the entrypoint will have if the manifest does not say: the
/// artifact file name with its archive suffix stripped.
pub fn default_entrypoint(file_name: &str) -> String {
    let lower = file_name.to_ascii_lowercase();
    for suffix in [".tar.gz", ".tgz", ".tar", ".zip"] {
        if lower.ends_with(suffix) {
            return file_name[..file_name.len() - suffix.len()].to_string();
        }
    }
    file_name.to_string()
}

/// Unpack (or copy) the artifact into `dest`, atomically: everything is
/// staged into a temp directory sibling of `dest` which is renamed into
/// place. Returns the entrypoint path inside `dest`.
pub fn install(
    bytes: &[u8],
    file_name: &str,
    dest: &Path,
    entrypoint_name: &str,
) -> Result<PathBuf, Error> {
    let parent = dest.parent().ok_or_else(|| {
        Error::Install(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "install dir has no parent",
        ))
    })?;
    std::fs::create_dir_all(parent).map_err(Error::Install)?;
    let staging = tempfile::tempdir_in(parent).map_err(Error::Install)?;

    match archive_kind(file_name) {
        ArchiveKind::Zip => extract_zip(bytes, staging.path())?,
        ArchiveKind::TarGz => {
            let tar = flate2::read::GzDecoder::new(bytes);
            extract_tar(tar, staging.path())?;
        }
        ArchiveKind::Tar => extract_tar(bytes, staging.path())?,
        ArchiveKind::None => {
            std::fs::write(staging.path().join(entrypoint_name), bytes).map_err(Error::Install)?;
        }
    }

    let staged_entrypoint = staging.path().join(entrypoint_name);
    if !staged_entrypoint.exists() {
        return Err(Error::Install(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("artifact does not contain entrypoint {entrypoint_name:?}"),
        )));
    }
    make_executable(&staged_entrypoint)?;

    let staging = staging.into_path();
    match std::fs::rename(&staging, dest) {
        Ok(()) => (),
        // A concurrent resolve won the rename; its install is equivalent.
        Err(_) if dest.exists() => {
            let _ = std::fs::remove_dir_all(&staging);
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(Error::Install(err));
        }
    }
    Ok(dest.join(entrypoint_name))
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), Error> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|err| Error::Install(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
    archive
        .extract(dest)
        .map_err(|err| Error::Install(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<(), Error> {
    tar::Archive::new(reader).unpack(dest).map_err(Error::Install)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path).map_err(Error::Install)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(path, permissions).map_err(Error::Install)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}
