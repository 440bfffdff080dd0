//! Host platform detection and manifest artifact matching.

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Macos,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Os {
    pub fn name(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Macos => "macos",
            Os::Windows => "windows",
        }
    }

    /// Whether a manifest's loosely-spelled OS name ("Linux", "Mac OS X",
    /// "Windows 10", a "Mac.*" pattern) denotes this family.
    pub fn matches(&self, manifest_name: &str) -> bool {
        let name = manifest_name.to_ascii_lowercase();
        let name = name.trim_end_matches(".*");
        match self {
            Os::Linux => name.starts_with("linux"),
            Os::Macos => name.starts_with("mac") || name.starts_with("darwin"),
            Os::Windows => name.starts_with("windows"),
        }
    }
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    pub fn matches(&self, manifest_arch: &str) -> bool {
        let arch = manifest_arch.to_ascii_lowercase();
        match self {
            Arch::X86_64 => arch == "x86_64" || arch == "amd64",
            Arch::Aarch64 => arch == "aarch64" || arch == "arm64",
        }
    }
}

impl Platform {
    pub fn current() -> Result<Platform, Error> {
        let os = match std::env::consts::OS {
            "linux" => Os::Linux,
            "macos" => Os::Macos,
            "windows" => Os::Windows,
            other => {
                return Err(Error::PlatformUnsupported {
                    os: other.to_string(),
                    arch: std::env::consts::ARCH.to_string(),
                })
            }
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            other => {
                return Err(Error::PlatformUnsupported {
                    os: std::env::consts::OS.to_string(),
                    arch: other.to_string(),
                })
            }
        };
        Ok(Platform { os, arch })
    }

    /// Platforms to try in order. Apple silicon hosts fall back to x86_64
    /// artifacts, which run under Rosetta.
    pub fn candidates(&self) -> Vec<Platform> {
        let mut candidates = vec![*self];
        if self.os == Os::Macos && self.arch == Arch::Aarch64 {
            candidates.push(Platform {
                os: Os::Macos,
                arch: Arch::X86_64,
            });
        }
        candidates
    }
}
