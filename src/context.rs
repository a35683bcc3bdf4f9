// src/context.rs

//! Per-invocation build context
//!
//! Everything shared by parallel variant and image pipelines lives in one
//! immutable [`BuildContext`] value that is passed to each stage: the
//! version tag, the toolchain environment and the dynamic linker used for
//! fixup. It is computed once before any build starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Longest image tag accepted by registries
const MAX_TAG_LEN: usize = 128;

/// Version shared by every artifact and image of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Result<Self> {
        let version = version.into().trim().to_string();
        if version.is_empty() {
            return Err(Error::config("Version string is empty"));
        }
        // Image tags: [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}
        let leading_ok = version
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if !leading_ok
            || version.len() > MAX_TAG_LEN
            || !version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(Error::config(format!(
                "Version is not a valid image tag: {}",
                version
            )));
        }
        Ok(Self(version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the version string for a repository
pub trait VersionSource: Send + Sync {
    fn version(&self, repo_root: &Path) -> Result<Version>;
}

/// Fixed version, for CI overrides and tests
#[derive(Debug, Clone)]
pub struct StaticVersion(pub String);

impl VersionSource for StaticVersion {
    fn version(&self, _repo_root: &Path) -> Result<Version> {
        Version::new(self.0.clone())
    }
}

/// Version from git: exact tag if HEAD is tagged, short commit hash otherwise
#[derive(Debug, Clone, Default)]
pub struct GitVersion;

impl GitVersion {
    fn git(repo_root: &Path, args: &[&str]) -> Option<String> {
        Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(args)
            .output()
            .ok()
            .and_then(|o| {
                if o.status.success() {
                    String::from_utf8(o.stdout)
                        .ok()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                } else {
                    None
                }
            })
    }
}

impl VersionSource for GitVersion {
    fn version(&self, repo_root: &Path) -> Result<Version> {
        if let Some(tag) = Self::git(repo_root, &["describe", "--tags", "--exact-match"]) {
            debug!("HEAD is tagged: {}", tag);
            return Version::new(tag);
        }

        let commit = Self::git(repo_root, &["rev-parse", "--short=12", "HEAD"]).ok_or_else(|| {
            Error::Command(format!(
                "Could not read git metadata from {}",
                repo_root.display()
            ))
        })?;
        Version::new(commit)
    }
}

/// Toolchain locations shared by every variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directory containing libclang (C compatibility layer for bindgen)
    pub libclang_path: Option<PathBuf>,
    /// Protocol buffer compiler
    pub protoc: Option<PathBuf>,
    /// Well-known protobuf includes
    pub protoc_include: Option<PathBuf>,
    /// Dynamic linker written into fixed-up binaries
    pub dynamic_linker: Option<PathBuf>,
    /// Parallel build slots (default: available parallelism)
    pub jobs: Option<usize>,
}

/// Immutable values shared by every stage of one invocation
#[derive(Debug, Clone)]
pub struct BuildContext {
    version: Version,
    env: BTreeMap<String, String>,
    dynamic_linker: PathBuf,
    jobs: usize,
}

impl BuildContext {
    /// Create a context with no toolchain environment
    pub fn new(version: Version) -> Self {
        Self {
            version,
            env: BTreeMap::new(),
            dynamic_linker: default_dynamic_linker(),
            jobs: num_cpus(),
        }
    }

    /// Resolve toolchain locations once for the whole invocation
    ///
    /// Explicit config wins, then the process environment, then `PATH`
    /// lookup for `protoc`.
    pub fn resolve(version: Version, toolchain: &ToolchainConfig) -> Self {
        let mut env = BTreeMap::new();

        let libclang = toolchain
            .libclang_path
            .clone()
            .or_else(|| std::env::var_os("LIBCLANG_PATH").map(PathBuf::from));
        if let Some(path) = libclang {
            env.insert("LIBCLANG_PATH".to_string(), path.display().to_string());
        }

        let protoc = toolchain
            .protoc
            .clone()
            .or_else(|| std::env::var_os("PROTOC").map(PathBuf::from))
            .or_else(|| which::which("protoc").ok());
        if let Some(path) = protoc {
            env.insert("PROTOC".to_string(), path.display().to_string());
        }

        let protoc_include = toolchain
            .protoc_include
            .clone()
            .or_else(|| std::env::var_os("PROTOC_INCLUDE").map(PathBuf::from));
        if let Some(path) = protoc_include {
            env.insert("PROTOC_INCLUDE".to_string(), path.display().to_string());
        }

        let dynamic_linker = toolchain
            .dynamic_linker
            .clone()
            .or_else(nix_cc_dynamic_linker)
            .unwrap_or_else(default_dynamic_linker);

        let ctx = Self {
            version,
            env,
            dynamic_linker,
            jobs: toolchain.jobs.filter(|j| *j > 0).unwrap_or_else(num_cpus),
        };

        info!(
            "Build context: version {}, {} jobs, interpreter {}",
            ctx.version,
            ctx.jobs,
            ctx.dynamic_linker.display()
        );
        ctx
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_dynamic_linker(mut self, path: impl Into<PathBuf>) -> Self {
        self.dynamic_linker = path.into();
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Toolchain environment passed to every build
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn dynamic_linker(&self) -> &Path {
        &self.dynamic_linker
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }
}

/// Dynamic linker advertised by a Nix C compiler wrapper, if any
fn nix_cc_dynamic_linker() -> Option<PathBuf> {
    let nix_cc = std::env::var_os("NIX_CC")?;
    let marker = Path::new(&nix_cc).join("nix-support/dynamic-linker");
    std::fs::read_to_string(marker)
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

fn default_dynamic_linker() -> PathBuf {
    match std::env::consts::ARCH {
        "aarch64" => PathBuf::from("/lib/ld-linux-aarch64.so.1"),
        "riscv64" => PathBuf::from("/lib/ld-linux-riscv64-lp64d.so.1"),
        _ => PathBuf::from("/lib64/ld-linux-x86-64.so.2"),
    }
}

/// Get number of CPUs for parallel builds
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
