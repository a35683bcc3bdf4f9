// src/build/toolchain.rs

//! Toolchain collaborator
//!
//! The variant builder never runs a compiler itself. It hands a
//! [`BuildRequest`] to a [`Toolchain`], which turns the filtered source into
//! binaries or reports a build error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::variant::{BuildType, VariantId};

/// Everything the toolchain needs for one variant build
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    /// Variant being built (for error attribution)
    pub variant: VariantId,
    /// Filtered source tree
    pub source_dir: &'a Path,
    /// Output directory for intermediate build products
    pub target_dir: PathBuf,
    pub build_type: BuildType,
    /// Binary names to produce, in configured order
    pub binaries: Vec<String>,
    /// Complete build environment (toolchain paths, dependency paths, flags)
    pub env: BTreeMap<String, String>,
    /// Also run the toolchain's check step
    pub check: bool,
    /// Parallel jobs available to this build
    pub jobs: usize,
}

impl BuildRequest<'_> {
    /// Where the toolchain leaves a produced binary
    pub fn output_path(&self, binary: &str) -> PathBuf {
        self.target_dir
            .join(self.build_type.profile_dir())
            .join(binary)
    }
}

/// Compiles a filtered source tree
pub trait Toolchain: Send + Sync {
    /// Build the requested binaries and return their paths, in request order
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<PathBuf>>;
}

/// Cargo-driven toolchain
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo: PathBuf,
    /// Pass `--locked` so builds never rewrite the lockfile
    locked: bool,
}

impl CargoToolchain {
    /// Locate `cargo` on `PATH`
    pub fn detect() -> Result<Self> {
        let cargo = which::which("cargo")
            .map_err(|_| Error::config("cargo not found in PATH"))?;
        Ok(Self::new(cargo))
    }

    pub fn new(cargo: impl Into<PathBuf>) -> Self {
        Self {
            cargo: cargo.into(),
            locked: true,
        }
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn cargo(&self) -> &Path {
        &self.cargo
    }

    /// Arguments shared by the build and check steps
    fn common_args(&self, request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = Vec::new();
        if request.build_type.is_optimized() {
            args.push("--release".to_string());
        }
        if self.locked {
            args.push("--locked".to_string());
        }
        args.push("--jobs".to_string());
        args.push(request.jobs.max(1).to_string());
        args.push("--target-dir".to_string());
        args.push(request.target_dir.display().to_string());
        for bin in &request.binaries {
            args.push("--bin".to_string());
            args.push(bin.clone());
        }
        args
    }

    /// Full argument list for `cargo build`
    pub fn build_args(&self, request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        args.extend(self.common_args(request));
        args
    }

    /// Full argument list for `cargo test`
    pub fn check_args(&self, request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec!["test".to_string()];
        args.extend(self.common_args(request));
        args
    }

    fn run(&self, phase: &str, args: &[String], request: &BuildRequest<'_>) -> Result<()> {
        info!("Running {} for variant {}", phase, request.variant);
        debug!("Command: {} {}", self.cargo.display(), args.join(" "));

        let output = Command::new(&self.cargo)
            .args(args)
            .current_dir(request.source_dir)
            .envs(request.env.iter())
            .output()
            .map_err(|e| Error::build(request.variant, format!("Failed to run cargo {}: {}", phase, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::build(
                request.variant,
                format!(
                    "cargo {} failed with exit code {:?}\nstderr: {}",
                    phase,
                    output.status.code(),
                    stderr.trim_end()
                ),
            ));
        }

        Ok(())
    }
}

impl Toolchain for CargoToolchain {
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<PathBuf>> {
        self.run("build", &self.build_args(request), request)?;

        if request.check {
            self.run("test", &self.check_args(request), request)?;
        }

        request
            .binaries
            .iter()
            .map(|bin| {
                let path = request.output_path(bin);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::build(
                        request.variant,
                        format!("expected binary not produced: {}", path.display()),
                    ))
                }
            })
            .collect()
    }
}
