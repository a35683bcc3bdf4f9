// src/fixup.rs

//! Artifact fixup
//!
//! Binaries leave the toolchain pointing at the build host's dynamic linker
//! and library layout. Before they go into a minimal image, the interpreter
//! is rewritten to the toolchain-provided dynamic linker and the run path is
//! set to the directory holding the native dependency's shared objects.

use goblin::elf::header::{ET_DYN, ET_EXEC};
use goblin::Object;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::build::Artifact;
use crate::error::{Error, Result};

/// What fixup found in a binary before patching it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    /// Current `PT_INTERP`, absent for static binaries
    pub interpreter: Option<String>,
    /// `DT_NEEDED` entries
    pub needed: Vec<String>,
    /// Existing `DT_RUNPATH`/`DT_RPATH` entries
    pub runpaths: Vec<String>,
}

impl ElfInfo {
    pub fn is_dynamic(&self) -> bool {
        self.interpreter.is_some()
    }
}

/// Inspect a binary, rejecting anything that is not an ELF executable or
/// shared object
pub fn inspect(path: &Path) -> Result<ElfInfo> {
    if !path.is_file() {
        return Err(Error::fixup(path, "binary not found"));
    }

    let bytes = fs::read(path)?;
    let elf = match Object::parse(&bytes) {
        Ok(Object::Elf(elf)) => elf,
        Ok(_) => return Err(Error::fixup(path, "not an ELF binary")),
        Err(e) => return Err(Error::fixup(path, format!("unrecognized format: {}", e))),
    };

    if !matches!(elf.header.e_type, ET_EXEC | ET_DYN) {
        return Err(Error::fixup(
            path,
            format!("ELF type {} is not an executable", elf.header.e_type),
        ));
    }

    let mut runpaths: Vec<String> = elf.runpaths.iter().map(|s| s.to_string()).collect();
    runpaths.extend(elf.rpaths.iter().map(|s| s.to_string()));

    Ok(ElfInfo {
        interpreter: elf.interpreter.map(str::to_string),
        needed: elf.libraries.iter().map(|s| s.to_string()).collect(),
        runpaths,
    })
}

/// Rewrites ELF metadata in place
pub trait BinaryPatcher: Send + Sync {
    fn set_interpreter(&self, binary: &Path, interpreter: &Path) -> Result<()>;
    fn set_rpath(&self, binary: &Path, rpath: &Path) -> Result<()>;
}

/// Patcher backed by the `patchelf` tool
#[derive(Debug, Clone)]
pub struct Patchelf {
    path: PathBuf,
}

impl Patchelf {
    /// Locate `patchelf` on `PATH`
    pub fn detect() -> Result<Self> {
        let path = which::which("patchelf")
            .map_err(|_| Error::config("patchelf not found in PATH"))?;
        Ok(Self { path })
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn run(&self, binary: &Path, flag: &str, value: &Path) -> Result<()> {
        debug!("patchelf {} {} {}", flag, value.display(), binary.display());
        let output = Command::new(&self.path)
            .arg(flag)
            .arg(value)
            .arg(binary)
            .output()
            .map_err(|e| Error::fixup(binary, format!("failed to run patchelf: {}", e)))?;

        if !output.status.success() {
            return Err(Error::fixup(
                binary,
                format!(
                    "patchelf {} failed: {}",
                    flag,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                ),
            ));
        }
        Ok(())
    }
}

impl BinaryPatcher for Patchelf {
    fn set_interpreter(&self, binary: &Path, interpreter: &Path) -> Result<()> {
        self.run(binary, "--set-interpreter", interpreter)
    }

    fn set_rpath(&self, binary: &Path, rpath: &Path) -> Result<()> {
        self.run(binary, "--set-rpath", rpath)
    }
}

/// Applies interpreter and run path fixes to artifacts
pub struct Fixup<'a> {
    patcher: &'a dyn BinaryPatcher,
    interpreter: PathBuf,
}

impl<'a> Fixup<'a> {
    pub fn new(patcher: &'a dyn BinaryPatcher, interpreter: impl Into<PathBuf>) -> Self {
        Self {
            patcher,
            interpreter: interpreter.into(),
        }
    }

    /// Fix up one artifact; static binaries keep their (absent) interpreter
    pub fn fixup(&self, artifact: Artifact, lib_dir: &Path) -> Result<Artifact> {
        let info = inspect(&artifact.binary)?;

        if info.is_dynamic() {
            self.patcher
                .set_interpreter(&artifact.binary, &self.interpreter)?;
        } else {
            debug!(
                "{} is statically linked, leaving interpreter unset",
                artifact.binary.display()
            );
        }
        self.patcher.set_rpath(&artifact.binary, lib_dir)?;

        info!(
            "Fixed up {} ({}): rpath {}",
            artifact.name,
            artifact.variant,
            lib_dir.display()
        );
        Ok(artifact)
    }
}
