// tests/common/mod.rs

//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;
use varimage::{
    BinaryPatcher, BuildContext, BuildRequest, Error, Project, ProjectConfig, Result, Toolchain,
    VariantId, Version,
};

/// Create a small monorepo with the storage-engine layout, a dependency
/// store and a busybox tool tree.
///
/// Returns (TempDir, project) - keep the TempDir alive to prevent cleanup.
pub fn setup_engine_repo() -> (TempDir, Project) {
    let temp_dir = tempfile::tempdir().unwrap();
    let repo = temp_dir.path().to_path_buf();

    write(&repo, "Cargo.toml", "[workspace]\nmembers = [\"mayastor\", \"csi\"]\n");
    write(&repo, "Cargo.lock", "# lock\n");
    write(&repo, "mayastor/src/main.rs", "fn main() {}\n");
    write(&repo, "csi/src/main.rs", "fn main() {}\n");
    write(&repo, "cli/src/main.rs", "fn main() {}\n");
    write(&repo, "cside/notes.txt", "picked up by the naive prefix\n");
    write(&repo, "docs/README.md", "not part of the build\n");

    for package in ["libspdk", "libspdk-dev"] {
        fs::create_dir_all(repo.join("deps").join(package).join("lib")).unwrap();
    }
    write(&repo, "deps/busybox/bin/busybox", "busybox");
    std::os::unix::fs::symlink("busybox", repo.join("deps/busybox/bin/sh")).unwrap();

    let project = ProjectConfig::storage_engine().project(&repo).unwrap();
    (temp_dir, project)
}

pub fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

pub fn context(version: &str) -> BuildContext {
    BuildContext::new(Version::new(version).unwrap())
        .with_dynamic_linker("/toolchain/lib/ld-linux-x86-64.so.2")
        .with_jobs(2)
}

/// Toolchain that "compiles" by copying the running test binary, which is
/// a real ELF executable
#[derive(Default)]
pub struct FakeToolchain {
    /// Variants whose build fails
    pub failing: Vec<VariantId>,
    /// (variant, binary) pairs produced as shell scripts instead of ELF
    pub not_elf: Vec<(VariantId, String)>,
    pub requests: Mutex<Vec<(VariantId, Option<String>)>>,
    /// Compile jobs handed to each build
    pub jobs: Mutex<Vec<usize>>,
}

impl FakeToolchain {
    pub fn failing(variant: VariantId) -> Self {
        Self {
            failing: vec![variant],
            ..Self::default()
        }
    }

    pub fn with_script(variant: VariantId, binary: &str) -> Self {
        Self {
            not_elf: vec![(variant, binary.to_string())],
            ..Self::default()
        }
    }
}

impl Toolchain for FakeToolchain {
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<PathBuf>> {
        self.requests
            .lock()
            .unwrap()
            .push((request.variant, request.env.get("SPDK_PATH").cloned()));
        self.jobs.lock().unwrap().push(request.jobs);

        if !request.source_dir.join("Cargo.toml").is_file() {
            return Err(Error::build(request.variant, "no Cargo.toml in source"));
        }
        if self.failing.contains(&request.variant) {
            return Err(Error::build(request.variant, "linker exited with status 1"));
        }

        let exe = std::env::current_exe()?;
        request
            .binaries
            .iter()
            .map(|bin| {
                let path = request.output_path(bin);
                fs::create_dir_all(path.parent().unwrap())?;
                if self.not_elf.contains(&(request.variant, bin.clone())) {
                    fs::write(&path, "#!/bin/sh\nexit 0\n")?;
                } else {
                    fs::copy(&exe, &path)?;
                }
                Ok(path)
            })
            .collect()
    }
}

/// Patcher that records calls instead of rewriting binaries
#[derive(Default)]
pub struct RecordingPatcher {
    pub calls: Mutex<Vec<(PathBuf, String, PathBuf)>>,
}

impl RecordingPatcher {
    pub fn rpaths(&self) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, op, _)| op == "rpath")
            .map(|(_, _, value)| value.clone())
            .collect()
    }
}

impl BinaryPatcher for RecordingPatcher {
    fn set_interpreter(&self, binary: &Path, interpreter: &Path) -> Result<()> {
        self.calls.lock().unwrap().push((
            binary.to_path_buf(),
            "interpreter".to_string(),
            interpreter.to_path_buf(),
        ));
        Ok(())
    }

    fn set_rpath(&self, binary: &Path, rpath: &Path) -> Result<()> {
        self.calls.lock().unwrap().push((
            binary.to_path_buf(),
            "rpath".to_string(),
            rpath.to_path_buf(),
        ));
        Ok(())
    }
}
