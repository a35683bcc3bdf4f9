// src/build/mod.rs

//! Variant builds
//!
//! The [`VariantBuilder`] turns a filtered source tree and an effective
//! [`VariantSpec`] into one [`Artifact`] per configured binary:
//!
//! 1. Resolve every active dependency package to an install prefix
//! 2. Assemble the build environment (shared toolchain paths, dependency
//!    paths, `RUSTFLAGS`)
//! 3. Hand the request to the [`Toolchain`]
//! 4. Copy produced binaries to `<output>/<variant>/bin/<name>`
//!
//! Each variant writes only below its own output directory, so several
//! variants can build concurrently from the same source tree.
//!
//! Which binaries a variant directory holds, and for which version, is
//! recorded in `<output>/<variant>/artifacts.json`. The record is removed
//! when a build starts and rewritten once the variant's artifacts are
//! final, so a failed rebuild never leaves older binaries looking current.

mod toolchain;

pub use toolchain::{BuildRequest, CargoToolchain, Toolchain};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::context::{BuildContext, Version};
use crate::error::{Error, Result};
use crate::variant::{VariantId, VariantSpec};

/// One compiled program of the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub name: String,
    /// Install path inside images (default: `/bin/<name>`)
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl BuildTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entrypoint: None,
        }
    }

    pub fn with_entrypoint(mut self, path: impl Into<String>) -> Self {
        self.entrypoint = Some(path.into());
        self
    }

    /// Absolute install path inside an image
    pub fn install_path(&self) -> String {
        match &self.entrypoint {
            Some(path) => path.clone(),
            None => format!("/bin/{}", self.name),
        }
    }
}

/// A produced binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Binary name as configured
    pub name: String,
    /// Location of the binary owned by this pipeline run
    pub binary: PathBuf,
    pub variant: VariantId,
    pub version: Version,
}

/// Per-variant record of finished artifacts
pub const MANIFEST_FILE: &str = "artifacts.json";

/// Location of a variant's artifact record below the output directory
pub fn manifest_path(output_dir: &Path, variant: VariantId) -> PathBuf {
    output_dir.join(variant.as_str()).join(MANIFEST_FILE)
}

/// Record the finished artifacts of one variant
pub fn write_manifest(path: &Path, artifacts: &[Artifact]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(artifacts)?)?;
    debug!("Recorded {} artifacts in {}", artifacts.len(), path.display());
    Ok(())
}

/// Load a variant's artifact record
pub fn read_manifest(path: &Path) -> Result<Vec<Artifact>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::config(format!(
                "No finished build recorded at {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&content)?)
}

/// Resolves dependency packages to install prefixes
pub trait DependencyStore: Send + Sync {
    /// Install prefix of a package (containing `lib/`, `include/`, ...)
    fn locate(&self, package: &str) -> Result<PathBuf>;
}

/// Packages laid out as subdirectories of one root
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    /// Explicit package -> prefix mappings that bypass the root layout
    pinned: BTreeMap<String, PathBuf>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pinned: BTreeMap::new(),
        }
    }

    pub fn with_package(mut self, package: impl Into<String>, prefix: impl Into<PathBuf>) -> Self {
        self.pinned.insert(package.into(), prefix.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DependencyStore for DirectoryStore {
    fn locate(&self, package: &str) -> Result<PathBuf> {
        let prefix = match self.pinned.get(package) {
            Some(prefix) => prefix.clone(),
            None => self.root.join(package),
        };
        if prefix.is_dir() {
            Ok(prefix)
        } else {
            Err(Error::config(format!(
                "Dependency package {} not found at {}",
                package,
                prefix.display()
            )))
        }
    }
}

/// Environment variable naming a dependency prefix: `spdk` -> `SPDK_PATH`
pub fn dependency_env_var(dependency: &str) -> String {
    let mut name: String = dependency
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_PATH");
    name
}

/// Builds variants of one project
pub struct VariantBuilder<'a> {
    toolchain: &'a dyn Toolchain,
    store: &'a dyn DependencyStore,
    targets: &'a [BuildTarget],
    output_dir: PathBuf,
    jobs: Option<usize>,
}

impl<'a> VariantBuilder<'a> {
    pub fn new(
        toolchain: &'a dyn Toolchain,
        store: &'a dyn DependencyStore,
        targets: &'a [BuildTarget],
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            toolchain,
            store,
            targets,
            output_dir: output_dir.into(),
            jobs: None,
        }
    }

    /// Compile jobs handed to each toolchain call (default: the context's)
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs.max(1));
        self
    }

    /// Output directory for one variant
    pub fn variant_dir(&self, variant: VariantId) -> PathBuf {
        self.output_dir.join(variant.as_str())
    }

    /// Install prefixes of the variant's active dependencies
    pub fn resolve_dependencies(&self, variant: &VariantSpec) -> Result<BTreeMap<String, PathBuf>> {
        variant
            .dependencies
            .iter()
            .map(|(name, package)| {
                let prefix = self.store.locate(package).map_err(|e| {
                    Error::build(variant.id, format!("dependency {}: {}", name, e))
                })?;
                Ok((name.clone(), prefix))
            })
            .collect()
    }

    /// Build environment for a variant
    ///
    /// Shared toolchain variables come first; dependency paths and
    /// `RUSTFLAGS` are layered on top.
    pub fn build_env(
        &self,
        variant: &VariantSpec,
        prefixes: &BTreeMap<String, PathBuf>,
        ctx: &BuildContext,
    ) -> BTreeMap<String, String> {
        let mut env = ctx.env().clone();
        let mut rustflags: Vec<String> = Vec::new();

        for (name, prefix) in prefixes {
            env.insert(dependency_env_var(name), prefix.display().to_string());
            rustflags.push(format!("-L native={}", prefix.join("lib").display()));
        }
        rustflags.extend(variant.flags.iter().cloned());

        if !rustflags.is_empty() {
            env.insert("RUSTFLAGS".to_string(), rustflags.join(" "));
        }
        env.insert("VARIMAGE_VERSION".to_string(), ctx.version().to_string());
        env.insert("VARIMAGE_VARIANT".to_string(), variant.id.to_string());
        env
    }

    /// Build one variant from a materialized source tree
    pub fn build(&self, source_dir: &Path, variant: &VariantSpec, ctx: &BuildContext) -> Result<Vec<Artifact>> {
        if self.targets.is_empty() {
            return Err(Error::config("No build targets configured"));
        }

        info!(
            "Building variant {} ({} binaries, {})",
            variant.id,
            self.targets.len(),
            variant.build_type.profile_dir()
        );

        let manifest = manifest_path(&self.output_dir, variant.id);
        if manifest.exists() {
            fs::remove_file(&manifest)?;
        }

        let prefixes = self.resolve_dependencies(variant)?;
        let env = self.build_env(variant, &prefixes, ctx);

        let variant_dir = self.variant_dir(variant.id);
        let bin_dir = variant_dir.join("bin");
        fs::create_dir_all(&bin_dir)?;

        let request = BuildRequest {
            variant: variant.id,
            source_dir,
            target_dir: variant_dir.join("target"),
            build_type: variant.build_type,
            binaries: self.targets.iter().map(|t| t.name.clone()).collect(),
            env,
            check: variant.check,
            jobs: self.jobs.unwrap_or_else(|| ctx.jobs()),
        };

        let produced = self.toolchain.build(&request)?;
        if produced.len() != self.targets.len() {
            return Err(Error::build(
                variant.id,
                format!(
                    "toolchain produced {} binaries, expected {}",
                    produced.len(),
                    self.targets.len()
                ),
            ));
        }

        let mut artifacts = Vec::with_capacity(produced.len());
        for (target, path) in self.targets.iter().zip(produced) {
            let dest = bin_dir.join(&target.name);
            fs::copy(&path, &dest).map_err(|e| {
                Error::build(
                    variant.id,
                    format!("failed to collect {}: {}", path.display(), e),
                )
            })?;
            debug!("Collected {} -> {}", path.display(), dest.display());

            artifacts.push(Artifact {
                name: target.name.clone(),
                binary: dest,
                variant: variant.id,
                version: ctx.version().clone(),
            });
        }

        info!("Variant {} produced {} artifacts", variant.id, artifacts.len());
        Ok(artifacts)
    }
}
