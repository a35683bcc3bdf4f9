// src/commands/mod.rs
//! Command handlers for the varimage CLI

mod pipeline;
mod plan;
mod select;

pub use pipeline::{cmd_build, cmd_image, cmd_run};
pub use plan::cmd_plan;
pub use select::cmd_select;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use varimage::{
    BuildContext, GitVersion, Project, ProjectConfig, StaticVersion, VariantId, VersionSource,
    load_config,
};

use crate::cli::VariantArgs;

/// Loaded project plus the resolved repository root
pub struct Session {
    pub config: ProjectConfig,
    pub project: Project,
}

impl Session {
    pub fn open(config: Option<&Path>, repo: &Path) -> Result<Self> {
        let repo_root: PathBuf = repo
            .canonicalize()
            .with_context(|| format!("Repository root not found: {}", repo.display()))?;
        let config = load_config(config, &repo_root).context("Failed to load project file")?;
        let project = config
            .project(&repo_root)
            .context("Invalid project configuration")?;
        debug!("Project {} at {}", project.name, repo_root.display());
        Ok(Self { config, project })
    }

    /// Build context for this invocation: version, toolchain env, job count
    pub fn context(&self, args: &VariantArgs) -> Result<BuildContext> {
        let version = match &args.tag {
            Some(tag) => StaticVersion(tag.clone()).version(&self.project.repo_root)?,
            None => GitVersion
                .version(&self.project.repo_root)
                .context("Cannot derive a version from git; pass --tag")?,
        };

        let mut toolchain = self.config.toolchain.clone();
        if let Some(jobs) = args.jobs {
            toolchain.jobs = Some(jobs);
        }
        Ok(BuildContext::resolve(version, &toolchain))
    }
}

/// Parse `--variant` values; no values means every variant
pub fn parse_variants(names: &[String]) -> Result<Vec<VariantId>> {
    if names.is_empty() {
        return Ok(VariantId::all().to_vec());
    }
    let mut variants = names
        .iter()
        .map(|n| n.parse::<VariantId>().map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;
    variants.sort();
    variants.dedup();
    Ok(variants)
}
