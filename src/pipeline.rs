// src/pipeline.rs

//! Whole-matrix orchestration
//!
//! [`Pipeline::run`] drives every stage for a set of variants:
//!
//! 1. Select the source tree once and materialize it under the output dir
//! 2. Build and fix up each variant in parallel
//! 3. Compose, layer and export each image in parallel
//!
//! A failure in one variant, artifact or image is recorded in the
//! [`PipelineReport`] and never stops unrelated work. Only problems that
//! affect everything (bad whitelist, unreadable repository) abort the run.

use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::build::{
    Artifact, DependencyStore, Toolchain, VariantBuilder, manifest_path, read_manifest,
    write_manifest,
};
use crate::config::Project;
use crate::context::{BuildContext, Version};
use crate::error::{Error, Result};
use crate::fixup::{BinaryPatcher, Fixup};
use crate::image::{ExportSummary, ImageDefinition, compose, export_oci};
use crate::source::{self, FilteredTree};
use crate::variant::{VariantId, VariantSpec};

/// Stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Build,
    Fixup,
    Image,
}

/// One failed unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Variant, artifact or image reference
    pub subject: String,
    pub stage: Stage,
    pub message: String,
}

impl Failure {
    fn new(subject: impl Into<String>, stage: Stage, error: &Error) -> Self {
        Self {
            subject: subject.into(),
            stage,
            message: error.to_string(),
        }
    }
}

/// A produced image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageOutcome {
    pub reference: String,
    pub variant: VariantId,
    pub layers: usize,
    /// Bytes of file content before compression
    pub content_size: u64,
    /// Written archive, when export is enabled
    pub archive: Option<ExportSummary>,
}

/// Everything one run produced or failed to produce
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub version: Version,
    pub artifacts: Vec<Artifact>,
    pub images: Vec<ImageOutcome>,
    pub failures: Vec<Failure>,
}

impl PipelineReport {
    fn new(version: Version) -> Self {
        Self {
            version,
            artifacts: Vec::new(),
            images: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Artifacts of one variant
    pub fn artifacts_for(&self, variant: VariantId) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.variant == variant)
    }
}

/// Result of one variant's build and fixup chain
struct VariantOutcome {
    artifacts: Vec<Artifact>,
    failures: Vec<Failure>,
}

/// Drives selection, builds and image assembly for one project
pub struct Pipeline<'a> {
    project: &'a Project,
    toolchain: &'a dyn Toolchain,
    patcher: &'a dyn BinaryPatcher,
    export: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        project: &'a Project,
        toolchain: &'a dyn Toolchain,
        patcher: &'a dyn BinaryPatcher,
    ) -> Self {
        Self {
            project,
            toolchain,
            patcher,
            export: true,
        }
    }

    /// Write OCI archives for composed images (default: on)
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    pub fn source_dir(&self) -> PathBuf {
        self.project.output_dir.join("source")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.project.output_dir.join("images")
    }

    /// Select the whitelisted source tree
    pub fn select(&self) -> Result<FilteredTree> {
        source::select(&self.project.repo_root, &self.project.whitelist)
    }

    /// Select and copy the source into a fresh build directory
    pub fn prepare_source(&self) -> Result<PathBuf> {
        let tree = self.select()?;
        if tree.is_empty() {
            return Err(Error::config(format!(
                "Whitelist selected no files from {}",
                self.project.repo_root.display()
            )));
        }

        let dest = self.source_dir();
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        tree.materialize(&dest)
    }

    /// Images to produce for the requested variants, in config order
    pub fn image_jobs(&self, variants: &[VariantId]) -> Vec<(&'a ImageDefinition, VariantId)> {
        let mut variants = variants.to_vec();
        variants.sort();
        variants.dedup();

        self.project
            .images
            .iter()
            .flat_map(|def| {
                variants
                    .iter()
                    .filter(|v| def.packages(**v))
                    .map(move |v| (def, *v))
            })
            .collect()
    }

    /// Build and fix up the requested variants
    pub fn build(&self, ctx: &BuildContext, variants: &[VariantId]) -> Result<PipelineReport> {
        let source_dir = self.prepare_source()?;
        let specs = self.project.matrix.specs(variants);
        let mut report = PipelineReport::new(ctx.version().clone());

        // Variants build concurrently, so each toolchain call gets a share
        let jobs_per_variant = (ctx.jobs() / specs.len().max(1)).max(1);
        let builder = VariantBuilder::new(
            self.toolchain,
            &self.project.store,
            &self.project.targets,
            &self.project.output_dir,
        )
        .with_jobs(jobs_per_variant);

        info!(
            "Building {} variants of {} with {} jobs ({} per variant)",
            specs.len(),
            self.project.name,
            ctx.jobs(),
            jobs_per_variant
        );

        let outcomes: Vec<VariantOutcome> = worker_pool(ctx)?.install(|| {
            specs
                .par_iter()
                .map(|spec| self.run_variant(&builder, &source_dir, spec, ctx))
                .collect()
        });

        for outcome in outcomes {
            report.artifacts.extend(outcome.artifacts);
            report.failures.extend(outcome.failures);
        }
        Ok(report)
    }

    /// Compose, layer and export images from already built artifacts
    pub fn images(
        &self,
        ctx: &BuildContext,
        variants: &[VariantId],
        report: &mut PipelineReport,
    ) -> Result<()> {
        let jobs = self.image_jobs(variants);
        if jobs.is_empty() {
            debug!("No images configured for {:?}", variants);
            return Ok(());
        }
        if self.export {
            fs::create_dir_all(self.images_dir())?;
        }

        let artifacts = &report.artifacts;
        let results: Vec<std::result::Result<ImageOutcome, Failure>> =
            worker_pool(ctx)?.install(|| {
                jobs.par_iter()
                    .map(|(def, variant)| {
                        let name = format!("{}:{}", def.image_name(*variant), ctx.version());
                        self.run_image(def, *variant, artifacts, ctx)
                            .map_err(|e| Failure::new(name, Stage::Image, &e))
                    })
                    .collect()
            });

        for result in results {
            match result {
                Ok(image) => report.images.push(image),
                Err(failure) => {
                    warn!("{}: {}", failure.subject, failure.message);
                    report.failures.push(failure);
                }
            }
        }
        Ok(())
    }

    /// Build, fix up and package the requested variants
    pub fn run(&self, ctx: &BuildContext, variants: &[VariantId]) -> Result<PipelineReport> {
        let mut report = self.build(ctx, variants)?;
        self.images(ctx, variants, &mut report)?;

        info!(
            "Pipeline finished: {} artifacts, {} images, {} failures",
            report.artifacts.len(),
            report.images.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Artifacts recorded by an earlier build of the same version
    ///
    /// Variants without a finished build record, and artifacts built for
    /// another version or since removed, are reported as image failures.
    pub fn existing_artifacts(&self, ctx: &BuildContext, variants: &[VariantId]) -> PipelineReport {
        let mut report = PipelineReport::new(ctx.version().clone());
        let mut variants = variants.to_vec();
        variants.sort();
        variants.dedup();

        for variant in variants {
            let recorded = match read_manifest(&manifest_path(&self.project.output_dir, variant)) {
                Ok(recorded) => recorded,
                Err(e) => {
                    warn!("Variant {}: {}", variant, e);
                    report
                        .failures
                        .push(Failure::new(variant.as_str(), Stage::Image, &e));
                    continue;
                }
            };

            for artifact in recorded {
                let subject = format!("{} ({})", artifact.name, variant);
                let problem = if artifact.variant != variant {
                    Some(format!("recorded for variant {}", artifact.variant))
                } else if artifact.version != *ctx.version() {
                    Some(format!(
                        "built as version {}, requested {}",
                        artifact.version,
                        ctx.version()
                    ))
                } else if !artifact.binary.is_file() {
                    Some(format!("binary missing at {}", artifact.binary.display()))
                } else {
                    None
                };

                match problem {
                    Some(problem) => {
                        let e = Error::config(format!("Stale artifact {}: {}", artifact.name, problem));
                        warn!("{}: {}", subject, e);
                        report.failures.push(Failure::new(subject, Stage::Image, &e));
                    }
                    None => report.artifacts.push(artifact),
                }
            }
        }
        report
    }

    fn run_variant(
        &self,
        builder: &VariantBuilder<'_>,
        source_dir: &Path,
        spec: &VariantSpec,
        ctx: &BuildContext,
    ) -> VariantOutcome {
        let mut outcome = VariantOutcome {
            artifacts: Vec::new(),
            failures: Vec::new(),
        };

        let built = match builder.build(source_dir, spec, ctx) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Variant {} failed: {}", spec.id, e);
                outcome
                    .failures
                    .push(Failure::new(spec.id.as_str(), Stage::Build, &e));
                return outcome;
            }
        };

        let lib_dir = match self.rpath_lib_dir(spec) {
            Ok(Some(dir)) => dir,
            Ok(None) => {
                debug!("No run path dependency, {} artifacts kept as built", spec.id);
                outcome.artifacts = built;
                self.record(spec, &mut outcome);
                return outcome;
            }
            Err(e) => {
                outcome
                    .failures
                    .push(Failure::new(spec.id.as_str(), Stage::Fixup, &e));
                return outcome;
            }
        };

        let fixup = Fixup::new(self.patcher, ctx.dynamic_linker());
        for artifact in built {
            let subject = format!("{} ({})", artifact.name, artifact.variant);
            match fixup.fixup(artifact, &lib_dir) {
                Ok(artifact) => outcome.artifacts.push(artifact),
                Err(e) => {
                    warn!("Fixup of {} failed: {}", subject, e);
                    outcome.failures.push(Failure::new(subject, Stage::Fixup, &e));
                }
            }
        }
        self.record(spec, &mut outcome);
        outcome
    }

    /// Write the variant's finished artifacts for later `image` runs
    fn record(&self, spec: &VariantSpec, outcome: &mut VariantOutcome) {
        let path = manifest_path(&self.project.output_dir, spec.id);
        if let Err(e) = write_manifest(&path, &outcome.artifacts) {
            warn!("Cannot record artifacts of {}: {}", spec.id, e);
            outcome
                .failures
                .push(Failure::new(spec.id.as_str(), Stage::Build, &e));
        }
    }

    /// `<prefix>/lib` of the variant's run path dependency
    fn rpath_lib_dir(&self, spec: &VariantSpec) -> Result<Option<PathBuf>> {
        let dependency = &self.project.rpath_dependency;
        if dependency.is_empty() {
            return Ok(None);
        }
        let package = spec.package_for(dependency).ok_or_else(|| {
            Error::config(format!(
                "Variant {} has no package for run path dependency {}",
                spec.id, dependency
            ))
        })?;
        let store: &dyn DependencyStore = &self.project.store;
        Ok(Some(store.locate(package)?.join("lib")))
    }

    fn run_image(
        &self,
        def: &ImageDefinition,
        variant: VariantId,
        artifacts: &[Artifact],
        ctx: &BuildContext,
    ) -> Result<ImageOutcome> {
        let spec = def.spec(variant, ctx.version(), &self.project.targets)?;
        let image = compose(&spec, artifacts, &self.project.tools, ctx)?.into_layered()?;

        let archive = if self.export {
            let path = self
                .images_dir()
                .join(format!("{}-{}.tar", image.name, image.tag));
            Some(export_oci(&image, &path)?)
        } else {
            None
        };

        Ok(ImageOutcome {
            reference: image.reference(),
            variant,
            layers: image.layers.len(),
            content_size: image.content_size(),
            archive,
        })
    }
}

/// Bounded pool sized to the context's job count
fn worker_pool(ctx: &BuildContext) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.jobs())
        .build()
        .map_err(|e| Error::config(format!("Cannot start worker pool: {}", e)))
}
