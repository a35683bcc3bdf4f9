// src/commands/pipeline.rs

//! Build, image and run commands

use anyhow::{Result, bail};
use std::path::Path;
use tracing::info;
use varimage::{CargoToolchain, Patchelf, Pipeline, PipelineReport};

use super::{Session, parse_variants};
use crate::cli::VariantArgs;

pub fn cmd_build(config: Option<&Path>, repo: &Path, args: &VariantArgs) -> Result<()> {
    let session = Session::open(config, repo)?;
    let ctx = session.context(args)?;
    let variants = parse_variants(&args.variants)?;

    let toolchain = CargoToolchain::detect()?;
    let patcher = Patchelf::detect()?;
    let pipeline = Pipeline::new(&session.project, &toolchain, &patcher);

    let report = pipeline.build(&ctx, &variants)?;
    finish(&report, false)
}

pub fn cmd_image(config: Option<&Path>, repo: &Path, args: &VariantArgs, no_export: bool) -> Result<()> {
    let session = Session::open(config, repo)?;
    let ctx = session.context(args)?;
    let variants = parse_variants(&args.variants)?;

    // Packaging never compiles or patches; detection only fails `build`
    let toolchain = CargoToolchain::new("cargo");
    let patcher = Patchelf::new("patchelf");
    let pipeline = Pipeline::new(&session.project, &toolchain, &patcher).with_export(!no_export);

    let mut report = pipeline.existing_artifacts(&ctx, &variants);
    info!("Found {} built artifacts", report.artifacts.len());
    pipeline.images(&ctx, &variants, &mut report)?;
    finish(&report, false)
}

pub fn cmd_run(
    config: Option<&Path>,
    repo: &Path,
    args: &VariantArgs,
    no_export: bool,
    json: bool,
) -> Result<()> {
    let session = Session::open(config, repo)?;
    let ctx = session.context(args)?;
    let variants = parse_variants(&args.variants)?;

    let toolchain = CargoToolchain::detect()?;
    let patcher = Patchelf::detect()?;
    let pipeline = Pipeline::new(&session.project, &toolchain, &patcher).with_export(!no_export);

    let report = pipeline.run(&ctx, &variants)?;
    finish(&report, json)
}

/// Print successes, then failures; fail the process if anything failed
fn finish(report: &PipelineReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_report(report);
    }

    if !report.is_success() {
        bail!("{} step(s) failed", report.failures.len());
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("Version: {}", report.version);

    if !report.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &report.artifacts {
            println!(
                "  {:<10} {:<20} {}",
                artifact.variant.as_str(),
                artifact.name,
                artifact.binary.display()
            );
        }
    }

    if !report.images.is_empty() {
        println!();
        println!("Images:");
        for image in &report.images {
            match &image.archive {
                Some(archive) => println!(
                    "  {:<32} {} layers  {}",
                    image.reference,
                    image.layers,
                    archive.path.display()
                ),
                None => println!("  {:<32} {} layers", image.reference, image.layers),
            }
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &report.failures {
            println!(
                "  [{:?}] {}: {}",
                failure.stage, failure.subject, failure.message
            );
        }
    }
}
