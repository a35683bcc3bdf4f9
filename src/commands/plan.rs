// src/commands/plan.rs

//! Plan command: show what a run would build and package

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use varimage::{LayeringMode, VariantId, VariantSpec};

use super::{Session, parse_variants};
use crate::cli::VariantArgs;

#[derive(Serialize)]
struct PlannedImage {
    name: String,
    variant: VariantId,
    binaries: Vec<String>,
    layering: LayeringMode,
}

#[derive(Serialize)]
struct Plan {
    project: String,
    variants: Vec<VariantSpec>,
    images: Vec<PlannedImage>,
}

pub fn cmd_plan(config: Option<&Path>, repo: &Path, args: &VariantArgs, json: bool) -> Result<()> {
    let session = Session::open(config, repo)?;
    let project = &session.project;
    let variants = parse_variants(&args.variants)?;

    let plan = Plan {
        project: project.name.clone(),
        variants: project.matrix.specs(&variants),
        images: project
            .images
            .iter()
            .flat_map(|def| {
                variants
                    .iter()
                    .filter(|v| def.packages(**v))
                    .map(move |v| PlannedImage {
                        name: def.image_name(*v),
                        variant: *v,
                        binaries: def.binaries.clone(),
                        layering: def.layering,
                    })
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Project: {}", plan.project);
    println!();
    println!("Variants:");
    for spec in &plan.variants {
        println!(
            "  {:<10} {:<8} check={}",
            spec.id.as_str(),
            spec.build_type.profile_dir(),
            spec.check
        );
        for (dep, package) in &spec.dependencies {
            println!("    {} -> {}", dep, package);
        }
        if !spec.flags.is_empty() {
            println!("    flags: {}", spec.flags.join(" "));
        }
    }

    println!();
    println!("Images:");
    for image in &plan.images {
        let layering = match image.layering {
            LayeringMode::Flat => "flat".to_string(),
            LayeringMode::Layered { max_layers } => format!("layered (max {})", max_layers),
        };
        println!(
            "  {:<24} [{}] {}",
            image.name,
            image.binaries.join(", "),
            layering
        );
    }

    Ok(())
}
