// src/cli/mod.rs
//! CLI definitions for varimage
//!
//! Commands follow the pipeline stages:
//! - `plan` - Show effective variant specs and the images they produce
//! - `select` - Run source selection only
//! - `build` - Build and fix up variants
//! - `image` - Package previously built variants into images
//! - `run` - Build and package in one go

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "varimage")]
#[command(author = "varimage Contributors")]
#[command(version)]
#[command(about = "Build variant matrices and assemble container images", long_about = None)]
pub struct Cli {
    /// Project file (default: <repo>/varimage.toml, else built-in project)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository root
    #[arg(short, long, global = true, default_value = ".")]
    pub repo: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by commands that act on variants
#[derive(Args, Debug, Clone)]
pub struct VariantArgs {
    /// Variants to process (default: all)
    #[arg(short = 'v', long = "variant", value_delimiter = ',')]
    pub variants: Vec<String>,

    /// Image tag and artifact version (default: from git)
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Parallel jobs (default: from config or available CPUs)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show effective variant specs and planned images
    Plan {
        #[command(flatten)]
        args: VariantArgs,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which files the whitelist selects
    Select {
        /// List every selected file
        #[arg(short, long)]
        list: bool,
    },

    /// Build and fix up variants
    Build {
        #[command(flatten)]
        args: VariantArgs,
    },

    /// Package previously built variants into images
    Image {
        #[command(flatten)]
        args: VariantArgs,

        /// Compose and layer without writing archives
        #[arg(long)]
        no_export: bool,
    },

    /// Build, fix up and package variants
    Run {
        #[command(flatten)]
        args: VariantArgs,

        /// Compose and layer without writing archives
        #[arg(long)]
        no_export: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}
