// src/lib.rs

//! varimage
//!
//! Multi-variant build and container image assembly for a native storage
//! engine and its companion binaries.
//!
//! # Architecture
//!
//! - Source selection: a whitelist reduces the monorepo to what builds need
//! - Variant matrix: every variant is the base spec plus an explicit override
//! - Fixup: binaries get the toolchain's dynamic linker and a run path into
//!   the variant's native dependency
//! - Images: artifacts, tools and customisation are composed, layered under
//!   a bound and exported as OCI archives
//! - One immutable [`BuildContext`] carries the version and toolchain
//!   environment through every stage

pub mod build;
pub mod config;
pub mod context;
mod error;
pub mod fixup;
pub mod image;
pub mod pipeline;
pub mod source;
pub mod variant;

pub use build::{
    Artifact, BuildRequest, BuildTarget, CargoToolchain, DependencyStore, DirectoryStore,
    Toolchain, VariantBuilder,
};
pub use config::{Project, ProjectConfig, load_config, parse_config_file, parse_config_string};
pub use context::{BuildContext, GitVersion, StaticVersion, ToolchainConfig, Version, VersionSource};
pub use error::{Error, Result};
pub use fixup::{BinaryPatcher, ElfInfo, Fixup, Patchelf, inspect};
pub use image::{
    AuxScript, AuxTool, ComposedImage, ContainerImage, ContentItem, CreatedPolicy, ExportSummary,
    ImageDefinition, ImageSpec, Layer, LayeringMode, ToolSet, compose, export_oci, layer,
};
pub use pipeline::{Failure, ImageOutcome, Pipeline, PipelineReport, Stage};
pub use source::{FilteredTree, PrefixMatch, SourceWhitelist, select};
pub use variant::{BaseSpec, BuildType, VariantId, VariantMatrix, VariantOverride, VariantSpec};
