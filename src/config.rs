// src/config.rs

//! Project configuration
//!
//! A project is described by a `varimage.toml` file:
//!
//! ```toml
//! base_tools = ["busybox"]
//!
//! [project]
//! name = "mayastor"
//!
//! [source]
//! whitelist = ["Cargo.lock", "Cargo.toml", "mayastor", "csi"]
//!
//! [[binary]]
//! name = "mayastor"
//!
//! [base]
//! dependencies = { spdk = "libspdk" }
//!
//! [variants.debug]
//! dependencies = { spdk = "libspdk-dev" }
//! build_type = "debug"
//!
//! [fixup]
//! rpath_dependency = "spdk"
//!
//! [[tool]]
//! name = "busybox"
//! path = "/opt/busybox"
//!
//! [[image]]
//! name = "mayastor"
//! binaries = ["mayastor"]
//! entrypoint = ["/bin/mayastor"]
//! exposed_ports = ["10124"]
//! ```
//!
//! Without a file the built-in storage-engine project is used. Relative
//! paths are resolved against the repository root.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::build::{BuildTarget, DirectoryStore};
use crate::context::ToolchainConfig;
use crate::error::{Error, Result};
use crate::image::{AuxTool, ImageDefinition, LayeringMode, ToolSet, validate_image_name};
use crate::source::{PrefixMatch, SourceWhitelist};
use crate::variant::{BaseSpec, VariantId, VariantMatrix, VariantOverride};

/// Default project file name
pub const DEFAULT_CONFIG_FILE: &str = "varimage.toml";

/// Project file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Tools included in every image
    pub base_tools: Vec<String>,

    /// Where artifacts, the filtered source and image archives go
    pub output_dir: PathBuf,

    pub project: ProjectSection,

    pub source: SourceSection,

    #[serde(rename = "binary")]
    pub binaries: Vec<BuildTarget>,

    pub base: BaseSpec,

    /// Variant name -> override
    pub variants: BTreeMap<String, VariantOverride>,

    pub fixup: FixupSection,

    pub toolchain: ToolchainConfig,

    pub store: StoreSection,

    #[serde(rename = "tool")]
    pub tools: Vec<AuxTool>,

    #[serde(rename = "image")]
    pub images: Vec<ImageDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Path prefixes relative to the repository root
    pub whitelist: Vec<String>,
    pub matching: PrefixMatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixupSection {
    /// Dependency whose `lib/` becomes the run path of fixed-up binaries
    pub rpath_dependency: String,
}

/// Dependency package locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Packages live in `<root>/<package>`
    pub root: PathBuf,
    /// Package -> prefix overrides
    pub packages: BTreeMap<String, PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self::storage_engine()
    }
}

impl ProjectConfig {
    /// The storage engine with its control-plane binaries and three images
    pub fn storage_engine() -> Self {
        let matrix = VariantMatrix::storage_engine();
        let whitelist = [
            "Cargo.lock",
            "Cargo.toml",
            "cli",
            "csi",
            "devinfo",
            "jsonrpc",
            "mayastor",
            "nvmeadm",
            "rpc",
            "spdk-sys",
            "sysfs",
            "mbus-api",
            "composer",
        ];

        Self {
            base_tools: vec!["busybox".to_string()],
            output_dir: PathBuf::from("target/varimage"),
            project: ProjectSection {
                name: "mayastor".to_string(),
            },
            source: SourceSection {
                whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
                matching: PrefixMatch::Naive,
            },
            binaries: vec![
                BuildTarget::new("mayastor"),
                BuildTarget::new("mayastor-csi"),
                BuildTarget::new("mayastor-client"),
            ],
            base: matrix.base,
            variants: matrix
                .variants
                .into_iter()
                .map(|(id, over)| (id.to_string(), over))
                .collect(),
            fixup: FixupSection {
                rpath_dependency: "spdk".to_string(),
            },
            toolchain: ToolchainConfig::default(),
            store: StoreSection {
                root: PathBuf::from("deps"),
                packages: BTreeMap::new(),
            },
            tools: vec![AuxTool::new("busybox", "deps/busybox")],
            images: vec![
                ImageDefinition::new("mayastor")
                    .with_binary("mayastor")
                    .with_entrypoint(&["/bin/mayastor"])
                    .with_exposed_port("10124"),
                ImageDefinition::new("mayastor-csi")
                    .with_binary("mayastor-csi")
                    .with_entrypoint(&["/bin/mayastor-csi"])
                    .with_host_wrapper("iscsiadm"),
                ImageDefinition::new("mayastor-client")
                    .with_binary("mayastor-client")
                    .with_entrypoint(&["/bin/mayastor-client"])
                    .with_layering(LayeringMode::layered()),
            ],
        }
    }

    /// Check cross references between sections
    pub fn validate(&self) -> Result<()> {
        if self.project.name.is_empty() {
            return Err(Error::config("project.name is not set"));
        }
        if self.binaries.is_empty() {
            return Err(Error::config("No [[binary]] entries configured"));
        }

        let mut names = BTreeSet::new();
        for target in &self.binaries {
            if !names.insert(target.name.as_str()) {
                return Err(Error::config(format!("Duplicate binary {}", target.name)));
            }
        }

        for name in self.variants.keys() {
            name.parse::<VariantId>()?;
        }

        if !self.fixup.rpath_dependency.is_empty()
            && !self.base.dependencies.contains_key(&self.fixup.rpath_dependency)
        {
            return Err(Error::config(format!(
                "fixup.rpath_dependency {} is not a base dependency",
                self.fixup.rpath_dependency
            )));
        }

        let tools: BTreeSet<&str> = self.tools.iter().map(|t| t.name.as_str()).collect();
        for tool in &self.base_tools {
            if !tools.contains(tool.as_str()) {
                return Err(Error::config(format!("Unknown base tool {}", tool)));
            }
        }

        let mut images = BTreeSet::new();
        for image in &self.images {
            if !images.insert(image.name.as_str()) {
                return Err(Error::config(format!("Duplicate image {}", image.name)));
            }
            validate_image_name(&image.name)?;
            for binary in &image.binaries {
                if !names.contains(binary.as_str()) {
                    return Err(Error::config(format!(
                        "Image {} uses unknown binary {}",
                        image.name, binary
                    )));
                }
            }
        }

        Ok(())
    }

    /// Variant matrix with string keys parsed
    pub fn variant_matrix(&self) -> Result<VariantMatrix> {
        let variants = self
            .variants
            .iter()
            .map(|(name, over)| Ok((name.parse::<VariantId>()?, over.clone())))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(VariantMatrix {
            base: self.base.clone(),
            variants,
        })
    }

    /// Resolve into a [`Project`] rooted at `repo_root`
    pub fn project(&self, repo_root: &Path) -> Result<Project> {
        self.validate()?;

        let resolve = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                repo_root.join(p)
            }
        };

        let whitelist =
            SourceWhitelist::new(self.source.whitelist.iter().cloned())?.with_matching(self.source.matching);

        let mut store = DirectoryStore::new(resolve(&self.store.root));
        for (package, prefix) in &self.store.packages {
            store = store.with_package(package.clone(), resolve(prefix));
        }

        let mut tools = ToolSet::new();
        for tool in &self.tools {
            let mut tool = tool.clone();
            tool.path = resolve(&tool.path);
            tools = tools.with_tool(tool);
        }
        for name in &self.base_tools {
            tools = tools.with_base_tool(name.clone());
        }

        Ok(Project {
            name: self.project.name.clone(),
            repo_root: repo_root.to_path_buf(),
            output_dir: resolve(&self.output_dir),
            whitelist,
            matrix: self.variant_matrix()?,
            targets: self.binaries.clone(),
            rpath_dependency: self.fixup.rpath_dependency.clone(),
            store,
            tools,
            images: self.images.clone(),
        })
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Parse a project file
pub fn parse_config_file(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    parse_config_string(&content)
}

/// Parse a project file from a string
pub fn parse_config_string(content: &str) -> Result<ProjectConfig> {
    let config: ProjectConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given, else `<repo_root>/varimage.toml` if present, else
/// the built-in project
pub fn load_config(path: Option<&Path>, repo_root: &Path) -> Result<ProjectConfig> {
    match path {
        Some(path) => parse_config_file(path),
        None => {
            let default = repo_root.join(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                parse_config_file(&default)
            } else {
                Ok(ProjectConfig::storage_engine())
            }
        }
    }
}

/// Project with every path resolved and every section validated
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub repo_root: PathBuf,
    pub output_dir: PathBuf,
    pub whitelist: SourceWhitelist,
    pub matrix: VariantMatrix,
    pub targets: Vec<BuildTarget>,
    /// Empty when binaries keep their run path
    pub rpath_dependency: String,
    pub store: DirectoryStore,
    pub tools: ToolSet,
    pub images: Vec<ImageDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_project_is_valid() {
        let config = ProjectConfig::default();
        config.validate().unwrap();

        let matrix = config.variant_matrix().unwrap();
        assert_eq!(matrix, VariantMatrix::storage_engine());
        assert_eq!(config.images.len(), 3);
        assert_eq!(config.source.whitelist.len(), 13);
    }

    #[test]
    fn test_parse_minimal_project() {
        let toml = r#"
base_tools = ["busybox"]

[project]
name = "engine"

[source]
whitelist = ["Cargo.toml", "engine"]
matching = "segment"

[[binary]]
name = "engine"

[base]
dependencies = { utils = "utils-v1" }

[variants.debug]
dependencies = { utils = "utils-v1-dbg" }
build_type = "debug"

[fixup]
rpath_dependency = "utils"

[[tool]]
name = "busybox"
path = "tools/busybox"

[[image]]
name = "engine"
variants = ["release", "debug"]
binaries = ["engine"]
entrypoint = ["/bin/engine"]
layering = { mode = "layered", max_layers = 10 }
created = "epoch"
"#;
        let config = parse_config_string(toml).unwrap();
        assert_eq!(config.source.matching, PrefixMatch::Segment);

        let project = config.project(Path::new("/repo")).unwrap();
        assert_eq!(project.output_dir, PathBuf::from("/repo/target/varimage"));
        assert_eq!(
            project.tools.get("busybox").unwrap().path,
            PathBuf::from("/repo/tools/busybox")
        );
        assert_eq!(
            project.matrix.spec(VariantId::Debug).package_for("utils"),
            Some("utils-v1-dbg")
        );
        assert_eq!(
            project.matrix.spec(VariantId::Release).package_for("utils"),
            Some("utils-v1")
        );
        assert_eq!(
            project.images[0].layering,
            LayeringMode::Layered { max_layers: 10 }
        );
        assert!(!project.images[0].packages(VariantId::Coverage));
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let mut config = ProjectConfig::default();
        config
            .variants
            .insert("profiling".to_string(), VariantOverride::new());
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_image_name_rejected() {
        let mut config = ProjectConfig::default();
        config.images[0].name = "Mayastor_Engine".to_string();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.images[0].name = "openebs/mayastor".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_image_with_unknown_binary_rejected() {
        let mut config = ProjectConfig::default();
        config.images[0].binaries.push("mayastor-io-engine".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_whitelist_rejected_on_resolve() {
        let mut config = ProjectConfig::default();
        config.source.whitelist.clear();
        assert!(matches!(
            config.project(Path::new("/repo")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_builtin_round_trips_through_toml() {
        let config = ProjectConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(parse_config_string(&text).unwrap(), config);
    }

    #[test]
    fn test_load_falls_back_to_builtin() {
        let temp = tempfile::tempdir().unwrap();
        let config = load_config(None, temp.path()).unwrap();
        assert_eq!(config.project.name, "mayastor");

        std::fs::write(
            temp.path().join(DEFAULT_CONFIG_FILE),
            "[project]\nname = \"other\"\n",
        )
        .unwrap();
        // Only the name is overridden; everything else keeps built-in defaults
        let config = load_config(None, temp.path()).unwrap();
        assert_eq!(config.project.name, "other");
        assert_eq!(config.binaries.len(), 3);
    }
}
