// src/image/mod.rs

//! Container image composition
//!
//! An [`ImageDefinition`] from the project config names the variants it
//! packages. For each of them it yields an [`ImageSpec`] whose name carries
//! the variant suffix (`mayastor`, `mayastor-dev`, ...) and whose tag is the
//! invocation version. [`compose`] gathers the content of one image:
//!
//! - the base tool set plus image-specific tools, each with its closure
//! - the image's fixed-up artifacts at their install paths
//! - a customisation item: `tmp`, `var/tmp`, extra directories and scripts
//!
//! The resulting [`ComposedImage`] is split into layers by the
//! [`layering`] strategy and finally written out by [`oci`].

pub mod content;
pub mod layering;
pub mod oci;

pub use content::{AuxScript, AuxTool, ContentEntry, ContentItem, ContentOrigin, EntryKind};
pub use layering::{DEFAULT_MAX_LAYERS, Layer, LayeringMode, layer};
pub use oci::{ExportSummary, export_oci};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::build::{Artifact, BuildTarget};
use crate::context::{BuildContext, Version};
use crate::error::{Error, Result};
use crate::variant::VariantId;

/// Timestamp written into the image config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedPolicy {
    /// Time of composition
    #[default]
    Now,
    /// Unix epoch, for reproducible images
    Epoch,
}

impl CreatedPolicy {
    pub fn timestamp(&self) -> String {
        match self {
            Self::Now => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            Self::Epoch => "1970-01-01T00:00:00Z".to_string(),
        }
    }
}

/// Image as declared in the project config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Base image name; variant suffixes are appended
    pub name: String,
    /// Variants packaged into this image (default: all)
    #[serde(default = "all_variants")]
    pub variants: Vec<VariantId>,
    /// Build targets installed into the image
    pub binaries: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Ports as `port[/proto]`, `tcp` when no protocol is given
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tools in addition to the base tool set
    #[serde(default)]
    pub tools: Vec<String>,
    /// Host tools wrapped with a chroot script
    #[serde(default)]
    pub host_wrappers: Vec<String>,
    #[serde(default)]
    pub extra_dirs: Vec<String>,
    #[serde(default)]
    pub layering: LayeringMode,
    #[serde(default)]
    pub created: CreatedPolicy,
}

fn all_variants() -> Vec<VariantId> {
    VariantId::all().to_vec()
}

impl ImageDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variants: all_variants(),
            binaries: Vec::new(),
            entrypoint: Vec::new(),
            exposed_ports: Vec::new(),
            env: BTreeMap::new(),
            tools: Vec::new(),
            host_wrappers: Vec::new(),
            extra_dirs: Vec::new(),
            layering: LayeringMode::Flat,
            created: CreatedPolicy::Now,
        }
    }

    pub fn with_variants(mut self, variants: &[VariantId]) -> Self {
        self.variants = variants.to_vec();
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binaries.push(binary.into());
        self
    }

    pub fn with_entrypoint(mut self, argv: &[&str]) -> Self {
        self.entrypoint = argv.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn with_host_wrapper(mut self, tool: impl Into<String>) -> Self {
        self.host_wrappers.push(tool.into());
        self
    }

    pub fn with_layering(mut self, layering: LayeringMode) -> Self {
        self.layering = layering;
        self
    }

    pub fn with_created(mut self, created: CreatedPolicy) -> Self {
        self.created = created;
        self
    }

    pub fn packages(&self, variant: VariantId) -> bool {
        self.variants.contains(&variant)
    }

    /// Image name for a variant: `<name><suffix>`
    pub fn image_name(&self, variant: VariantId) -> String {
        format!("{}{}", self.name, variant.image_suffix())
    }

    /// Concrete image for one variant
    pub fn spec(&self, variant: VariantId, tag: &Version, targets: &[BuildTarget]) -> Result<ImageSpec> {
        let binaries = self
            .binaries
            .iter()
            .map(|name| {
                targets
                    .iter()
                    .find(|t| &t.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::config(format!(
                            "Image {} uses unknown binary {}",
                            self.name, name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let exposed_ports = self
            .exposed_ports
            .iter()
            .map(|p| normalize_port(p))
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(ImageSpec {
            name: self.image_name(variant),
            tag: tag.clone(),
            variant,
            env: self.env.clone(),
            exposed_ports,
            entrypoint: self.entrypoint.clone(),
            extra_dirs: self.extra_dirs.clone(),
            binaries,
            tools: self.tools.clone(),
            scripts: self
                .host_wrappers
                .iter()
                .map(|t| AuxScript::host_wrapper(t))
                .collect(),
            layering: self.layering,
            created: self.created,
        })
    }
}

/// `10124` -> `10124/tcp`; validates number and protocol
fn normalize_port(port: &str) -> Result<String> {
    let (number, proto) = match port.split_once('/') {
        Some((n, p)) => (n, p.to_ascii_lowercase()),
        None => (port, "tcp".to_string()),
    };
    let number: u16 = number
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("Invalid exposed port: {}", port)))?;
    if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
        return Err(Error::config(format!(
            "Invalid protocol in exposed port: {}",
            port
        )));
    }
    Ok(format!("{}/{}", number, proto))
}

/// One image to compose for one variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Full image name including the variant suffix
    pub name: String,
    pub tag: Version,
    pub variant: VariantId,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub entrypoint: Vec<String>,
    pub extra_dirs: Vec<String>,
    pub binaries: Vec<BuildTarget>,
    pub tools: Vec<String>,
    pub scripts: Vec<AuxScript>,
    pub layering: LayeringMode,
    pub created: CreatedPolicy,
}

impl ImageSpec {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Auxiliary tools known to a project
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    /// Tools included in every image, in order
    base: Vec<String>,
    tools: BTreeMap<String, AuxTool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: AuxTool) -> Self {
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    pub fn with_base_tool(mut self, name: impl Into<String>) -> Self {
        self.base.push(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AuxTool> {
        self.tools.get(name)
    }

    /// Tools for an image: base set first, then the image's own, deduplicated
    pub fn resolve(&self, image: &ImageSpec) -> Result<Vec<&AuxTool>> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();
        for name in self.base.iter().chain(&image.tools) {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let tool = self.get(name).ok_or_else(|| {
                Error::config(format!("Image {} uses unknown tool {}", image.name, name))
            })?;
            resolved.push(tool);
        }
        Ok(resolved)
    }
}

/// Runtime configuration of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageConfig {
    /// `KEY=value`, sorted by key
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub exposed_ports: BTreeSet<String>,
    /// RFC 3339 creation timestamp
    pub created: String,
    pub labels: BTreeMap<String, String>,
}

/// Image content before layering
#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub name: String,
    pub tag: Version,
    pub variant: VariantId,
    pub config: ImageConfig,
    pub layering: LayeringMode,
    pub content: Vec<ContentItem>,
}

impl ComposedImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Apply the image's layering mode
    pub fn into_layered(self) -> Result<ContainerImage> {
        let layers = layer(&self.name, self.layering, self.content)?;
        info!("{}:{} has {} layers", self.name, self.tag, layers.len());
        Ok(ContainerImage {
            name: self.name,
            tag: self.tag,
            variant: self.variant,
            config: self.config,
            layers,
        })
    }
}

/// Layered image descriptor, ready for export
#[derive(Debug, Clone)]
pub struct ContainerImage {
    pub name: String,
    pub tag: Version,
    pub variant: VariantId,
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
}

impl ContainerImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Total bytes of file contents across layers
    pub fn content_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Check an image name against the reference grammar
///
/// Names are `/`-separated components of lowercase letters and digits,
/// joined inside a component by `.`, `_`, `__` or runs of `-`.
pub fn validate_image_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::config(format!("Invalid image name {:?}: {}", name, reason));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    for component in name.split('/') {
        let bytes = component.as_bytes();
        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
            return Err(invalid("components must start and end with a lowercase letter or digit"));
        }

        let mut separator = String::new();
        for c in component.chars() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                if !(separator.is_empty()
                    || separator == "."
                    || separator == "_"
                    || separator == "__"
                    || separator.chars().all(|s| s == '-'))
                {
                    return Err(invalid("bad separator"));
                }
                separator.clear();
            } else if matches!(c, '.' | '_' | '-') {
                separator.push(c);
            } else {
                return Err(invalid("only lowercase letters, digits, '.', '_', '-' and '/' allowed"));
            }
        }
    }
    Ok(())
}

/// Directories every image gets, world-writable with the sticky bit
const SCRATCH_DIRS: &[&str] = &["tmp", "var/tmp"];

/// Gather the content and runtime configuration of one image
pub fn compose(
    spec: &ImageSpec,
    artifacts: &[Artifact],
    tools: &ToolSet,
    ctx: &BuildContext,
) -> Result<ComposedImage> {
    debug!("Composing {}", spec.reference());

    let resolved_tools = tools.resolve(spec)?;

    let mut selected = Vec::with_capacity(spec.binaries.len());
    for target in &spec.binaries {
        let artifact = artifacts
            .iter()
            .find(|a| a.name == target.name && a.variant == spec.variant)
            .ok_or_else(|| {
                Error::config(format!(
                    "Image {} needs artifact {} of variant {}, which was not built",
                    spec.name, target.name, spec.variant
                ))
            })?;
        if artifact.version != *ctx.version() {
            return Err(Error::config(format!(
                "Artifact {} has version {}, image {} is tagged {}",
                artifact.name,
                artifact.version,
                spec.name,
                ctx.version()
            )));
        }
        selected.push((artifact, target));
    }

    let mut content = Vec::new();
    let mut path_dirs: Vec<String> = Vec::new();
    let mut closure_paths = BTreeSet::new();
    for tool in &resolved_tools {
        for item in tool.content()? {
            // A closure path shared by several tools is shipped once
            if item.origin == ContentOrigin::Closure && !closure_paths.insert(item.name.clone()) {
                debug!("{}: {} already provided", tool.name, item.name);
                continue;
            }
            content.push(item);
        }
        let bin = tool.bin_dir();
        if !path_dirs.contains(&bin) {
            path_dirs.push(bin);
        }
    }
    for (artifact, target) in &selected {
        content.push(ContentItem::from_artifact(artifact, target)?);
    }
    content.push(customisation(spec)?);

    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        if path_dirs.is_empty() {
            "/bin".to_string()
        } else {
            path_dirs.join(":")
        },
    );
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }

    let mut labels = BTreeMap::new();
    labels.insert(
        "org.opencontainers.image.version".to_string(),
        spec.tag.to_string(),
    );
    labels.insert("io.varimage.variant".to_string(), spec.variant.to_string());

    let config = ImageConfig {
        env: env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        entrypoint: spec.entrypoint.clone(),
        exposed_ports: spec.exposed_ports.clone(),
        created: spec.created.timestamp(),
        labels,
    };

    info!(
        "Composed {} from {} tools, {} artifacts",
        spec.reference(),
        resolved_tools.len(),
        selected.len()
    );

    Ok(ComposedImage {
        name: spec.name.clone(),
        tag: spec.tag.clone(),
        variant: spec.variant,
        config,
        layering: spec.layering,
        content,
    })
}

/// Scratch directories, extra directories and scripts
fn customisation(spec: &ImageSpec) -> Result<ContentItem> {
    let mut entries = Vec::new();
    let mut seen = BTreeSet::new();

    let mut add_dir = |entries: &mut Vec<ContentEntry>, path: &str, mode: u32| {
        let path = content::image_path(path);
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if seen.insert(prefix.clone()) {
                let m = if i == parts.len() - 1 { mode } else { 0o755 };
                entries.push(ContentEntry::dir(&prefix, m));
            }
        }
    };

    for dir in SCRATCH_DIRS {
        add_dir(&mut entries, dir, 0o1777);
    }
    for dir in &spec.extra_dirs {
        add_dir(&mut entries, dir, 0o755);
    }
    for script in &spec.scripts {
        entries.push(script.entry());
    }

    ContentItem::new("customisation", ContentOrigin::Customisation, entries)
}
