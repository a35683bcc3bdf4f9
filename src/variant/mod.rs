// src/variant/mod.rs
//! Build variant matrix
//!
//! Every variant is a specialization of one shared [`BaseSpec`]. A variant
//! only states what it changes through a [`VariantOverride`]; the effective
//! [`VariantSpec`] is computed once by [`BaseSpec::specialize`] and never
//! modified afterwards.
//!
//! ```text
//!                 BaseSpec { spdk = libspdk, optimized, no check }
//!                     │
//!     ┌───────────────┼───────────────┬────────────────┐
//!     ▼               ▼               ▼                ▼
//!  release          debug           adhoc           coverage
//!  (as base)   spdk = libspdk-dev  spdk = libspdk-dev  + instrument flags
//!              unoptimized         unoptimized         check = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Named build configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantId {
    /// Optimized build linked against release dependencies
    Release,
    /// Unoptimized build linked against debug-instrumented dependencies
    Debug,
    /// Developer build for ad-hoc images
    Adhoc,
    /// Instrumented build with the check step enabled
    Coverage,
}

impl VariantId {
    /// All variants in matrix order
    pub fn all() -> &'static [VariantId] {
        &[Self::Release, Self::Debug, Self::Adhoc, Self::Coverage]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Debug => "debug",
            Self::Adhoc => "adhoc",
            Self::Coverage => "coverage",
        }
    }

    /// Suffix appended to an image base name when packaging this variant
    pub fn image_suffix(&self) -> &'static str {
        match self {
            Self::Release => "",
            Self::Debug => "-dev",
            Self::Adhoc => "-adhoc",
            Self::Coverage => "-coverage",
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VariantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "release" => Ok(Self::Release),
            "debug" | "dev" => Ok(Self::Debug),
            "adhoc" => Ok(Self::Adhoc),
            "coverage" | "cov" => Ok(Self::Coverage),
            _ => Err(Error::config(format!(
                "Unknown variant: {} (expected: release, debug, adhoc, coverage)",
                s
            ))),
        }
    }
}

/// Optimization level passed to the toolchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    #[default]
    Release,
    Debug,
}

impl BuildType {
    /// Name of the toolchain's output profile directory
    pub fn profile_dir(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Debug => "debug",
        }
    }

    pub fn is_optimized(&self) -> bool {
        matches!(self, Self::Release)
    }
}

/// Configuration shared by every variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseSpec {
    /// Native dependencies: dependency name -> package providing it
    pub dependencies: BTreeMap<String, String>,
    /// Extra compiler flags
    pub flags: Vec<String>,
    pub build_type: BuildType,
    /// Run the toolchain check step after building
    pub check: bool,
}

/// Fields a variant changes relative to the base; unset fields inherit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantOverride {
    /// Entries replace same-named base dependencies entirely
    pub dependencies: BTreeMap<String, String>,
    /// Replaces the base flags when set
    pub flags: Option<Vec<String>>,
    /// Appended after the (possibly replaced) flags
    pub extra_flags: Vec<String>,
    pub build_type: Option<BuildType>,
    pub check: Option<bool>,
}

impl VariantOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, name: impl Into<String>, package: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), package.into());
        self
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_extra_flag(mut self, flag: impl Into<String>) -> Self {
        self.extra_flags.push(flag.into());
        self
    }

    pub fn with_build_type(mut self, build_type: BuildType) -> Self {
        self.build_type = Some(build_type);
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = Some(check);
        self
    }
}

/// Effective configuration of one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantSpec {
    pub id: VariantId,
    pub dependencies: BTreeMap<String, String>,
    pub flags: Vec<String>,
    pub build_type: BuildType,
    pub check: bool,
}

impl VariantSpec {
    /// Package providing a dependency in this variant
    pub fn package_for(&self, dependency: &str) -> Option<&str> {
        self.dependencies.get(dependency).map(String::as_str)
    }
}

impl BaseSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, name: impl Into<String>, package: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), package.into());
        self
    }

    pub fn with_build_type(mut self, build_type: BuildType) -> Self {
        self.build_type = build_type;
        self
    }

    /// Compute the effective spec for a variant
    ///
    /// Dependencies are merged by name with the override winning, so a
    /// variant never links two packages for the same dependency.
    pub fn specialize(&self, id: VariantId, over: &VariantOverride) -> VariantSpec {
        let mut dependencies = self.dependencies.clone();
        for (name, package) in &over.dependencies {
            dependencies.insert(name.clone(), package.clone());
        }

        let mut flags = over.flags.clone().unwrap_or_else(|| self.flags.clone());
        flags.extend(over.extra_flags.iter().cloned());

        VariantSpec {
            id,
            dependencies,
            flags,
            build_type: over.build_type.unwrap_or(self.build_type),
            check: over.check.unwrap_or(self.check),
        }
    }
}

/// Base spec plus per-variant overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantMatrix {
    pub base: BaseSpec,
    pub variants: BTreeMap<VariantId, VariantOverride>,
}

impl VariantMatrix {
    /// Effective spec for one variant; variants without an override inherit the base
    pub fn spec(&self, id: VariantId) -> VariantSpec {
        match self.variants.get(&id) {
            Some(over) => self.base.specialize(id, over),
            None => self.base.specialize(id, &VariantOverride::default()),
        }
    }

    /// Effective specs for the requested variants, in matrix order
    pub fn specs(&self, ids: &[VariantId]) -> Vec<VariantSpec> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| self.spec(id)).collect()
    }

    /// Matrix for the storage engine: SPDK is the native dependency that
    /// changes between optimized and debug-instrumented builds.
    pub fn storage_engine() -> Self {
        let base = BaseSpec::new()
            .with_dependency("spdk", "libspdk")
            .with_build_type(BuildType::Release);

        let mut variants = BTreeMap::new();
        variants.insert(VariantId::Release, VariantOverride::new());
        variants.insert(
            VariantId::Debug,
            VariantOverride::new()
                .with_dependency("spdk", "libspdk-dev")
                .with_build_type(BuildType::Debug),
        );
        variants.insert(
            VariantId::Adhoc,
            VariantOverride::new()
                .with_dependency("spdk", "libspdk-dev")
                .with_build_type(BuildType::Debug),
        );
        variants.insert(
            VariantId::Coverage,
            VariantOverride::new()
                .with_dependency("spdk", "libspdk-dev")
                .with_build_type(BuildType::Debug)
                .with_extra_flag("-Cinstrument-coverage")
                .with_check(true),
        );

        Self { base, variants }
    }
}
