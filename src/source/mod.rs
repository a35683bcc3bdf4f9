// src/source/mod.rs

//! Source selection
//!
//! Reduces a monorepo to the subtree a build actually needs. Selection is
//! driven by a whitelist of path prefixes relative to the repository root.
//!
//! Matching is a plain string prefix test by default: the prefix `csi`
//! selects `csi/driver` and also `cside/ignored`. [`PrefixMatch::Segment`]
//! restricts matches to whole path segments for projects where that
//! over-selection matters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// How a whitelist prefix is compared against a relative path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixMatch {
    /// String prefix, not segment aware
    #[default]
    Naive,
    /// Prefix must end on a path segment boundary
    Segment,
}

/// Ordered allow-list of source prefixes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWhitelist {
    prefixes: Vec<String>,
    matching: PrefixMatch,
}

impl SourceWhitelist {
    /// Create a whitelist, rejecting empty lists and empty or absolute prefixes
    pub fn new<I, S>(prefixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();

        for prefix in prefixes {
            let prefix = prefix.into();
            if prefix.is_empty() {
                return Err(Error::config("Whitelist contains an empty prefix"));
            }
            if prefix.starts_with('/') {
                return Err(Error::config(format!(
                    "Whitelist prefix must be relative to the repository root: {}",
                    prefix
                )));
            }
            if seen.insert(prefix.clone()) {
                ordered.push(prefix);
            }
        }

        if ordered.is_empty() {
            return Err(Error::config("Source whitelist is empty"));
        }

        Ok(Self {
            prefixes: ordered,
            matching: PrefixMatch::default(),
        })
    }

    /// Set the matching mode
    pub fn with_matching(mut self, matching: PrefixMatch) -> Self {
        self.matching = matching;
        self
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn matching(&self) -> PrefixMatch {
        self.matching
    }

    /// Check whether a root-relative, `/`-separated path is selected
    pub fn matches(&self, relative: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| prefix_matches(self.matching, prefix, relative))
    }

    /// Check whether a directory may contain selected files
    fn may_contain_matches(&self, relative_dir: &str) -> bool {
        let dir = format!("{}/", relative_dir);
        self.prefixes
            .iter()
            .any(|prefix| dir.starts_with(prefix.as_str()) || prefix.starts_with(&dir))
    }
}

fn prefix_matches(matching: PrefixMatch, prefix: &str, relative: &str) -> bool {
    match matching {
        PrefixMatch::Naive => relative.starts_with(prefix),
        PrefixMatch::Segment => {
            let prefix = prefix.trim_end_matches('/');
            match relative.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        }
    }
}

/// Files selected from a repository, relative to its root
#[derive(Debug, Clone)]
pub struct FilteredTree {
    root: PathBuf,
    files: BTreeSet<String>,
    unmatched: Vec<String>,
}

impl FilteredTree {
    /// Repository root the tree was selected from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Selected files as `/`-separated relative paths, sorted
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.files.contains(relative)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whitelist prefixes that selected nothing
    pub fn unmatched_prefixes(&self) -> &[String] {
        &self.unmatched
    }

    /// Copy the selected files into `dest`, preserving structure and permissions
    pub fn materialize(&self, dest: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest)?;

        for relative in &self.files {
            let from = self.root.join(relative);
            let to = dest.join(relative);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }

            let meta = fs::symlink_metadata(&from)?;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&from)?;
                if fs::symlink_metadata(&to).is_ok() {
                    fs::remove_file(&to)?;
                }
                std::os::unix::fs::symlink(&target, &to)?;
            } else {
                fs::copy(&from, &to)?;
            }
        }

        debug!(
            "Materialized {} files from {} into {}",
            self.files.len(),
            self.root.display(),
            dest.display()
        );
        Ok(dest.to_path_buf())
    }
}

/// Walk `repo_root` and keep every file matching the whitelist
pub fn select(repo_root: &Path, whitelist: &SourceWhitelist) -> Result<FilteredTree> {
    if !repo_root.is_dir() {
        return Err(Error::config(format!(
            "Repository root does not exist: {}",
            repo_root.display()
        )));
    }

    let mut files = BTreeSet::new();

    let walker = WalkDir::new(repo_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match relative_path(repo_root, entry.path()) {
                Some(rel) => whitelist.may_contain_matches(&rel),
                None => false,
            }
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "Failed to walk {}: {}",
                repo_root.display(),
                e
            )))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }

        let Some(rel) = relative_path(repo_root, entry.path()) else {
            continue;
        };
        if whitelist.matches(&rel) {
            files.insert(rel);
        }
    }

    let unmatched: Vec<String> = whitelist
        .prefixes()
        .iter()
        .filter(|prefix| {
            !files
                .iter()
                .any(|f| prefix_matches(whitelist.matching(), prefix, f))
        })
        .cloned()
        .collect();

    for prefix in &unmatched {
        warn!("Whitelist prefix '{}' matched no files", prefix);
    }

    info!(
        "Selected {} files from {} ({} prefixes)",
        files.len(),
        repo_root.display(),
        whitelist.prefixes().len()
    );

    Ok(FilteredTree {
        root: repo_root.to_path_buf(),
        files,
        unmatched,
    })
}

/// Root-relative path with `/` separators
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
