// src/image/content.rs

//! Image content
//!
//! Everything that ends up in an image is a [`ContentItem`]: a named group of
//! filesystem entries with a known byte size. Items are the unit the
//! layering strategy places into layers; a tool's dependency closure is one
//! item per closure path so shared paths land in their own layers.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::build::{Artifact, BuildTarget};
use crate::error::{Error, Result};

/// Kind of filesystem entry in an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file copied from the host
    File { source: PathBuf },
    /// Regular file with literal contents
    Inline { data: Vec<u8> },
    Dir,
    Symlink { target: String },
}

/// One path inside an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// Image path without a leading slash
    pub path: String,
    pub mode: u32,
    pub kind: EntryKind,
}

impl ContentEntry {
    pub fn dir(path: &str, mode: u32) -> Self {
        Self {
            path: image_path(path),
            mode,
            kind: EntryKind::Dir,
        }
    }

    pub fn file(path: &str, source: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            path: image_path(path),
            mode,
            kind: EntryKind::File {
                source: source.into(),
            },
        }
    }

    pub fn inline(path: &str, data: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: image_path(path),
            mode,
            kind: EntryKind::Inline { data: data.into() },
        }
    }

    pub fn symlink(path: &str, target: impl Into<String>) -> Self {
        Self {
            path: image_path(path),
            mode: 0o777,
            kind: EntryKind::Symlink {
                target: target.into(),
            },
        }
    }
}

/// Normalize an image path: no leading or trailing slash
pub fn image_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Where a content item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentOrigin {
    /// Auxiliary tool tree (shell, utilities)
    Tool,
    /// One path of a tool's dependency closure
    Closure,
    /// Fixed-up build artifact
    Artifact,
    /// Created directories and auxiliary scripts
    Customisation,
}

/// A named group of entries placed into layers as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub name: String,
    pub origin: ContentOrigin,
    pub entries: Vec<ContentEntry>,
    /// Total bytes of file contents
    pub size: u64,
}

impl ContentItem {
    pub fn new(name: impl Into<String>, origin: ContentOrigin, entries: Vec<ContentEntry>) -> Result<Self> {
        let mut size = 0u64;
        for entry in &entries {
            size += match &entry.kind {
                EntryKind::File { source } => fs::metadata(source)?.len(),
                EntryKind::Inline { data } => data.len() as u64,
                EntryKind::Dir | EntryKind::Symlink { .. } => 0,
            };
        }
        Ok(Self {
            name: name.into(),
            origin,
            entries,
            size,
        })
    }

    /// Content item for a fixed-up artifact at its install path
    pub fn from_artifact(artifact: &Artifact, target: &BuildTarget) -> Result<Self> {
        if !artifact.binary.is_file() {
            return Err(Error::config(format!(
                "Artifact {} missing at {}",
                artifact.name,
                artifact.binary.display()
            )));
        }
        let entry = ContentEntry::file(&target.install_path(), &artifact.binary, 0o755);
        Self::new(
            format!("{}-{}", artifact.name, artifact.variant),
            ContentOrigin::Artifact,
            vec![entry],
        )
    }
}

/// Auxiliary tool bundled into images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxTool {
    pub name: String,
    /// Host directory whose contents are copied into the image
    pub path: PathBuf,
    /// Image directory the tool tree is placed under
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Host paths the tool needs at runtime, copied to the same image path
    #[serde(default)]
    pub closure: Vec<PathBuf>,
}

fn default_prefix() -> String {
    "/".to_string()
}

impl AuxTool {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            prefix: default_prefix(),
            closure: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_closure_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.closure.push(path.into());
        self
    }

    /// Image directory added to `PATH` for this tool
    pub fn bin_dir(&self) -> String {
        let prefix = image_path(&self.prefix);
        if prefix.is_empty() {
            "/bin".to_string()
        } else {
            format!("/{}/bin", prefix)
        }
    }

    /// Content items: the tool tree first, then one item per closure path
    pub fn content(&self) -> Result<Vec<ContentItem>> {
        if !self.path.is_dir() {
            return Err(Error::config(format!(
                "Tool {} not found at {}",
                self.name,
                self.path.display()
            )));
        }

        let mut items = vec![ContentItem::new(
            self.name.clone(),
            ContentOrigin::Tool,
            scan_tree(&self.path, &self.prefix)?,
        )?];

        for path in &self.closure {
            let image_dir = path.display().to_string();
            let entries = if path.is_dir() {
                scan_tree(path, &image_dir)?
            } else if path.is_file() {
                vec![ContentEntry::file(&image_dir, path, file_mode(path)?)]
            } else {
                return Err(Error::config(format!(
                    "Closure path of tool {} not found: {}",
                    self.name,
                    path.display()
                )));
            };
            items.push(ContentItem::new(
                image_dir,
                ContentOrigin::Closure,
                entries,
            )?);
        }

        Ok(items)
    }
}

/// Script written into an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxScript {
    /// Absolute image path
    pub path: String,
    pub content: String,
    pub mode: u32,
}

impl AuxScript {
    /// Wrapper that runs a host tool inside a chroot of the host
    /// filesystem (mounted at `/host`) with a sanitized environment
    pub fn host_wrapper(tool: &str) -> Self {
        Self {
            path: format!("/bin/{}", tool),
            content: format!(
                "#!/bin/sh\nchroot /host /usr/bin/env -i PATH=\"/sbin:/bin:/usr/bin\" {} \"$@\"\n",
                tool
            ),
            mode: 0o755,
        }
    }

    pub fn entry(&self) -> ContentEntry {
        ContentEntry::inline(&self.path, self.content.as_bytes().to_vec(), self.mode)
    }
}

/// Entries for a host tree placed under an image prefix, sorted by path
fn scan_tree(root: &Path, prefix: &str) -> Result<Vec<ContentEntry>> {
    let prefix = image_path(prefix);
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
            _ => {
                // Root itself: only recorded when it maps to a real directory
                if !prefix.is_empty() {
                    entries.push(ContentEntry::dir(&prefix, 0o755));
                }
                continue;
            }
        };
        let image = if prefix.is_empty() {
            rel
        } else {
            format!("{}/{}", prefix, rel)
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            entries.push(ContentEntry::symlink(&image, target.to_string_lossy()));
        } else if file_type.is_dir() {
            entries.push(ContentEntry::dir(&image, file_mode(entry.path())?));
        } else {
            entries.push(ContentEntry::file(&image, entry.path(), file_mode(entry.path())?));
        }
    }

    Ok(entries)
}

fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::symlink_metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path_normalization() {
        assert_eq!(image_path("/bin/sh"), "bin/sh");
        assert_eq!(image_path("var/tmp/"), "var/tmp");
        assert_eq!(image_path("/"), "");
    }

    #[test]
    fn test_host_wrapper_script() {
        let script = AuxScript::host_wrapper("iscsiadm");
        assert_eq!(script.path, "/bin/iscsiadm");
        assert_eq!(
            script.content,
            "#!/bin/sh\nchroot /host /usr/bin/env -i PATH=\"/sbin:/bin:/usr/bin\" iscsiadm \"$@\"\n"
        );
        assert_eq!(script.entry().path, "bin/iscsiadm");
        assert_eq!(script.entry().mode, 0o755);
    }

    #[test]
    fn test_tool_bin_dir() {
        assert_eq!(AuxTool::new("busybox", "/x").bin_dir(), "/bin");
        assert_eq!(
            AuxTool::new("nvme-cli", "/x").with_prefix("/opt/nvme").bin_dir(),
            "/opt/nvme/bin"
        );
    }

    #[test]
    fn test_tool_content_and_closure() {
        let temp = tempfile::tempdir().unwrap();
        let tool = temp.path().join("busybox");
        fs::create_dir_all(tool.join("bin")).unwrap();
        fs::write(tool.join("bin/busybox"), vec![0u8; 100]).unwrap();
        std::os::unix::fs::symlink("busybox", tool.join("bin/sh")).unwrap();

        let lib = temp.path().join("libc.so.6");
        fs::write(&lib, vec![0u8; 40]).unwrap();

        let items = AuxTool::new("busybox", &tool)
            .with_closure_path(&lib)
            .content()
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].origin, ContentOrigin::Tool);
        assert_eq!(items[0].size, 100);
        let paths: Vec<_> = items[0].entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["bin", "bin/busybox", "bin/sh"]);
        assert!(matches!(
            items[0].entries[2].kind,
            EntryKind::Symlink { ref target } if target == "busybox"
        ));

        assert_eq!(items[1].origin, ContentOrigin::Closure);
        assert_eq!(items[1].size, 40);
        assert_eq!(items[1].entries[0].path, image_path(&lib.display().to_string()));
    }

    #[test]
    fn test_missing_tool_is_configuration_error() {
        let err = AuxTool::new("busybox", "/nonexistent/busybox").content().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
