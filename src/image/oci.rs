// src/image/oci.rs
//! OCI image export
//!
//! Writes a layered [`ContainerImage`] as an OCI image layout archive. The
//! result can be loaded with podman or copied with skopeo:
//!
//! ```text
//! podman load < mayastor-dev.tar
//! skopeo copy oci-archive:mayastor-dev.tar containers-storage:localhost/mayastor-dev:<tag>
//! ```
//!
//! Layer blobs are deterministic: entries are sorted by path, parent
//! directories are synthesized, and every header carries the same mtime.
//! Each layer is streamed through tar and gzip straight into its blob file,
//! hashing the uncompressed and compressed bytes on the way.

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info};

use super::content::{ContentEntry, EntryKind};
use super::{ContainerImage, Layer};
use crate::error::{Error, Result};

/// OCI image layout version
const OCI_LAYOUT_VERSION: &str = "1.0.0";

/// OCI image manifest media type
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image config media type
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI layer media type (gzipped tar)
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image index media type
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Modification time of every layer entry (2024-01-01)
const LAYER_MTIME: u64 = 1704067200;

/// OCI image configuration
#[derive(Debug, Serialize)]
struct OciConfig {
    created: String,
    architecture: String,
    os: String,
    config: OciConfigRuntime,
    rootfs: OciRootfs,
    history: Vec<OciHistory>,
}

#[derive(Debug, Serialize)]
struct OciConfigRuntime {
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Env", skip_serializing_if = "Vec::is_empty")]
    env: Vec<String>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "BTreeMap::is_empty")]
    exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "Labels", skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct OciRootfs {
    #[serde(rename = "type")]
    rootfs_type: String,
    diff_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OciHistory {
    created: String,
    created_by: String,
}

/// OCI image manifest
#[derive(Debug, Serialize)]
struct OciManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: OciDescriptor,
    layers: Vec<OciDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

/// OCI image index
#[derive(Debug, Serialize)]
struct OciIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    manifests: Vec<OciDescriptor>,
}

/// OCI content descriptor
#[derive(Debug, Serialize)]
struct OciDescriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<OciPlatform>,
}

/// OCI platform specification
#[derive(Debug, Serialize)]
struct OciPlatform {
    architecture: String,
    os: String,
}

/// OCI layout file content
#[derive(Debug, Serialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// What was written by [`export_oci`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    /// `name:tag`
    pub reference: String,
    pub manifest_digest: String,
    /// Compressed layer digests, bottom to top
    pub layers: Vec<String>,
    /// Total compressed layer bytes
    pub size: u64,
}

/// A layer blob written to the layout
struct LayerBlob {
    digest: String,
    diff_id: String,
    size: u64,
}

/// Writer that hashes and counts everything passed through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Inner writer, `sha256:<hex>` digest and byte count
    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{:x}", self.hasher.finalize());
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Export a layered image to an OCI archive at `output`
pub fn export_oci(image: &ContainerImage, output: &Path) -> Result<ExportSummary> {
    let temp_dir = tempfile::tempdir()?;
    let blobs_dir = temp_dir.path().join("blobs/sha256");
    fs::create_dir_all(&blobs_dir)?;

    let mut blobs = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        let blob = build_layer(layer, &blobs_dir)?;
        debug!(
            "{}: layer {} ({} bytes, items: {})",
            image.reference(),
            blob.digest,
            blob.size,
            layer.items.join(", ")
        );
        blobs.push(blob);
    }

    let config = create_config(image, &blobs);
    let config_json = serde_json::to_string_pretty(&config)?;
    let config_digest = format!("sha256:{}", sha256_hex(config_json.as_bytes()));
    fs::write(blobs_dir.join(hex_part(&config_digest)), &config_json)?;

    let reference = image.reference();
    let mut manifest_annotations = BTreeMap::new();
    manifest_annotations.insert(
        "org.opencontainers.image.title".to_string(),
        image.name.clone(),
    );
    manifest_annotations.insert(
        "org.opencontainers.image.version".to_string(),
        image.tag.to_string(),
    );

    let manifest = OciManifest {
        schema_version: 2,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        config: OciDescriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_json.len() as u64,
            annotations: None,
            platform: None,
        },
        layers: blobs
            .iter()
            .map(|b| OciDescriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: b.digest.clone(),
                size: b.size,
                annotations: None,
                platform: None,
            })
            .collect(),
        annotations: Some(manifest_annotations),
    };

    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    let manifest_digest = format!("sha256:{}", sha256_hex(manifest_json.as_bytes()));
    fs::write(blobs_dir.join(hex_part(&manifest_digest)), &manifest_json)?;

    let mut ref_annotation = BTreeMap::new();
    ref_annotation.insert(
        "org.opencontainers.image.ref.name".to_string(),
        reference.clone(),
    );
    let index = OciIndex {
        schema_version: 2,
        media_type: INDEX_MEDIA_TYPE.to_string(),
        manifests: vec![OciDescriptor {
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            digest: manifest_digest.clone(),
            size: manifest_json.len() as u64,
            annotations: Some(ref_annotation),
            platform: Some(OciPlatform {
                architecture: oci_architecture().to_string(),
                os: "linux".to_string(),
            }),
        }],
    };
    fs::write(
        temp_dir.path().join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )?;

    let layout = OciLayout {
        image_layout_version: OCI_LAYOUT_VERSION.to_string(),
    };
    fs::write(
        temp_dir.path().join("oci-layout"),
        serde_json::to_string_pretty(&layout)?,
    )?;

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let output_file = File::create(output)?;
    let mut archive = Builder::new(output_file);
    archive.append_dir_all(".", temp_dir.path())?;
    archive.finish()?;

    let size = blobs.iter().map(|b| b.size).sum();
    info!(
        "Exported {} to {} ({} layers, {} bytes)",
        reference,
        output.display(),
        blobs.len(),
        size
    );

    Ok(ExportSummary {
        path: output.to_path_buf(),
        reference,
        manifest_digest,
        layers: blobs.into_iter().map(|b| b.digest).collect(),
        size,
    })
}

/// Stream one layer into `blobs_dir`, named by its compressed digest
///
/// The diff_id is the digest of the uncompressed tar.
fn build_layer(layer: &Layer, blobs_dir: &Path) -> Result<LayerBlob> {
    let staging = tempfile::NamedTempFile::new_in(blobs_dir)?;
    let compressed = HashingWriter::new(BufWriter::new(staging));
    let encoder = GzEncoder::new(compressed, Compression::default());

    let uncompressed = write_layer_tar(&layer.entries, HashingWriter::new(encoder))?;
    let (encoder, diff_id, _) = uncompressed.finish();
    let (buffered, digest, size) = encoder.finish()?.finish();

    let staging = buffered.into_inner().map_err(|e| e.into_error())?;
    staging
        .persist(blobs_dir.join(hex_part(&digest)))
        .map_err(|e| e.error)?;

    Ok(LayerBlob {
        digest,
        diff_id,
        size,
    })
}

/// Sorted tar of layer entries; a later entry for the same path wins
fn write_layer_tar<W: Write>(entries: &[ContentEntry], writer: W) -> Result<W> {
    let mut by_path: BTreeMap<&str, &ContentEntry> = BTreeMap::new();
    for entry in entries {
        if !entry.path.is_empty() {
            by_path.insert(entry.path.as_str(), entry);
        }
    }

    let mut archive = Builder::new(writer);
    let mut created_dirs = BTreeSet::new();

    for (path, entry) in &by_path {
        // Parent directories not declared by the content
        let mut current = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len() - 1] {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            if !by_path.contains_key(current.as_str()) && created_dirs.insert(current.clone()) {
                append_dir(&mut archive, &current, 0o755)?;
            }
        }

        match &entry.kind {
            EntryKind::Dir => {
                if created_dirs.insert(path.to_string()) {
                    append_dir(&mut archive, path, entry.mode)?;
                }
            }
            EntryKind::Symlink { target } => {
                let mut header = entry_header(tar::EntryType::Symlink, 0o777, 0);
                archive.append_link(&mut header, path, target)?;
            }
            EntryKind::Inline { data } => {
                let mut header = entry_header(tar::EntryType::Regular, entry.mode, data.len() as u64);
                archive.append_data(&mut header, path, data.as_slice())?;
            }
            EntryKind::File { source } => {
                let file = File::open(source).map_err(|e| {
                    Error::config(format!(
                        "Cannot read {} for {}: {}",
                        source.display(),
                        path,
                        e
                    ))
                })?;
                let len = file.metadata()?.len();
                let mut header = entry_header(tar::EntryType::Regular, entry.mode, len);
                archive.append_data(&mut header, path, file)?;
            }
        }
    }

    Ok(archive.into_inner()?)
}

fn entry_header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(LAYER_MTIME);
    header.set_cksum();
    header
}

fn append_dir<W: Write>(archive: &mut Builder<W>, path: &str, mode: u32) -> Result<()> {
    let mut header = entry_header(tar::EntryType::Directory, mode, 0);
    archive.append_data(&mut header, path, io::empty())?;
    Ok(())
}

/// Calculate SHA256 hex digest
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn hex_part(digest: &str) -> &str {
    digest.trim_start_matches("sha256:")
}

/// OCI architecture name for the host
fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn create_config(image: &ContainerImage, blobs: &[LayerBlob]) -> OciConfig {
    let exposed_ports = image
        .config
        .exposed_ports
        .iter()
        .map(|p| (p.clone(), serde_json::json!({})))
        .collect();

    OciConfig {
        created: image.config.created.clone(),
        architecture: oci_architecture().to_string(),
        os: "linux".to_string(),
        config: OciConfigRuntime {
            entrypoint: if image.config.entrypoint.is_empty() {
                None
            } else {
                Some(image.config.entrypoint.clone())
            },
            env: image.config.env.clone(),
            exposed_ports,
            labels: image.config.labels.clone(),
        },
        rootfs: OciRootfs {
            rootfs_type: "layers".to_string(),
            diff_ids: blobs.iter().map(|b| b.diff_id.clone()).collect(),
        },
        history: image
            .layers
            .iter()
            .map(|l| OciHistory {
                created: image.config.created.clone(),
                created_by: format!("varimage: {}", l.items.join(", ")),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Version;
    use crate::image::{ContentItem, ContentOrigin, ImageConfig, LayeringMode, layer};
    use crate::variant::VariantId;
    use std::io::Read;

    fn sample_image(dir: &Path) -> ContainerImage {
        let binary = dir.join("mayastor");
        fs::write(&binary, b"\x7fELF fake").unwrap();

        let content = vec![
            ContentItem::new(
                "busybox",
                ContentOrigin::Tool,
                vec![
                    ContentEntry::inline("/bin/busybox", b"busybox".to_vec(), 0o755),
                    ContentEntry::symlink("/bin/sh", "busybox"),
                ],
            )
            .unwrap(),
            ContentItem::new(
                "mayastor-release",
                ContentOrigin::Artifact,
                vec![ContentEntry::file("/bin/mayastor", &binary, 0o755)],
            )
            .unwrap(),
            ContentItem::new(
                "customisation",
                ContentOrigin::Customisation,
                vec![ContentEntry::dir("tmp", 0o1777), ContentEntry::dir("var/tmp", 0o1777)],
            )
            .unwrap(),
        ];

        ContainerImage {
            name: "mayastor".to_string(),
            tag: Version::new("v1").unwrap(),
            variant: VariantId::Release,
            config: ImageConfig {
                env: vec!["PATH=/bin".to_string()],
                entrypoint: vec!["/bin/mayastor".to_string()],
                exposed_ports: ["10124/tcp".to_string()].into_iter().collect(),
                created: "1970-01-01T00:00:00Z".to_string(),
                labels: BTreeMap::new(),
            },
            layers: layer("mayastor", LayeringMode::layered(), content).unwrap(),
        }
    }

    fn read_archive(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_start_matches("./")
                .to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.insert(name, data);
        }
        files
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_export_layout() {
        let temp = tempfile::tempdir().unwrap();
        let image = sample_image(temp.path());
        let out = temp.path().join("out/mayastor.tar");

        let summary = export_oci(&image, &out).unwrap();
        assert_eq!(summary.reference, "mayastor:v1");
        assert_eq!(summary.layers.len(), 3);

        let files = read_archive(&out);
        assert!(files.contains_key("oci-layout"));
        let index: serde_json::Value = serde_json::from_slice(&files["index.json"]).unwrap();
        assert_eq!(
            index["manifests"][0]["annotations"]["org.opencontainers.image.ref.name"],
            "mayastor:v1"
        );
        assert_eq!(index["manifests"][0]["digest"], summary.manifest_digest.as_str());

        let manifest_blob = format!("blobs/sha256/{}", hex_part(&summary.manifest_digest));
        let manifest: serde_json::Value = serde_json::from_slice(&files[&manifest_blob]).unwrap();
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 3);

        let config_digest = manifest["config"]["digest"].as_str().unwrap();
        let config_blob = format!("blobs/sha256/{}", hex_part(config_digest));
        let config: serde_json::Value = serde_json::from_slice(&files[&config_blob]).unwrap();
        assert_eq!(config["config"]["Entrypoint"][0], "/bin/mayastor");
        assert!(config["config"]["ExposedPorts"]["10124/tcp"].is_object());
        assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_layer_blobs_are_deterministic() {
        let temp = tempfile::tempdir().unwrap();
        let image = sample_image(temp.path());
        let first = export_oci(&image, &temp.path().join("a.tar")).unwrap();
        let second = export_oci(&image, &temp.path().join("b.tar")).unwrap();
        assert_eq!(first.layers, second.layers);
        assert_eq!(first.manifest_digest, second.manifest_digest);
    }

    #[test]
    fn test_streamed_layer_digests() {
        let temp = tempfile::tempdir().unwrap();
        let image = sample_image(temp.path());
        let blobs_dir = temp.path().join("blobs");
        fs::create_dir_all(&blobs_dir).unwrap();

        let layer = &image.layers[0];
        let blob = build_layer(layer, &blobs_dir).unwrap();

        let stored = fs::read(blobs_dir.join(hex_part(&blob.digest))).unwrap();
        assert_eq!(stored.len() as u64, blob.size);
        assert_eq!(blob.digest, format!("sha256:{}", sha256_hex(&stored)));

        let mut tar_data = Vec::new();
        flate2::read::GzDecoder::new(stored.as_slice())
            .read_to_end(&mut tar_data)
            .unwrap();
        assert_eq!(tar_data, write_layer_tar(&layer.entries, Vec::new()).unwrap());
        assert_eq!(blob.diff_id, format!("sha256:{}", sha256_hex(&tar_data)));

        // Only the finished blob is left behind
        assert_eq!(fs::read_dir(&blobs_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_layer_tarball_synthesizes_parents() {
        let entries = vec![
            ContentEntry::inline("/usr/lib/libfoo.so", b"x".to_vec(), 0o644),
            ContentEntry::dir("var/tmp", 0o1777),
        ];
        let data = write_layer_tar(&entries, Vec::new()).unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let listed: Vec<(String, u32)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    e.header().mode().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            listed,
            vec![
                ("usr".to_string(), 0o755),
                ("usr/lib".to_string(), 0o755),
                ("usr/lib/libfoo.so".to_string(), 0o644),
                ("var".to_string(), 0o755),
                ("var/tmp".to_string(), 0o1777),
            ]
        );
    }
}
