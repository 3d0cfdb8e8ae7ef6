//! On-disk OCI Image Layout.
//!
//! Each stored image is a self-contained layout directory, interoperable
//! with any conformant implementation:
//!
//! ```text
//! images/<sanitized-ref>/
//! ├── oci-layout            {"imageLayoutVersion":"1.0.0"}
//! ├── index.json            descriptors of the stored manifests
//! └── blobs/
//!     └── sha256/
//!         └── <hex>         manifests, configs, and layers
//! ```
//!
//! Blob writes are verified against their digest before landing and are
//! atomic (temp sibling + rename), so a crash can never leave a corrupt
//! blob in place.

use crate::constants::{MAX_IMAGE_REF_LEN, OCI_LAYOUT_VERSION};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Layout JSON Types
// =============================================================================

/// Top-level `oci-layout` marker document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

/// Content descriptor, as used by the index and manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// `index.json`: the manifests stored in this layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    fn empty() -> Self {
        Self {
            schema_version: 2,
            manifests: Vec::new(),
        }
    }
}

/// An image manifest blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// The subset of the OCI image config blob the orchestrator consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
}

/// Runtime section of the image config: how the image wants to be run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
}

impl ImageConfig {
    /// Derives the default process arguments: entrypoint ++ cmd.
    pub fn process_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            if let Some(entrypoint) = &config.entrypoint {
                args.extend(entrypoint.iter().cloned());
            }
            if let Some(cmd) = &config.cmd {
                args.extend(cmd.iter().cloned());
            }
        }
        args
    }
}

// =============================================================================
// Layout Directory
// =============================================================================

/// Handle to one layout directory.
pub struct ImageLayout {
    root: PathBuf,
}

impl ImageLayout {
    /// Creates a fresh layout (marker + empty index) at `root`, or opens the
    /// existing one.
    pub fn create(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("blobs").join("sha256")).map_err(Error::from_store_io)?;

        let marker_path = root.join("oci-layout");
        if !marker_path.exists() {
            let marker = LayoutMarker {
                image_layout_version: OCI_LAYOUT_VERSION.to_string(),
            };
            fs::write(&marker_path, serde_json::to_vec(&marker)?)
                .map_err(Error::from_store_io)?;
        }

        let index_path = root.join("index.json");
        if !index_path.exists() {
            fs::write(&index_path, serde_json::to_vec(&ImageIndex::empty())?)
                .map_err(Error::from_store_io)?;
        }

        Ok(Self { root })
    }

    /// Opens an existing layout. Fails if the marker file is absent.
    pub fn open(root: PathBuf) -> Option<Self> {
        if root.join("oci-layout").exists() {
            Some(Self { root })
        } else {
            None
        }
    }

    /// Returns the layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path a blob with this digest would occupy. The digest is
    /// validated so a crafted value cannot traverse out of the layout.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = parse_sha256_digest(digest)?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Reads a blob.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::IntegrityError {
                digest: digest.to_string(),
                reason: "blob missing from layout".to_string(),
            },
            _ => Error::from_store_io(e),
        })
    }

    /// Opens a blob for streaming reads.
    pub fn open_blob(&self, digest: &str) -> Result<fs::File> {
        let path = self.blob_path(digest)?;
        fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::IntegrityError {
                digest: digest.to_string(),
                reason: "blob missing from layout".to_string(),
            },
            _ => Error::from_store_io(e),
        })
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// The write is atomic: content lands under a temp sibling and is
    /// renamed into place, so concurrent writers of the same (identical)
    /// blob cannot corrupt each other.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let expected = parse_sha256_digest(digest)?;
        let computed = hex::encode(Sha256::digest(data));
        if computed != expected {
            return Err(Error::IntegrityError {
                digest: digest.to_string(),
                reason: format!("content hashed to sha256:{computed}"),
            });
        }

        let path = self.blob_path(digest)?;
        if path.exists() {
            debug!(digest, "blob already stored");
            return Ok(());
        }

        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&temp_path, data).map_err(Error::from_store_io)?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::from_store_io(e)
        })?;

        debug!(digest, bytes = data.len(), "stored blob");
        Ok(())
    }

    /// Reads `index.json`.
    pub fn index(&self) -> Result<ImageIndex> {
        let data = fs::read(self.root.join("index.json")).map_err(Error::from_store_io)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Appends a manifest descriptor to `index.json` (atomically replaced).
    pub fn append_manifest(&self, descriptor: Descriptor) -> Result<()> {
        let mut index = self.index()?;
        index.manifests.retain(|m| m.digest != descriptor.digest);
        index.manifests.push(descriptor);

        let index_path = self.root.join("index.json");
        let temp_path = index_path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_vec(&index)?).map_err(Error::from_store_io)?;
        fs::rename(&temp_path, &index_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::from_store_io(e)
        })
    }

    /// Reads and parses a manifest blob.
    pub fn read_manifest(&self, digest: &str) -> Result<ImageManifest> {
        Ok(serde_json::from_slice(&self.get_blob(digest)?)?)
    }

    /// Reads and parses a config blob.
    pub fn read_config(&self, digest: &str) -> Result<ImageConfig> {
        Ok(serde_json::from_slice(&self.get_blob(digest)?)?)
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Splits and validates a `sha256:<hex>` digest, returning the hex part.
fn parse_sha256_digest(digest: &str) -> Result<&str> {
    let hex = digest.strip_prefix("sha256:").ok_or_else(|| Error::IntegrityError {
        digest: digest.to_string(),
        reason: "unsupported digest algorithm".to_string(),
    })?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::IntegrityError {
            digest: digest.to_string(),
            reason: "digest is not hexadecimal".to_string(),
        });
    }
    Ok(hex)
}

/// Converts an image reference into a safe directory name.
pub fn sanitize_ref(reference: &str) -> String {
    reference.replace(['/', ':'], "_")
}

/// Validates a caller-supplied reference before it reaches the parser.
pub fn validate_ref(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidRef {
            reference: reference.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidRef {
            reference: reference.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds maximum length of {MAX_IMAGE_REF_LEN} bytes"),
        });
    }
    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidRef {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_writes_marker_and_index() {
        let temp = TempDir::new().unwrap();
        let layout = ImageLayout::create(temp.path().join("img")).unwrap();

        let marker: LayoutMarker = serde_json::from_slice(
            &fs::read(layout.root().join("oci-layout")).unwrap(),
        )
        .unwrap();
        assert_eq!(marker.image_layout_version, "1.0.0");
        assert!(layout.index().unwrap().manifests.is_empty());
    }

    #[test]
    fn blob_roundtrip_verifies_content() {
        let temp = TempDir::new().unwrap();
        let layout = ImageLayout::create(temp.path().join("img")).unwrap();

        let data = b"layer bytes";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        layout.put_blob(&digest, data).unwrap();
        assert!(layout.has_blob(&digest));
        assert_eq!(layout.get_blob(&digest).unwrap(), data);

        let wrong = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert!(matches!(
            layout.put_blob(wrong, data),
            Err(Error::IntegrityError { .. })
        ));
    }

    #[test]
    fn digest_validation_blocks_traversal() {
        let temp = TempDir::new().unwrap();
        let layout = ImageLayout::create(temp.path().join("img")).unwrap();
        assert!(layout.blob_path("sha256:../../etc/passwd").is_err());
        assert!(layout.blob_path("md5:abcd").is_err());
        assert!(layout.blob_path("sha256:").is_err());
    }

    #[test]
    fn sanitize_ref_flattens_separators() {
        assert_eq!(sanitize_ref("library/alpine:latest"), "library_alpine_latest");
        assert_eq!(
            sanitize_ref("ghcr.io/foo/bar:v1"),
            "ghcr.io_foo_bar_v1"
        );
    }

    #[test]
    fn validate_ref_rejects_bad_input() {
        assert!(validate_ref("").is_err());
        assert!(validate_ref("bad image").is_err());
        assert!(validate_ref(&"a".repeat(600)).is_err());
        assert!(validate_ref("library/alpine:latest").is_ok());
    }

    #[test]
    fn process_args_concatenates_entrypoint_and_cmd() {
        let config: ImageConfig = serde_json::from_str(
            r#"{"config":{"Entrypoint":["/docker-entrypoint.sh"],"Cmd":["nginx","-g","daemon off;"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.process_args(),
            vec!["/docker-entrypoint.sh", "nginx", "-g", "daemon off;"]
        );

        let empty: ImageConfig = serde_json::from_str("{}").unwrap();
        assert!(empty.process_args().is_empty());
    }
}
