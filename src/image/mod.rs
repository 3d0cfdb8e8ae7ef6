//! Image store: OCI pulls into a content-addressed layout, plus the
//! operations the orchestrator derives from it (unpack, config extraction,
//! base ext4 images).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ImageStore (ImageService)                                  │
//! │  ├── pull()               registry → layout (pull.rs)       │
//! │  ├── get()                layout → StoredImage view         │
//! │  ├── unpack()             ordered layers → tree (unpack.rs) │
//! │  ├── config()             config blob → entrypoint/cmd      │
//! │  ├── create_base_image()  tree → ext4 file (ext4.rs)        │
//! │  └── delete()             remove the layout                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ImageLayout (layout.rs)                                    │
//! │  oci-layout │ index.json │ blobs/sha256/<hex>               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! An in-flight pull on a ref serializes with any concurrent pull or unpack
//! on the same ref through a per-ref async lock; distinct refs proceed in
//! parallel. Reads never take the lock: the layout is only ever replaced
//! atomically, so the store stays readable for other refs while one pull is
//! in flight.

mod ext4;
pub mod layout;
mod pull;
pub mod unpack;

pub use layout::{ImageConfig, ImageLayout};

use crate::constants::REF_NAME_ANNOTATION;
use crate::error::{Error, Result};
use async_trait::async_trait;
use layout::{sanitize_ref, validate_ref};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

// =============================================================================
// Views
// =============================================================================

/// Metadata about one stored layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Layer digest.
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Media type (decides decompression during unpack).
    pub media_type: String,
}

/// In-memory view of a stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    /// Original reference.
    pub reference: String,
    /// Digest of the (platform-resolved) manifest.
    pub manifest_digest: String,
    /// Digest of the config blob.
    pub config_digest: String,
    /// Layers in application order, bottom to top.
    pub layers: Vec<LayerInfo>,
}

// =============================================================================
// Service Trait
// =============================================================================

/// Image management operations consumed by the VM controller and the rootfs
/// provisioner.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Pulls an image, or returns the stored view without network access if
    /// it is already local.
    async fn pull(&self, reference: &str) -> Result<StoredImage>;

    /// Returns the stored view, or [`Error::ImageNotFound`].
    async fn get(&self, reference: &str) -> Result<StoredImage>;

    /// Applies the image's layers in order to `dest`.
    async fn unpack(&self, reference: &str, dest: &Path) -> Result<()>;

    /// Reads the image's runtime config (entrypoint, cmd, …).
    async fn config(&self, reference: &str) -> Result<ImageConfig>;

    /// Produces (or reuses) the shared read-only ext4 base image for this
    /// reference. Idempotent per reference.
    async fn create_base_image(&self, reference: &str) -> Result<PathBuf>;

    /// Removes the stored layout for this reference.
    async fn delete(&self, reference: &str) -> Result<()>;
}

// =============================================================================
// Store
// =============================================================================

/// The on-disk image store: one OCI Image Layout per reference.
pub struct ImageStore {
    image_dir: PathBuf,
    ref_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageStore {
    /// Opens the store rooted at `image_dir`, creating it if needed.
    pub fn new(image_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&image_dir).map_err(Error::from_store_io)?;
        Ok(Self {
            image_dir,
            ref_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the store root.
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    fn ref_lock(&self, reference: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.ref_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(reference.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn layout_root(&self, reference: &str) -> PathBuf {
        self.image_dir.join(sanitize_ref(reference))
    }

    fn open_layout(&self, reference: &str) -> Result<ImageLayout> {
        ImageLayout::open(self.layout_root(reference)).ok_or_else(|| Error::ImageNotFound {
            reference: reference.to_string(),
        })
    }

    /// Loads the stored view for a reference without taking the ref lock.
    fn load_view(&self, reference: &str) -> Result<StoredImage> {
        let layout = self.open_layout(reference)?;
        let index = layout.index()?;

        let descriptor = index
            .manifests
            .iter()
            .find(|m| {
                m.annotations
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .is_some_and(|name| name == reference)
            })
            .or_else(|| index.manifests.first())
            .ok_or_else(|| Error::ImageNotFound {
                reference: reference.to_string(),
            })?;

        let manifest = layout.read_manifest(&descriptor.digest)?;
        Ok(StoredImage {
            reference: reference.to_string(),
            manifest_digest: descriptor.digest.clone(),
            config_digest: manifest.config.digest,
            layers: manifest
                .layers
                .into_iter()
                .map(|l| LayerInfo {
                    digest: l.digest,
                    size: l.size,
                    media_type: l.media_type,
                })
                .collect(),
        })
    }

    /// Applies the view's layers to `dest`. Caller holds the ref lock.
    fn unpack_inner(&self, view: &StoredImage, dest: &Path) -> Result<()> {
        let layout = self.open_layout(&view.reference)?;
        fs::create_dir_all(dest).map_err(Error::from_store_io)?;

        for layer in &view.layers {
            debug!(digest = %layer.digest, "extracting layer");
            let blob = layout.open_blob(&layer.digest)?;
            unpack::extract_layer_blob(blob, &layer.media_type, dest)?;
        }
        Ok(())
    }

    fn base_image_path(&self, reference: &str) -> PathBuf {
        let name = reference.replace(['/', ':', '.'], "_");
        self.image_dir.join("base").join(format!("{name}.ext4"))
    }
}

#[async_trait]
impl ImageService for ImageStore {
    async fn pull(&self, reference: &str) -> Result<StoredImage> {
        validate_ref(reference)?;
        let lock = self.ref_lock(reference);
        let _guard = lock.lock().await;

        if let Ok(view) = self.load_view(reference) {
            debug!(reference, "image already stored, skipping network");
            return Ok(view);
        }

        pull::pull_image(reference, &self.layout_root(reference)).await
    }

    async fn get(&self, reference: &str) -> Result<StoredImage> {
        validate_ref(reference)?;
        self.load_view(reference)
    }

    async fn unpack(&self, reference: &str, dest: &Path) -> Result<()> {
        validate_ref(reference)?;
        let lock = self.ref_lock(reference);
        let _guard = lock.lock().await;

        let view = self.load_view(reference)?;
        info!(reference, dest = %dest.display(), layers = view.layers.len(), "unpacking image");
        self.unpack_inner(&view, dest)
    }

    async fn config(&self, reference: &str) -> Result<ImageConfig> {
        validate_ref(reference)?;
        let view = self.load_view(reference)?;
        self.open_layout(reference)?.read_config(&view.config_digest)
    }

    async fn create_base_image(&self, reference: &str) -> Result<PathBuf> {
        validate_ref(reference)?;
        let base_path = self.base_image_path(reference);
        if base_path.exists() {
            debug!(reference, base = %base_path.display(), "base image already exists");
            return Ok(base_path);
        }

        let lock = self.ref_lock(reference);
        let _guard = lock.lock().await;

        let view = self.load_view(reference)?;
        let temp_dir = self
            .image_dir
            .join("temp")
            .join(base_path.file_stem().unwrap_or_default());
        fs::create_dir_all(&temp_dir).map_err(Error::from_store_io)?;

        let result = self
            .unpack_inner(&view, &temp_dir)
            .and_then(|()| ext4::create_ext4_from_dir(&temp_dir, &base_path));
        let _ = fs::remove_dir_all(&temp_dir);
        result?;

        Ok(base_path)
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        validate_ref(reference)?;
        let lock = self.ref_lock(reference);
        let _guard = lock.lock().await;

        let root = self.layout_root(reference);
        if !root.exists() {
            return Err(Error::ImageNotFound {
                reference: reference.to_string(),
            });
        }
        fs::remove_dir_all(&root).map_err(Error::from_store_io)?;
        info!(reference, "image deleted");
        Ok(())
    }
}
