//! Registry pulls into the local layout.
//!
//! Fetches a manifest (resolving multi-arch indexes to the host platform),
//! then the config and layer blobs, verifying every blob against its digest
//! before it lands in the layout. All network operations are bounded by
//! [`IMAGE_PULL_TIMEOUT`]; network failures surface as
//! [`Error::RegistryUnavailable`] and digest mismatches poison the partial
//! layout so the caller can retry a clean pull.
//!
//! [`IMAGE_PULL_TIMEOUT`]: crate::constants::IMAGE_PULL_TIMEOUT

use crate::constants::{
    IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE, MAX_LAYERS, MAX_LAYER_SIZE, MAX_MANIFEST_SIZE,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE, REF_NAME_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::image::layout::{sanitize_ref, validate_ref, Descriptor, ImageLayout, ImageManifest};
use crate::image::{LayerInfo, StoredImage};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use tracing::{debug, info};

/// Manifest media types accepted from the registry. Docker types are still
/// what most public registries serve.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

// Minimal index shapes for platform resolution.
#[derive(Deserialize)]
struct RawIndex {
    manifests: Vec<RawIndexEntry>,
}

#[derive(Deserialize)]
struct RawIndexEntry {
    digest: String,
    platform: Option<RawPlatform>,
}

#[derive(Deserialize)]
struct RawPlatform {
    os: String,
    architecture: String,
}

/// Pulls an image from its registry into a fresh layout at `layout_root`.
///
/// Returns the stored view. On an integrity failure the partial layout is
/// removed before the error is returned.
pub async fn pull_image(reference_str: &str, layout_root: &Path) -> Result<StoredImage> {
    validate_ref(reference_str)?;

    let reference: Reference = reference_str.parse().map_err(|e| Error::InvalidRef {
        reference: reference_str.to_string(),
        reason: format!("{e}"),
    })?;

    info!(reference = reference_str, "pulling image");

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let result = pull_into_layout(&client, &reference, &auth, reference_str, layout_root).await;
    if matches!(result, Err(Error::IntegrityError { .. })) {
        // A mismatched blob poisons the whole layout; leave nothing behind.
        let _ = std::fs::remove_dir_all(layout_root);
    }
    result
}

async fn pull_into_layout(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    reference_str: &str,
    layout_root: &Path,
) -> Result<StoredImage> {
    let manifest_bytes = fetch_platform_manifest(client, reference, auth, reference_str).await?;
    if manifest_bytes.len() > MAX_MANIFEST_SIZE {
        return Err(Error::RegistryUnavailable {
            reference: reference_str.to_string(),
            reason: format!("manifest exceeds {MAX_MANIFEST_SIZE} bytes"),
        });
    }

    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
    let manifest_digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest_bytes)));

    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::RegistryUnavailable {
            reference: reference_str.to_string(),
            reason: format!("too many layers: {} > {MAX_LAYERS}", manifest.layers.len()),
        });
    }
    if manifest.config.size as usize > MAX_CONFIG_SIZE {
        return Err(Error::RegistryUnavailable {
            reference: reference_str.to_string(),
            reason: format!("config blob exceeds {MAX_CONFIG_SIZE} bytes"),
        });
    }

    let layout = ImageLayout::create(layout_root.to_path_buf())?;

    // Config blob.
    if !layout.has_blob(&manifest.config.digest) {
        let data = fetch_blob(client, reference, reference_str, &manifest.config).await?;
        layout.put_blob(&manifest.config.digest, &data)?;
    }

    // Layer blobs, in order.
    for layer in &manifest.layers {
        if layer.size > MAX_LAYER_SIZE {
            return Err(Error::RegistryUnavailable {
                reference: reference_str.to_string(),
                reason: format!("layer {} exceeds {MAX_LAYER_SIZE} bytes", layer.digest),
            });
        }
        if layout.has_blob(&layer.digest) {
            debug!(digest = %layer.digest, "layer already stored");
            continue;
        }
        let data = fetch_blob(client, reference, reference_str, layer).await?;
        layout.put_blob(&layer.digest, &data)?;
    }

    // The manifest itself, then its index entry.
    layout.put_blob(&manifest_digest, &manifest_bytes)?;
    layout.append_manifest(Descriptor {
        media_type: manifest
            .media_type
            .clone()
            .unwrap_or_else(|| OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
        digest: manifest_digest.clone(),
        size: manifest_bytes.len() as u64,
        annotations: Some(
            [(REF_NAME_ANNOTATION.to_string(), reference_str.to_string())]
                .into_iter()
                .collect(),
        ),
    })?;

    info!(
        reference = reference_str,
        digest = %manifest_digest,
        layers = manifest.layers.len(),
        "image stored"
    );

    Ok(StoredImage {
        reference: reference_str.to_string(),
        manifest_digest,
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

/// Fetches the manifest for the host platform, following one level of
/// multi-arch index indirection.
async fn fetch_platform_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    reference_str: &str,
) -> Result<Vec<u8>> {
    let (bytes, _digest) = with_pull_timeout(
        reference_str,
        "pull manifest",
        client.pull_manifest_raw(reference, auth, MANIFEST_MEDIA_TYPES),
    )
    .await?;

    // An index carries `manifests`; an image manifest carries `layers`.
    let probe: serde_json::Value = serde_json::from_slice(&bytes)?;
    if probe.get("manifests").is_none() {
        return Ok(bytes);
    }

    let index: RawIndex = serde_json::from_slice(&bytes)?;
    let arch = host_arch();
    let entry = index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            Error::RegistryUnavailable {
                reference: reference_str.to_string(),
                reason: format!(
                    "no manifest for linux/{arch}; available: {}",
                    available.join(", ")
                ),
            }
        })?;

    let digest_ref: Reference = format!(
        "{}/{}@{}",
        reference.registry(),
        reference.repository(),
        entry.digest
    )
    .parse()
    .map_err(|e| Error::RegistryUnavailable {
        reference: reference_str.to_string(),
        reason: format!("failed to build digest reference: {e}"),
    })?;

    let (bytes, _digest) = with_pull_timeout(
        reference_str,
        "pull platform manifest",
        client.pull_manifest_raw(&digest_ref, auth, MANIFEST_MEDIA_TYPES),
    )
    .await?;
    Ok(bytes)
}

async fn fetch_blob(
    client: &Client,
    reference: &Reference,
    reference_str: &str,
    descriptor: &Descriptor,
) -> Result<Vec<u8>> {
    debug!(digest = %descriptor.digest, size = descriptor.size, "pulling blob");

    let oci_desc = OciDescriptor {
        digest: descriptor.digest.clone(),
        size: descriptor.size as i64,
        media_type: descriptor.media_type.clone(),
        urls: None,
        annotations: None,
    };

    let mut data = Vec::with_capacity(descriptor.size as usize);
    with_pull_timeout(
        reference_str,
        "pull blob",
        client.pull_blob(reference, &oci_desc, &mut data),
    )
    .await?;
    Ok(data)
}

/// Wraps a registry future with the pull timeout, mapping both the timeout
/// and the transport error to [`Error::RegistryUnavailable`].
async fn with_pull_timeout<T, E, F>(reference: &str, operation: &str, fut: F) -> Result<T>
where
    E: std::fmt::Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, fut)
        .await
        .map_err(|_| Error::RegistryUnavailable {
            reference: reference.to_string(),
            reason: format!("{operation} timed out after {IMAGE_PULL_TIMEOUT:?}"),
        })?
        .map_err(|e| Error::RegistryUnavailable {
            reference: reference.to_string(),
            reason: format!("{operation}: {e}"),
        })
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Layout directory for a reference under the image store root.
pub fn layout_root(image_dir: &Path, reference: &str) -> std::path::PathBuf {
    image_dir.join(sanitize_ref(reference))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_arch_is_a_known_oci_arch() {
        assert!(["amd64", "arm64", "arm", "riscv64"].contains(&host_arch()));
    }

    #[test]
    fn layout_root_is_ref_keyed() {
        let root = layout_root(Path::new("/var/images"), "library/alpine:latest");
        assert_eq!(
            root,
            Path::new("/var/images/library_alpine_latest")
        );
    }
}
