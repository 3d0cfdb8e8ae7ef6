//! Tests for the image store over synthetic OCI layouts.
//!
//! A complete layout (marker, index, manifest, config, gzipped layers) is
//! fabricated on disk so store operations are exercised end to end without
//! any registry traffic.

use flate2::write::GzEncoder;
use flate2::Compression;
use micropod::constants::{
    OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE_GZIP,
    REF_NAME_ANNOTATION,
};
use micropod::image::layout::{sanitize_ref, Descriptor, ImageIndex, ImageLayout, ImageManifest};
use micropod::image::{ImageService, ImageStore};
use micropod::Error;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

// =============================================================================
// Fixture
// =============================================================================

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn gz_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, *path, *data).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// Writes a conformant layout for `reference` under `image_dir` and returns
/// the manifest digest.
fn seed_image(
    image_dir: &Path,
    reference: &str,
    layers: &[Vec<u8>],
    config_json: &str,
) -> String {
    let layout = ImageLayout::create(image_dir.join(sanitize_ref(reference))).unwrap();

    let config_bytes = config_json.as_bytes();
    let config_digest = digest_of(config_bytes);
    layout.put_blob(&config_digest, config_bytes).unwrap();

    let mut layer_descriptors = Vec::new();
    for layer in layers {
        let digest = digest_of(layer);
        layout.put_blob(&digest, layer).unwrap();
        layer_descriptors.push(Descriptor {
            media_type: OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
            digest,
            size: layer.len() as u64,
            annotations: None,
        });
    }

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
        config: Descriptor {
            media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_bytes.len() as u64,
            annotations: None,
        },
        layers: layer_descriptors,
    };
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    let manifest_digest = digest_of(&manifest_bytes);
    layout.put_blob(&manifest_digest, &manifest_bytes).unwrap();
    layout
        .append_manifest(Descriptor {
            media_type: OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
            digest: manifest_digest.clone(),
            size: manifest_bytes.len() as u64,
            annotations: Some(
                [(REF_NAME_ANNOTATION.to_string(), reference.to_string())]
                    .into_iter()
                    .collect(),
            ),
        })
        .unwrap();

    manifest_digest
}

const ALPINE_CONFIG: &str = r#"{
  "architecture": "amd64",
  "os": "linux",
  "config": {
    "Entrypoint": ["/docker-entrypoint.sh"],
    "Cmd": ["sh"],
    "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"]
  }
}"#;

// =============================================================================
// Get
// =============================================================================

#[tokio::test]
async fn get_returns_the_stored_view() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();

    let layer = gz_layer(&[("bin/sh", b"#!")]);
    let manifest_digest = seed_image(store.image_dir(), "library/alpine:latest", &[layer.clone()], ALPINE_CONFIG);

    let view = store.get("library/alpine:latest").await.unwrap();
    assert_eq!(view.reference, "library/alpine:latest");
    assert_eq!(view.manifest_digest, manifest_digest);
    assert_eq!(view.layers.len(), 1);
    assert_eq!(view.layers[0].digest, digest_of(&layer));
    assert_eq!(view.layers[0].media_type, OCI_LAYER_MEDIA_TYPE_GZIP);
}

#[tokio::test]
async fn get_unknown_ref_is_not_found() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
    assert!(matches!(
        store.get("nobody/nothing:none").await,
        Err(Error::ImageNotFound { .. })
    ));
}

// =============================================================================
// Unpack
// =============================================================================

#[tokio::test]
async fn unpack_applies_layers_in_order() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().join("images")).unwrap();

    let layers = vec![
        gz_layer(&[("bin/sh", b"v1"), ("etc-motd", b"hello")]),
        gz_layer(&[("bin/sh", b"v2")]),
    ];
    seed_image(store.image_dir(), "library/alpine:latest", &layers, ALPINE_CONFIG);

    let dest = temp.path().join("rootfs");
    store.unpack("library/alpine:latest", &dest).await.unwrap();

    assert_eq!(fs::read(dest.join("bin/sh")).unwrap(), b"v2");
    assert_eq!(fs::read(dest.join("etc-motd")).unwrap(), b"hello");
}

#[tokio::test]
async fn unpack_of_zero_layer_image_is_empty_but_valid() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().join("images")).unwrap();
    seed_image(store.image_dir(), "empty/image:latest", &[], "{}");

    let dest = temp.path().join("rootfs");
    store.unpack("empty/image:latest", &dest).await.unwrap();

    assert!(dest.is_dir());
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
}

#[tokio::test]
async fn unpack_into_two_destinations_is_identical() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().join("images")).unwrap();

    let layers = vec![gz_layer(&[("a", b"1"), ("b", b"2"), ("dir/c", b"3")])];
    seed_image(store.image_dir(), "det/image:1", &layers, "{}");

    let one = temp.path().join("one");
    let two = temp.path().join("two");
    store.unpack("det/image:1", &one).await.unwrap();
    store.unpack("det/image:1", &two).await.unwrap();

    let list = |root: &Path| {
        let mut files = Vec::new();
        collect(root, root, &mut files);
        files.sort();
        files
    };
    assert_eq!(list(&one), list(&two));
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, out);
        } else {
            out.push((
                path.strip_prefix(root).unwrap().to_string_lossy().into_owned(),
                fs::read(&path).unwrap(),
            ));
        }
    }
}

// =============================================================================
// Config Extraction
// =============================================================================

#[tokio::test]
async fn config_yields_entrypoint_and_cmd() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
    seed_image(store.image_dir(), "library/nginx:latest", &[], ALPINE_CONFIG);

    let config = store.config("library/nginx:latest").await.unwrap();
    assert_eq!(
        config.process_args(),
        vec!["/docker-entrypoint.sh".to_string(), "sh".to_string()]
    );
}

#[tokio::test]
async fn config_without_process_section_yields_no_args() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
    seed_image(store.image_dir(), "bare/image:1", &[], "{}");

    let config = store.config("bare/image:1").await.unwrap();
    assert!(config.process_args().is_empty());
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn delete_removes_the_layout_and_get_fails_after() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
    seed_image(store.image_dir(), "library/alpine:latest", &[], "{}");

    store.delete("library/alpine:latest").await.unwrap();
    assert!(!store.image_dir().join(sanitize_ref("library/alpine:latest")).exists());
    assert!(matches!(
        store.get("library/alpine:latest").await,
        Err(Error::ImageNotFound { .. })
    ));

    // Deleting again reports the absence.
    assert!(matches!(
        store.delete("library/alpine:latest").await,
        Err(Error::ImageNotFound { .. })
    ));
}

// =============================================================================
// Layout Interoperability
// =============================================================================

#[tokio::test]
async fn seeded_layout_is_conformant() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
    seed_image(store.image_dir(), "library/alpine:latest", &[gz_layer(&[("f", b"x")])], "{}");

    let root = store.image_dir().join(sanitize_ref("library/alpine:latest"));

    let marker: serde_json::Value =
        serde_json::from_slice(&fs::read(root.join("oci-layout")).unwrap()).unwrap();
    assert_eq!(marker["imageLayoutVersion"], "1.0.0");

    let index: ImageIndex =
        serde_json::from_slice(&fs::read(root.join("index.json")).unwrap()).unwrap();
    assert_eq!(index.schema_version, 2);
    assert_eq!(index.manifests.len(), 1);
    let annotations = index.manifests[0].annotations.as_ref().unwrap();
    assert_eq!(annotations[REF_NAME_ANNOTATION], "library/alpine:latest");

    // Every referenced blob is present, content-addressed.
    for entry in fs::read_dir(root.join("blobs/sha256")).unwrap() {
        let path = entry.unwrap().path();
        let data = fs::read(&path).unwrap();
        let expected = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(hex::encode(Sha256::digest(&data)), expected);
    }
}

// =============================================================================
// Integrity
// =============================================================================

#[tokio::test]
async fn corrupted_blob_digests_are_rejected() {
    let temp = TempDir::new().unwrap();
    let layout = ImageLayout::create(temp.path().join("img")).unwrap();

    let wrong = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    assert!(matches!(
        layout.put_blob(wrong, b"anything"),
        Err(Error::IntegrityError { .. })
    ));
    assert!(
        !layout.has_blob(wrong),
        "rejected blobs must not be stored"
    );
}
