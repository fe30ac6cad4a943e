//! A `Store` backed by a plain OCI image-layout directory
//! (`index.json` + `blobs/<algo>/<hex>`), grounded on `peoci::ocidir`'s
//! `digest_path`/`load_layers_from_oci` approach but generalized to serve
//! every digest reachable from the index (manifests, configs, layers) and
//! to emit `Subscribe` events when the directory changes on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cmref::Reference;
use log::{error, warn};
use oci_spec::image::{Arch, Descriptor, Digest, ImageIndex, ImageManifest, Os};
use tokio::sync::{broadcast, RwLock};

use crate::{BoxAsyncRead, Error, Store, StoreEvent};

fn digest_path(d: &Digest) -> PathBuf {
    PathBuf::from(d.to_string().replacen(':', "/", 1))
}

#[derive(Default, Clone)]
struct Snapshot {
    images: Vec<cmref::Image>,
    tags: HashMap<String, Digest>,
    descriptors: HashMap<Digest, Descriptor>,
    /// top-level index digest -> every digest transitively reachable from
    /// it (itself, the platform-selected sub-manifest if any, its config,
    /// and every layer).
    content: HashMap<Digest, Vec<Digest>>,
}

/// Read-only `Store` over an `oci-layout` directory on disk.
pub struct OciDirStore {
    root: PathBuf,
    snapshot: Arc<RwLock<Snapshot>>,
    events: broadcast::Sender<StoreEvent>,
    // keeps the inotify watcher alive for the lifetime of the store
    _watcher: Option<notify::RecommendedWatcher>,
}

impl OciDirStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<OciDirStore>, Error> {
        let root = root.into();
        let snapshot = scan(&root).await?;
        let (events, _) = broadcast::channel(256);
        let store = Arc::new(OciDirStore {
            root,
            snapshot: Arc::new(RwLock::new(snapshot)),
            events,
            _watcher: None,
        });
        store.clone().spawn_watcher();
        Ok(store)
    }

    fn spawn_watcher(self: Arc<Self>) {
        use notify::{RecursiveMode, Watcher};
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        });
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                warn!("ocidir store: could not start filesystem watcher: {e:?}");
                return;
            }
        };
        if let Err(e) = watcher.watch(&self.root, RecursiveMode::Recursive) {
            warn!("ocidir store: could not watch {:?}: {e:?}", self.root);
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            // keep the watcher alive by moving it into this task
            let _watcher = watcher;
            while rx.recv().await.is_some() {
                if let Err(e) = store.refresh().await {
                    error!("ocidir store: refresh after fs event failed: {e:?}");
                }
            }
        });
    }

    async fn refresh(&self) -> Result<(), Error> {
        let new_snapshot = scan(&self.root).await?;
        let mut old = self.snapshot.write().await;

        let old_refs: HashMap<String, &cmref::Image> = old
            .images
            .iter()
            .map(|i| (i.reference().to_string(), i))
            .collect();
        let new_refs: HashMap<String, &cmref::Image> = new_snapshot
            .images
            .iter()
            .map(|i| (i.reference().to_string(), i))
            .collect();

        for (key, image) in &new_refs {
            if !old_refs.contains_key(key) {
                let _ = self.events.send(StoreEvent::Create(image.reference().clone()));
            }
        }
        for (key, image) in &old_refs {
            if !new_refs.contains_key(key) {
                let _ = self.events.send(StoreEvent::Delete(image.reference().clone()));
            }
        }

        *old = new_snapshot;
        Ok(())
    }
}

async fn scan(root: &Path) -> Result<Snapshot, Error> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || scan_blocking(&root))
        .await
        .map_err(|_| Error::Io(std::io::Error::other("scan task panicked")))?
}

fn scan_blocking(root: &Path) -> Result<Snapshot, Error> {
    let index = ImageIndex::from_file(root.join("index.json"))?;
    let blobs = root.join("blobs");

    let mut snapshot = Snapshot::default();

    for top in index.manifests() {
        snapshot
            .descriptors
            .insert(top.digest().clone(), top.clone());

        let name = top
            .annotations()
            .as_ref()
            .and_then(|a| a.get("org.opencontainers.image.ref.name"))
            .cloned();

        let repository = sanitize_repository(name.as_deref().unwrap_or("untagged"));
        let reference_str = format!("local/{repository}@{}", top.digest());
        let reference: Reference = match reference_str.parse() {
            Ok(r) => r,
            Err(e) => {
                warn!("ocidir store: skipping unparseable reference {reference_str}: {e:?}");
                continue;
            }
        };

        match walk_manifest_like(&blobs, top, &mut snapshot) {
            Ok(digests) => {
                snapshot.content.insert(top.digest().clone(), digests);
            }
            Err(e) => {
                warn!(
                    "ocidir store: skipping {} ({}): {e:?}",
                    reference_str,
                    top.digest()
                );
                continue;
            }
        }

        if let Some(name) = name {
            snapshot
                .tags
                .insert(format!("local/{repository}:{name}"), top.digest().clone());
        }

        if let Ok(image) = cmref::Image::new(reference) {
            snapshot.images.push(image);
        }
    }

    Ok(snapshot)
}

/// `descriptor` may point at either an `ImageManifest` or an `ImageIndex`
/// (nested multi-platform list); walk it either way, recording every
/// transitively reachable digest and returning all of them, including
/// `descriptor.digest()` itself.
fn walk_manifest_like(
    blobs: &Path,
    descriptor: &Descriptor,
    snapshot: &mut Snapshot,
) -> Result<Vec<Digest>, Error> {
    let data = std::fs::read(blobs.join(digest_path(descriptor.digest())))?;

    if let Ok(manifest) = ImageManifest::from_reader(data.as_slice()) {
        let mut digests = record_manifest(&manifest, snapshot);
        digests.push(descriptor.digest().clone());
        return Ok(digests);
    }

    let index = ImageIndex::from_reader(data.as_slice())?;
    let (os, arch) = host_platform();
    let matching = select_platform_manifest(&index, os, arch, None);
    match matching {
        Some(sub) => {
            snapshot.descriptors.insert(sub.digest().clone(), sub.clone());
            let mut digests = walk_manifest_like(blobs, sub, snapshot)?;
            digests.push(descriptor.digest().clone());
            Ok(digests)
        }
        None => {
            warn!(
                "ocidir store: index {} has no manifest matching this host's platform",
                descriptor.digest()
            );
            Ok(vec![descriptor.digest().clone()])
        }
    }
}

fn record_manifest(manifest: &ImageManifest, snapshot: &mut Snapshot) -> Vec<Digest> {
    snapshot
        .descriptors
        .insert(manifest.config().digest().clone(), manifest.config().clone());
    let mut digests = vec![manifest.config().digest().clone()];
    for layer in manifest.layers() {
        snapshot.descriptors.insert(layer.digest().clone(), layer.clone());
        digests.push(layer.digest().clone());
    }
    digests
}

/// containerd-style platform match: OS and architecture must match
/// exactly; among equal candidates, an exact variant match wins over no
/// variant or a mismatched one.
fn select_platform_manifest<'a>(
    index: &'a ImageIndex,
    os: Os,
    arch: Arch,
    variant: Option<&str>,
) -> Option<&'a Descriptor> {
    index
        .manifests()
        .iter()
        .filter(|d| {
            d.platform()
                .as_ref()
                .map(|p| *p.os() == os && *p.architecture() == arch)
                .unwrap_or(false)
        })
        .max_by_key(|d| {
            let platform_variant = d.platform().as_ref().and_then(|p| p.variant().clone());
            match (variant, platform_variant.as_deref()) {
                (Some(a), Some(b)) if a == b => 2,
                (None, None) => 1,
                _ => 0,
            }
        })
}

/// The platform this node runs on. Every node in this cluster is a Linux
/// container; the architecture is whatever this binary actually targets.
fn host_platform() -> (Os, Arch) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => Arch::ARM64,
        _ => Arch::Amd64,
    };
    (Os::Linux, arch)
}

fn sanitize_repository(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if s.is_empty() {
        "untagged".to_string()
    } else {
        s
    }
}

#[async_trait]
impl Store for OciDirStore {
    async fn list_images(&self) -> Result<Vec<cmref::Image>, Error> {
        Ok(self.snapshot.read().await.images.clone())
    }

    async fn list_content(&self) -> Result<Vec<Vec<Reference>>, Error> {
        let snapshot = self.snapshot.read().await;
        let mut by_digest: HashMap<String, Vec<Reference>> = HashMap::new();
        for image in &snapshot.images {
            by_digest
                .entry(image.digest().to_string())
                .or_default()
                .push(image.reference().clone());
        }
        Ok(by_digest.into_values().collect())
    }

    async fn content_digests(&self, digest: &Digest) -> Result<Vec<Digest>, Error> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot
            .content
            .get(digest)
            .cloned()
            .unwrap_or_else(|| vec![digest.clone()]))
    }

    async fn resolve(&self, reference: &str) -> Result<Digest, Error> {
        self.snapshot
            .read()
            .await
            .tags
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn descriptor(&self, digest: &Digest) -> Result<Descriptor, Error> {
        self.snapshot
            .read()
            .await
            .descriptors
            .get(digest)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn open(&self, digest: &Digest) -> Result<BoxAsyncRead, Error> {
        let path = self.root.join("blobs").join(digest_path(digest));
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| if e.kind() == std::io::ErrorKind::NotFound { Error::NotFound } else { e.into() })?;
        Ok(Box::pin(file))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_blob(dir: &Path, data: &[u8]) -> Digest {
        use sha2::Digest as _;
        let digest: Digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(data)))
            .parse()
            .unwrap();
        let path = dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&path).unwrap();
        let hex = digest.to_string().split_once(':').unwrap().1.to_string();
        std::fs::File::create(path.join(hex)).unwrap().write_all(data).unwrap();
        digest
    }

    #[tokio::test]
    async fn scans_a_single_manifest_image() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        let config_digest = write_blob(dir, br#"{"architecture":"amd64","os":"linux"}"#);
        let layer_digest = write_blob(dir, b"layer-bytes");

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "size": 38, "digest": config_digest.to_string()},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "size": 11, "digest": layer_digest.to_string()}],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = write_blob(dir, &manifest_bytes);

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": manifest_bytes.len(),
                "digest": manifest_digest.to_string(),
                "annotations": {"org.opencontainers.image.ref.name": "demo"},
            }],
        });
        std::fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        let store = OciDirStore::open(dir).await.unwrap();
        let images = store.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].digest(), &manifest_digest);

        assert!(store.descriptor(&config_digest).await.is_ok());
        assert!(store.descriptor(&layer_digest).await.is_ok());

        let resolved = store.resolve("local/demo:demo").await.unwrap();
        assert_eq!(resolved, manifest_digest);

        let content = store.content_digests(&manifest_digest).await.unwrap();
        assert_eq!(content.len(), 3);
        assert!(content.contains(&manifest_digest));
        assert!(content.contains(&config_digest));
        assert!(content.contains(&layer_digest));
    }

    #[test]
    fn platform_selection_prefers_exact_variant_match() {
        let index_json = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "size": 1,
                    "digest": format!("sha256:{}", "a".repeat(64)),
                    "platform": {"architecture": "arm", "os": "linux", "variant": "v7"},
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "size": 1,
                    "digest": format!("sha256:{}", "b".repeat(64)),
                    "platform": {"architecture": "arm", "os": "linux", "variant": "v8"},
                },
            ],
        });
        let index = ImageIndex::from_reader(serde_json::to_vec(&index_json).unwrap().as_slice()).unwrap();

        let selected = select_platform_manifest(&index, Os::Linux, Arch::ARM, Some("v8")).unwrap();
        assert_eq!(selected.digest().to_string(), format!("sha256:{}", "b".repeat(64)));
    }

    #[test]
    fn platform_selection_returns_none_without_a_match() {
        let index_json = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 1,
                "digest": format!("sha256:{}", "a".repeat(64)),
                "platform": {"architecture": "arm", "os": "linux"},
            }],
        });
        let index = ImageIndex::from_reader(serde_json::to_vec(&index_json).unwrap().as_slice()).unwrap();
        assert!(select_platform_manifest(&index, Os::Linux, Arch::Amd64, None).is_none());
    }
}
