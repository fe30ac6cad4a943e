use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use cmref::Reference;
use oci_spec::image::{Descriptor, Digest, ImageManifest};
use tokio::sync::{broadcast, RwLock};

use crate::{BoxAsyncRead, Error, Store, StoreEvent};

#[derive(Default)]
struct Inner {
    tags: HashMap<String, Digest>,
    blobs: HashMap<Digest, (Descriptor, Vec<u8>)>,
    images: Vec<cmref::Image>,
}

/// An in-memory `Store` used throughout this workspace's test suites.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        MemoryStore {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds content addressable by `digest`, returning the descriptor
    /// stored for it.
    pub async fn put_blob(&self, media_type: &str, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest: Digest = format!("sha256:{}", sha256_hex(&data)).parse().unwrap();
        let descriptor = Descriptor::new(media_type.into(), data.len() as u64, digest.clone());
        self.inner
            .write()
            .await
            .blobs
            .insert(digest.clone(), (descriptor, data));
        digest
    }

    /// Registers `reference` as an image (tag or digest) pointing at
    /// `digest`, and fires a `Create` event.
    pub async fn put_image(&self, reference: Reference, digest: Digest) {
        let mut inner = self.inner.write().await;
        if let Some(tag) = reference.tag() {
            inner.tags.insert(
                format!("{}/{}:{}", reference.resolve_registry(), reference.repository(), tag),
                digest.clone(),
            );
        }
        let image_ref = reference.clone_with_digest(digest.to_string());
        let image = cmref::Image::new(image_ref.clone()).expect("constructed with digest");
        inner.images.push(image);
        let _ = self.events.send(StoreEvent::Create(image_ref));
    }

    pub async fn remove_image(&self, reference: Reference) {
        let mut inner = self.inner.write().await;
        inner
            .images
            .retain(|img| img.reference().to_string() != reference.to_string());
        let _ = self.events.send(StoreEvent::Delete(reference));
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest as _;
    hex::encode(sha2::Sha256::digest(data))
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_images(&self) -> Result<Vec<cmref::Image>, Error> {
        Ok(self.inner.read().await.images.clone())
    }

    async fn list_content(&self) -> Result<Vec<Vec<Reference>>, Error> {
        let inner = self.inner.read().await;
        let mut by_digest: HashMap<String, Vec<Reference>> = HashMap::new();
        for image in &inner.images {
            by_digest
                .entry(image.digest().to_string())
                .or_default()
                .push(image.reference().clone());
        }
        Ok(by_digest.into_values().collect())
    }

    /// `MemoryStore` has no separate index of config/layer relationships;
    /// if the blob at `digest` parses as a manifest, its config and layers
    /// are returned alongside it, otherwise just `digest` itself.
    async fn content_digests(&self, digest: &Digest) -> Result<Vec<Digest>, Error> {
        let inner = self.inner.read().await;
        let Some((_, data)) = inner.blobs.get(digest) else {
            return Ok(vec![digest.clone()]);
        };
        match ImageManifest::from_reader(data.as_slice()) {
            Ok(manifest) => {
                let mut digests = vec![digest.clone(), manifest.config().digest().clone()];
                digests.extend(manifest.layers().iter().map(|l| l.digest().clone()));
                Ok(digests)
            }
            Err(_) => Ok(vec![digest.clone()]),
        }
    }

    async fn resolve(&self, reference: &str) -> Result<Digest, Error> {
        self.inner
            .read()
            .await
            .tags
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn descriptor(&self, digest: &Digest) -> Result<Descriptor, Error> {
        self.inner
            .read()
            .await
            .blobs
            .get(digest)
            .map(|(d, _)| d.clone())
            .ok_or(Error::NotFound)
    }

    async fn open(&self, digest: &Digest) -> Result<BoxAsyncRead, Error> {
        let data = self
            .inner
            .read()
            .await
            .blobs
            .get(digest)
            .map(|(_, data)| data.clone())
            .ok_or(Error::NotFound)?;
        Ok(Box::pin(Cursor::new(data)))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_resolve_roundtrip() {
        let store = MemoryStore::new();
        let digest = store.put_blob("application/vnd.oci.image.manifest.v1+json", b"{}".to_vec()).await;
        let reference: Reference = format!("ghcr.io/example/app:v1@{digest}").parse().unwrap();
        store.put_image(reference, digest.clone()).await;

        let resolved = store.resolve("ghcr.io/example/app:v1").await.unwrap();
        assert_eq!(resolved, digest);

        let descriptor = store.descriptor(&digest).await.unwrap();
        assert_eq!(descriptor.digest(), &digest);
    }

    #[tokio::test]
    async fn content_digests_expands_a_manifest() {
        let store = MemoryStore::new();
        let config_digest = store.put_blob("application/vnd.oci.image.config.v1+json", br#"{}"#.to_vec()).await;
        let layer_digest = store.put_blob("application/vnd.oci.image.layer.v1.tar", b"layer".to_vec()).await;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "size": 2, "digest": config_digest.to_string()},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "size": 5, "digest": layer_digest.to_string()}],
        });
        let manifest_digest = store
            .put_blob("application/vnd.oci.image.manifest.v1+json", serde_json::to_vec(&manifest).unwrap())
            .await;

        let content = store.content_digests(&manifest_digest).await.unwrap();
        assert_eq!(content.len(), 3);
        assert!(content.contains(&manifest_digest));
        assert!(content.contains(&config_digest));
        assert!(content.contains(&layer_digest));
    }

    #[tokio::test]
    async fn content_digests_of_a_plain_blob_is_itself() {
        let store = MemoryStore::new();
        let digest = store.put_blob("application/vnd.oci.image.layer.v1.tar", b"layer".to_vec()).await;
        assert_eq!(store.content_digests(&digest).await.unwrap(), vec![digest]);
    }

    #[tokio::test]
    async fn missing_tag_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.resolve("ghcr.io/nope:latest").await,
            Err(Error::NotFound)
        ));
    }
}
