//! The `Store` abstraction (spec.md §4.5): a read-only view of the node's
//! local content. The spec treats concrete backends (containerd, CRI-O) as
//! external collaborators; this crate carries only the trait plus two
//! in-tree adapters so the rest of the workspace is runnable standalone:
//! `MemoryStore` for tests and `OciDirStore` for a plain OCI image-layout
//! directory, grounded on `peoci::ocidir`'s blob-loading logic.

pub mod memory;
pub mod ocidir;

use std::pin::Pin;

use async_trait::async_trait;
use cmref::Reference;
use oci_spec::image::{Descriptor, Digest};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use ocidir::OciDirStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotFound,
    Io(#[from] std::io::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    BadReference,
    BadDigest,
    Json(#[from] serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An `{kind, reference}` notification from `Store::subscribe`.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Create(Reference),
    Delete(Reference),
}

pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_images(&self) -> Result<Vec<cmref::Image>, Error>;

    /// Groups of references that all resolve to the same digest.
    async fn list_content(&self) -> Result<Vec<Vec<Reference>>, Error>;

    /// Every digest that descends from (and includes) `digest`: for a
    /// manifest this store has indexed, that's the manifest itself, its
    /// config, and each layer; for anything else, just `digest` itself.
    /// Every digest returned here is a routing key, not only the
    /// top-level one `list_content` groups references by.
    async fn content_digests(&self, digest: &Digest) -> Result<Vec<Digest>, Error>;

    async fn resolve(&self, reference: &str) -> Result<Digest, Error>;

    async fn descriptor(&self, digest: &Digest) -> Result<Descriptor, Error>;

    async fn open(&self, digest: &Digest) -> Result<BoxAsyncRead, Error>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
