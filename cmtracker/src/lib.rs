//! The State Tracker (spec.md §4.3): keeps the Peer Router's advertised
//! set in sync with what the local `Store` actually holds. Consumes
//! `Store::subscribe` events for the steady state and falls back to a
//! periodic full resync (the Store's watch mechanism is best-effort, not
//! a transaction log) so a missed event can never cause permanent drift.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cmstore::{Store, StoreEvent};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Handle to a running tracker. Dropping it does not stop the background
/// task; call [`Tracker::shutdown`] to stop it and best-effort unadvertise
/// everything it advertised.
pub struct Tracker {
    cancel: CancellationToken,
    ready: watch::Receiver<bool>,
}

impl Tracker {
    pub fn spawn(
        store: Arc<dyn Store>,
        router: cmrouter::PeerRouter,
        resync_interval: Duration,
    ) -> (Tracker, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let worker = Worker {
            store,
            router,
            resync_interval,
            cancel: cancel.clone(),
            refs: HashMap::new(),
            ready: ready_tx,
        };
        let handle = tokio::spawn(worker.run());
        (
            Tracker {
                cancel,
                ready: ready_rx,
            },
            handle,
        )
    }

    /// Requests the background task stop; it will best-effort unadvertise
    /// every key it currently holds before exiting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Flips to `true` once the initial full resync has run (successfully
    /// or not — a store that never succeeds must not wedge readiness
    /// forever), for a `/readyz` handler to gate traffic on.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }
}

/// digest key -> how many local references currently resolve to it. A key
/// is advertised while its count is above zero and unadvertised exactly
/// when it drops to zero, so two tags pointing at the same digest don't
/// cause a spurious unadvertise when only one of them is removed.
struct Worker {
    store: Arc<dyn Store>,
    router: cmrouter::PeerRouter,
    resync_interval: Duration,
    cancel: CancellationToken,
    refs: HashMap<String, RefEntry>,
    ready: watch::Sender<bool>,
}

struct RefEntry {
    count: usize,
    references: std::collections::HashSet<String>,
}

impl Worker {
    async fn run(mut self) {
        if let Err(e) = self.full_resync().await {
            error!("tracker: initial resync failed: {e:?}");
        }
        let _ = self.ready.send(true);

        let mut events = self.store.subscribe();
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("tracker: missed {n} store events, forcing resync");
                            if let Err(e) = self.full_resync().await {
                                error!("tracker: resync after lag failed: {e:?}");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            info!("tracker: store event channel closed");
                            break;
                        }
                    }
                }
                _ = resync.tick() => {
                    if let Err(e) = self.full_resync().await {
                        error!("tracker: periodic resync failed: {e:?}");
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        self.unadvertise_all().await;
    }

    async fn handle_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Create(reference) => {
                let digest = match self.store.resolve(&reference.to_string()).await {
                    Ok(d) => d,
                    Err(e) => {
                        debug!("tracker: could not resolve {reference} after create: {e:?}");
                        return;
                    }
                };
                let digests = match self.store.content_digests(&digest).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("tracker: could not expand content for {digest}: {e:?}");
                        vec![digest]
                    }
                };
                for content_digest in digests {
                    self.add_ref(content_digest.to_string(), reference.to_string()).await;
                }
            }
            StoreEvent::Delete(reference) => {
                self.remove_ref(reference.to_string()).await;
            }
        }
    }

    async fn add_ref(&mut self, digest: String, reference: String) {
        let entry = self.refs.entry(digest.clone()).or_insert_with(|| RefEntry {
            count: 0,
            references: Default::default(),
        });
        if entry.references.insert(reference) {
            entry.count += 1;
        }
        if entry.count == 1 {
            if let Err(e) = self.router.advertise(digest.as_bytes()).await {
                warn!("tracker: advertise {digest} failed: {e:?}");
            }
        }
        cmtelemetry::set_advertised_keys(self.refs.len() as i64);
    }

    /// A single reference (an image tag or digest) can own several digests
    /// at once — its manifest, config, and every layer — so this must walk
    /// every entry, not stop at the first match, or dropping an image would
    /// leave its config/layers advertised forever.
    async fn remove_ref(&mut self, reference: String) {
        let mut emptied = Vec::new();
        for (digest, entry) in self.refs.iter_mut() {
            if entry.references.remove(&reference) {
                entry.count = entry.count.saturating_sub(1);
                if entry.count == 0 {
                    emptied.push(digest.clone());
                }
            }
        }
        for digest in &emptied {
            self.refs.remove(digest);
            if let Err(e) = self.router.unadvertise(digest.as_bytes()).await {
                warn!("tracker: unadvertise {digest} failed: {e:?}");
            }
        }
        cmtelemetry::set_advertised_keys(self.refs.len() as i64);
    }

    /// Rebuilds the refcount table from scratch against what the store
    /// reports right now, advertising newly-seen digests and unadvertising
    /// ones the store no longer has. Runs on start and every resync tick
    /// so a dropped `StoreEvent` can never cause permanent drift.
    async fn full_resync(&mut self) -> Result<(), cmstore::Error> {
        let groups = self.store.list_content().await?;
        let mut fresh: HashMap<String, RefEntry> = HashMap::new();

        for group in groups {
            if group.is_empty() {
                continue;
            }
            let top_digest = match self.store.resolve(&group[0].to_string()).await {
                Ok(d) => d,
                Err(_) => continue,
            };
            let digests = match self.store.content_digests(&top_digest).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("tracker: resync could not expand content for {top_digest}: {e:?}");
                    vec![top_digest]
                }
            };
            let references: std::collections::HashSet<String> =
                group.iter().map(|r| r.to_string()).collect();
            for digest in digests {
                let entry = fresh.entry(digest.to_string()).or_insert_with(|| RefEntry {
                    count: 0,
                    references: Default::default(),
                });
                for reference in &references {
                    if entry.references.insert(reference.clone()) {
                        entry.count += 1;
                    }
                }
            }
        }

        for digest in fresh.keys() {
            if !self.refs.contains_key(digest) {
                if let Err(e) = self.router.advertise(digest.as_bytes()).await {
                    warn!("tracker: resync advertise {digest} failed: {e:?}");
                }
            }
        }
        for digest in self.refs.keys() {
            if !fresh.contains_key(digest) {
                if let Err(e) = self.router.unadvertise(digest.as_bytes()).await {
                    warn!("tracker: resync unadvertise {digest} failed: {e:?}");
                }
            }
        }

        self.refs = fresh;
        cmtelemetry::set_advertised_keys(self.refs.len() as i64);
        Ok(())
    }

    async fn unadvertise_all(&mut self) {
        for digest in self.refs.keys() {
            if let Err(e) = self.router.unadvertise(digest.as_bytes()).await {
                warn!("tracker: shutdown unadvertise {digest} failed: {e:?}");
            }
        }
        cmtelemetry::set_advertised_keys(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmstore::MemoryStore;

    #[tokio::test]
    async fn add_and_remove_ref_advertises_once_per_digest() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let mut worker = Worker {
            store,
            router,
            resync_interval: Duration::from_secs(600),
            cancel: CancellationToken::new(),
            refs: HashMap::new(),
            ready: watch::channel(false).0,
        };

        worker.add_ref("sha256:abc".into(), "ghcr.io/a:v1".into()).await;
        worker.add_ref("sha256:abc".into(), "ghcr.io/a:v2".into()).await;
        assert_eq!(worker.refs.get("sha256:abc").unwrap().count, 2);

        worker.remove_ref("ghcr.io/a:v1".into()).await;
        assert_eq!(worker.refs.get("sha256:abc").unwrap().count, 1);

        worker.remove_ref("ghcr.io/a:v2".into()).await;
        assert!(!worker.refs.contains_key("sha256:abc"));
    }

    /// A manifest owns several digests at once (itself, its config, every
    /// layer); one reference's removal must unadvertise all of them, not
    /// just whichever one `refs.iter_mut()` happens to visit first.
    #[tokio::test]
    async fn remove_ref_clears_every_digest_a_reference_touches() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let mut worker = Worker {
            store,
            router,
            resync_interval: Duration::from_secs(600),
            cancel: CancellationToken::new(),
            refs: HashMap::new(),
            ready: watch::channel(false).0,
        };

        worker.add_ref("sha256:manifest".into(), "ghcr.io/a:v1".into()).await;
        worker.add_ref("sha256:config".into(), "ghcr.io/a:v1".into()).await;
        worker.add_ref("sha256:layer".into(), "ghcr.io/a:v1".into()).await;

        worker.remove_ref("ghcr.io/a:v1".into()).await;
        assert!(worker.refs.is_empty());
    }

    #[tokio::test]
    async fn create_event_advertises_manifest_config_and_layers() {
        let store = MemoryStore::new();
        let config_digest = store
            .put_blob("application/vnd.oci.image.config.v1+json", br#"{}"#.to_vec())
            .await;
        let layer_digest = store
            .put_blob("application/vnd.oci.image.layer.v1.tar", b"layer".to_vec())
            .await;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "size": 2, "digest": config_digest.to_string()},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "size": 5, "digest": layer_digest.to_string()}],
        });
        let manifest_digest = store
            .put_blob("application/vnd.oci.image.manifest.v1+json", serde_json::to_vec(&manifest).unwrap())
            .await;
        let digests = store.content_digests(&manifest_digest).await.unwrap();

        let store: Arc<dyn Store> = Arc::new(store);
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let mut worker = Worker {
            store,
            router,
            resync_interval: Duration::from_secs(600),
            cancel: CancellationToken::new(),
            refs: HashMap::new(),
            ready: watch::channel(false).0,
        };

        for digest in &digests {
            worker.add_ref(digest.to_string(), "ghcr.io/example/app:v1".into()).await;
        }

        assert!(worker.refs.contains_key(&manifest_digest.to_string()));
        assert!(worker.refs.contains_key(&config_digest.to_string()));
        assert!(worker.refs.contains_key(&layer_digest.to_string()));

        worker.remove_ref("ghcr.io/example/app:v1".into()).await;
        assert!(worker.refs.is_empty());
    }
}
