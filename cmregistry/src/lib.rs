//! The Registry Handler and Readiness gate (spec.md §4.6/§4.7): an axum
//! server implementing the pull-only distribution-spec subset, dispatching
//! between mirror mode (resolve via the Peer Router, forward to a peer,
//! fall back to origin) and proxy mode (serve from the local Store only).
//! Grounded on `peserver::gh`'s axum `Router` + `State` + graceful-shutdown
//! shape, generalized from one route to the full `/v2/*` surface.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router as AxumRouter;
use cmclient::ByteRange;
use cmref::{DistributionPath, Kind, Reference, TagOrDigest};
use cmstore::Store;
use cmtelemetry::{MirrorOutcome, ResolveOutcome};
use log::{debug, warn};
use oci_spec::image::Digest;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone)]
pub struct Config {
    /// How long the registry handler waits for the first candidate peer
    /// before falling back to origin (the "T" of spec.md §4.6).
    pub resolve_timeout: Duration,
    /// How many peers to try, in order, before giving up (the "R").
    pub retry_budget: usize,
    /// Whether `latest`-tagged manifests may be served via the DHT at all.
    pub resolve_latest_tag: bool,
    /// The port every node in the cluster serves this registry API on;
    /// used to turn a DHT peer's bare IP into an HTTP endpoint, since the
    /// DHT only advertises its own listen address, not the registry port.
    pub registry_http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            resolve_timeout: Duration::from_millis(20),
            retry_budget: 3,
            resolve_latest_tag: true,
            registry_http_port: 5000,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub router: cmrouter::PeerRouter,
    pub client: cmclient::Client,
    pub ready: watch::Receiver<bool>,
    pub config: Config,
}

pub fn router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/v2/", get(v2_probe).head(v2_probe))
        .route("/v2/{*rest}", get(handle_request).head(handle_request))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn v2_probe() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], "{}")
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if *state.ready.borrow() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCode {
    NameInvalid,
    DigestInvalid,
    ManifestUnknown,
    BlobUnknown,
    Unsupported,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NameInvalid => "NAME_INVALID",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }
}

fn error_response(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    let body = serde_json::json!({
        "errors": [{"code": code.as_str(), "message": message}]
    });
    (status, axum::Json(body)).into_response()
}

fn bad_request(e: cmref::Error) -> Response {
    let code = match e {
        cmref::Error::BadDigest => ErrorCode::DigestInvalid,
        _ => ErrorCode::NameInvalid,
    };
    error_response(StatusCode::BAD_REQUEST, code, &format!("{e}"))
}

fn not_found(kind: Kind) -> Response {
    let code = match kind {
        Kind::Manifest => ErrorCode::ManifestUnknown,
        Kind::Blob => ErrorCode::BlobUnknown,
    };
    error_response(StatusCode::NOT_FOUND, code, "not found")
}

fn parse_ns(query: Option<&str>) -> Option<String> {
    query?.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == "ns").then(|| v.to_string())
    })
}

/// A single `Range: bytes=A-B` header. Multi-range requests are rejected
/// with 416 (spec.md §9 Open Questions: unsupported, not exercised by the
/// source this was distilled from).
fn parse_range(headers: &HeaderMap) -> Result<Option<ByteRange>, Response> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let value = value.to_str().unwrap_or("");
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE.into_response());
    }
    let (start, end) = spec.split_once('-').ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, ErrorCode::Unsupported, "bad range")
    })?;
    let start: u64 = start.parse().map_err(|_| {
        error_response(StatusCode::BAD_REQUEST, ErrorCode::Unsupported, "bad range")
    })?;
    let end: u64 = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().map_err(|_| {
            error_response(StatusCode::BAD_REQUEST, ErrorCode::Unsupported, "bad range")
        })?
    };
    Ok(Some(ByteRange { start, end }))
}

async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let ns = parse_ns(uri.query());

    let path = match DistributionPath::parse(uri.path(), ns.as_deref()) {
        Ok(p) => p,
        Err(e) => return bad_request(e),
    };

    let range = match parse_range(&headers) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let range = if matches!(path.kind, Kind::Manifest) {
        None // range passthrough only applies to blobs (spec.md §6)
    } else {
        range
    };

    match &path.reference {
        TagOrDigest::Digest(digest) => {
            let digest = digest.clone();
            serve_digest(&state, &path, digest, &method, range).await
        }
        TagOrDigest::Tag(tag) => {
            let tag = tag.clone();
            handle_tag(&state, path, tag, &method, range).await
        }
    }
}

async fn handle_tag(
    state: &AppState,
    path: DistributionPath,
    tag: String,
    method: &Method,
    range: Option<ByteRange>,
) -> Response {
    let mirror_mode = path.registry.is_some();

    if mirror_mode && tag == "latest" && !state.config.resolve_latest_tag {
        cmtelemetry::record_proxy_fallback("latest_tag_disabled");
        return forward_origin_tag(state, &path, &tag, method, range).await;
    }

    let key = match &path.registry {
        Some(registry) => format!("{registry}/{}:{tag}", path.repository),
        None => format!("{}:{tag}", path.repository),
    };

    match state.store.resolve(&key).await {
        Ok(digest) => {
            let mut digest_path = path;
            digest_path.reference = TagOrDigest::Digest(digest.clone());
            serve_digest(state, &digest_path, digest, method, range).await
        }
        Err(_) if mirror_mode => {
            cmtelemetry::record_proxy_fallback("tag_not_local");
            forward_origin_tag(state, &path, &tag, method, range).await
        }
        Err(_) => not_found(path.kind),
    }
}

async fn forward_origin_tag(
    state: &AppState,
    path: &DistributionPath,
    tag: &str,
    method: &Method,
    range: Option<ByteRange>,
) -> Response {
    let Some(registry) = &path.registry else {
        return not_found(path.kind);
    };
    let reference_str = format!("{registry}/{}:{tag}", path.repository);
    let reference: Reference = match reference_str.parse() {
        Ok(r) => r,
        Err(_) => return bad_request(cmref::Error::BadRepository),
    };
    let mut tag_path = path.clone();
    tag_path.reference = TagOrDigest::Tag(tag.to_string());
    forward_origin(state, &reference, &tag_path, method, range).await
}

async fn serve_digest(
    state: &AppState,
    path: &DistributionPath,
    digest: Digest,
    method: &Method,
    range: Option<ByteRange>,
) -> Response {
    let mirror_mode = path.registry.is_some();

    if !mirror_mode {
        return match state.store.descriptor(&digest).await {
            Ok(descriptor) => serve_local(state, &digest, descriptor, path.kind, method, range).await,
            Err(_) => not_found(path.kind),
        };
    }

    if let Ok(descriptor) = state.store.descriptor(&digest).await {
        return serve_local(state, &digest, descriptor, path.kind, method, range).await;
    }

    match mirror_via_peers(state, &digest, path, method, range).await {
        Some(response) => response,
        None => match &path.registry {
            Some(registry) => {
                cmtelemetry::record_proxy_fallback("peers_exhausted");
                let reference_str = match &path.reference {
                    TagOrDigest::Digest(d) => format!("{registry}/{}@{d}", path.repository),
                    TagOrDigest::Tag(t) => format!("{registry}/{}:{t}", path.repository),
                };
                match reference_str.parse::<Reference>() {
                    Ok(reference) => forward_origin(state, &reference, path, method, range).await,
                    Err(_) => error_response(
                        StatusCode::BAD_GATEWAY,
                        ErrorCode::Unsupported,
                        "no peers and could not reach origin",
                    ),
                }
            }
            None => not_found(path.kind),
        },
    }
}

async fn serve_local(
    state: &AppState,
    digest: &Digest,
    descriptor: oci_spec::image::Descriptor,
    kind: Kind,
    method: &Method,
    range: Option<ByteRange>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(descriptor.media_type().to_string().as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        "docker-content-digest",
        HeaderValue::from_str(&digest.to_string()).unwrap(),
    );
    if matches!(kind, Kind::Blob) {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }

    if *method == Method::HEAD {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&descriptor.size().to_string()).unwrap(),
        );
        return (StatusCode::OK, headers, Body::empty()).into_response();
    }

    let reader = match state.store.open(digest).await {
        Ok(r) => r,
        Err(_) => return not_found(kind),
    };

    match range {
        Some(range) if matches!(kind, Kind::Blob) => {
            use tokio::io::AsyncReadExt;
            let mut reader = reader;
            let mut buf = Vec::new();
            if reader.read_to_end(&mut buf).await.is_err() {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Unsupported,
                    "read error",
                );
            }
            let total = buf.len() as u64;
            let clamped = cmclient::clamp_range(range.start..range.end, total);
            let slice = buf
                .get(clamped.start as usize..=clamped.end.min(total.saturating_sub(1)) as usize)
                .unwrap_or(&[])
                .to_vec();
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", clamped.start, clamped.end, total))
                    .unwrap(),
            );
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&slice.len().to_string()).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, headers, Body::from(slice)).into_response()
        }
        _ => {
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&descriptor.size().to_string()).unwrap(),
            );
            let body = Body::from_stream(ReaderStream::new(reader));
            (StatusCode::OK, headers, body).into_response()
        }
    }
}

/// The peer-iteration algorithm of spec.md §4.6. Returns `None` only when
/// every candidate peer was tried and failed (or none appeared within the
/// resolve deadline); the resolve deadline itself only ever bounds the
/// wait for the first peer, never an in-flight forward (`PeerRouter::resolve`
/// already enforces that split).
async fn mirror_via_peers(
    state: &AppState,
    digest: &Digest,
    path: &DistributionPath,
    method: &Method,
    range: Option<ByteRange>,
) -> Option<Response> {
    let started = Instant::now();
    let mut peers = state
        .router
        .resolve(digest.to_string().as_bytes(), state.config.resolve_timeout)
        .await;

    let mut digest_path = path.clone();
    digest_path.reference = TagOrDigest::Digest(digest.clone());

    for attempt in 0..state.config.retry_budget {
        let peer = match peers.recv().await {
            Some(p) => p,
            None => {
                let outcome = if attempt == 0 {
                    ResolveOutcome::Timeout
                } else {
                    ResolveOutcome::NoPeers
                };
                cmtelemetry::record_resolve(outcome, started.elapsed());
                return None;
            }
        };
        if attempt == 0 {
            cmtelemetry::record_resolve(ResolveOutcome::Found, started.elapsed());
        }

        if peer.peer_id == state.router.local_peer_id() {
            if let Ok(descriptor) = state.store.descriptor(digest).await {
                return Some(serve_local(state, digest, descriptor, path.kind, method, range).await);
            }
            continue;
        }

        let Some(addr) = peer_http_addr(&peer, state.config.registry_http_port) else {
            continue;
        };

        match state.client.fetch_from_peer(&addr, &digest_path, range).await {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::PARTIAL_CONTENT => {
                cmtelemetry::record_mirror_attempt(MirrorOutcome::Success);
                return Some(passthrough(resp).await);
            }
            Ok(resp) => {
                debug!("peer {addr} returned {}", resp.status());
                cmtelemetry::record_mirror_attempt(MirrorOutcome::PeerBadResponse);
            }
            Err(e) => {
                warn!("peer {addr} unreachable: {e:?}");
                cmtelemetry::record_mirror_attempt(MirrorOutcome::PeerUnreachable);
            }
        }
    }

    None
}

fn peer_http_addr(peer: &cmrouter::Peer, http_port: u16) -> Option<String> {
    use libp2p::multiaddr::Protocol;
    peer.addresses.iter().find_map(|addr| {
        addr.iter().find_map(|proto| match proto {
            Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        })
    }).map(|ip| format!("{ip}:{http_port}"))
}

async fn forward_origin(
    state: &AppState,
    reference: &Reference,
    path: &DistributionPath,
    method: &Method,
    range: Option<ByteRange>,
) -> Response {
    match state.client.fetch_from_origin(reference, path, range).await {
        Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::PARTIAL_CONTENT => {
            if *method == Method::HEAD {
                let mut headers = HeaderMap::new();
                copy_passthrough_headers(resp.headers(), &mut headers);
                (resp.status(), headers, Body::empty()).into_response()
            } else {
                passthrough(resp).await
            }
        }
        Ok(resp) => {
            let status = resp.status();
            error_response(
                StatusCode::BAD_GATEWAY,
                ErrorCode::Unsupported,
                &format!("origin returned {status}"),
            )
        }
        Err(e) => {
            warn!("origin fetch failed: {e:?}");
            error_response(StatusCode::BAD_GATEWAY, ErrorCode::Unsupported, "origin unreachable")
        }
    }
}

fn copy_passthrough_headers(from: &reqwest::header::HeaderMap, into: &mut HeaderMap) {
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
    ] {
        if let Some(value) = from.get(name.as_str()) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                into.insert(name, value);
            }
        }
    }
    if let Some(value) = from.get("docker-content-digest") {
        if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
            into.insert("docker-content-digest", value);
        }
    }
}

async fn passthrough(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    copy_passthrough_headers(resp.headers(), &mut headers);
    let stream = resp.bytes_stream();
    (status, headers, Body::from_stream(stream)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmstore::MemoryStore;

    async fn test_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let (_tx, ready) = watch::channel(true);
        AppState {
            store,
            router,
            client: cmclient::Client::new().unwrap(),
            ready,
            config: Config::default(),
        }
    }

    #[tokio::test]
    async fn v2_probe_returns_empty_object() {
        let response = v2_probe().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proxy_mode_miss_is_404_with_blob_unknown() {
        let state = test_state().await;
        let digest = "sha256:".to_string() + &"a".repeat(64);
        let path = DistributionPath::parse(&format!("/v2/lib/img/blobs/{digest}"), None).unwrap();
        let d: Digest = digest.parse().unwrap();
        let response = serve_digest(&state, &path, d, &Method::GET, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readyz_reflects_watch_value() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let (tx, ready) = watch::channel(false);
        let state = AppState {
            store,
            router,
            client: cmclient::Client::new().unwrap(),
            ready,
            config: Config::default(),
        };
        assert_eq!(
            readyz(State(state.clone())).await.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        tx.send(true).unwrap();
        assert_eq!(
            readyz(State(state)).await.into_response().status(),
            StatusCode::OK
        );
    }

    #[test]
    fn parse_ns_from_query() {
        assert_eq!(parse_ns(Some("ns=ghcr.io&foo=bar")), Some("ghcr.io".to_string()));
        assert_eq!(parse_ns(Some("foo=bar")), None);
        assert_eq!(parse_ns(None), None);
    }

    #[test]
    fn parse_range_rejects_multi_range() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-10,20-30"));
        assert!(parse_range(&headers).is_err());
    }

    #[test]
    fn parse_range_accepts_single_range() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        let range = parse_range(&headers).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 99 });
    }

    /// `bytes=0-0` requests exactly one byte; a `range.end + 1` off-by-one
    /// here would serve two.
    #[tokio::test]
    async fn single_byte_range_serves_exactly_one_byte() {
        let store = MemoryStore::new();
        let digest = store
            .put_blob("application/vnd.oci.image.layer.v1.tar", b"abcdef".to_vec())
            .await;
        let (router, _handle) = cmrouter::PeerRouter::spawn(cmrouter::Config::default())
            .await
            .unwrap();
        let (_tx, ready) = watch::channel(true);
        let state = AppState {
            store: Arc::new(store),
            router,
            client: cmclient::Client::new().unwrap(),
            ready,
            config: Config::default(),
        };
        let descriptor = state.store.descriptor(&digest).await.unwrap();

        let response = serve_local(
            &state,
            &digest,
            descriptor,
            Kind::Blob,
            &Method::GET,
            Some(ByteRange { start: 0, end: 0 }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(content_range, "bytes 0-0/6");
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "1"
        );
    }
}
