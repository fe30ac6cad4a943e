//! The OCI HTTP Client (spec.md §4.4): talks distribution-spec HTTP either
//! to the origin registry (bearer-token auth, ratelimit backoff, digest
//! verification) or to a peer mirror node discovered via the Peer Router
//! (plain HTTP, byte-range passthrough, no auth). Grounded on
//! `peoci::ocidist::Client`, which this crate carries over close to
//! verbatim for the origin path, plus a peer path the teacher never
//! needed because it only ever pulled from the origin.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cmref::{DistributionPath, Kind, TagOrDigest as PathTagOrDigest};
use log::{error, info, trace, warn};
use moka::{future::Cache, Expiry};
use oci_spec::{
    distribution::Reference as OciReference,
    image::{Descriptor, Digest, DigestAlgorithm, ImageIndex, ImageManifest},
    OciSpecError,
};
use reqwest::{header, header::HeaderValue, Method, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_IMAGE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const ACCEPTED_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";
const ACCEPTED_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    OciSpecError(#[from] OciSpecError),
    DigestMismatch,
    SizeMismatch,
    NoTagOrDigest,
    BadDigest,
    BadDockerContentDigest,
    Write,
    InvalidAuth,
    Unknown,
    NoMatchingManifest,
    RatelimitExceeded,
    BadContentType(String),
    DigestAlgorithmNotHandled(DigestAlgorithm),
    StatusNotOk(StatusCode),
    RegistryNotSupported(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenCacheKey(String);

impl From<&OciReference> for TokenCacheKey {
    fn from(reference: &OciReference) -> Self {
        Self(format!(
            "{}/{}",
            reference.resolve_registry(),
            reference.repository()
        ))
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

#[derive(Debug)]
pub enum Auth {
    None,
    UserPass(String, String),
}

type UtcInstant = DateTime<Utc>;

pub type AuthMap = BTreeMap<String, Auth>;
pub type RatelimitMap = BTreeMap<String, UtcInstant>;

/// An inclusive byte range for a partial blob fetch, `Content-Range`
/// semantics (`start..=end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&format!("bytes={}-{}", self.start, self.end)).unwrap()
    }
}

/// Talks distribution-spec HTTP to origin registries (token auth,
/// ratelimit backoff) and to peer mirror nodes (plain HTTP passthrough).
///
/// Two underlying `reqwest::Client`s: origins are always TLS, but peers are
/// other nodes on the cluster network addressed by bare IP, so the peer
/// client cannot carry the `https_only` guard the origin client does.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    peer_client: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
    auth_store: Arc<ArcSwap<AuthMap>>,
    ratelimit: Arc<RwLock<RatelimitMap>>,
}

pub struct ImageManifestResponse {
    digest: Digest,
    data: Bytes,
}

pub struct ImageIndexResponse {
    data: Bytes,
}

impl ImageManifestResponse {
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
    pub fn get(&self) -> Result<ImageManifest, OciSpecError> {
        ImageManifest::from_reader(Cursor::new(&self.data))
    }
}

impl ImageIndexResponse {
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    pub fn get(&self) -> Result<ImageIndex, OciSpecError> {
        ImageIndex::from_reader(Cursor::new(&self.data))
    }
}

enum TagOrDigest<'a> {
    Tag(&'a str),
    Digest(&'a str),
}

impl<'a> TagOrDigest<'a> {
    fn try_from(r: &'a OciReference) -> Result<Self, Error> {
        match (r.tag(), r.digest()) {
            (Some(tag), None) => Ok(TagOrDigest::Tag(tag)),
            (Some(_), Some(digest)) | (None, Some(digest)) => Ok(TagOrDigest::Digest(digest)),
            (None, None) => Err(Error::NoTagOrDigest),
        }
    }
    fn as_str(&'a self) -> &'a str {
        match self {
            Self::Tag(s) => s,
            Self::Digest(s) => s,
        }
    }
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(true)
            .build()?;

        let peer_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .eviction_listener(move |k, _v, reason| {
                trace!("token eviction {k:?} {reason:?}");
            })
            .expire_after(ExpireToken)
            .build();

        Ok(Client {
            client,
            peer_client,
            token_cache,
            auth_store: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            ratelimit: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    pub async fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    // --- origin requests -------------------------------------------------

    pub async fn get_image_manifest(
        &self,
        reference: &OciReference,
    ) -> Result<Option<ImageManifestResponse>, Error> {
        self.get_manifest(reference, ACCEPTED_IMAGE_MANIFEST)
            .await?
            .map(|(content_type, digest, data)| {
                if content_type != OCI_IMAGE_MANIFEST_V1 && content_type != DOCKER_IMAGE_MANIFEST_V2
                {
                    Err(Error::BadContentType(content_type))
                } else {
                    let digest = digest.unwrap_or_else(|| digest_from_data(&data));
                    Ok(ImageManifestResponse { data, digest })
                }
            })
            .transpose()
    }

    pub async fn get_image_index(
        &self,
        reference: &OciReference,
    ) -> Result<Option<ImageIndexResponse>, Error> {
        self.get_manifest(reference, ACCEPTED_IMAGE_INDEX)
            .await?
            .map(|(content_type, _digest, data)| {
                if content_type != OCI_IMAGE_INDEX_V1
                    && content_type != DOCKER_IMAGE_MANIFEST_LIST_V2
                {
                    Err(Error::BadContentType(content_type))
                } else {
                    Ok(ImageIndexResponse { data })
                }
            })
            .transpose()
    }

    async fn get_manifest(
        &self,
        reference: &OciReference,
        accept: &str,
    ) -> Result<Option<(String, Option<Digest>, Bytes)>, Error> {
        let domain = reference.resolve_registry();
        let repo = reference.repository();
        let td = TagOrDigest::try_from(reference)?;

        let url = format!("https://{domain}/v2/{repo}/manifests/{}", td.as_str());

        trace!("GET {url}");
        let request = self
            .client
            .request(Method::GET, &url)
            .header(header::ACCEPT, accept);

        let response = self.auth_and_retry(reference, request).await?;

        match response.status() {
            StatusCode::OK => {
                let digest = if let TagOrDigest::Digest(s) = td {
                    Some(s.parse().map_err(|_| Error::BadDigest)?)
                } else {
                    get_docker_content_digest(&response)?
                };
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .map(|x| x.to_str().unwrap_or("").to_string())
                    .unwrap_or_default();
                let data = response.bytes().await?;
                check_data_matches_digest(digest.as_ref(), &data)?;
                Ok(Some((content_type, digest, data)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// Fetches a blob from the origin, optionally restricted to `range`,
    /// writing the verified bytes into `writer`. Digest verification is
    /// skipped for partial ranges: there's no way to check a sha256 of a
    /// slice of the content against the digest of the whole blob.
    pub async fn get_blob(
        &self,
        reference: &OciReference,
        descriptor: &Descriptor,
        range: Option<ByteRange>,
        writer: &mut (impl AsyncWrite + std::marker::Unpin),
    ) -> Result<Option<usize>, Error> {
        let mut response = self.request_blob(reference, descriptor, range).await?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(status_not_ok(response).await),
        }

        let mut len = 0;
        if range.is_some() {
            while let Some(chunk) = response.chunk().await? {
                len += chunk.len();
                writer.write_all(&chunk).await.map_err(|_| Error::Write)?;
            }
            writer.flush().await.map_err(|_| Error::Write)?;
            return Ok(Some(len));
        }

        match descriptor.digest().algorithm() {
            DigestAlgorithm::Sha256 => {
                use sha2::Digest;
                let mut hasher = Sha256::new();
                while let Some(chunk) = response.chunk().await? {
                    len += chunk.len();
                    hasher.update(&chunk);
                    writer.write_all(&chunk).await.map_err(|_| Error::Write)?;
                }
                writer.flush().await.map_err(|_| Error::Write)?;
                if descriptor.size() != len as u64 {
                    return Err(Error::SizeMismatch);
                }
                check_digest_matches(descriptor.digest(), hasher)?;
            }
            algo => {
                error!("blob algo not handled {}", algo);
                return Err(Error::DigestAlgorithmNotHandled(algo.clone()));
            }
        };

        Ok(Some(len))
    }

    async fn request_blob(
        &self,
        reference: &OciReference,
        descriptor: &Descriptor,
        range: Option<ByteRange>,
    ) -> Result<Response, Error> {
        let domain = reference.resolve_registry();
        let repo = reference.repository();
        let url = format!(
            "https://{domain}/v2/{repo}/blobs/{}:{}",
            descriptor.digest().algorithm().as_ref(),
            descriptor.digest().digest()
        );
        trace!("GET {url}");
        let mut request = self.client.request(Method::GET, &url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }
        self.auth_and_retry(reference, request).await
    }

    /// Raw passthrough GET against the origin registry for `path`
    /// (manifest or blob, by tag or digest), returning the unconsumed
    /// `Response` for the caller to stream straight through. Used by the
    /// registry handler's origin-fallback path, where the response needs
    /// to reach the client unbuffered rather than through the
    /// verify-then-return-`Bytes` helpers above.
    pub async fn fetch_from_origin(
        &self,
        reference: &OciReference,
        path: &DistributionPath,
        range: Option<ByteRange>,
    ) -> Result<Response, Error> {
        let domain = reference.resolve_registry();
        let segment = match path.kind {
            Kind::Manifest => "manifests",
            Kind::Blob => "blobs",
        };
        let target = match &path.reference {
            PathTagOrDigest::Tag(t) => t.clone(),
            PathTagOrDigest::Digest(d) => d.to_string(),
        };
        let url = format!("https://{domain}/v2/{}/{segment}/{target}", path.repository);
        trace!("GET {url}");
        let mut request = self.client.request(Method::GET, &url);
        if segment == "manifests" {
            request = request.header(header::ACCEPT, ACCEPTED_IMAGE_MANIFEST);
        }
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }
        self.auth_and_retry(reference, request).await
    }

    async fn get_token_for(
        &self,
        reference: &OciReference,
        www_auth: &WWWAuthenticateBearerRealmService<'_>,
    ) -> Result<Option<Token>, Error> {
        let registry = reference.resolve_registry();
        match self.auth_store.load().get(registry) {
            Some(Auth::None) => Ok(None),
            Some(Auth::UserPass(user, pass)) => {
                let entry = self
                    .token_cache
                    .entry(reference.into())
                    .or_try_insert_with(retrieve_token_user_pass(
                        self.client.clone(),
                        reference,
                        www_auth,
                        user,
                        pass,
                    ))
                    .await
                    .map_err(|e| {
                        error!("error in retrieve_token_user_pass {:?}", e);
                        Error::Unknown
                    })?;
                if entry.is_fresh() {
                    trace!("got new token for {}", entry.key().0);
                }
                Ok(Some(entry.into_value()))
            }
            None => Err(Error::RegistryNotSupported(registry.to_string())),
        }
    }

    async fn auth_and_retry(
        &self,
        reference: &OciReference,
        mut req: reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        self.check_ratelimit(reference).await?;

        let req_copy = req.try_clone().unwrap();

        let token_cache_key: TokenCacheKey = reference.into();
        if let Some(token) = self.token_cache.get(&token_cache_key).await {
            req = req.bearer_auth(token.token);
        }

        let res = req.send().await?;
        self.handle_ratelimit(reference, &res).await?;

        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let www_auth = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_www_authenticate_bearer_header)
            .ok_or_else(|| {
                error!(
                    "bad auth but couldn't get www-authenticate header {:?}",
                    res.headers().get(header::WWW_AUTHENTICATE)
                );
                Error::StatusNotOk(StatusCode::UNAUTHORIZED)
            })?;

        let token = self
            .get_token_for(reference, &www_auth)
            .await?
            .ok_or(Error::StatusNotOk(StatusCode::UNAUTHORIZED))?;

        let res = req_copy.bearer_auth(token.token).send().await?;
        self.handle_ratelimit(reference, &res).await?;

        Ok(res)
    }

    async fn check_ratelimit(&self, reference: &OciReference) -> Result<(), Error> {
        let mut remove = false;
        let registry = reference.resolve_registry();
        if let Some(ratelimit_end) = self.ratelimit.read().await.get(registry) {
            if Utc::now() < *ratelimit_end {
                warn!("still in ratelimit reset period");
                return Err(Error::RatelimitExceeded);
            } else {
                remove = true;
            }
        }
        if remove {
            self.ratelimit.write().await.remove(registry);
        }
        Ok(())
    }

    async fn handle_ratelimit(&self, reference: &OciReference, res: &Response) -> Result<(), Error> {
        if !matches!(
            res.status(),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        ) {
            return Ok(());
        }

        let registry = reference.resolve_registry();
        let end: UtcInstant = if let Some(reset) = get_ratelimit_reset_header(res.headers()) {
            let now = chrono::Utc::now();
            let time = reset
                .try_into()
                .ok()
                .and_then(|x| chrono::DateTime::<chrono::Utc>::from_timestamp(x, 0))
                .unwrap_or_else(|| {
                    error!("bad reset timestamp");
                    now + Duration::from_secs(DEFAULT_RATELIMIT_RESET)
                });
            if now > time {
                now + Duration::from_secs(reset)
            } else {
                time
            }
        } else {
            warn!(
                "got res status {} from {} but no ratelimit-reset",
                res.status(),
                registry
            );
            chrono::Utc::now() + Duration::from_secs(DEFAULT_RATELIMIT_RESET)
        };

        warn!("hit ratelimit when registry={} res.url={}", registry, res.url());
        self.ratelimit
            .write()
            .await
            .insert(registry.to_string(), end);

        Err(Error::RatelimitExceeded)
    }

    // --- peer requests -----------------------------------------------
    //
    // peers run the same mirror's registry handler so there is no auth
    // and no ratelimit bookkeeping: every request is a direct, single
    // attempt, and the caller (the registry handler's peer-iteration
    // loop) decides whether to move on to the next peer on failure.

    /// Issues a raw distribution-spec request against `peer_addr`
    /// (`host:port`), returning the unconsumed `Response` so the caller
    /// can stream it straight through to its own client without
    /// buffering the whole body.
    pub async fn fetch_from_peer(
        &self,
        peer_addr: &str,
        path: &DistributionPath,
        range: Option<ByteRange>,
    ) -> Result<Response, Error> {
        let segment = match path.kind {
            Kind::Manifest => "manifests",
            Kind::Blob => "blobs",
        };
        let reference = match &path.reference {
            PathTagOrDigest::Tag(t) => t.clone(),
            PathTagOrDigest::Digest(d) => d.to_string(),
        };
        let url = format!(
            "http://{peer_addr}/v2/{}/{segment}/{reference}",
            path.repository
        );
        trace!("GET {url}");
        let mut request = self.peer_client.request(Method::GET, &url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }
        Ok(request.send().await?)
    }
}

/// Clamps `range.end` to `content_length - 1`, mirroring what a registry
/// handler does before it sets `Content-Range` on a `206` response.
pub fn clamp_range(range: Range<u64>, content_length: u64) -> ByteRange {
    let end = range.end.min(content_length.saturating_sub(1)).max(range.start);
    ByteRange { start: range.start, end }
}

async fn status_not_ok(res: Response) -> Error {
    let status = res.status();
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={}, body={}", status, body),
            Err(e) => trace!("unhandled error getting body, status={status}, error={e:?}"),
        }
    }
    Error::StatusNotOk(status)
}

async fn retrieve_token_user_pass(
    client: reqwest::Client,
    reference: &OciReference,
    www_auth: &WWWAuthenticateBearerRealmService<'_>,
    user: &str,
    pass: &str,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: String,
        expires_in: Option<u64>,
    }

    let scope = format!("repository:{}:pull", reference.repository());

    let token = client
        .request(Method::GET, www_auth.realm)
        .query(&[("scope", scope), ("service", www_auth.service.to_string())])
        .basic_auth(user, Some(pass))
        .send()
        .await?
        .json::<JsonToken>()
        .await?;

    let expires_in = Duration::from_secs(token.expires_in.unwrap_or(60));
    Ok(Token {
        token: token.token,
        expires_in,
    })
}

fn digest_from_data(x: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(x)))
        .unwrap()
        .into()
}

fn get_docker_content_digest(response: &Response) -> Result<Option<Digest>, Error> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|header_value| -> Result<Digest, Error> {
            header_value
                .to_str()
                .map_err(|_| Error::BadDockerContentDigest)?
                .try_into()
                .map_err(|_| Error::BadDockerContentDigest)
        })
        .transpose()
}

fn check_digest_matches(expected: &Digest, digest: impl sha2::Digest) -> Result<(), Error> {
    if digest_eq(expected.digest(), digest) {
        Ok(())
    } else {
        Err(Error::DigestMismatch)
    }
}

fn check_data_matches_digest(expected: Option<&Digest>, data: &[u8]) -> Result<(), Error> {
    if let Some(expected) = expected {
        if data_matches_digest(expected, data)? {
            Ok(())
        } else {
            Err(Error::DigestMismatch)
        }
    } else {
        Ok(())
    }
}

fn data_matches_digest(expected: &Digest, data: &[u8]) -> Result<bool, Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest;
            let mut hasher = Sha256::new();
            hasher.update(data);
            Ok(digest_eq(expected.digest(), hasher))
        }
        algo => {
            error!("manifest algo not handled {}", algo);
            Err(Error::DigestAlgorithmNotHandled(algo.clone()))
        }
    }
}

fn digest_eq(digest_lower_hex_str: &str, digest: impl sha2::Digest) -> bool {
    let digest_bytes = digest.finalize();
    let l = digest_lower_hex_str.len();
    if l != 2 * digest_bytes.len() {
        return false;
    }

    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102,
    ];
    let as_byte_pairs = <str as AsRef<[u8]>>::as_ref(digest_lower_hex_str).chunks_exact(2);

    as_byte_pairs.zip(digest_bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}

#[derive(Default)]
struct WWWAuthenticateBearer<'a> {
    realm: Option<&'a str>,
    service: Option<&'a str>,
    scope: Option<&'a str>,
}

struct WWWAuthenticateBearerRealmService<'a> {
    realm: &'a str,
    service: &'a str,
}

fn parse_www_authenticate_bearer_header(
    input: &HeaderValue,
) -> Option<WWWAuthenticateBearerRealmService<'_>> {
    let res = parse_www_authenticate_bearer_str(input.to_str().ok()?)?;
    Some(WWWAuthenticateBearerRealmService {
        realm: res.realm?,
        service: res.service?,
    })
}

fn parse_www_authenticate_bearer_str(input: &str) -> Option<WWWAuthenticateBearer<'_>> {
    use nom::{
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
        IResult, Parser,
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        let (input, matches) = preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)?;
        Ok((input, matches))
    }
    let (_, matches) = parser(input).ok()?;
    let mut ret = WWWAuthenticateBearer::default();
    for (k, v) in matches.into_iter() {
        match k {
            "realm" => ret.realm = Some(v),
            "service" => ret.service = Some(v),
            "scope" => ret.scope = Some(v),
            _ => {}
        }
    }
    Some(ret)
}

const DEFAULT_RATELIMIT_RESET: u64 = 60;

fn get_ratelimit_reset_header(map: &reqwest::header::HeaderMap) -> Option<u64> {
    map.get("ratelimit-reset")
        .or_else(|| map.get("x-ratelimit-reset"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_eq() {
        fn sha256_digest(data: impl AsRef<[u8]>) -> impl sha2::Digest {
            use sha2::Digest;
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher
        }
        assert!(digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            sha256_digest("abc"),
        ));
        assert!(!digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
            sha256_digest("abc"),
        ));
    }

    #[test]
    fn test_www_authenticate() {
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
        ];
        for case in cases.iter() {
            let x = parse_www_authenticate_bearer_str(case).unwrap();
            assert_eq!(x.realm, Some("https://auth.docker.io/token"));
            assert_eq!(x.service, Some("registry.docker.io"));
        }
    }

    #[test]
    fn clamp_range_caps_to_content_length() {
        let r = clamp_range(0..1_000_000, 100);
        assert_eq!(r, ByteRange { start: 0, end: 99 });
    }

    #[test]
    fn byte_range_header_format() {
        let r = ByteRange { start: 10, end: 20 };
        assert_eq!(r.header_value(), "bytes=10-20");
    }
}
