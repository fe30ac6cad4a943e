//! Parsing and validation of OCI references and distribution-spec URL paths.
//!
//! `Reference` (the free-form `[registry/][namespace/]name[:tag][@digest]`
//! grammar) is handed off to `oci_spec::distribution::Reference`, which
//! already implements it correctly. What that crate does not give us is the
//! wire-level `/v2/<name>/{manifests,blobs}/<ref>` parser, so that lives
//! here as `DistributionPath`.

use oci_spec::image::Digest;

pub use oci_spec::distribution::Reference;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotV2,
    MissingKind,
    AmbiguousKind,
    MissingReference,
    TrailingSegments,
    BadRepository,
    BadTag,
    BadDigest,
    BlobCannotCarryTag,
    NoTagOrDigest,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Manifest,
    Blob,
}

impl Kind {
    fn from_segment(s: &str) -> Option<Kind> {
        match s {
            "manifests" => Some(Kind::Manifest),
            "blobs" => Some(Kind::Blob),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOrDigest {
    Tag(String),
    Digest(Digest),
}

impl TagOrDigest {
    pub fn as_routing_key(&self) -> Option<String> {
        match self {
            TagOrDigest::Digest(d) => Some(d.to_string()),
            TagOrDigest::Tag(_) => None,
        }
    }
}

/// A parsed `/v2/<name>/{manifests,blobs}/<ref>` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPath {
    pub registry: Option<String>,
    pub repository: String,
    pub kind: Kind,
    pub reference: TagOrDigest,
}

impl DistributionPath {
    /// `path` is the request's URL path (must start with `/v2/`); `ns` is
    /// the `?ns=` query parameter, if present.
    pub fn parse(path: &str, ns: Option<&str>) -> Result<DistributionPath, Error> {
        let rest = path.strip_prefix("/v2/").ok_or(Error::NotV2)?;
        let segments: Vec<&str> = rest.split('/').collect();

        let kind_idx = segments
            .iter()
            .position(|s| Kind::from_segment(s).is_some())
            .ok_or(Error::MissingKind)?;
        if segments[kind_idx + 1..]
            .iter()
            .any(|s| Kind::from_segment(s).is_some())
        {
            return Err(Error::AmbiguousKind);
        }
        let kind = Kind::from_segment(segments[kind_idx]).unwrap();

        if kind_idx == 0 {
            return Err(Error::MissingReference);
        }
        let name_segments = &segments[..kind_idx];
        let ref_segments = &segments[kind_idx + 1..];
        if ref_segments.len() != 1 {
            return if ref_segments.is_empty() {
                Err(Error::MissingReference)
            } else {
                Err(Error::TrailingSegments)
            };
        }
        let reference_str = ref_segments[0];
        if reference_str.is_empty() {
            return Err(Error::MissingReference);
        }

        let (registry, repository) = split_registry(name_segments, ns);
        validate_repository(&repository)?;

        let reference = parse_tag_or_digest(reference_str)?;
        if kind == Kind::Blob {
            if let TagOrDigest::Tag(_) = &reference {
                return Err(Error::BlobCannotCarryTag);
            }
        }

        Ok(DistributionPath {
            registry,
            repository,
            kind,
            reference,
        })
    }
}

/// First segment is a registry iff it contains `.` or `:`, or is `localhost`
/// (spec.md §4.1). Otherwise fall back to the `ns=` query parameter.
fn split_registry(name_segments: &[&str], ns: Option<&str>) -> (Option<String>, String) {
    if name_segments.len() >= 2 {
        let first = name_segments[0];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (
                Some(first.to_string()),
                name_segments[1..].join("/"),
            );
        }
    }
    (ns.map(|s| s.to_string()), name_segments.join("/"))
}

fn parse_tag_or_digest(s: &str) -> Result<TagOrDigest, Error> {
    if s.contains(':') {
        let digest: Digest = s.try_into().map_err(|_| Error::BadDigest)?;
        Ok(TagOrDigest::Digest(digest))
    } else {
        validate_tag(s)?;
        Ok(TagOrDigest::Tag(s.to_string()))
    }
}

fn validate_tag(s: &str) -> Result<(), Error> {
    if s.is_empty() || s.len() > 128 {
        return Err(Error::BadTag);
    }
    let mut chars = s.chars();
    let first = chars.next().ok_or(Error::BadTag)?;
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(Error::BadTag);
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
        return Err(Error::BadTag);
    }
    Ok(())
}

/// `[a-z0-9]+(([._]|__|[-]+)[a-z0-9]+)*` repeated, slash-separated.
fn validate_repository(s: &str) -> Result<(), Error> {
    if s.is_empty() {
        return Err(Error::BadRepository);
    }
    for component in s.split('/') {
        validate_repository_component(component)?;
    }
    Ok(())
}

fn validate_repository_component(s: &str) -> Result<(), Error> {
    #[derive(PartialEq)]
    enum St {
        Alnum,
        Sep,
    }
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return Err(Error::BadRepository);
    }
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_alnum(bytes[0]) {
        return Err(Error::BadRepository);
    }
    let mut state = St::Alnum;
    let mut i = 1;
    while i < bytes.len() {
        let b = bytes[i];
        if is_alnum(b) {
            state = St::Alnum;
            i += 1;
            continue;
        }
        if state != St::Alnum {
            return Err(Error::BadRepository);
        }
        // separator: one of '.', '_', "__", or a run of '-'
        match b {
            b'.' | b'_' => {
                i += 1;
            }
            b'-' => {
                while i < bytes.len() && bytes[i] == b'-' {
                    i += 1;
                }
            }
            _ => return Err(Error::BadRepository),
        }
        state = St::Sep;
        if i >= bytes.len() || !is_alnum(bytes[i]) {
            return Err(Error::BadRepository);
        }
    }
    if state != St::Alnum {
        return Err(Error::BadRepository);
    }
    Ok(())
}

/// A `Reference` known to carry a digest — the unit of content routing.
#[derive(Debug, Clone)]
pub struct Image {
    reference: Reference,
    digest: Digest,
}

impl Image {
    pub fn new(reference: Reference) -> Result<Image, Error> {
        let digest_str = reference.digest().ok_or(Error::NoTagOrDigest)?;
        let digest: Digest = digest_str.try_into().map_err(|_| Error::BadDigest)?;
        Ok(Image { reference, digest })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// The manifest `DistributionPath` rooted at this image's digest.
    pub fn manifest_path(&self) -> DistributionPath {
        DistributionPath {
            registry: Some(self.reference.resolve_registry().to_string()),
            repository: self.reference.repository().to_string(),
            kind: Kind::Manifest,
            reference: TagOrDigest::Digest(self.digest.clone()),
        }
    }
}

/// `parse(s).Identifier()`: digest when present, else `registry/repository:tag`.
pub fn identifier(reference: &Reference) -> String {
    if let Some(digest) = reference.digest() {
        digest.to_string()
    } else {
        format!(
            "{}/{}:{}",
            reference.resolve_registry(),
            reference.repository(),
            reference.tag().unwrap_or("latest")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_manifest_by_tag_with_ns_query() {
        let p = DistributionPath::parse("/v2/example/app/manifests/v1", Some("ghcr.io")).unwrap();
        assert_eq!(p.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(p.repository, "example/app");
        assert_eq!(p.kind, Kind::Manifest);
        assert_eq!(p.reference, TagOrDigest::Tag("v1".to_string()));
    }

    #[test]
    fn parse_blob_with_embedded_registry() {
        let p = DistributionPath::parse(
            "/v2/docker.io/library/busybox/blobs/sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            None,
        )
        .unwrap();
        assert_eq!(p.registry.as_deref(), Some("docker.io"));
        assert_eq!(p.repository, "library/busybox");
        assert_eq!(p.kind, Kind::Blob);
        assert!(matches!(p.reference, TagOrDigest::Digest(_)));
    }

    #[test]
    fn blob_with_tag_is_rejected() {
        let err = DistributionPath::parse("/v2/lib/img/blobs/v1", None).unwrap_err();
        assert!(matches!(err, Error::BlobCannotCarryTag));
    }

    #[test]
    fn localhost_is_recognized_as_registry() {
        let p = DistributionPath::parse("/v2/localhost/repo/manifests/latest", None).unwrap();
        assert_eq!(p.registry.as_deref(), Some("localhost"));
        assert_eq!(p.repository, "repo");
    }

    #[test]
    fn missing_v2_prefix_errors() {
        assert!(matches!(
            DistributionPath::parse("/foo/bar", None),
            Err(Error::NotV2)
        ));
    }

    #[test]
    fn repository_grammar_accepts_separators() {
        assert!(validate_repository("a/b-c/d.e_f/g__h").is_ok());
        assert!(validate_repository("A/b").is_err());
        assert!(validate_repository("a--b").is_ok());
        assert!(validate_repository("a.-b").is_err());
        assert!(validate_repository("-ab").is_err());
        assert!(validate_repository("ab-").is_err());
    }

    #[test]
    fn tag_grammar() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("1.0.0").is_ok());
        assert!(validate_tag(".bad").is_err());
        assert!(validate_tag("").is_err());
    }
}
