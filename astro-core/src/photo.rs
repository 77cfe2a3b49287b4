//! Photo identifiers and references as supplied by the rover photo API.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Integer identifier of a rover photo; the cache key for its bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PhotoId(pub u64);

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PhotoId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single photo entry: its id and where its image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoReference {
    pub id: PhotoId,
    pub img_src: Url,
}

impl PhotoReference {
    pub fn new(id: impl Into<PhotoId>, img_src: Url) -> Self {
        Self {
            id: id.into(),
            img_src,
        }
    }

    /// Image URL with an `http` scheme upgraded to `https`.
    ///
    /// The photo API still hands out plain `http` links for older sols.
    pub fn secure_url(&self) -> Url {
        upgrade_to_https(&self.img_src)
    }
}

pub fn upgrade_to_https(url: &Url) -> Url {
    if url.scheme() != "http" {
        return url.clone();
    }
    let mut secure = url.clone();
    // http -> https is always an allowed scheme change for special schemes.
    if secure.set_scheme("https").is_err() {
        return url.clone();
    }
    secure
}

/// Accepts either a bare array of references or the API envelope
/// `{"photos": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    Envelope { photos: Vec<PhotoReference> },
    List(Vec<PhotoReference>),
}

/// Parse a photo manifest as served by the rover API or saved from it.
pub fn parse_manifest(json: &str) -> serde_json::Result<Vec<PhotoReference>> {
    let manifest: Manifest = serde_json::from_str(json)?;
    Ok(match manifest {
        Manifest::Envelope { photos } => photos,
        Manifest::List(photos) => photos,
    })
}
