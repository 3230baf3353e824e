//! Mapping of origin + coordinate to keys

use crate::key::{ArtifactCoordinate, Key};
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Container used for Maven Central
pub const CENTRAL_CONTAINER: &str = "central";

const CENTRAL_URLS: [&str; 2] = [
    "https://repo.maven.apache.org/maven2",
    "https://repo1.maven.org/maven2",
];

/// Number of hex characters of the URL digest used as container
const CONTAINER_HASH_LEN: usize = 32;

/// A remote repository an artifact would otherwise be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Repository id as known to the build tool
    pub id: String,
    /// Repository base URL
    pub url: String,
}

impl Origin {
    /// Create an origin
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// Maps a coordinate from a given origin to a cache key
///
/// Implementations must be deterministic. Closures of the matching shape
/// are mappers too.
pub trait KeyMapper: Send + Sync {
    /// Compute the key
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKey`] when no valid key can be built.
    fn apply(&self, origin: &Origin, coordinate: &ArtifactCoordinate) -> Result<Key>;
}

impl<F> KeyMapper for F
where
    F: Fn(&Origin, &ArtifactCoordinate) -> Result<Key> + Send + Sync,
{
    fn apply(&self, origin: &Origin, coordinate: &ArtifactCoordinate) -> Result<Key> {
        self(origin, coordinate)
    }
}

/// Default mapper
///
/// Well-known origins get a readable container name, every other origin is
/// identified by a digest of its normalized URL. The repository id is not
/// used since it differs between build configurations.
#[derive(Debug, Clone)]
pub struct SimpleKeyMapper {
    well_known: BTreeMap<String, String>,
}

impl SimpleKeyMapper {
    /// Mapper knowing Maven Central
    #[must_use]
    pub fn new() -> Self {
        let well_known = CENTRAL_URLS
            .iter()
            .map(|url| ((*url).to_string(), CENTRAL_CONTAINER.to_string()))
            .collect();
        Self { well_known }
    }

    /// Register an additional well-known origin URL
    #[must_use]
    pub fn with_well_known(mut self, url: &str, container: impl Into<String>) -> Self {
        self.well_known.insert(normalize_url(url), container.into());
        self
    }

    /// Container name for an origin
    #[must_use]
    pub fn container(&self, origin: &Origin) -> String {
        let url = normalize_url(&origin.url);
        if let Some(container) = self.well_known.get(&url) {
            return container.clone();
        }
        let digest = hex::encode(Sha256::digest(url.as_bytes()).as_slice());
        digest[..CONTAINER_HASH_LEN].to_string()
    }
}

impl Default for SimpleKeyMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyMapper for SimpleKeyMapper {
    fn apply(&self, origin: &Origin, coordinate: &ArtifactCoordinate) -> Result<Key> {
        Key::artifact(self.container(origin), coordinate)
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Scheme;

    fn coordinate() -> ArtifactCoordinate {
        ArtifactCoordinate::new("org.example", "lib", "jar", "1.0")
    }

    #[test]
    fn test_central_is_well_known() {
        let mapper = SimpleKeyMapper::new();
        let key = mapper
            .apply(
                &Origin::new("central", "https://repo.maven.apache.org/maven2/"),
                &coordinate(),
            )
            .unwrap();
        assert_eq!(key.scheme(), Scheme::Artifact);
        assert_eq!(key.container(), "central");
        assert_eq!(key.payload(), "org.example:lib:jar:1.0");
    }

    #[test]
    fn test_unknown_origin_uses_url_digest() {
        let mapper = SimpleKeyMapper::new();
        let a = mapper
            .apply(&Origin::new("corp", "https://repo.corp.example/maven"), &coordinate())
            .unwrap();
        let b = mapper
            .apply(&Origin::new("other-id", "https://repo.corp.example/maven/"), &coordinate())
            .unwrap();
        let c = mapper
            .apply(&Origin::new("corp", "https://mirror.corp.example/maven"), &coordinate())
            .unwrap();

        assert_eq!(a.container().len(), CONTAINER_HASH_LEN);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_registered_well_known_origin() {
        let mapper = SimpleKeyMapper::new().with_well_known("https://repo.corp.example/maven/", "corp");
        let key = mapper
            .apply(&Origin::new("x", "https://repo.corp.example/maven"), &coordinate())
            .unwrap();
        assert_eq!(key.container(), "corp");
    }

    #[test]
    fn test_closure_is_a_mapper() {
        let mapper = |_: &Origin, c: &ArtifactCoordinate| Key::artifact("fixed", c);
        let key = KeyMapper::apply(&mapper, &Origin::new("a", "b"), &coordinate()).unwrap();
        assert_eq!(key.container(), "fixed");
    }
}
