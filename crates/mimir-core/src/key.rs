//! Canonical cache keys
//!
//! A [`Key`] addresses one cached object. Its string form is
//!
//! ```text
//! mimir:<scheme>:<container>:<payload>
//! ```
//!
//! where the scheme is one of `artifact`, `file` or `cas`, the container
//! identifies the origin the object came from, and the payload is
//! scheme-specific. Two keys are equal iff their string forms are equal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix every encoded key starts with
pub const KEY_PREFIX: &str = "mimir";

/// The kind of object a key addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// A build artifact addressed by its coordinate
    Artifact,
    /// A plain file addressed by a relative path
    File,
    /// A blob addressed by its content digest
    ContentAddress,
}

impl Scheme {
    /// The scheme tag used in the encoded key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Artifact => "artifact",
            Self::File => "file",
            Self::ContentAddress => "cas",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "artifact" => Ok(Self::Artifact),
            "file" => Ok(Self::File),
            "cas" => Ok(Self::ContentAddress),
            other => Err(Error::invalid_key(other, "unknown scheme")),
        }
    }
}

/// Coordinate of a build artifact
///
/// Canonical form: `groupId:artifactId:extension[:classifier]:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactCoordinate {
    /// Group identifier, dot separated
    pub group_id: String,
    /// Artifact identifier
    pub artifact_id: String,
    /// File extension (`jar`, `pom`, ...)
    pub extension: String,
    /// Optional classifier (`sources`, `javadoc`, ...)
    pub classifier: Option<String>,
    /// Version string
    pub version: String,
}

impl ArtifactCoordinate {
    /// Create a coordinate without classifier
    #[must_use]
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        extension: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            extension: extension.into(),
            classifier: None,
            version: version.into(),
        }
    }

    /// Set the classifier
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// File name of the artifact: `artifactId-version[-classifier].extension`
    #[must_use]
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact_id, self.version, classifier, self.extension
            ),
            None => format!("{}-{}.{}", self.artifact_id, self.version, self.extension),
        }
    }

    fn validate(&self, input: &str) -> Result<()> {
        let mut segments = vec![
            ("groupId", self.group_id.as_str()),
            ("artifactId", self.artifact_id.as_str()),
            ("extension", self.extension.as_str()),
            ("version", self.version.as_str()),
        ];
        if let Some(classifier) = &self.classifier {
            segments.push(("classifier", classifier.as_str()));
        }
        for (name, value) in segments {
            if value.is_empty() {
                return Err(Error::invalid_key(input, format!("empty {name}")));
            }
            if value == "." || value == ".." || value.contains(['/', '\\', ':']) {
                return Err(Error::invalid_key(
                    input,
                    format!("{name} '{value}' is not a safe path segment"),
                ));
            }
        }
        if self.group_id.split('.').any(str::is_empty) {
            return Err(Error::invalid_key(input, "groupId has an empty segment"));
        }
        Ok(())
    }
}

impl fmt::Display for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.extension)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        write!(f, ":{}", self.version)
    }
}

impl FromStr for ArtifactCoordinate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let coordinate = match parts.as_slice() {
            [g, a, e, v] => Self::new(*g, *a, *e, *v),
            [g, a, e, c, v] => Self::new(*g, *a, *e, *v).with_classifier(*c),
            _ => {
                return Err(Error::invalid_key(
                    s,
                    "expected groupId:artifactId:extension[:classifier]:version",
                ));
            }
        };
        coordinate.validate(s)?;
        Ok(coordinate)
    }
}

/// Canonical address of a cached object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key {
    scheme: Scheme,
    container: String,
    payload: String,
}

impl Key {
    /// Create a key, validating container and payload for the scheme
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when either part is malformed.
    pub fn new(
        scheme: Scheme,
        container: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            scheme,
            container: container.into(),
            payload: payload.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Key for an artifact coordinate within a container
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the container or coordinate is malformed.
    pub fn artifact(container: impl Into<String>, coordinate: &ArtifactCoordinate) -> Result<Self> {
        Self::new(Scheme::Artifact, container, coordinate.to_string())
    }

    /// Key for a relative file path within a container
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the container or path is malformed.
    pub fn file(container: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        Self::new(Scheme::File, container, path)
    }

    /// Key for a content digest within a container
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the container or digest is malformed.
    pub fn content_address(container: impl Into<String>, digest: impl Into<String>) -> Result<Self> {
        Self::new(Scheme::ContentAddress, container, digest)
    }

    /// The key scheme
    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The container (origin identifier)
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The scheme-specific payload
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Parse the payload of an `artifact` key
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the key is not an artifact key.
    pub fn coordinate(&self) -> Result<ArtifactCoordinate> {
        if self.scheme != Scheme::Artifact {
            return Err(Error::invalid_key(self.to_string(), "not an artifact key"));
        }
        self.payload.parse()
    }

    fn validate(&self) -> Result<()> {
        let encoded = || self.to_string();
        if self.container.is_empty() {
            return Err(Error::invalid_key(encoded(), "empty container"));
        }
        if self.container.starts_with('.') {
            return Err(Error::invalid_key(
                encoded(),
                "container must not start with '.'",
            ));
        }
        if !self
            .container
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::invalid_key(
                encoded(),
                "container may only contain [A-Za-z0-9._-]",
            ));
        }

        match self.scheme {
            Scheme::Artifact => {
                ArtifactCoordinate::from_str(&self.payload)
                    .map_err(|_| Error::invalid_key(encoded(), "malformed artifact coordinate"))?;
            }
            Scheme::File => validate_relative_path(&self.payload)
                .map_err(|reason| Error::invalid_key(encoded(), reason))?,
            Scheme::ContentAddress => {
                if self.payload.len() < 4
                    || !self
                        .payload
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
                {
                    return Err(Error::invalid_key(
                        encoded(),
                        "digest must be at least 4 lowercase hex characters",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_relative_path(path: &str) -> std::result::Result<(), &'static str> {
    if path.is_empty() {
        return Err("empty path");
    }
    if path.starts_with('/') {
        return Err("path must be relative");
    }
    if path.contains('\\') {
        return Err("path must use '/' separators");
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err("path has an empty, '.' or '..' segment");
    }
    Ok(())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{KEY_PREFIX}:{}:{}:{}",
            self.scheme, self.container, self.payload
        )
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, ':');
        let (Some(prefix), Some(scheme), Some(container), Some(payload)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_key(
                s,
                "expected mimir:<scheme>:<container>:<payload>",
            ));
        };
        if prefix != KEY_PREFIX {
            return Err(Error::invalid_key(s, format!("missing '{KEY_PREFIX}:' prefix")));
        }
        let scheme = scheme
            .parse::<Scheme>()
            .map_err(|_| Error::invalid_key(s, format!("unknown scheme '{scheme}'")))?;
        Self::new(scheme, container, payload)
    }
}

impl TryFrom<String> for Key {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_key() {
        let key: Key = "mimir:file:bucketX:hello.txt".parse().unwrap();
        assert_eq!(key.scheme(), Scheme::File);
        assert_eq!(key.container(), "bucketX");
        assert_eq!(key.payload(), "hello.txt");
        assert_eq!(key.to_string(), "mimir:file:bucketX:hello.txt");
    }

    #[test]
    fn test_parse_artifact_key_keeps_colons_in_payload() {
        let key: Key = "mimir:artifact:central:org.example:lib:jar:sources:1.0"
            .parse()
            .unwrap();
        let coordinate = key.coordinate().unwrap();
        assert_eq!(coordinate.group_id, "org.example");
        assert_eq!(coordinate.classifier.as_deref(), Some("sources"));
        assert_eq!(coordinate.version, "1.0");
        assert_eq!(coordinate.file_name(), "lib-1.0-sources.jar");
    }

    #[test]
    fn test_artifact_constructor_matches_parse() {
        let coordinate = ArtifactCoordinate::new("org.example", "lib", "pom", "2.1");
        let key = Key::artifact("central", &coordinate).unwrap();
        assert_eq!(key.to_string(), "mimir:artifact:central:org.example:lib:pom:2.1");
        assert_eq!(key, key.to_string().parse::<Key>().unwrap());
    }

    #[test]
    fn test_invalid_keys_are_rejected() {
        for input in [
            "",
            "mimir",
            "mimir:file:bucket",
            "other:file:bucket:a.txt",
            "mimir:blob:bucket:a.txt",
            "mimir:file::a.txt",
            "mimir:file:.hidden:a.txt",
            "mimir:file:bu/cket:a.txt",
            "mimir:file:bucket:/etc/passwd",
            "mimir:file:bucket:a/../b",
            "mimir:file:bucket:a//b",
            "mimir:artifact:central:g:a:1.0",
            "mimir:artifact:central:g::jar:1.0",
            "mimir:artifact:central:g:..:jar:1.0",
            "mimir:cas:store:ABCDEF",
            "mimir:cas:store:abc",
        ] {
            let err = input.parse::<Key>().unwrap_err();
            assert!(
                matches!(err, Error::InvalidKey { .. }),
                "expected InvalidKey for {input:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_coordinate_of_file_key_fails() {
        let key = Key::file("bucket", "a/b.txt").unwrap();
        assert!(key.coordinate().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let key = Key::content_address("store", "abcdef0123").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"mimir:cas:store:abcdef0123\"");
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<Key>("\"mimir:cas:store:xyz\"").is_err());
    }
}
