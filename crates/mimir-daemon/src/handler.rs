//! Execution of established-session commands against the caching node

use crate::error::{DaemonError, Result};
use crate::protocol::{Command, Data, fields};
use mimir_core::checksum::{SHA_1, SHA_256, SHA_512};
use mimir_core::entry;
use mimir_core::resolver::repository_path;
use mimir_core::{CachingNode, Checksums, Entry, Key, LocalEntry, LocalNode, Metadata, Scheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Checksum sidecars read next to bundle files
const BUNDLE_SIDECARS: [(&str, &str); 3] = [(SHA_1, "sha1"), (SHA_256, "sha256"), (SHA_512, "sha512")];

/// Outcome of a PRESEED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreseedReport {
    /// Keys copied from the bundle
    pub stored: usize,
    /// Keys the system node already had
    pub skipped: usize,
}

/// Runs LOCATE, TRANSFER, LS_CHECKSUMS, STORE_PATH and PRESEED
#[derive(Debug, Clone)]
pub struct CommandHandler {
    caching: Arc<CachingNode>,
}

impl CommandHandler {
    /// Handler serving from `caching`
    #[must_use]
    pub const fn new(caching: Arc<CachingNode>) -> Self {
        Self { caching }
    }

    /// The node commands run against
    #[must_use]
    pub const fn caching(&self) -> &Arc<CachingNode> {
        &self.caching
    }

    /// Execute `command` and return the response data
    ///
    /// # Errors
    ///
    /// Returns the error to be answered with KO.
    pub async fn dispatch(&self, command: Command, data: &Data) -> Result<Data> {
        match command {
            Command::Locate => self.locate(data).await,
            Command::Transfer => self.transfer(data).await,
            Command::LsChecksums => Ok(self.ls_checksums()),
            Command::StorePath => self.store_path(data).await,
            Command::Preseed => self.preseed(data).await,
            Command::Hello | Command::Bye => Err(DaemonError::protocol(format!(
                "{command} is handled by the session layer"
            ))),
        }
    }

    async fn locate(&self, data: &Data) -> Result<Data> {
        let key = key_arg(data)?;
        let found = self.caching.locate(&key).await?;
        tracing::debug!(key = %key, hit = found.is_some(), "LOCATE");
        Ok(found.map(|entry| entry.info().to_merged()).unwrap_or_default())
    }

    async fn transfer(&self, data: &Data) -> Result<Data> {
        let key = key_arg(data)?;
        let target = path_arg(data)?;
        let Some(found) = self.caching.locate(&key).await? else {
            return Err(DaemonError::NotFound {
                key: key.to_string(),
            });
        };
        found.transfer_to(&target).await?;
        tracing::debug!(key = %key, target = %target.display(), "TRANSFER");
        Ok(Data::new())
    }

    fn ls_checksums(&self) -> Data {
        Data::from([(
            fields::CHECKSUMS.to_string(),
            self.caching.checksum_algorithms().join(","),
        )])
    }

    async fn store_path(&self, data: &Data) -> Result<Data> {
        let key = key_arg(data)?;
        let source = path_arg(data)?;
        let (metadata, checksums) = entry::split(data);
        let stored = self
            .caching
            .store(&key, &source, &metadata, &checksums)
            .await?;
        tracing::debug!(key = %key, source = %source.display(), "STORE_PATH");
        Ok(stored.info().to_merged())
    }

    async fn preseed(&self, data: &Data) -> Result<Data> {
        let bundle = path_arg(data)?;
        let keys = data
            .iter()
            .filter(|(name, _)| name.starts_with(fields::KEY_PREFIX))
            .map(|(_, value)| value.parse::<Key>())
            .collect::<mimir_core::Result<Vec<_>>>()?;

        let mut report = PreseedReport::default();
        for key in keys {
            if self.caching.system().locate(&key).await?.is_some() {
                report.skipped += 1;
                continue;
            }
            let file = bundle_file(&bundle, &key)?;
            let present = tokio::fs::try_exists(&file)
                .await
                .map_err(|e| DaemonError::io(e, &file, "stat bundle file"))?;
            if !present {
                return Err(mimir_core::Error::unavailable(
                    "bundle",
                    format!("{} has no file for {key}", bundle.display()),
                )
                .into());
            }
            let checksums = bundle_checksums(&file).await?;
            self.caching
                .store(&key, &file, &Metadata::new(), &checksums)
                .await?;
            report.stored += 1;
        }

        tracing::info!(bundle = %bundle.display(), stored = report.stored, skipped = report.skipped, "PRESEED");
        Ok(Data::from([
            (fields::STORED.to_string(), report.stored.to_string()),
            (fields::SKIPPED.to_string(), report.skipped.to_string()),
        ]))
    }
}

fn key_arg(data: &Data) -> Result<Key> {
    Ok(required(data, fields::KEY)?.parse()?)
}

fn path_arg(data: &Data) -> Result<PathBuf> {
    let path = PathBuf::from(required(data, fields::PATH)?);
    if !path.is_absolute() {
        return Err(DaemonError::protocol(format!(
            "path '{}' must be absolute",
            path.display()
        )));
    }
    Ok(path)
}

fn required<'a>(data: &'a Data, name: &str) -> Result<&'a str> {
    data.get(name)
        .map(String::as_str)
        .ok_or_else(|| DaemonError::protocol(format!("missing '{name}'")))
}

/// Where a key lives inside a Maven-style bundle
fn bundle_file(bundle: &Path, key: &Key) -> Result<PathBuf> {
    match key.scheme() {
        Scheme::Artifact => Ok(bundle.join(repository_path(&key.coordinate()?))),
        Scheme::File => Ok(bundle.join(key.payload())),
        Scheme::ContentAddress => Err(DaemonError::protocol(format!(
            "{key} cannot be preseeded from a bundle"
        ))),
    }
}

/// Digests published next to a bundle file as `<file>.sha1` and friends
async fn bundle_checksums(file: &Path) -> Result<Checksums> {
    let mut checksums = Checksums::new();
    for (algorithm, extension) in BUNDLE_SIDECARS {
        let mut sidecar = file.as_os_str().to_owned();
        sidecar.push(".");
        sidecar.push(extension);
        let sidecar = PathBuf::from(sidecar);
        let body = match tokio::fs::read_to_string(&sidecar).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(DaemonError::io(e, &sidecar, "read checksum sidecar")),
        };
        if let Some(digest) = body.split_whitespace().next() {
            checksums.insert(algorithm.to_string(), digest.to_ascii_lowercase());
        }
    }
    Ok(checksums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::{FileNode, FileNodeConfig};
    use tempfile::TempDir;

    fn handler(tmp: &TempDir) -> CommandHandler {
        let system = FileNode::new(FileNodeConfig::new("file", tmp.path().join("local"))).unwrap();
        CommandHandler::new(Arc::new(CachingNode::new(
            Vec::new(),
            Arc::new(system),
            Vec::new(),
        )))
    }

    fn preseed_request(bundle: &Path, key: &str) -> Data {
        Data::from([
            (fields::PATH.to_string(), bundle.display().to_string()),
            (format!("{}0", fields::KEY_PREFIX), key.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_preseed_reports_missing_bundle_file() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();

        let err = handler(&tmp)
            .preseed(&preseed_request(&bundle, "mimir:file:tools:bin/tool"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no file"), "{err}");
    }

    #[tokio::test]
    async fn test_preseed_propagates_bundle_io_errors() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the bundle directory should be: stat fails with ENOTDIR.
        let bundle = tmp.path().join("bundle");
        std::fs::write(&bundle, b"not a directory").unwrap();

        let err = handler(&tmp)
            .preseed(&preseed_request(&bundle, "mimir:file:tools:bin/tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Io { .. }), "{err}");
    }

    #[test]
    fn test_bundle_file_layout() {
        let bundle = Path::new("/bundle");
        let artifact: Key = "mimir:artifact:central:org.example:lib:jar:1.0".parse().unwrap();
        assert_eq!(
            bundle_file(bundle, &artifact).unwrap(),
            Path::new("/bundle/org/example/lib/1.0/lib-1.0.jar")
        );
        let file: Key = "mimir:file:tools:bin/tool".parse().unwrap();
        assert_eq!(bundle_file(bundle, &file).unwrap(), Path::new("/bundle/bin/tool"));
        let cas: Key = "mimir:cas:blobs:abcd".parse().unwrap();
        assert!(bundle_file(bundle, &cas).is_err());
    }

    #[test]
    fn test_relative_paths_are_refused() {
        let data = Data::from([(fields::PATH.to_string(), "relative/file".to_string())]);
        assert!(path_arg(&data).is_err());
        assert!(required(&Data::new(), fields::KEY).is_err());
    }
}
