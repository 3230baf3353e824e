//! Checksum algorithms and enforcement
//!
//! Checksums are computed strictly once over a forward pass of the content:
//! [`ChecksumReader`] and [`ChecksumWriter`] accumulate digests while bytes
//! flow through them and neither supports seeking. [`ChecksumEnforcer`]
//! compares the final digests against an expected map.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Algorithm name to lowercase hex digest
pub type Checksums = BTreeMap<String, String>;

/// SHA-1
pub const SHA_1: &str = "SHA-1";
/// SHA-256
pub const SHA_256: &str = "SHA-256";
/// SHA-512
pub const SHA_512: &str = "SHA-512";

const BUFFER_SIZE: usize = 64 * 1024;

/// A running digest computation
pub trait ChecksumAlgorithm: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Finish and return the lowercase hex digest
    fn finish(self: Box<Self>) -> String;
}

macro_rules! digest_algorithm {
    ($name:ident, $constructor:ident, $hasher:ty, $digest:path) => {
        struct $name($hasher);

        impl ChecksumAlgorithm for $name {
            fn update(&mut self, data: &[u8]) {
                <$hasher as $digest>::update(&mut self.0, data);
            }

            fn finish(self: Box<Self>) -> String {
                hex::encode(<$hasher as $digest>::finalize(self.0).as_slice())
            }
        }

        fn $constructor() -> Box<dyn ChecksumAlgorithm> {
            Box::new($name(<$hasher as $digest>::new()))
        }
    };
}

digest_algorithm!(Sha1Algorithm, sha1_algorithm, sha1::Sha1, sha1::Digest);
digest_algorithm!(Sha256Algorithm, sha256_algorithm, sha2::Sha256, sha2::Digest);
digest_algorithm!(Sha512Algorithm, sha512_algorithm, sha2::Sha512, sha2::Digest);

/// Creates running computations of one algorithm
#[derive(Debug)]
pub struct ChecksumAlgorithmFactory {
    name: &'static str,
    create: fn() -> Box<dyn ChecksumAlgorithm>,
}

impl ChecksumAlgorithmFactory {
    /// Canonical algorithm name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Start a new computation
    #[must_use]
    pub fn create(&self) -> Box<dyn ChecksumAlgorithm> {
        (self.create)()
    }
}

static FACTORIES: [ChecksumAlgorithmFactory; 3] = [
    ChecksumAlgorithmFactory {
        name: SHA_1,
        create: sha1_algorithm,
    },
    ChecksumAlgorithmFactory {
        name: SHA_256,
        create: sha256_algorithm,
    },
    ChecksumAlgorithmFactory {
        name: SHA_512,
        create: sha512_algorithm,
    },
];

/// Names of every supported algorithm
#[must_use]
pub fn supported_algorithms() -> Vec<&'static str> {
    FACTORIES.iter().map(ChecksumAlgorithmFactory::name).collect()
}

/// Look up an algorithm by name (case-insensitive)
///
/// # Errors
///
/// Returns [`Error::UnsupportedChecksum`] for unknown names.
pub fn factory(name: &str) -> Result<&'static ChecksumAlgorithmFactory> {
    FACTORIES
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| Error::UnsupportedChecksum {
            algorithm: name.to_string(),
        })
}

/// Rewrite known algorithm names to their canonical spelling
///
/// Unknown names are kept as given; they never intersect with computed digests.
#[must_use]
pub fn canonicalize(checksums: Checksums) -> Checksums {
    checksums
        .into_iter()
        .map(|(name, value)| match factory(&name) {
            Ok(f) => (f.name().to_string(), value),
            Err(_) => (name, value),
        })
        .collect()
}

/// Look up several algorithms, keeping their order
///
/// # Errors
///
/// Returns [`Error::UnsupportedChecksum`] for the first unknown name.
pub fn factories<S: AsRef<str>>(names: &[S]) -> Result<Vec<&'static ChecksumAlgorithmFactory>> {
    names.iter().map(|name| factory(name.as_ref())).collect()
}

/// Running computations of several algorithms at once
pub struct Checksummer {
    running: Vec<(&'static str, Box<dyn ChecksumAlgorithm>)>,
}

impl Checksummer {
    /// Start computations for the given algorithms
    #[must_use]
    pub fn new(factories: &[&'static ChecksumAlgorithmFactory]) -> Self {
        Self {
            running: factories.iter().map(|f| (f.name(), f.create())).collect(),
        }
    }

    /// Feed more bytes to every computation
    pub fn update(&mut self, data: &[u8]) {
        for (_, algorithm) in &mut self.running {
            algorithm.update(data);
        }
    }

    /// Finish every computation
    #[must_use]
    pub fn finish(self) -> Checksums {
        self.running
            .into_iter()
            .map(|(name, algorithm)| (name.to_string(), algorithm.finish()))
            .collect()
    }
}

impl std::fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.running.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Compute checksums over a whole file
///
/// # Errors
///
/// Returns [`Error::Io`] when the file cannot be read.
pub async fn checksum_file(
    path: &Path,
    factories: &[&'static ChecksumAlgorithmFactory],
) -> Result<Checksums> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io(e, path, "open"))?;
    let mut checksummer = Checksummer::new(factories);
    let mut reader = tokio::io::BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        checksummer.update(&buf[..n]);
    }
    Ok(checksummer.finish())
}

/// Compare expected checksums with received ones
///
/// At least one algorithm must appear in both maps and every such
/// algorithm must agree. Algorithm names and hex digests are both compared
/// case-insensitively.
///
/// # Errors
///
/// Returns [`Error::NoChecksumIntersection`] or [`Error::ChecksumMismatch`].
pub fn enforce(expected: &Checksums, received: &Checksums) -> Result<()> {
    let received_canonical = canonicalize(received.clone());
    let mut matched = false;
    for (algorithm, value) in canonicalize(expected.clone()) {
        let Some(actual) = received_canonical.get(&algorithm) else {
            continue;
        };
        if !actual.eq_ignore_ascii_case(&value) {
            return Err(Error::ChecksumMismatch {
                expected: expected.clone(),
                received: received.clone(),
            });
        }
        matched = true;
    }
    if matched {
        Ok(())
    } else {
        Err(Error::NoChecksumIntersection {
            expected: expected.clone(),
            received: received.clone(),
        })
    }
}

/// Callback invoked once with the final digests at end of stream
pub type ChecksumCallback = Box<dyn FnOnce(&Checksums) -> Result<()> + Send>;

/// Reader that computes checksums of everything read through it
///
/// When the inner reader reports end of stream the digests are finalized
/// and handed to the callback; a callback error fails that read with
/// [`io::ErrorKind::InvalidData`] wrapping the [`Error`].
pub struct ChecksumReader<R> {
    inner: R,
    checksummer: Option<Checksummer>,
    callback: Option<ChecksumCallback>,
    checksums: Option<Checksums>,
}

impl<R> ChecksumReader<R> {
    /// Wrap a reader
    #[must_use]
    pub fn new(
        inner: R,
        factories: &[&'static ChecksumAlgorithmFactory],
        callback: Option<ChecksumCallback>,
    ) -> Self {
        Self {
            inner,
            checksummer: Some(Checksummer::new(factories)),
            callback,
            checksums: None,
        }
    }

    /// Final digests, available once the stream was read to the end
    #[must_use]
    pub fn checksums(&self) -> Option<&Checksums> {
        self.checksums.as_ref()
    }

    fn complete(&mut self) -> io::Result<()> {
        let Some(checksummer) = self.checksummer.take() else {
            return Ok(());
        };
        let checksums = checksummer.finish();
        let outcome = match self.callback.take() {
            Some(callback) => callback(&checksums),
            None => Ok(()),
        };
        self.checksums = Some(checksums);
        outcome.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChecksumReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = &buf.filled()[before..];
        if !read.is_empty() {
            if let Some(checksummer) = this.checksummer.as_mut() {
                checksummer.update(read);
            }
        } else if had_room {
            this.complete()?;
        }
        Poll::Ready(Ok(()))
    }
}

/// Writer that computes checksums of everything written through it
pub struct ChecksumWriter<W> {
    inner: W,
    checksummer: Checksummer,
    written: u64,
}

impl<W> ChecksumWriter<W> {
    /// Wrap a writer
    #[must_use]
    pub fn new(inner: W, factories: &[&'static ChecksumAlgorithmFactory]) -> Self {
        Self {
            inner,
            checksummer: Checksummer::new(factories),
            written: 0,
        }
    }

    /// Number of bytes written so far
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer and the digests of everything written
    #[must_use]
    pub fn finish(self) -> (W, Checksums) {
        (self.inner, self.checksummer.finish())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChecksumWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.checksummer.update(&buf[..n]);
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Validates streamed content against expected checksums
#[derive(Debug, Clone)]
pub struct ChecksumEnforcer {
    expected: Checksums,
}

impl ChecksumEnforcer {
    /// Enforcer expecting the given digests
    #[must_use]
    pub fn new(expected: Checksums) -> Self {
        Self { expected }
    }

    /// The expected digests
    #[must_use]
    pub fn expected(&self) -> &Checksums {
        &self.expected
    }

    /// Check received digests
    ///
    /// # Errors
    ///
    /// See [`enforce`].
    pub fn verify(&self, received: &Checksums) -> Result<()> {
        enforce(&self.expected, received)
    }

    /// Wrap a reader so that reaching end of stream enforces the checksums
    #[must_use]
    pub fn wrap<R>(
        &self,
        inner: R,
        factories: &[&'static ChecksumAlgorithmFactory],
    ) -> ChecksumReader<R> {
        let enforcer = self.clone();
        ChecksumReader::new(
            inner,
            factories,
            Some(Box::new(move |received| enforcer.verify(received))),
        )
    }
}

/// Recover the integrity [`Error`] carried by an I/O error from a [`ChecksumReader`]
#[must_use]
pub fn integrity_error(err: &io::Error) -> Option<&Error> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<Error>())
        .filter(|e| e.is_integrity())
}
