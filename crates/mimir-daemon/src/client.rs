//! Daemon client.
//!
//! One [`DaemonClient`] owns one connection and one session. Every response
//! carries the session map; a sessionId other than ours means the daemon was
//! restarted underneath us and is reported as [`DaemonError::SessionChanged`].

use crate::error::{DaemonError, Result};
use crate::handler::PreseedReport;
use crate::protocol::{Command, Data, PROTOCOL_VERSION, Request, Response, Status, fields};
use crate::session::session_map;
use mimir_core::entry;
use mimir_core::{Checksums, EntryInfo, Key, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

/// Client side of a daemon connection.
#[derive(Debug)]
pub struct DaemonClient {
    stream: UnixStream,
    socket: PathBuf,
    session: Data,
    daemon_version: Option<String>,
}

impl DaemonClient {
    /// Connect and say HELLO with `client` data.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::NotRunning`] when nothing listens on `socket`,
    /// or [`DaemonError::Rejected`] when the daemon refuses the HELLO.
    pub async fn connect(socket: impl AsRef<Path>, client: Data) -> Result<Self> {
        let mut this = Self::open(socket.as_ref()).await?;
        let mut data = client;
        data.insert(fields::PROTOCOL.to_string(), PROTOCOL_VERSION.to_string());
        let response = this.exchange(Command::Hello, data).await?;
        let id = response
            .session
            .get(fields::SESSION_ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DaemonError::protocol("HELLO response carries no sessionId"))?;
        this.session = session_map(id);
        this.daemon_version = response.data.get(fields::VERSION).cloned();
        tracing::debug!(
            socket = %this.socket.display(),
            session = %id,
            daemon = this.daemon_version.as_deref().unwrap_or("unknown"),
            "Connected to daemon"
        );
        Ok(this)
    }

    /// Connect and continue an existing session without HELLO.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::NotRunning`] when nothing listens on `socket`.
    pub async fn resume(socket: impl AsRef<Path>, session_id: &str) -> Result<Self> {
        let mut this = Self::open(socket.as_ref()).await?;
        this.session = session_map(session_id);
        Ok(this)
    }

    async fn open(socket: &Path) -> Result<Self> {
        let present = tokio::fs::try_exists(socket)
            .await
            .map_err(|e| DaemonError::io(e, socket, "stat daemon socket"))?;
        if !present {
            return Err(DaemonError::NotRunning {
                socket: socket.to_path_buf(),
            });
        }
        let stream = UnixStream::connect(socket).await.map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                DaemonError::NotRunning {
                    socket: socket.to_path_buf(),
                }
            }
            _ => DaemonError::io(e, socket, "connect to daemon"),
        })?;
        Ok(Self {
            stream,
            socket: socket.to_path_buf(),
            session: Data::new(),
            daemon_version: None,
        })
    }

    /// Session id held by this client.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session.get(fields::SESSION_ID).map(String::as_str)
    }

    /// Daemon version reported by HELLO.
    #[must_use]
    pub fn daemon_version(&self) -> Option<&str> {
        self.daemon_version.as_deref()
    }

    /// Look `key` up; `None` on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon answers KO or the connection fails.
    pub async fn locate(&mut self, key: &Key) -> Result<Option<EntryInfo>> {
        let data = self.call(Command::Locate, key_data(key)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(EntryInfo::from_merged(&data)))
    }

    /// Materialize `key` at `target` on the daemon host.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is missing, the path is refused, or the
    /// connection fails.
    pub async fn transfer(&mut self, key: &Key, target: &Path) -> Result<()> {
        let mut data = key_data(key);
        data.insert(fields::PATH.to_string(), path_string(target));
        self.call(Command::Transfer, data).await?;
        Ok(())
    }

    /// Checksum algorithms of the daemon's system node, in order.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon answers KO or the connection fails.
    pub async fn ls_checksums(&mut self) -> Result<Vec<String>> {
        let data = self.call(Command::LsChecksums, Data::new()).await?;
        Ok(data
            .get(fields::CHECKSUMS)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Store the file at `source` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon answers KO, for example on a
    /// checksum mismatch, or the connection fails.
    pub async fn store_path(
        &mut self,
        key: &Key,
        source: &Path,
        metadata: &Metadata,
        checksums: &Checksums,
    ) -> Result<EntryInfo> {
        let mut data = entry::merge(metadata, checksums);
        data.extend(key_data(key));
        data.insert(fields::PATH.to_string(), path_string(source));
        let stored = self.call(Command::StorePath, data).await?;
        Ok(EntryInfo::from_merged(&stored))
    }

    /// Populate the cache with `keys` from the bundle rooted at `bundle`.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon answers KO or the connection fails.
    pub async fn preseed(&mut self, bundle: &Path, keys: &[Key]) -> Result<PreseedReport> {
        let mut data = Data::from([(fields::PATH.to_string(), path_string(bundle))]);
        for (index, key) in keys.iter().enumerate() {
            data.insert(format!("{}{index}", fields::KEY_PREFIX), key.to_string());
        }
        let answer = self.call(Command::Preseed, data).await?;
        Ok(PreseedReport {
            stored: count(&answer, fields::STORED)?,
            skipped: count(&answer, fields::SKIPPED)?,
        })
    }

    /// Close the session; with `shutdown` the daemon terminates afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon answers KO or the connection fails.
    pub async fn bye(mut self, shutdown: bool) -> Result<()> {
        let mut data = Data::new();
        if shutdown {
            data.insert(fields::SHUTDOWN.to_string(), "true".to_string());
        }
        self.call(Command::Bye, data).await?;
        Ok(())
    }

    async fn call(&mut self, command: Command, data: Data) -> Result<Data> {
        Ok(self.exchange(command, data).await?.data)
    }

    async fn exchange(&mut self, command: Command, data: Data) -> Result<Response> {
        Request::new(command, data, self.session.clone())
            .write_to(&mut self.stream)
            .await?;
        let response = Response::read_from(&mut self.stream)
            .await?
            .ok_or_else(|| {
                DaemonError::protocol(format!("daemon closed the connection during {command}"))
            })?;

        if let Some(expected) = self.session.get(fields::SESSION_ID) {
            let actual = response
                .session
                .get(fields::SESSION_ID)
                .map_or("", String::as_str);
            if actual != expected {
                return Err(DaemonError::SessionChanged {
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }
        }

        match response.status {
            Status::Ok => Ok(response),
            Status::Ko => Err(DaemonError::Rejected {
                command: command.to_string(),
                message: response.message().unwrap_or("no message").to_string(),
            }),
        }
    }
}

fn key_data(key: &Key) -> Data {
    Data::from([(fields::KEY.to_string(), key.to_string())])
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn count(data: &Data, field: &str) -> Result<usize> {
    data.get(field)
        .map_or(Ok(0), |v| v.parse())
        .map_err(|_| DaemonError::protocol(format!("'{field}' is not a count")))
}
