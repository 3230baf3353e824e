//! Centralized path management for mimir.
//!
//! Everything lives under one base directory:
//!
//! ```text
//! ~/.mimir/
//!   mimir.toml      (configuration, optional)
//!   mimir-socket    (daemon Unix socket)
//!   local/          (file node store)
//! ```
//!
//! Resolution order for the base directory:
//! 1. `mimir.basedir` property
//! 2. `MIMIR_BASEDIR` environment variable
//! 3. `~/.mimir`

use crate::properties::{Properties, keys};
use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable overriding the base directory
pub const BASEDIR_ENV: &str = "MIMIR_BASEDIR";

/// File name of the daemon socket inside the base directory
pub const SOCKET_FILE_NAME: &str = "mimir-socket";

/// File name of the configuration file inside the base directory
pub const CONFIG_FILE_NAME: &str = "mimir.toml";

/// Get the base directory.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn basedir(properties: &Properties) -> Result<PathBuf> {
    if let Some(dir) = properties.get(keys::BASEDIR)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }

    if let Ok(dir) = std::env::var(BASEDIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| Error::configuration("Could not determine home directory"))?;

    Ok(home.join(".mimir"))
}

/// Get the path of the daemon socket.
///
/// `mimir.daemon.socketPath` wins over `<basedir>/mimir-socket`.
///
/// # Errors
///
/// Returns an error if the base directory cannot be determined.
pub fn socket_path(properties: &Properties) -> Result<PathBuf> {
    if let Some(path) = properties.get(keys::DAEMON_SOCKET_PATH)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    Ok(basedir(properties)?.join(SOCKET_FILE_NAME))
}

/// Get the root directory of the file node.
///
/// # Errors
///
/// Returns an error if the base directory cannot be determined.
pub fn file_node_dir(properties: &Properties) -> Result<PathBuf> {
    if let Some(path) = properties.get(keys::FILE_BASEDIR)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    Ok(basedir(properties)?.join("local"))
}

/// Get the default configuration file path.
///
/// # Errors
///
/// Returns an error if the base directory cannot be determined.
pub fn config_file(properties: &Properties) -> Result<PathBuf> {
    Ok(basedir(properties)?.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_win() {
        let props = Properties::new().with(keys::BASEDIR, "/srv/mimir");
        assert_eq!(basedir(&props).unwrap(), PathBuf::from("/srv/mimir"));
        assert_eq!(
            socket_path(&props).unwrap(),
            PathBuf::from("/srv/mimir/mimir-socket")
        );
        assert_eq!(
            file_node_dir(&props).unwrap(),
            PathBuf::from("/srv/mimir/local")
        );
        assert_eq!(
            config_file(&props).unwrap(),
            PathBuf::from("/srv/mimir/mimir.toml")
        );
    }

    #[test]
    fn test_explicit_socket_path() {
        let props = Properties::new()
            .with(keys::BASEDIR, "/srv/mimir")
            .with(keys::DAEMON_SOCKET_PATH, "/run/mimir.sock");
        assert_eq!(
            socket_path(&props).unwrap(),
            PathBuf::from("/run/mimir.sock")
        );
    }
}
