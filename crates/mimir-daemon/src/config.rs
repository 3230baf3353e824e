//! Effective configuration.
//!
//! Properties are layered, lowest precedence first:
//! 1. built-in defaults (applied by each consumer)
//! 2. `<basedir>/mimir.toml`, or the file given with `--config`
//! 3. `-D key=value` overrides
//!
//! Nested TOML tables are flattened into dotted keys, so
//! `[mimir.daemon] workers = 4` becomes `mimir.daemon.workers = "4"`.

use crate::error::{DaemonError, Result};
use mimir_core::{Properties, paths};
use std::path::Path;

/// Parse a `key=value` override.
///
/// # Errors
///
/// Returns a message when the `=` is missing or the key is empty.
pub fn parse_override(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Load the effective properties.
///
/// A missing default config file is fine; a missing `--config` file is not.
///
/// # Errors
///
/// Returns a configuration error for unreadable or malformed files.
pub async fn load(config_file: Option<&Path>, overrides: &[(String, String)]) -> Result<Properties> {
    let cli: Properties = overrides.iter().cloned().collect();

    let (path, explicit) = match config_file {
        Some(path) => (path.to_path_buf(), true),
        None => (paths::config_file(&cli)?, false),
    };

    let mut properties = match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
            let properties = parse_toml(&text).map_err(|message| {
                DaemonError::config_with_help(
                    format!("{}: {message}", path.display()),
                    "The configuration file must be valid TOML",
                )
            })?;
            tracing::debug!(path = %path.display(), keys = properties.len(), "Configuration loaded");
            properties
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Properties::new(),
        Err(e) => return Err(DaemonError::io(e, &path, "read configuration")),
    };
    properties.merge(&cli);
    Ok(properties)
}

/// Flatten a TOML document into properties.
///
/// # Errors
///
/// Returns the parser message for malformed TOML.
pub fn parse_toml(text: &str) -> std::result::Result<Properties, String> {
    let table: toml::Table = text.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut properties = Properties::new();
    flatten("", &table, &mut properties);
    Ok(properties)
}

fn flatten(prefix: &str, table: &toml::Table, into: &mut Properties) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&key, nested, into),
            other => into.set(key, scalar(other)),
        }
    }
}

fn scalar(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items.iter().map(scalar).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::properties::keys;
    use tempfile::TempDir;

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("mimir.daemon.workers=4").unwrap(),
            ("mimir.daemon.workers".to_string(), "4".to_string())
        );
        assert_eq!(parse_override("a=b=c").unwrap().1, "b=c");
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=x").is_err());
    }

    #[test]
    fn test_toml_is_flattened() {
        let props = parse_toml(
            r#"
            [mimir.daemon]
            workers = 4
            remoteNodes = ["http", "group"]

            [mimir.file]
            mayLink = false
            "#,
        )
        .unwrap();
        assert_eq!(props.get(keys::DAEMON_WORKERS), Some("4"));
        assert_eq!(props.get(keys::DAEMON_REMOTE_NODES), Some("http,group"));
        assert_eq!(props.get(keys::FILE_MAY_LINK), Some("false"));
    }

    #[test]
    fn test_malformed_toml_is_reported() {
        assert!(parse_toml("[mimir").is_err());
    }

    #[tokio::test]
    async fn test_overrides_win_over_file() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("mimir.toml"),
            "[mimir.daemon]\nworkers = 2\nsystemNode = \"file\"\n",
        )
        .await
        .unwrap();
        let overrides = vec![
            (keys::BASEDIR.to_string(), tmp.path().to_string_lossy().into_owned()),
            (keys::DAEMON_WORKERS.to_string(), "8".to_string()),
        ];

        let props = load(None, &overrides).await.unwrap();
        assert_eq!(props.get(keys::DAEMON_WORKERS), Some("8"));
        assert_eq!(props.get(keys::DAEMON_SYSTEM_NODE), Some("file"));
    }

    #[tokio::test]
    async fn test_missing_default_file_is_fine_but_explicit_is_not() {
        let tmp = TempDir::new().unwrap();
        let overrides = vec![(keys::BASEDIR.to_string(), tmp.path().to_string_lossy().into_owned())];
        assert!(load(None, &overrides).await.unwrap().get(keys::DAEMON_WORKERS).is_none());

        let missing = tmp.path().join("nope.toml");
        assert!(load(Some(&missing), &overrides).await.is_err());
    }
}
