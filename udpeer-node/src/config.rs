//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: ~/.config/udpeer/config.toml or /etc/udpeer/config.toml.
/// Env overrides: UDPEER_NAME (or CLIENT_ID), UDPEER_PORT (or SERVER_PORT), UDPEER_OUTBOX, UDPEER_INBOX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Peer name announced in heartbeats. Required.
    pub name: String,
    /// UDP port for the service socket and the heartbeat broadcast. Required.
    pub port: u16,
    /// Directory `sendfile` reads from (default `files`).
    pub outbox_dir: PathBuf,
    /// Directory received files are written to (default `files`).
    pub inbox_dir: PathBuf,
}

/// On-disk form; every field optional so env vars can fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    name: Option<String>,
    port: Option<u16>,
    outbox_dir: Option<PathBuf>,
    inbox_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("peer name not set (UDPEER_NAME, CLIENT_ID or `name` in config file)")]
    MissingName,
    #[error("peer name {0:?} must not contain spaces")]
    InvalidName(String),
    #[error("port not set (UDPEER_PORT, SERVER_PORT or `port` in config file)")]
    MissingPort,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn default_dir() -> PathBuf {
    PathBuf::from("files")
}

/// Load config: config file (if present), then env vars. Fails if name or port is missing.
pub fn load() -> Result<Config, ConfigError> {
    let file = load_file()?.unwrap_or_default();
    resolve(file, |key| std::env::var(key).ok())
}

fn resolve(
    file: FileConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let env_first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| env(k))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    };

    let name = env_first(&["UDPEER_NAME", "CLIENT_ID"])
        .or(file.name.map(|n| n.trim().to_string()))
        .filter(|n| !n.is_empty())
        .ok_or(ConfigError::MissingName)?;
    if name.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidName(name));
    }

    let port = match env_first(&["UDPEER_PORT", "SERVER_PORT"]) {
        Some(s) => s.parse::<u16>().map_err(|_| ConfigError::InvalidPort(s))?,
        None => file.port.ok_or(ConfigError::MissingPort)?,
    };
    if port == 0 {
        return Err(ConfigError::InvalidPort(port.to_string()));
    }

    let outbox_dir = env_first(&["UDPEER_OUTBOX"])
        .map(PathBuf::from)
        .or(file.outbox_dir)
        .unwrap_or_else(default_dir);
    let inbox_dir = env_first(&["UDPEER_INBOX"])
        .map(PathBuf::from)
        .or(file.inbox_dir)
        .unwrap_or_else(default_dir);

    Ok(Config {
        name,
        port,
        outbox_dir,
        inbox_dir,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/udpeer/config.toml"));
    }
    out.push(PathBuf::from("/etc/udpeer/config.toml"));
    out
}

/// First existing config file wins.
fn load_file() -> Result<Option<FileConfig>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => parse_file(&p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn env_supplies_required_settings() {
        let cfg = resolve(
            FileConfig::default(),
            env(&[("UDPEER_NAME", "alice"), ("UDPEER_PORT", "5000")]),
        )
        .unwrap();
        assert_eq!(cfg.name, "alice");
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.outbox_dir, PathBuf::from("files"));
        assert_eq!(cfg.inbox_dir, PathBuf::from("files"));
    }

    #[test]
    fn legacy_env_names_accepted() {
        let cfg = resolve(
            FileConfig::default(),
            env(&[("CLIENT_ID", "bob"), ("SERVER_PORT", "6000")]),
        )
        .unwrap();
        assert_eq!((cfg.name.as_str(), cfg.port), ("bob", 6000));
    }

    #[test]
    fn env_overrides_file() {
        let file = FileConfig {
            name: Some("from-file".into()),
            port: Some(7000),
            outbox_dir: Some("/srv/out".into()),
            inbox_dir: None,
        };
        let cfg = resolve(file, env(&[("UDPEER_PORT", "7001")])).unwrap();
        assert_eq!(cfg.name, "from-file");
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.outbox_dir, PathBuf::from("/srv/out"));
    }

    #[test]
    fn missing_or_blank_name_is_fatal() {
        let err = resolve(FileConfig::default(), env(&[("UDPEER_PORT", "5000")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingName));
        let err = resolve(
            FileConfig::default(),
            env(&[("UDPEER_NAME", "   "), ("UDPEER_PORT", "5000")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingName));
    }

    #[test]
    fn bad_port_is_fatal() {
        let err = resolve(FileConfig::default(), env(&[("UDPEER_NAME", "a")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
        let err = resolve(
            FileConfig::default(),
            env(&[("UDPEER_NAME", "a"), ("UDPEER_PORT", "70000")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_)));
        let err = resolve(
            FileConfig::default(),
            env(&[("UDPEER_NAME", "a"), ("UDPEER_PORT", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_)));
    }

    #[test]
    fn name_with_space_rejected() {
        let err = resolve(
            FileConfig::default(),
            env(&[("UDPEER_NAME", "al ice"), ("UDPEER_PORT", "5000")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName(_)));
    }

    #[test]
    fn parses_toml_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "name = \"carol\"\nport = 5050\ninbox_dir = \"inbox\"").unwrap();
        let file = parse_file(f.path()).unwrap();
        let cfg = resolve(file, env(&[])).unwrap();
        assert_eq!(cfg.name, "carol");
        assert_eq!(cfg.port, 5050);
        assert_eq!(cfg.inbox_dir, PathBuf::from("inbox"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "nmae = \"typo\"").unwrap();
        assert!(matches!(
            parse_file(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
