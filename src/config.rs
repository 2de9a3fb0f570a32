//! Host configuration: defaults, TOML file, environment overrides.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Wire and codec clamps shared by server and client endpoints.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Upper bound on one framed payload, both directions.
    pub max_frame_bytes: usize,
    pub max_payload_bytes: usize,
    pub max_channel_name_len: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_frame_bytes: 1 << 20,
            max_payload_bytes: 1 << 19,
            max_channel_name_len: 255,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: String,
    /// Default tracing filter; `LOCKSTEP_LOG` or `-v` override it.
    pub log_filter: String,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "127.0.0.1:30303".to_string(),
            log_filter: "info".to_string(),
            limits: Limits::default(),
        }
    }
}

/// Load configuration: defaults, then the TOML file if given, then the
/// `LOCKSTEP_*` environment.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = lookup("LOCKSTEP_LISTEN_ADDR") {
        config.listen_addr = addr;
    }
    if let Some(filter) = lookup("LOCKSTEP_LOG") {
        config.log_filter = filter;
    }
    if let Some(raw) = lookup("LOCKSTEP_MAX_FRAME_BYTES") {
        match raw.parse() {
            Ok(value) => config.limits.max_frame_bytes = value,
            Err(_) => tracing::warn!(raw, "ignoring unparseable LOCKSTEP_MAX_FRAME_BYTES"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert!(config.limits.max_payload_bytes < config.limits.max_frame_bytes);
        assert!(config.limits.max_channel_name_len <= usize::from(u16::MAX));
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_addr = \"0.0.0.0:4000\"\n\n[limits]\nmax_frame_bytes = 4096\n"
        )
        .unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.limits.max_frame_bytes, 4096);
        // Unset fields keep their defaults.
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "listen_adr = \"oops\"\n").unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            load(Some(Path::new("/nonexistent/lockstep.toml"))),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        apply_overrides(&mut config, |key| match key {
            "LOCKSTEP_LISTEN_ADDR" => Some("127.0.0.1:9999".to_string()),
            "LOCKSTEP_MAX_FRAME_BYTES" => Some("2048".to_string()),
            _ => None,
        });
        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.limits.max_frame_bytes, 2048);
    }

    #[test]
    fn bad_env_number_is_ignored() {
        let mut config = Config::default();
        apply_overrides(&mut config, |key| match key {
            "LOCKSTEP_MAX_FRAME_BYTES" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.limits.max_frame_bytes, Limits::default().max_frame_bytes);
    }
}
