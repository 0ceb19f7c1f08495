use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` environment
/// variables, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the JSON embedding store.
    pub store_path: PathBuf,
    /// Path to the SQLite attendance ledger.
    pub ledger_path: PathBuf,
    /// Shell command that writes one captured image to stdout.
    pub capture_cmd: String,
    /// Shell command reading a PNG on stdin, printing a JSON list of embeddings.
    pub encoder_cmd: String,
    /// Shell command printing a transcribed name (speech enrollment).
    pub listen_cmd: Option<String>,
    /// Shell command that speaks text read from stdin.
    pub speak_cmd: Option<String>,
    /// Seconds to wait for a spoken name.
    pub listen_timeout_secs: u64,
    /// Optional open-set threshold on class probability.
    pub min_confidence: Option<f32>,
    pub bus: Bus,
}

/// File layer: every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub store_path: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub capture_cmd: Option<String>,
    pub encoder_cmd: Option<String>,
    pub listen_cmd: Option<String>,
    pub speak_cmd: Option<String>,
    pub listen_timeout_secs: Option<u64>,
    pub min_confidence: Option<f32>,
    pub bus: Option<Bus>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load from the config file (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => parse_file(&path, &text)?,
            // A missing default file is fine; a missing explicit one is not.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                FileConfig::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge a file layer with an environment lookup.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir(&env);

        let min_confidence = env("ROLLCALL_MIN_CONFIDENCE")
            .and_then(|v| v.parse().ok())
            .or(file.min_confidence)
            .filter(|t: &f32| *t > 0.0);

        let bus = match env("ROLLCALL_BUS").as_deref() {
            Some("system") => Bus::System,
            Some("session") => Bus::Session,
            Some(other) => {
                let fallback = file.bus.unwrap_or(Bus::Session);
                tracing::warn!(value = other, ?fallback, "ignoring unrecognised ROLLCALL_BUS");
                fallback
            }
            None => file.bus.unwrap_or(Bus::Session),
        };

        Self {
            store_path: env("ROLLCALL_STORE_PATH")
                .map(PathBuf::from)
                .or(file.store_path)
                .unwrap_or_else(|| data_dir.join("faces.json")),
            ledger_path: env("ROLLCALL_LEDGER_PATH")
                .map(PathBuf::from)
                .or(file.ledger_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            capture_cmd: env("ROLLCALL_CAPTURE_CMD")
                .or(file.capture_cmd)
                .unwrap_or_else(|| "fswebcam --no-banner --png 0 -".to_string()),
            encoder_cmd: env("ROLLCALL_ENCODER_CMD")
                .or(file.encoder_cmd)
                .unwrap_or_else(|| "rollcall-encode".to_string()),
            listen_cmd: env("ROLLCALL_LISTEN_CMD").or(file.listen_cmd).filter(|c| !c.trim().is_empty()),
            speak_cmd: env("ROLLCALL_SPEAK_CMD").or(file.speak_cmd).filter(|c| !c.trim().is_empty()),
            listen_timeout_secs: env("ROLLCALL_LISTEN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .or(file.listen_timeout_secs)
                .unwrap_or(8),
            min_confidence,
            bus,
        }
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }
}

fn parse_file(path: &Path, text: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("rollcall/rollcalld.toml")
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".local/share"))
        .join("rollcall")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let cfg = Config::resolve(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(cfg.store_path, PathBuf::from("/data/rollcall/faces.json"));
        assert_eq!(cfg.ledger_path, PathBuf::from("/data/rollcall/attendance.db"));
        assert_eq!(cfg.listen_timeout(), Duration::from_secs(8));
        assert_eq!(cfg.min_confidence, None);
        assert_eq!(cfg.bus, Bus::Session);
        assert!(cfg.listen_cmd.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = parse_file(
            Path::new("rollcalld.toml"),
            r#"
                store_path = "/srv/faces.json"
                listen_timeout_secs = 5
                min_confidence = 0.6
                bus = "system"
            "#,
        )
        .unwrap();
        let cfg = Config::resolve(
            file,
            env_of(&[("ROLLCALL_LISTEN_TIMEOUT_SECS", "12"), ("ROLLCALL_BUS", "session")]),
        );
        assert_eq!(cfg.store_path, PathBuf::from("/srv/faces.json"));
        assert_eq!(cfg.listen_timeout_secs, 12);
        assert_eq!(cfg.min_confidence, Some(0.6));
        assert_eq!(cfg.bus, Bus::Session);
    }

    #[test]
    fn test_zero_threshold_means_closed_set() {
        let cfg = Config::resolve(FileConfig::default(), env_of(&[("ROLLCALL_MIN_CONFIDENCE", "0")]));
        assert_eq!(cfg.min_confidence, None);
    }

    #[test]
    fn test_misspelled_bus_falls_back_to_file() {
        let file = parse_file(Path::new("rollcalld.toml"), r#"bus = "system""#).unwrap();
        let cfg = Config::resolve(file, env_of(&[("ROLLCALL_BUS", "sytem")]));
        assert_eq!(cfg.bus, Bus::System);

        let cfg = Config::resolve(FileConfig::default(), env_of(&[("ROLLCALL_BUS", "sytem")]));
        assert_eq!(cfg.bus, Bus::Session);
    }

    #[test]
    fn test_blank_commands_disabled() {
        let cfg = Config::resolve(FileConfig::default(), env_of(&[("ROLLCALL_SPEAK_CMD", "  ")]));
        assert!(cfg.speak_cmd.is_none());
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let err = parse_file(Path::new("x.toml"), "similarity = 0.4").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
