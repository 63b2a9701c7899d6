//! Daemon configuration – reads/writes `~/.conduit/config.toml`.
//!
//! ```toml
//! settings_metadata = "sm-settings"
//! queue_capacity = 256
//!
//! [[watch]]
//! name = "sinks"
//! target = "STANDARD"
//!
//! [[watch.interests]]
//! category = { object = "node" }
//! constraints = [
//!     { domain = "global-property", subject = "media.class", verb = "equals", value = "Audio/Sink" },
//! ]
//! ```

use conduit_kernel::Interest;
use conduit_kernel::settings::DEFAULT_METADATA_NAME;
use conduit_middleware::bus::DEFAULT_CAPACITY;
use conduit_types::{ConduitError, Features};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A declarative watcher: every object matching one of `interests` is
/// logged, and activated up to `target` when that is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub name: String,

    #[serde(default)]
    pub interests: Vec<Interest>,

    /// Feature names joined with `|`, e.g. `"STANDARD | PARAM_PROPS"`.
    #[serde(default)]
    pub target: Features,
}

/// Persisted daemon configuration stored in `~/.conduit/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for state files. Defaults to `$XDG_CONFIG_HOME/conduit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// `metadata.name` of the settings store to follow.
    #[serde(default = "default_settings_metadata")]
    pub settings_metadata: String,

    /// Bound of the transport event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Save the settings to the state store on exit.
    #[serde(default = "default_persist_settings")]
    pub persist_settings: bool,

    #[serde(default, rename = "watch", skip_serializing_if = "Vec::is_empty")]
    pub watches: Vec<WatchConfig>,
}

fn default_settings_metadata() -> String {
    DEFAULT_METADATA_NAME.to_string()
}
fn default_queue_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_persist_settings() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            settings_metadata: default_settings_metadata(),
            queue_capacity: default_queue_capacity(),
            persist_settings: default_persist_settings(),
            watches: Vec::new(),
        }
    }
}

impl Config {
    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<(), ConduitError> {
        if self.settings_metadata.is_empty() {
            return Err(ConduitError::Config("settings_metadata must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConduitError::Config("queue_capacity must be at least 1".into()));
        }
        for watch in &self.watches {
            for interest in &watch.interests {
                interest
                    .validate()
                    .map_err(|e| ConduitError::Config(format!("watch '{}': {e}", watch.name)))?;
            }
        }
        Ok(())
    }
}

/// Return the path to `~/.conduit/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".conduit").join("config.toml")
}

/// Load the config, falling back to defaults when the file does not exist.
/// Environment overrides apply either way.
pub fn load() -> Result<Config, ConduitError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the file at `path`. `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConduitError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ConduitError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| ConduitError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `CONDUIT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CONDUIT_STATE_DIR` | `state_dir` |
/// | `CONDUIT_SETTINGS_METADATA` | `settings_metadata` |
/// | `CONDUIT_QUEUE_CAPACITY` | `queue_capacity` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CONDUIT_STATE_DIR") {
        cfg.state_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CONDUIT_SETTINGS_METADATA") {
        cfg.settings_metadata = v;
    }
    if let Ok(v) = std::env::var("CONDUIT_QUEUE_CAPACITY")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.queue_capacity = n;
    }
}

/// Write the default config to `~/.conduit/config.toml` unless a file is
/// already there. Returns whether it wrote one.
pub fn init_default() -> Result<bool, ConduitError> {
    write_default_if_missing(&config_path())
}

pub(crate) fn write_default_if_missing(path: &Path) -> Result<bool, ConduitError> {
    if path.exists() {
        return Ok(false);
    }
    save_to(&Config::default(), path)?;
    Ok(true)
}

/// Save the config to `path`, creating the parent directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConduitError> {
    let fail = |what: &str, e: std::io::Error| ConduitError::Config(format!("failed to {what} {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail("create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| fail("restrict directory of", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| ConduitError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| fail("write", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| fail("write", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_kernel::{Domain, Verb};
    use conduit_types::{Category, ObjectKind};

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.settings_metadata, "sm-settings");
        assert_eq!(cfg.queue_capacity, 256);
        assert!(cfg.persist_settings);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_path_points_to_conduit_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.conduit/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() -> Result<(), ConduitError> {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn roundtrip_default_config() -> Result<(), ConduitError> {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path)?;
        assert_eq!(load_from(&path)?, Some(Config::default()));
        Ok(())
    }

    #[test]
    fn first_run_writes_defaults_and_keeps_existing_file() -> Result<(), ConduitError> {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        assert!(write_default_if_missing(&path)?);
        assert_eq!(load_from(&path)?, Some(Config::default()));

        std::fs::write(&path, "queue_capacity = 8\n").expect("write");
        assert!(!write_default_if_missing(&path)?);
        assert_eq!(load_from(&path)?.map(|c| c.queue_capacity), Some(8));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn parses_watch_entries() {
        let src = r#"
            queue_capacity = 32

            [[watch]]
            name = "sinks"
            target = "STANDARD | PARAM_PROPS"

            [[watch.interests]]
            category = { object = "node" }
            constraints = [
                { domain = "global-property", subject = "media.class", verb = "equals", value = "Audio/Sink" },
            ]

            [[watch]]
            name = "everything"
            interests = [{ category = "any" }]
        "#;
        let cfg: Config = toml::from_str(src).unwrap();
        assert_eq!(cfg.queue_capacity, 32);
        assert_eq!(cfg.settings_metadata, "sm-settings");
        assert_eq!(cfg.watches.len(), 2);

        let sinks = &cfg.watches[0];
        assert_eq!(sinks.target, Features::STANDARD | Features::PARAM_PROPS);
        assert_eq!(sinks.interests[0].category, Category::Object(ObjectKind::Node));
        assert_eq!(sinks.interests[0].constraints[0].verb, Verb::Equals);
        assert_eq!(sinks.interests[0].constraints[0].domain, Domain::GlobalProperty);

        assert_eq!(cfg.watches[1].target, Features::empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_watch_interest_is_a_config_error() {
        let src = r#"
            [[watch]]
            name = "broken"
            interests = [{ category = "any", constraints = [{ domain = "attribute", subject = "id", verb = "in-range", value = "5" }] }]
        "#;
        let cfg: Config = toml::from_str(src).unwrap();
        assert!(matches!(cfg.validate(), Err(ConduitError::Config(msg)) if msg.contains("broken")));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let cfg = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_fields() {
        // SAFETY: single-threaded test; no other test touches these variables.
        unsafe {
            std::env::set_var("CONDUIT_STATE_DIR", "/var/lib/conduit");
            std::env::set_var("CONDUIT_SETTINGS_METADATA", "test-settings");
            std::env::set_var("CONDUIT_QUEUE_CAPACITY", "not-a-number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/var/lib/conduit")));
        assert_eq!(cfg.settings_metadata, "test-settings");
        assert_eq!(cfg.queue_capacity, 256, "invalid capacity is ignored");

        unsafe { std::env::set_var("CONDUIT_QUEUE_CAPACITY", "16") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.queue_capacity, 16);

        unsafe {
            std::env::remove_var("CONDUIT_STATE_DIR");
            std::env::remove_var("CONDUIT_SETTINGS_METADATA");
            std::env::remove_var("CONDUIT_QUEUE_CAPACITY");
        }
    }
}
