//! Named key/value state persisted as flat text files.
//!
//! Each [`StateStore`] owns one file, `<dir>/<name>`, holding one entry per
//! line:
//!
//! ```text
//! device.alsa_card.pci-0000\ profile output:analog-stereo
//! ```
//!
//! The key comes first and ends at the first unescaped space; the rest of
//! the line is the value. Spaces and backslashes inside keys are written with
//! a leading backslash. Line breaks and backslashes in keys and values are
//! written as `\n`, `\r` and `\\` so every entry stays on one line. Empty keys
//! cannot be stored.
//!
//! Saves go to `<name>.tmp` first and are then renamed over the real file,
//! so a crash never leaves a half-written state behind.
//!
//! # Example
//!
//! ```rust
//! use conduit_memory::state::StateStore;
//! use conduit_types::PropertyBag;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = StateStore::with_dir(dir.path(), "default-routes");
//!
//! let mut bag = PropertyBag::new();
//! bag.set("card 0", "speaker");
//! store.save(&bag).unwrap();
//!
//! assert_eq!(store.load().unwrap(), bag);
//! store.clear().unwrap();
//! assert!(store.load().unwrap().is_empty());
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use conduit_types::{ConduitError, PropertyBag};
use tracing::{debug, info, warn};

/// Subdirectory of the user's configuration directory holding state files.
pub const STATE_SUBDIR: &str = "conduit";

/// One named state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    name: String,
    dir: PathBuf,
}

impl StateStore {
    /// Store `name` in `$XDG_CONFIG_HOME/conduit/`, falling back to
    /// `$HOME/.config/conduit/`.
    ///
    /// # Errors
    ///
    /// [`ConduitError::State`] when neither variable is set.
    pub fn new(name: impl Into<String>) -> Result<Self, ConduitError> {
        let dir = default_state_dir(
            std::env::var("XDG_CONFIG_HOME").ok().as_deref(),
            std::env::var("HOME").ok().as_deref(),
        )
        .ok_or_else(|| ConduitError::State("neither XDG_CONFIG_HOME nor HOME is set".into()))?;
        Ok(Self::with_dir(dir, name))
    }

    /// Store `name` in an explicit directory.
    pub fn with_dir(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the state file.
    pub fn location(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    fn tmp_location(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", self.name))
    }

    /// Replace the stored state with `props`.
    ///
    /// # Errors
    ///
    /// [`ConduitError::State`] when a key is empty or the file cannot be
    /// written. The previous state is left untouched in both cases.
    pub fn save(&self, props: &PropertyBag) -> Result<(), ConduitError> {
        let location = self.location();
        info!(location = %location.display(), entries = props.len(), "saving state");

        if props.iter().any(|(key, _)| key.is_empty()) {
            return Err(ConduitError::State(format!(
                "cannot save {}: empty keys are not representable",
                location.display()
            )));
        }

        ensure_dir(&self.dir).map_err(|e| io_error("create state directory", &self.dir, e))?;

        let tmp = self.tmp_location();
        let mut raw = String::new();
        for (key, value) in props.iter() {
            raw.push_str(&escape_key(key));
            raw.push(' ');
            raw.push_str(&escape_value(value));
            raw.push('\n');
        }
        write_private(&tmp, raw.as_bytes()).map_err(|e| io_error("write", &tmp, e))?;

        fs::rename(&tmp, &location).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_error("rename temporary file to", &location, e)
        })?;
        Ok(())
    }

    /// Read the stored state. A missing file is an empty state.
    pub fn load(&self) -> Result<PropertyBag, ConduitError> {
        let location = self.location();
        info!(location = %location.display(), "loading state");

        let raw = match fs::read_to_string(&location) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(location = %location.display(), "no state file, starting empty");
                return Ok(PropertyBag::new());
            }
            Err(e) => return Err(io_error("read", &location, e)),
        };

        let mut props = PropertyBag::new();
        // `str::lines` would also eat a trailing `\r` that belongs to the value.
        for line in raw.split('\n') {
            if line.is_empty() {
                continue;
            }
            let (key, value) = split_line(line);
            if key.is_empty() {
                warn!(location = %location.display(), "state line without key, skipping it");
                continue;
            }
            props.set(key, unescape_value(value));
        }
        Ok(props)
    }

    /// Remove the state file if it exists.
    pub fn clear(&self) -> Result<(), ConduitError> {
        let location = self.location();
        match fs::remove_file(&location) {
            Ok(()) => {
                info!(location = %location.display(), "state cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &location, e)),
        }
    }
}

/// `$XDG_CONFIG_HOME/conduit` or `$HOME/.config/conduit`.
pub fn default_state_dir(xdg_config_home: Option<&str>, home: Option<&str>) -> Option<PathBuf> {
    match (xdg_config_home, home) {
        (Some(xdg), _) if !xdg.is_empty() => Some(PathBuf::from(xdg).join(STATE_SUBDIR)),
        (_, Some(home)) if !home.is_empty() => Some(PathBuf::from(home).join(".config").join(STATE_SUBDIR)),
        _ => None,
    }
}

fn io_error(action: &str, path: &Path, e: io::Error) -> ConduitError {
    ConduitError::State(format!("failed to {action} {}: {e}", path.display()))
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    // Owner only (rwx------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            ' ' => out.push_str("\\ "),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            // Unknown escape: keep it as written.
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split at the first unescaped space, unescaping the key.
fn split_line(line: &str) -> (String, &str) {
    let mut key = String::new();
    let mut chars = line.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            ' ' => return (key, &line[i + 1..]),
            '\\' => {
                match chars.next() {
                    Some((_, 'n')) => key.push('\n'),
                    Some((_, 'r')) => key.push('\r'),
                    Some((_, escaped)) => key.push(escaped),
                    None => {}
                }
            }
            c => key.push(c),
        }
    }
    (key, "")
}
