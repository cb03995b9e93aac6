use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::Result;
use crate::store::Store;

pub const DEFAULT_SESSION: &str = "default";

/// Default base directory for all paracore storage.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".paracore")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Sanitize a session name for use as a filename.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One agent's database inside a base directory.
///
/// Layout:
/// ```text
/// ~/.paracore/
/// ├── config.toml
/// └── sessions/
///     ├── default.db
///     └── <name>.db
/// ```
pub struct SessionStore {
    store: Store,
    name: String,
    path: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the named session. Empty or missing names
    /// fall back to `default`.
    pub fn open(name: Option<&str>, base_dir: Option<&Path>) -> Result<Self> {
        let base = base_dir.map(PathBuf::from).unwrap_or_else(default_base_dir);
        let sessions_dir = base.join("sessions");
        fs::create_dir_all(&sessions_dir)?;

        let name = name
            .map(sanitize_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        let path = sessions_dir.join(format!("{name}.db"));
        let store = Store::open(&path)?;
        tracing::debug!(session = %name, path = %path.display(), "opened session store");

        Ok(Self { store, name, path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A second connection to the same database, handed to an agent as
    /// its cycle log while this one keeps snapshots.
    pub fn sink(&self) -> Result<Store> {
        Store::open(&self.path)
    }
}
