//! Recorded resources of one deployment, persisted between runs.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{DeployError, DeployResult};

pub const STATE_VERSION: u32 = 1;

/// What was applied for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: String,
    pub fingerprint: String,
    #[serde(default)]
    pub outputs: Value,
    /// Resources this one was applied after.
    #[serde(default)]
    pub deps: Vec<String>,
}

impl Record {
    /// String output `key`, if present.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub version: u32,
    /// In the order resources were applied.
    #[serde(default)]
    pub resources: IndexMap<String, Record>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: IndexMap::new(),
        }
    }
}

impl State {
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.resources.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// String output `key` of resource `id`.
    #[must_use]
    pub fn output(&self, id: &str, key: &str) -> Option<&str> {
        self.get(id).and_then(|r| r.output(key))
    }

    /// Like [`State::output`], but a missing value is an error.
    pub fn require(&self, id: &str, key: &str) -> DeployResult<&str> {
        self.output(id, key).ok_or_else(|| {
            DeployError::Other(format!("resource '{id}' has no recorded '{key}'"))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// JSON state file plus a lock file, both in the state directory.
///
/// The state holds private keys, so the file is only ever readable by
/// its owner.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    key: String,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: &Path, name: &str, stage: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            key: format!("{name}-{stage}"),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.state.json", self.key))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.key))
    }

    /// Load the state; a missing file is an empty state.
    pub fn load(&self) -> DeployResult<State> {
        let path = self.path();
        if !path.exists() {
            return Ok(State::default());
        }
        let content = fs::read_to_string(&path)?;
        let state: State = serde_json::from_str(&content)?;
        if state.version != STATE_VERSION {
            return Err(DeployError::Config(format!(
                "{} has state version {}, expected {STATE_VERSION}",
                path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    /// Replace the state file atomically.
    pub fn save(&self, state: &State) -> DeployResult<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        restrict(tmp.as_file())?;
        tmp.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path())
            .map_err(|e| DeployError::Io(e.error))?;
        debug!(path = %self.path().display(), resources = state.resources.len(), "state saved");
        Ok(())
    }

    pub fn clear(&self) -> DeployResult<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the run lock, failing at once if another run holds it.
    pub fn lock(&self) -> DeployResult<RunLock> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        file.try_lock_exclusive()
            .map_err(|_| DeployError::Locked(self.key.clone()))?;
        Ok(RunLock { file })
    }
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn restrict(file: &File) -> DeployResult<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_file: &File) -> DeployResult<()> {
    Ok(())
}
