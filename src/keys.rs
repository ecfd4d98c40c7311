//! Key and secret lifecycle: SSH key pairs, tunnel secrets, and the
//! on-disk private key file that must never outlive a run.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};

/// SSH key algorithms the deployment can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyAlgorithm {
    #[default]
    Ed25519,
    EcdsaP256,
    Rsa4096,
}

impl KeyAlgorithm {
    /// `(type, bits)` as understood by `ssh-keygen -t/-b`.
    #[must_use]
    pub const fn keygen_args(self) -> (&'static str, Option<&'static str>) {
        match self {
            Self::Ed25519 => ("ed25519", None),
            Self::EcdsaP256 => ("ecdsa", Some("256")),
            Self::Rsa4096 => ("rsa", Some("4096")),
        }
    }

    /// Conventional file stem (`id_ed25519`, ...).
    #[must_use]
    pub const fn file_stem(self) -> &'static str {
        match self {
            Self::Ed25519 => "id_ed25519",
            Self::EcdsaP256 => "id_ecdsa",
            Self::Rsa4096 => "id_rsa",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256 => "ecdsa-p256",
            Self::Rsa4096 => "rsa-4096",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "ecdsa" | "ecdsa-p256" | "p256" => Ok(Self::EcdsaP256),
            "rsa" | "rsa-4096" => Ok(Self::Rsa4096),
            other => Err(DeployError::KeyGeneration(format!(
                "unsupported key algorithm '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for KeyAlgorithm {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyAlgorithm> for String {
    fn from(value: KeyAlgorithm) -> Self {
        value.as_str().to_string()
    }
}

/// An SSH key pair in OpenSSH format.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub algorithm: KeyAlgorithm,
    pub public_key: String,
    private_key: SecretString,
}

impl KeyPair {
    #[must_use]
    pub const fn new(algorithm: KeyAlgorithm, private_key: SecretString, public_key: String) -> Self {
        Self {
            algorithm,
            public_key,
            private_key,
        }
    }

    #[must_use]
    pub const fn private_key(&self) -> &SecretString {
        &self.private_key
    }
}

/// Source of fresh SSH key pairs.
pub trait KeyGenerator {
    fn generate(&self, algorithm: KeyAlgorithm, comment: &str) -> DeployResult<KeyPair>;
}

/// Generates keys with the local `ssh-keygen` into a throwaway
/// directory, so the private half only ever lands on disk inside it.
pub struct SshKeygen;

impl KeyGenerator for SshKeygen {
    fn generate(&self, algorithm: KeyAlgorithm, comment: &str) -> DeployResult<KeyPair> {
        let scratch = tempfile::tempdir()?;
        let key_path = scratch.path().join("key");
        let key_str = key_path.to_string_lossy().to_string();

        let (kind, bits) = algorithm.keygen_args();
        let mut args = vec!["-q", "-t", kind, "-N", "", "-C", comment, "-f", &key_str];
        if let Some(bits) = bits {
            args.extend(["-b", bits]);
        }

        cmd::run("ssh-keygen", &args).map_err(|e| {
            DeployError::KeyGeneration(format!("ssh-keygen ({algorithm}): {e}"))
        })?;

        let private_key = fs::read_to_string(&key_path)?;
        let public_key = fs::read_to_string(format!("{key_str}.pub"))?;

        Ok(KeyPair::new(
            algorithm,
            SecretString::from(private_key),
            public_key.trim().to_string(),
        ))
    }
}

/// Write a private key readable and writable by the owner only.
pub fn persist_private_key(key: &SecretString, path: &Path) -> DeployResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // A pre-existing file keeps its old mode through `open`.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    let mut contents = key.expose_secret().to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    file.write_all(contents.as_bytes())?;
    debug!(path = %path.display(), "private key written");
    Ok(())
}

/// Per-deployment key file location under the state directory.
#[must_use]
pub fn key_path(state_dir: &Path, algorithm: KeyAlgorithm, suffix: &str) -> PathBuf {
    state_dir.join(format!("{}_{suffix}", algorithm.file_stem()))
}

/// Delete key files left in `state_dir` for `deployment` by runs that
/// never reached their teardown (killed, power loss). Returns what was
/// removed.
pub fn sweep_key_files(state_dir: &Path, deployment: &str) -> DeployResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let prefixes: Vec<String> = [
        KeyAlgorithm::Ed25519,
        KeyAlgorithm::EcdsaP256,
        KeyAlgorithm::Rsa4096,
    ]
    .iter()
    .map(|a| format!("{}_{deployment}_", a.file_stem()))
    .collect();

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if prefixes.iter().any(|p| name.starts_with(p)) {
            wipe(&entry.path());
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

/// Random, collision-resistant suffix for deployment-scoped paths.
#[must_use]
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 32 random bytes, base64 encoded, as expected by tunnel
/// registration.
pub fn generate_tunnel_secret() -> DeployResult<SecretString> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| DeployError::KeyGeneration(format!("random source unavailable: {e}")))?;
    Ok(SecretString::from(
        base64::engine::general_purpose::STANDARD.encode(bytes),
    ))
}

/// Paths that must be deleted at teardown, whatever happens.
///
/// Shared with the Ctrl-C handler so an interrupted run still wipes
/// key material.
#[derive(Debug, Clone, Default)]
pub struct WipeList {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl WipeList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` and return a guard that deletes it on drop.
    #[must_use]
    pub fn schedule_wipe(&self, path: &Path) -> WipeGuard {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_path_buf());
        }
        WipeGuard {
            path: path.to_path_buf(),
            list: self.clone(),
        }
    }

    /// Delete every registered path now.
    pub fn wipe_all(&self) {
        let drained: Vec<PathBuf> = {
            let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
            paths.drain(..).collect()
        };
        for path in drained {
            wipe(&path);
        }
    }

    #[must_use]
    pub fn pending(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn forget(&self, path: &Path) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p != path);
    }
}

/// Deletes its file when dropped.
#[derive(Debug)]
pub struct WipeGuard {
    path: PathBuf,
    list: WipeList,
}

impl WipeGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WipeGuard {
    fn drop(&mut self) {
        wipe(&self.path);
        self.list.forget(&self.path);
    }
}

fn wipe(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "key material wiped"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to wipe key material"),
    }
}
