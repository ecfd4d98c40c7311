pub mod docker_save;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::app::App;
use crate::error::{DeployError, DeployResult};
use crate::ssh::Connection;

/// An image present in the local engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub tag: String,
    /// Content-addressed id reported by the engine.
    pub id: String,
}

/// Builds the application image and places it on a remote host.
pub trait ImageBuilder {
    /// Build the image for `app`.
    fn build(&self, app: &App) -> DeployResult<BuiltImage>;

    /// Make `image` available to the engine on the far side of
    /// `connection`.
    fn transfer(&self, image: &BuiltImage, connection: &Connection) -> DeployResult<()>;
}

/// Content identity of a build context: a SHA-256 over every file the
/// engine would see (honouring `.dockerignore`), plus the Dockerfile.
///
/// An unchanged context yields the same digest, which is what keeps a
/// re-apply from rebuilding.
pub fn context_digest(context: &Path, dockerfile: &str) -> DeployResult<String> {
    if !context.is_dir() {
        return Err(DeployError::FileNotFound(format!(
            "build context {} is not a directory",
            context.display()
        )));
    }

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    let walker = ignore::WalkBuilder::new(context)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .add_custom_ignore_filename(".dockerignore")
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| DeployError::Other(format!("walking build context: {e}")))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(context)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push((relative, entry.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (relative, path) in &files {
        hasher.update(relative.as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(path)?);
        hasher.update([0]);
    }

    let dockerfile_path = context.join(dockerfile);
    hasher.update(b"dockerfile\0");
    match fs::read(&dockerfile_path) {
        Ok(bytes) => hasher.update(bytes),
        Err(_) => {
            return Err(DeployError::FileNotFound(format!(
                "{} not found",
                dockerfile_path.display()
            )));
        }
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}
