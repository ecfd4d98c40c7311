use std::process::ExitStatus;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("remote host unreachable: {0}")]
    Connectivity(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("DNS error: {0}")]
    DnsError(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("deployment '{0}' is locked by another run")]
    Locked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("command failed: {command}: {stderr}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("environment variable missing: {0}")]
    EnvMissing(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl DeployError {
    /// Attach the workflow stage that raised this error. Errors that
    /// already carry a stage are returned unchanged.
    #[must_use]
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage: stage.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The workflow stage that failed, if known.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The error underneath any stage annotation.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for the error classes of the deployment taxonomy
    /// (provisioning, connectivity, build, certificate, DNS).
    #[must_use]
    pub const fn is_classified(&self) -> bool {
        matches!(
            self,
            Self::Provisioning(_)
                | Self::Connectivity(_)
                | Self::Build(_)
                | Self::Certificate(_)
                | Self::DnsError(_)
                | Self::KeyGeneration(_)
        )
    }
}
