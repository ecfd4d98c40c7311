use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Defines the application: how its image is built and how the
/// one-shot build container and the long-running app container run.
///
/// # Example
///
/// ```
/// use trebuchet::App;
///
/// let app = App::new("app")
///     .image("next-self-hosted/next-self-hosted")
///     .context("./web")
///     .target("production")
///     .port(3000);
///
/// assert_eq!(app.image_tag(), "next-self-hosted/next-self-hosted:latest");
/// assert_eq!(app.build_container(), "app_container_build");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    /// Container name of the app; also the prefix of volumes and
    /// networks.
    pub name: String,
    /// Image repository; always tagged `latest`.
    pub image: String,
    pub context: PathBuf,
    /// Relative to `context`.
    pub dockerfile: String,
    pub target: Option<String>,
    pub platform: String,
    pub build_args: IndexMap<String, String>,
    pub env: IndexMap<String, String>,
    /// Command of the one-shot build container.
    pub build_command: Vec<String>,
    /// Command of the long-running app container.
    pub start_command: Vec<String>,
    /// Mount point of the persistent build-output volume.
    pub build_output: String,
    /// Port the app listens on inside the container network.
    pub port: u16,
    pub healthcheck: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        Self::new("app")
    }
}

impl App {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: name.to_string(),
            context: PathBuf::from("."),
            dockerfile: "Dockerfile".to_string(),
            target: Some("production".to_string()),
            platform: "linux/amd64".to_string(),
            build_args: IndexMap::new(),
            env: IndexMap::new(),
            build_command: vec!["pnpm".to_string(), "build".to_string()],
            start_command: vec!["pnpm".to_string(), "start".to_string()],
            build_output: "/app/.next".to_string(),
            port: 3000,
            healthcheck: None,
        }
    }

    #[must_use]
    pub fn image(mut self, repository: &str) -> Self {
        self.image = repository.to_string();
        self
    }

    #[must_use]
    pub fn context(mut self, dir: &str) -> Self {
        self.context = PathBuf::from(dir);
        self
    }

    #[must_use]
    pub fn dockerfile(mut self, path: &str) -> Self {
        self.dockerfile = path.to_string();
        self
    }

    #[must_use]
    pub fn target(mut self, stage: &str) -> Self {
        self.target = Some(stage.to_string());
        self
    }

    #[must_use]
    pub fn no_target(mut self) -> Self {
        self.target = None;
        self
    }

    #[must_use]
    pub fn platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    #[must_use]
    pub fn build_arg(mut self, key: &str, value: &str) -> Self {
        self.build_args.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn build_command(mut self, argv: &[&str]) -> Self {
        self.build_command = argv.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn start_command(mut self, argv: &[&str]) -> Self {
        self.start_command = argv.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn build_output(mut self, mount: &str) -> Self {
        self.build_output = mount.to_string();
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn healthcheck(mut self, cmd: &str) -> Self {
        self.healthcheck = Some(cmd.to_string());
        self
    }

    #[must_use]
    pub fn image_tag(&self) -> String {
        format!("{}:latest", self.image)
    }

    #[must_use]
    pub fn build_container(&self) -> String {
        format!("{}_container_build", self.name)
    }

    #[must_use]
    pub fn build_volume(&self) -> String {
        format!("{}_volume_build", self.name)
    }

    #[must_use]
    pub fn public_network(&self) -> String {
        format!("{}_network_public", self.name)
    }

    #[must_use]
    pub fn internal_network(&self) -> String {
        format!("{}_network_internal", self.name)
    }

    /// Address of the app on the public container network.
    #[must_use]
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}
