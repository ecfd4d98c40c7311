use tracing::info;

use crate::app::App;
use crate::cmd;
use crate::deploy::{BuiltImage, ImageBuilder};
use crate::error::{DeployError, DeployResult};
use crate::ssh::{Connection, shell_quote};

/// Build locally, then ship via `docker save | gzip | ssh | docker load`.
///
/// No registry needed; the image never leaves the operator's machine
/// and the target host.
pub struct DockerSaveLoad;

impl DockerSaveLoad {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Arguments to `docker` for building `app`.
    #[must_use]
    pub fn build_args(app: &App) -> Vec<String> {
        let context = app.context.to_string_lossy().to_string();
        let dockerfile = app.context.join(&app.dockerfile).to_string_lossy().to_string();

        let mut args = vec![
            "build".to_string(),
            "--platform".to_string(),
            app.platform.clone(),
            "-f".to_string(),
            dockerfile,
        ];
        if let Some(target) = &app.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        for (k, v) in &app.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push("-t".to_string());
        args.push(app.image_tag());
        args.push(context);
        args
    }

    /// The local pipeline that streams `tag` to `connection`.
    #[must_use]
    pub fn transfer_pipeline(tag: &str, connection: &Connection) -> String {
        format!(
            "docker save {} | gzip | {} 'gunzip | docker load'",
            shell_quote(tag),
            connection.ssh_command_line()
        )
    }
}

impl Default for DockerSaveLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder for DockerSaveLoad {
    fn build(&self, app: &App) -> DeployResult<BuiltImage> {
        info!(image = %app.image_tag(), platform = %app.platform, "building image");

        let args = Self::build_args(app);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("docker", &refs).map_err(|e| DeployError::Build(e.to_string()))?;

        let tag = app.image_tag();
        let id = cmd::run("docker", &["image", "inspect", "--format", "{{.Id}}", &tag])?;
        Ok(BuiltImage { tag, id })
    }

    fn transfer(&self, image: &BuiltImage, connection: &Connection) -> DeployResult<()> {
        let size_bytes = cmd::run(
            "docker",
            &["image", "inspect", "--format", "{{.Size}}", &image.tag],
        )?;
        let size_mb = size_bytes.parse::<u64>().unwrap_or(0) / (1024 * 1024);

        info!(
            image = %image.tag,
            size_mb,
            host = %connection.host,
            "streaming image to host"
        );
        cmd::run_pipeline(&Self::transfer_pipeline(&image.tag, connection))?;
        info!(host = %connection.host, "image loaded");
        Ok(())
    }
}
