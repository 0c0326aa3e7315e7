//! Provides a [DeploymentDriver] that runs each deployment as a docker compose project.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use tokio::process::Command;

use crate::descriptor::DeploymentDescriptor;
use crate::lifecycle::DeploymentDriver;
use crate::types::SparkTunnelResult;

/// Environment variable to override the path to the docker binary.
pub const ST_DOCKER_PATH_ENV: &str = "ST_DOCKER_PATH";

const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// Get the path to the docker binary.
///
/// If the [`ST_DOCKER_PATH_ENV`] environment variable is set, its value is used as the path.
/// Otherwise `docker` is looked up in the user's `PATH`.
pub fn docker_path() -> SparkTunnelResult<PathBuf> {
    match env::var(ST_DOCKER_PATH_ENV).ok().as_deref() {
        Some("") => {
            bail!("'{ST_DOCKER_PATH_ENV}' set to empty string");
        }
        Some("docker") | None => which::which("docker").with_context(|| {
            format!(
                "docker binary not found in PATH. Please install docker or set '{ST_DOCKER_PATH_ENV}' to the correct path."
            )
        }),
        Some(path) => {
            let docker_path = PathBuf::from(path);
            if !docker_path.exists() {
                bail!(
                    "Path to docker overridden with '{ST_DOCKER_PATH_ENV}={path}' but that path doesn't exist"
                );
            }
            Ok(docker_path)
        }
    }
}

/// Writes each descriptor to `<work_dir>/<deployment id>/docker-compose.yml` and drives it with
/// `docker compose`, using the deployment id as the project name.
#[derive(Debug, Clone)]
pub struct ComposeDriver {
    docker: PathBuf,
    work_dir: PathBuf,
}

impl ComposeDriver {
    pub fn new(docker: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker: docker.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn compose_file(&self, deployment_id: &str) -> PathBuf {
        self.work_dir.join(deployment_id).join(COMPOSE_FILE_NAME)
    }

    async fn compose(
        &self,
        deployment_id: &str,
        compose_file: &Path,
        args: &[&str],
    ) -> SparkTunnelResult<()> {
        let log_target = format!("docker_compose::{deployment_id}");
        log::debug!(target: &log_target, "docker compose {}", args.join(" "));

        let output = Command::new(&self.docker)
            .arg("compose")
            .arg("--project-name")
            .arg(deployment_id)
            .arg("--file")
            .arg(compose_file)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run '{}'", self.docker.display()))?;

        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            log::info!(target: &log_target, "{line}");
        }

        if !output.status.success() {
            bail!(
                "'docker compose {}' failed with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}

impl DeploymentDriver for ComposeDriver {
    async fn up(
        &self,
        deployment_id: &str,
        descriptor: &DeploymentDescriptor,
    ) -> anyhow::Result<()> {
        let compose_file = self.compose_file(deployment_id);
        let deployment_dir = self.work_dir.join(deployment_id);
        tokio::fs::create_dir_all(&deployment_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create deployment directory '{}'",
                    deployment_dir.display()
                )
            })?;

        let document = descriptor
            .to_compose_yaml()
            .context("Failed to render compose file")?;
        log::trace!("Writing compose file to '{}'", compose_file.display());
        tokio::fs::write(&compose_file, document)
            .await
            .with_context(|| format!("Failed to write '{}'", compose_file.display()))?;

        self.compose(deployment_id, &compose_file, &["up", "--detach"])
            .await
    }

    async fn down(&self, deployment_id: &str) -> anyhow::Result<()> {
        let compose_file = self.compose_file(deployment_id);
        if !compose_file.exists() {
            log::debug!("No compose file for '{deployment_id}', nothing to tear down");
            return Ok(());
        }

        self.compose(
            deployment_id,
            &compose_file,
            &["down", "--volumes", "--remove-orphans"],
        )
        .await?;

        let deployment_dir = self.work_dir.join(deployment_id);
        if let Err(e) = tokio::fs::remove_dir_all(&deployment_dir).await {
            log::warn!(
                "Failed to clean up deployment directory '{}': {e}",
                deployment_dir.display()
            );
        }

        Ok(())
    }
}
