use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::image::{Image, parse_image_inspect};

/// Client for the container runtime CLI.
#[derive(Debug, Clone)]
pub struct Docker {
    command: PathBuf,
}

/// Options for starting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunOptions {
    /// Container ports to publish on an auto-assigned host port (`"8080"`),
    /// or explicitly mapped (`"18080:8080"`).
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// A running container started by [`Docker::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    /// Container port (`"8080"`) to published host port (`"49153"`).
    pub ports: BTreeMap<String, String>,
}

impl Container {
    #[must_use]
    pub fn host_port(&self, container_port: &str) -> Option<&str> {
        self.ports.get(container_port).map(String::as_str)
    }
}

struct CommandOutput {
    stdout: String,
    stderr: String,
}

impl Docker {
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    #[must_use]
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Starts a detached container named `name` and resolves its published ports.
    ///
    /// Returns as soon as the runtime reports the container started; it does not
    /// wait for the process inside to become ready. If the runtime created the
    /// container but could not start it, the container is removed before the
    /// error is returned.
    ///
    /// # Errors
    /// Returns [`HarnessError::Run`] if the runtime rejects the image or options.
    pub async fn run(&self, image: &str, name: &str, options: &RunOptions) -> Result<Container> {
        let run_error = |reason: String| HarnessError::Run {
            image: image.to_string(),
            reason,
        };
        let args = run_args(image, name, options);
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let (status, output) = self.capture(&args_ref).await.map_err(run_error)?;
        let reported_id = last_line(&output.stdout);

        if !status.success() {
            let reason = self.failure(&args_ref, status, &output.stderr);
            // e.g. a port already in use: the container exists but never started.
            let removed = self.remove_container(reported_id.unwrap_or(name)).await;
            let cleanup = match (reported_id, removed) {
                (_, Ok(())) => String::new(),
                (None, Err(err)) => {
                    debug!("No container named {name} to remove: {err}");
                    String::new()
                }
                (Some(_), Err(err)) => format!(" (cleanup also failed: {err})"),
            };
            return Err(run_error(format!("{reason}{cleanup}")));
        }

        let id = reported_id
            .ok_or_else(|| run_error("runtime did not report a container id".to_string()))?
            .to_string();
        info!("Started container {} ({name}) from image {}", short_id(&id), image);

        if options.publish.is_empty() {
            return Ok(Container {
                id,
                ports: BTreeMap::new(),
            });
        }

        match self.container_ports(&id).await {
            Ok(ports) => Ok(Container { id, ports }),
            Err(reason) => {
                // The container exists but cannot be handed back; remove it here.
                let cleanup = match self.remove_container(&id).await {
                    Ok(()) => String::new(),
                    Err(err) => format!(" (cleanup also failed: {err})"),
                };
                Err(run_error(format!(
                    "failed to resolve published ports: {reason}{cleanup}"
                )))
            }
        }
    }

    /// Reads the combined stdout and stderr log of a container.
    ///
    /// # Errors
    /// Returns [`HarnessError::Runtime`] if the logs cannot be read.
    pub async fn logs(&self, id: &str) -> Result<String> {
        let output = self
            .output(&["container", "logs", id])
            .await
            .map_err(HarnessError::Runtime)?;
        let mut logs = output.stdout;
        logs.push_str(&output.stderr);
        Ok(logs)
    }

    /// Inspects a built image by name or ID.
    ///
    /// # Errors
    /// Returns [`HarnessError::Runtime`] if the image is unknown or the output is invalid.
    pub async fn inspect_image(&self, reference: &str) -> Result<Image> {
        let output = self
            .output(&["image", "inspect", reference])
            .await
            .map_err(HarnessError::Runtime)?;
        parse_image_inspect(&output.stdout)
    }

    /// Force-removes a container.
    ///
    /// # Errors
    /// Returns the runtime's error output if removal fails.
    pub async fn remove_container(&self, id: &str) -> Result<(), String> {
        self.output(&["container", "rm", "--force", id]).await?;
        debug!("Removed container {}", short_id(id));
        Ok(())
    }

    /// Force-removes an image.
    ///
    /// # Errors
    /// Returns the runtime's error output if removal fails.
    pub async fn remove_image(&self, id: &str) -> Result<(), String> {
        self.output(&["image", "rm", "--force", id]).await?;
        debug!("Removed image {}", short_id(id));
        Ok(())
    }

    /// Force-removes named volumes. Missing volumes are not an error.
    ///
    /// # Errors
    /// Returns the runtime's error output if removal fails.
    pub async fn remove_volumes(&self, names: &[String]) -> Result<(), String> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args = vec!["volume", "rm", "--force"];
        args.extend(names.iter().map(String::as_str));
        self.output(&args).await?;
        debug!("Removed volumes {}", names.join(", "));
        Ok(())
    }

    async fn container_ports(&self, id: &str) -> Result<BTreeMap<String, String>, String> {
        let output = self.output(&["container", "inspect", id]).await?;
        parse_container_ports(&output.stdout)
    }

    async fn output(&self, args: &[&str]) -> Result<CommandOutput, String> {
        let (status, output) = self.capture(args).await?;
        if !status.success() {
            return Err(self.failure(args, status, &output.stderr));
        }
        Ok(output)
    }

    /// Runs the runtime CLI and keeps its output whatever the exit status.
    async fn capture(&self, args: &[&str]) -> Result<(ExitStatus, CommandOutput), String> {
        debug!("Running {} {}", self.command.display(), args.join(" "));
        let output = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.command.display()))?;
        Ok((
            output.status,
            CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        ))
    }

    fn failure(&self, args: &[&str], status: ExitStatus, stderr: &str) -> String {
        warn!(
            "{} {} exited with {}",
            self.command.display(),
            args.first().copied().unwrap_or_default(),
            status
        );
        format!(
            "{} {} failed with {}: {}",
            self.command.display(),
            args.join(" "),
            status,
            stderr.trim()
        )
    }
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).rfind(|line| !line.is_empty())
}

fn run_args(image: &str, name: &str, options: &RunOptions) -> Vec<String> {
    let mut args = vec![
        "container".to_string(),
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    for (key, value) in &options.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &options.publish {
        args.push("--publish".to_string());
        args.push(port.clone());
    }
    for volume in &options.volumes {
        args.push("--volume".to_string());
        args.push(volume.to_arg());
    }
    args.push(image.to_string());
    args
}

#[derive(Deserialize)]
struct ContainerInspect {
    #[serde(rename = "NetworkSettings")]
    network: NetworkSettings,
}

#[derive(Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

fn parse_container_ports(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let entries: Vec<ContainerInspect> =
        serde_json::from_str(raw).map_err(|e| format!("unexpected container inspect output: {e}"))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| "container inspect returned no containers".to_string())?;

    let mut ports = BTreeMap::new();
    for (spec, bindings) in entry.network.ports.unwrap_or_default() {
        let Some(binding) = bindings.and_then(|b| b.into_iter().next()) else {
            continue;
        };
        let port = spec.split('/').next().unwrap_or(&spec).to_string();
        ports.insert(port, binding.host_port);
    }
    Ok(ports)
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}
