use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::docker::Docker;
use crate::error::{HarnessError, Result};
use crate::image::Image;
use crate::transcript::Transcript;

/// A single image build; immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub name: String,
    pub source: PathBuf,
    pub buildpacks: Vec<String>,
    pub pull_policy: String,
    pub env: BTreeMap<String, String>,
    pub no_color: bool,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image: Image,
    pub transcript: Transcript,
}

/// Client for the image builder CLI.
#[derive(Debug, Clone)]
pub struct Pack {
    command: PathBuf,
}

impl Pack {
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Runs one build and inspects the resulting image. Builds are never retried.
    ///
    /// # Errors
    /// Returns [`HarnessError::Build`] with the full transcript if the builder
    /// cannot run or exits non-zero, or if the built image cannot be inspected.
    pub async fn build(&self, request: &BuildRequest, docker: &Docker) -> Result<BuildResult> {
        let args = build_args(request);
        info!(
            "Building image '{}' from {} with [{}]",
            request.name,
            request.source.display(),
            request.buildpacks.join(", ")
        );

        let build_error = |reason: String, transcript: &Transcript| HarnessError::Build {
            name: request.name.clone(),
            reason,
            transcript: transcript.to_string(),
        };

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                build_error(
                    format!("failed to run {}: {e}", self.command.display()),
                    &Transcript::default(),
                )
            })?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let transcript = merge_lines(stdout, stderr).await.map_err(|e| {
            build_error(
                format!("failed to read build output: {e}"),
                &Transcript::default(),
            )
        })?;

        let status = child
            .wait()
            .await
            .map_err(|e| build_error(format!("failed to wait for builder: {e}"), &transcript))?;
        if !status.success() {
            warn!("Build '{}' failed with {status}", request.name);
            return Err(build_error(format!("builder exited with {status}"), &transcript));
        }

        let image = match docker.inspect_image(&request.name).await {
            Ok(image) => image,
            Err(err) => {
                // Nothing can own an image we failed to describe; remove it by name.
                if let Err(cleanup) = docker.remove_image(&request.name).await {
                    warn!("Failed to remove uninspectable image '{}': {cleanup}", request.name);
                }
                return Err(build_error(err.to_string(), &transcript));
            }
        };
        info!(
            "Built image '{}' ({}) with {} stage(s)",
            request.name,
            image.id,
            image.stages.len()
        );
        Ok(BuildResult { image, transcript })
    }
}

fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = Vec::new();
    if request.no_color {
        args.push("--no-color".to_string());
    }
    args.extend([
        "build".to_string(),
        request.name.clone(),
        "--path".to_string(),
        request.source.display().to_string(),
    ]);
    for buildpack in &request.buildpacks {
        args.push("--buildpack".to_string());
        args.push(buildpack.clone());
    }
    if !request.pull_policy.is_empty() {
        args.push("--pull-policy".to_string());
        args.push(request.pull_policy.clone());
    }
    for (key, value) in &request.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}

/// Reads two line streams to completion, recording lines in arrival order.
async fn merge_lines<A, B>(
    mut out: Option<Lines<A>>,
    mut err: Option<Lines<B>>,
) -> std::io::Result<Transcript>
where
    A: AsyncBufRead + Unpin,
    B: AsyncBufRead + Unpin,
{
    let mut transcript = Transcript::default();
    loop {
        let (from_stdout, line) = match (out.as_mut(), err.as_mut()) {
            (None, None) => break,
            (Some(o), None) => (true, o.next_line().await?),
            (None, Some(e)) => (false, e.next_line().await?),
            (Some(o), Some(e)) => tokio::select! {
                line = o.next_line() => (true, line?),
                line = e.next_line() => (false, line?),
            },
        };
        match line {
            Some(line) => {
                debug!(target: "buildcheck::build", "{line}");
                transcript.push(line);
            }
            None if from_stdout => out = None,
            None => err = None,
        }
    }
    Ok(transcript)
}
