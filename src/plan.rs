use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::docker::RunOptions;

/// A file of scenario declarations.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    /// Build stages used by scenarios that do not list their own.
    #[serde(default)]
    pub buildpacks: Vec<String>,
    #[serde(default, rename = "scenario")]
    pub scenarios: Vec<ScenarioPlan>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioPlan {
    pub name: String,
    pub fixture: String,
    /// Extra files written into the fixture before the build.
    #[serde(default)]
    pub files: BTreeMap<PathBuf, String>,
    #[serde(default)]
    pub build: BuildPlan,
    #[serde(default)]
    pub expect: BuildExpectations,
    #[serde(default)]
    pub run: RunOptions,
    #[serde(default)]
    pub checks: Vec<RuntimeCheck>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPlan {
    #[serde(default)]
    pub buildpacks: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Assertions on the build transcript and the resulting image.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildExpectations {
    /// Substrings that must appear, each on a later line than the previous.
    #[serde(default)]
    pub banners: Vec<String>,
    /// Substrings that must not appear on any line.
    #[serde(default)]
    pub absent: Vec<String>,
    /// When set, the exact participating stage identifiers, in order.
    #[serde(default)]
    pub stage_ids: Option<Vec<String>>,
    #[serde(default)]
    pub stages: Vec<StageExpectation>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageExpectation {
    /// Full stage key or its last path segment.
    pub id: String,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// An observation of the running container, polled until it holds.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeCheck {
    Log {
        contains: String,
        #[serde(default)]
        timeout: Option<String>,
    },
    Http {
        port: String,
        #[serde(default = "default_path")]
        path: String,
        /// Fixture-relative directory holding `ca.pem`, `cert.pem` and `key.pem`;
        /// when set the probe uses HTTPS with mutual TLS.
        #[serde(default)]
        tls: Option<PathBuf>,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        body_contains: Option<String>,
        #[serde(default)]
        timeout: Option<String>,
    },
}

impl RuntimeCheck {
    /// Per-check timeout override.
    ///
    /// # Errors
    /// Returns an error if the timeout is not a valid duration.
    pub fn timeout(&self) -> Result<Option<Duration>> {
        let raw = match self {
            RuntimeCheck::Log { timeout, .. } | RuntimeCheck::Http { timeout, .. } => timeout,
        };
        raw.as_deref()
            .map(|value| {
                humantime::parse_duration(value)
                    .with_context(|| format!("invalid check timeout '{value}'"))
            })
            .transpose()
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_status() -> u16 {
    200
}

impl PlanFile {
    /// Reads and validates a plan file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let plan = Self::parse(&raw).with_context(|| format!("Invalid plan {}", path.display()))?;
        Ok(plan)
    }

    /// Parses and validates plan contents.
    ///
    /// # Errors
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut plan: PlanFile = toml::from_str(raw)?;
        for scenario in &mut plan.scenarios {
            if scenario.build.buildpacks.is_empty() {
                scenario.build.buildpacks.clone_from(&plan.buildpacks);
            }
        }
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for scenario in &self.scenarios {
            if scenario.name.trim().is_empty() {
                anyhow::bail!("scenario name must not be empty");
            }
            if !seen.insert(scenario.name.as_str()) {
                anyhow::bail!("duplicate scenario name '{}'", scenario.name);
            }
            if scenario.fixture.trim().is_empty() {
                anyhow::bail!("scenario '{}' has no fixture", scenario.name);
            }
            for stage in &scenario.expect.stages {
                if stage.layer.is_some() != stage.field.is_some() {
                    anyhow::bail!(
                        "scenario '{}' stage '{}' must set both layer and field, or neither",
                        scenario.name,
                        stage.id
                    );
                }
                if stage.value.is_some() && stage.layer.is_none() {
                    anyhow::bail!(
                        "scenario '{}' stage '{}' sets a value without a layer and field",
                        scenario.name,
                        stage.id
                    );
                }
            }
            for check in &scenario.checks {
                check.timeout()?;
                if let RuntimeCheck::Http { port, .. } = check
                    && !scenario.run.publish.iter().any(|p| publishes(p, port))
                {
                    anyhow::bail!(
                        "scenario '{}' probes port {port} but does not publish it",
                        scenario.name
                    );
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn scenario(&self, name: &str) -> Option<&ScenarioPlan> {
        self.scenarios.iter().find(|scenario| scenario.name == name)
    }
}

/// Whether a publish spec (`8080`, `18080:8080`, `8080/tcp`) exposes `port`.
fn publishes(spec: &str, port: &str) -> bool {
    let container = spec.rsplit(':').next().unwrap_or(spec);
    container.split('/').next() == Some(port)
}
