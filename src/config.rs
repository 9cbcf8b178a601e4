use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::poll::PollPolicy;
use crate::probe::TlsVersion;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub builder: BuilderSettings,
    pub runtime: RuntimeSettings,
    pub poll: PollSettings,
    pub fixtures: FixtureSettings,
    pub tls: TlsSettings,
    pub names: NameSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuilderSettings {
    pub command: PathBuf,
    pub pull_policy: String,
    pub no_color: bool,
    pub buildpacks: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeSettings {
    pub command: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollSettings {
    pub timeout: String,
    pub interval: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixtureSettings {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    pub min_version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NameSettings {
    pub prefix: String,
}

const DEFAULT_CONFIG_FILE: &str = "buildcheck.toml";
const DEFAULT_BUILDER_COMMAND: &str = "pack";
const DEFAULT_PULL_POLICY: &str = "never";
const DEFAULT_NO_COLOR: bool = true;
const DEFAULT_RUNTIME_COMMAND: &str = "docker";
const DEFAULT_POLL_TIMEOUT: &str = "30s";
const DEFAULT_POLL_INTERVAL: &str = "1s";
const DEFAULT_FIXTURES_ROOT: &str = "testdata";
const DEFAULT_TLS_MIN_VERSION: &str = "1.2";
const DEFAULT_NAME_PREFIX: &str = "buildcheck";
const PULL_POLICIES: [&str; 3] = ["always", "if-not-present", "never"];

impl Settings {
    /// Loads settings from defaults, an optional TOML file, and the environment.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder()
            .set_default("builder.command", DEFAULT_BUILDER_COMMAND)?
            .set_default("builder.pull_policy", DEFAULT_PULL_POLICY)?
            .set_default("builder.no_color", DEFAULT_NO_COLOR)?
            .set_default("builder.buildpacks", Vec::<String>::new())?
            .set_default("runtime.command", DEFAULT_RUNTIME_COMMAND)?
            .set_default("poll.timeout", DEFAULT_POLL_TIMEOUT)?
            .set_default("poll.interval", DEFAULT_POLL_INTERVAL)?
            .set_default("fixtures.root", DEFAULT_FIXTURES_ROOT)?
            .set_default("tls.min_version", DEFAULT_TLS_MIN_VERSION)?
            .set_default("names.prefix", DEFAULT_NAME_PREFIX)?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        s = s.add_source(File::from(path).required(false));

        // e.g. BUILDCHECK_POLL__TIMEOUT=2m, BUILDCHECK_BUILDER__COMMAND=/usr/local/bin/pack
        s = s.add_source(
            Environment::with_prefix("BUILDCHECK")
                .prefix_separator("_")
                .separator("__"),
        );

        s.build()?.try_deserialize()
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        if self.builder.command.as_os_str().is_empty() {
            anyhow::bail!("builder.command must not be empty");
        }
        if self.runtime.command.as_os_str().is_empty() {
            anyhow::bail!("runtime.command must not be empty");
        }
        if !PULL_POLICIES.contains(&self.builder.pull_policy.as_str()) {
            anyhow::bail!(
                "builder.pull_policy must be one of {}",
                PULL_POLICIES.join(", ")
            );
        }
        self.poll_policy()?;
        self.tls_min_version()?;
        if self.names.prefix.is_empty() {
            anyhow::bail!("names.prefix must not be empty");
        }
        Ok(())
    }

    /// Default polling policy for runtime observations.
    ///
    /// # Errors
    /// Returns error if the durations cannot be parsed or are inconsistent.
    pub fn poll_policy(&self) -> Result<PollPolicy> {
        let timeout = parse_duration("poll.timeout", &self.poll.timeout)?;
        let interval = parse_duration("poll.interval", &self.poll.interval)?;
        if interval.is_zero() {
            anyhow::bail!("poll.interval must be greater than 0");
        }
        if interval > timeout {
            anyhow::bail!("poll.interval must be <= poll.timeout");
        }
        Ok(PollPolicy::new(timeout, interval))
    }

    /// Lowest TLS protocol version the probe client accepts.
    ///
    /// # Errors
    /// Returns error if the version is not recognized.
    pub fn tls_min_version(&self) -> Result<TlsVersion> {
        self.tls.min_version.parse()
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| anyhow::anyhow!("{key} is invalid: {e}"))
}
