use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while driving a scenario against the builder and runtime.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to provision fixture '{template}': {reason}")]
    Provision { template: String, reason: String },

    #[error("image build '{name}' failed: {reason}\n--- build transcript ---\n{transcript}")]
    Build {
        name: String,
        reason: String,
        transcript: String,
    },

    #[error("failed to start container from image '{image}': {reason}")]
    Run { image: String, reason: String },

    #[error("timed out after {waited:?} waiting for {what}; last observed: {last_observed}")]
    Timeout {
        what: String,
        waited: std::time::Duration,
        last_observed: String,
    },

    #[error("teardown failed: {}", join_failures(.0))]
    Teardown(Vec<TeardownFailure>),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error("runtime command failed: {0}")]
    Runtime(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HarnessError {
    pub(crate) fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}

/// A single teardown step that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: Resource,
    pub reason: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.resource, self.reason)
    }
}

/// External resources owned by a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Container(String),
    Image(String),
    Volumes(Vec<String>),
    Fixture(PathBuf),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Container(id) => write!(f, "container {id}"),
            Resource::Image(id) => write!(f, "image {id}"),
            Resource::Volumes(names) => write!(f, "volumes [{}]", names.join(", ")),
            Resource::Fixture(path) => write!(f, "fixture {}", path.display()),
        }
    }
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
