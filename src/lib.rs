pub mod config;
pub mod docker;
pub mod error;
pub mod fixture;
pub mod image;
pub mod names;
pub mod pack;
pub mod plan;
pub mod poll;
pub mod probe;
pub mod scenario;
pub mod teardown;
pub mod transcript;

pub use error::{HarnessError, Result};
pub use scenario::{Harness, ScenarioReport};
