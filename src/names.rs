use std::fmt::Write as _;

use anyhow::Result;
use ring::digest::{SHA256, digest};
use ring::rand::{SecureRandom, SystemRandom};

const RANDOM_SUFFIX_BYTES: usize = 8;
const CACHE_DIGEST_BYTES: usize = 6;
const CACHE_VOLUME_KINDS: [&str; 3] = ["build", "launch", "cache"];

/// Generates a unique, lowercase resource name such as `buildcheck-3f9a...`.
///
/// # Errors
/// Returns an error if the system random source is unavailable.
pub fn random_name(prefix: &str) -> Result<String> {
    let mut bytes = [0u8; RANDOM_SUFFIX_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("Failed to read system randomness"))?;
    Ok(format!("{prefix}-{}", hex(&bytes)))
}

/// Names of the cache volumes the image builder creates for an image name.
#[must_use]
pub fn cache_volume_names(name: &str) -> Vec<String> {
    let reference = format!("index.docker.io/library/{name}:latest");
    let sum = digest(&SHA256, reference.as_bytes());
    let short = hex(&sum.as_ref()[..CACHE_DIGEST_BYTES]);
    CACHE_VOLUME_KINDS
        .iter()
        .map(|kind| format!("pack-cache-library_{name}_latest-{short}.{kind}"))
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}
