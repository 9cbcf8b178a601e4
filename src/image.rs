use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{HarnessError, Result};

const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

/// A built image as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub stages: Stages,
}

/// Build stages that participated in an image, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stages {
    by_key: IndexMap<String, ParticipatingStage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipatingStage {
    pub key: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, StageLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StageLayer {
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Stages {
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Looks a stage up by its full key or by the last segment of the key
    /// (`environment-variables` matches `paketo-buildpacks/environment-variables`).
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ParticipatingStage> {
        self.by_key.get(id).or_else(|| {
            self.by_key
                .values()
                .find(|stage| stage.key.rsplit('/').next() == Some(id))
        })
    }

    /// Position of a stage in execution order.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        let key = &self.get(id)?.key;
        self.by_key.get_index_of(key)
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Option<&ParticipatingStage> {
        self.by_key.get_index(index).map(|(_, stage)| stage)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticipatingStage> {
        self.by_key.values()
    }

    /// Metadata value `field` of `layer` emitted by stage `id`.
    #[must_use]
    pub fn metadata(&self, id: &str, layer: &str, field: &str) -> Option<&Value> {
        self.get(id)?.layers.get(layer)?.metadata.get(field)
    }
}

impl FromIterator<ParticipatingStage> for Stages {
    fn from_iter<I: IntoIterator<Item = ParticipatingStage>>(iter: I) -> Self {
        Self {
            by_key: iter
                .into_iter()
                .map(|stage| (stage.key.clone(), stage))
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
}

#[derive(Deserialize, Default)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct LifecycleMetadata {
    #[serde(default)]
    buildpacks: Vec<ParticipatingStage>,
}

/// Parses `docker image inspect` output into an [`Image`].
///
/// # Errors
/// Returns [`HarnessError::Runtime`] if the output is not the expected JSON.
pub fn parse_image_inspect(raw: &str) -> Result<Image> {
    let entries: Vec<InspectEntry> = serde_json::from_str(raw)
        .map_err(|e| HarnessError::Runtime(format!("unexpected image inspect output: {e}")))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| HarnessError::Runtime("image inspect returned no images".to_string()))?;
    let labels = entry.config.labels.unwrap_or_default();

    let stages = match labels.get(LIFECYCLE_METADATA_LABEL) {
        Some(value) => {
            let metadata: LifecycleMetadata = serde_json::from_str(value).map_err(|e| {
                HarnessError::Runtime(format!("invalid {LIFECYCLE_METADATA_LABEL} label: {e}"))
            })?;
            metadata.buildpacks.into_iter().collect()
        }
        None => Stages::default(),
    };

    Ok(Image {
        id: entry.id,
        labels,
        stages,
    })
}
