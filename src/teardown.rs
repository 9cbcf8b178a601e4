use tracing::{error, info, warn};

use crate::docker::Docker;
use crate::error::{HarnessError, Resource, Result, TeardownFailure};
use crate::fixture::Fixture;

enum Cleanup {
    Container(String),
    Image(String),
    Volumes(Vec<String>),
    Fixture(Fixture),
}

impl Cleanup {
    fn resource(&self) -> Resource {
        match self {
            Cleanup::Container(id) => Resource::Container(id.clone()),
            Cleanup::Image(id) => Resource::Image(id.clone()),
            Cleanup::Volumes(names) => Resource::Volumes(names.clone()),
            Cleanup::Fixture(fixture) => Resource::Fixture(fixture.path().to_path_buf()),
        }
    }
}

/// Removal actions registered as resources are created, run newest first.
///
/// Every action runs even if an earlier one fails; all failures are reported.
pub struct Teardown {
    docker: Docker,
    stack: Vec<Cleanup>,
}

impl Teardown {
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            stack: Vec::new(),
        }
    }

    pub fn fixture(&mut self, fixture: Fixture) {
        self.stack.push(Cleanup::Fixture(fixture));
    }

    pub fn volumes(&mut self, names: Vec<String>) {
        self.stack.push(Cleanup::Volumes(names));
    }

    pub fn image(&mut self, id: impl Into<String>) {
        self.stack.push(Cleanup::Image(id.into()));
    }

    pub fn container(&mut self, id: impl Into<String>) {
        self.stack.push(Cleanup::Container(id.into()));
    }

    /// Resources still owned, in the order they will be removed.
    #[must_use]
    pub fn pending(&self) -> Vec<Resource> {
        self.stack.iter().rev().map(Cleanup::resource).collect()
    }

    /// Removes every registered resource in reverse creation order.
    ///
    /// # Errors
    /// Returns [`HarnessError::Teardown`] listing each step that failed.
    pub async fn run(mut self) -> Result<()> {
        let stack = std::mem::take(&mut self.stack);
        let mut failures = Vec::new();
        for cleanup in stack.into_iter().rev() {
            let resource = cleanup.resource();
            let outcome = match cleanup {
                Cleanup::Container(id) => self.docker.remove_container(&id).await,
                Cleanup::Image(id) => self.docker.remove_image(&id).await,
                Cleanup::Volumes(names) => self.docker.remove_volumes(&names).await,
                Cleanup::Fixture(fixture) => fixture.dispose().map_err(|e| e.to_string()),
            };
            match outcome {
                Ok(()) => info!("Removed {resource}"),
                Err(reason) => {
                    error!("Failed to remove {resource}: {reason}");
                    failures.push(TeardownFailure { resource, reason });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Teardown(failures))
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        let leaked = self
            .pending()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        warn!("Teardown dropped without running; leaking {leaked}");
    }
}
