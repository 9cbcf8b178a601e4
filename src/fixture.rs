use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// A disposable copy of a fixture template, owned by one scenario.
#[derive(Debug)]
pub struct Fixture {
    template: String,
    dir: TempDir,
}

impl Fixture {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Writes an extra file into the fixture, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the path escapes the fixture or the write fails.
    pub async fn write_file(&self, relative: impl AsRef<Path>, contents: &[u8]) -> Result<PathBuf> {
        let relative = relative.as_ref();
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(self.provision_error(format!(
                "refusing to write outside the fixture: {}",
                relative.display()
            )));
        }
        let target = self.path().join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.provision_error(format!("{}: {e}", parent.display())))?;
        }
        fs::write(&target, contents)
            .await
            .map_err(|e| self.provision_error(format!("{}: {e}", target.display())))?;
        debug!("Wrote {} into fixture", relative.display());
        Ok(target)
    }

    /// Recursively removes the fixture tree.
    ///
    /// # Errors
    /// Returns the I/O error if the tree cannot be removed.
    pub fn dispose(self) -> std::io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!("Removed fixture {}", path.display());
        Ok(())
    }

    fn provision_error(&self, reason: String) -> HarnessError {
        HarnessError::Provision {
            template: self.template.clone(),
            reason,
        }
    }
}

/// Copies the named template under `root` into a fresh temporary directory.
///
/// # Errors
/// Returns [`HarnessError::Provision`] if the template is missing or the copy fails.
pub async fn provision(root: &Path, template: &str) -> Result<Fixture> {
    let source = root.join(template);
    let provision_error = |reason: String| HarnessError::Provision {
        template: template.to_string(),
        reason,
    };

    let metadata = fs::metadata(&source)
        .await
        .map_err(|e| provision_error(format!("{}: {e}", source.display())))?;
    if !metadata.is_dir() {
        return Err(provision_error(format!(
            "{} is not a directory",
            source.display()
        )));
    }

    let dir = tempfile::Builder::new()
        .prefix("buildcheck-fixture-")
        .tempdir()
        .map_err(|e| provision_error(format!("failed to allocate temp dir: {e}")))?;

    // On failure `dir` is dropped here and the partial copy removed.
    copy_tree(&source, dir.path())
        .await
        .map_err(|e| provision_error(e.to_string()))?;

    info!(
        "Provisioned fixture '{}' at {}",
        template,
        dir.path().display()
    );
    Ok(Fixture {
        template: template.to_string(),
        dir,
    })
}

async fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path()).await?;
                fs::symlink(link, &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}
