// Helper functions are shared across multiple test crates; not every helper is
// referenced in each test module.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use buildcheck::docker::Docker;
use buildcheck::pack::Pack;
use buildcheck::poll::PollPolicy;
use buildcheck::probe::TlsVersion;
use buildcheck::scenario::Harness;
use serde_json::{Value, json};
use tempfile::TempDir;

pub(crate) const CONTAINER_ID: &str = "cid-0123456789abcdef";
pub(crate) const IMAGE_ID: &str = "sha256:0123456789abcdef0123";

/// Fake `pack` and `docker` executables plus a fixture template root.
///
/// Both scripts append `pack ...` / `docker ...` lines to a shared call log so
/// ordering across the two tools can be asserted.
pub(crate) struct FakeTools {
    bin: TempDir,
    templates: TempDir,
}

impl FakeTools {
    pub(crate) fn new() -> Result<Self> {
        let bin = tempfile::tempdir().context("Failed to create fake bin dir")?;
        let templates = tempfile::tempdir().context("Failed to create template root")?;
        write_script(&bin.path().join("pack"), &fake_pack_script(bin.path()))?;
        write_script(&bin.path().join("docker"), &fake_docker_script(bin.path()))?;
        let tools = Self { bin, templates };
        tools.set_image(&[], &json!([]))?;
        Ok(tools)
    }

    pub(crate) fn harness(&self) -> Harness {
        Harness {
            pack: Pack::new(self.bin.path().join("pack")),
            docker: Docker::new(self.bin.path().join("docker")),
            fixtures_root: self.templates.path().to_path_buf(),
            pull_policy: "never".to_string(),
            no_color: true,
            default_buildpacks: vec!["paketo-buildpacks/ruby".to_string()],
            poll: PollPolicy::new(Duration::from_secs(2), Duration::from_millis(100)),
            tls_min_version: TlsVersion::Tls12,
            name_prefix: "buildcheck".to_string(),
        }
    }

    pub(crate) fn add_template(&self, name: &str, files: &[(&str, &str)]) -> Result<PathBuf> {
        let root = self.templates.path().join(name);
        fs::create_dir_all(&root).context("Failed to create template")?;
        for (relative, contents) in files {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create template subdir")?;
            }
            fs::write(&path, contents).context("Failed to write template file")?;
        }
        Ok(root)
    }

    /// Sets what the fake builder prints and how it exits.
    pub(crate) fn set_build_output(&self, stdout: &str, stderr: &str, exit: i32) -> Result<()> {
        fs::write(self.bin.path().join("pack-stdout.txt"), stdout)?;
        fs::write(self.bin.path().join("pack-stderr.txt"), stderr)?;
        fs::write(self.bin.path().join("pack-exit"), exit.to_string())?;
        Ok(())
    }

    /// Sets the `docker image inspect` answer; `stages` is the lifecycle
    /// metadata `buildpacks` array.
    pub(crate) fn set_image(&self, labels: &[(&str, &str)], stages: &Value) -> Result<()> {
        let mut all_labels = serde_json::Map::new();
        for (key, value) in labels {
            all_labels.insert((*key).to_string(), Value::String((*value).to_string()));
        }
        all_labels.insert(
            "io.buildpacks.lifecycle.metadata".to_string(),
            Value::String(json!({ "buildpacks": stages }).to_string()),
        );
        let inspect = json!([{ "Id": IMAGE_ID, "Config": { "Labels": all_labels } }]);
        fs::write(self.bin.path().join("image-inspect.json"), inspect.to_string())?;
        Ok(())
    }

    pub(crate) fn set_published_port(&self, container_port: u16, host_port: u16) -> Result<()> {
        let inspect = json!([{
            "NetworkSettings": { "Ports": {
                format!("{container_port}/tcp"): [{ "HostIp": "0.0.0.0", "HostPort": host_port.to_string() }]
            }}
        }]);
        fs::write(self.bin.path().join("container-inspect.json"), inspect.to_string())?;
        Ok(())
    }

    pub(crate) fn set_container_logs(&self, logs: &str) -> Result<()> {
        fs::write(self.bin.path().join("container.log"), logs)?;
        Ok(())
    }

    /// Makes `docker <group> <action>` exit non-zero.
    pub(crate) fn fail(&self, group: &str, action: &str) -> Result<()> {
        self.fail_with_output(group, action, "")
    }

    /// Makes `docker <group> <action>` print `stdout` and then exit non-zero,
    /// like a runtime that created a container but could not start it.
    pub(crate) fn fail_with_output(&self, group: &str, action: &str, stdout: &str) -> Result<()> {
        fs::write(self.bin.path().join(format!("fail-{group}-{action}")), stdout)?;
        Ok(())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.bin.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    /// Files present in the build source when the builder ran.
    pub(crate) fn build_source_listing(&self) -> String {
        fs::read_to_string(self.bin.path().join("pack-source.txt")).unwrap_or_default()
    }

    /// The fixture directory passed to the builder via `--path`.
    pub(crate) fn build_source(&self) -> Option<PathBuf> {
        self.calls()
            .iter()
            .find(|call| call.starts_with("pack "))
            .and_then(|call| {
                let mut words = call.split_whitespace();
                words.find(|word| *word == "--path")?;
                words.next().map(PathBuf::from)
            })
    }
}

fn write_script(path: &Path, script: &str) -> Result<()> {
    fs::write(path, script).with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

fn fake_pack_script(dir: &Path) -> String {
    format!(
        r#"#!/bin/sh
dir="{dir}"
echo "pack $*" >> "$dir/calls.log"
while [ $# -gt 0 ]; do
  if [ "$1" = "--path" ]; then
    ls "$2" > "$dir/pack-source.txt"
  fi
  shift
done
[ -f "$dir/pack-stdout.txt" ] && cat "$dir/pack-stdout.txt"
[ -f "$dir/pack-stderr.txt" ] && cat "$dir/pack-stderr.txt" >&2
exit "$(cat "$dir/pack-exit" 2>/dev/null || echo 0)"
"#,
        dir = dir.display()
    )
}

fn fake_docker_script(dir: &Path) -> String {
    format!(
        r#"#!/bin/sh
dir="{dir}"
echo "docker $*" >> "$dir/calls.log"
if [ -f "$dir/fail-$1-$2" ]; then
  cat "$dir/fail-$1-$2"
  echo "$1 $2 refused by fake runtime" >&2
  exit 125
fi
case "$1 $2" in
  "image inspect") cat "$dir/image-inspect.json" ;;
  "container run") echo "{CONTAINER_ID}" ;;
  "container inspect") cat "$dir/container-inspect.json" ;;
  "container logs") cat "$dir/container.log" 2>/dev/null ;;
esac
exit 0
"#,
        dir = dir.display()
    )
}

/// Lifecycle metadata for the given stage keys, without layers.
pub(crate) fn stages(keys: &[&str]) -> Value {
    Value::Array(keys.iter().map(|key| json!({ "key": key })).collect())
}
