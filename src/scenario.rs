use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::format_description::well_known::Rfc3339;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::Settings;
use crate::docker::{Container, Docker, RunOptions};
use crate::error::{HarnessError, Result};
use crate::fixture;
use crate::image::Image;
use crate::names;
use crate::pack::{BuildRequest, BuildResult, Pack};
use crate::plan::{BuildExpectations, RuntimeCheck, ScenarioPlan};
use crate::poll::{PollPolicy, eventually};
use crate::probe::{ProbeClient, TlsMaterial, TlsVersion};
use crate::teardown::Teardown;

/// Lifecycle of one scenario. `Failed` is reachable from any non-terminal
/// state and is always followed by `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Provisioned,
    Built,
    Running,
    Verified,
    Failed,
    TornDown,
}

/// The forward step a scenario was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Name,
    Provision,
    Build,
    VerifyBuild,
    Run,
    VerifyRuntime,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::Name => "name",
            Step::Provision => "provision",
            Step::Build => "build",
            Step::VerifyBuild => "verify build",
            Step::Run => "run",
            Step::VerifyRuntime => "verify runtime",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
pub struct ScenarioFailure {
    pub step: Step,
    pub error: HarnessError,
}

/// Outcome of a single scenario, including its teardown.
#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: String,
    pub resource_name: Option<String>,
    pub started_at: time::OffsetDateTime,
    pub elapsed: Duration,
    pub phases: Vec<Phase>,
    pub failure: Option<ScenarioFailure>,
    pub teardown: Result<()>,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failure.is_none() && self.teardown.is_ok()
    }

    #[must_use]
    pub fn final_phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Fresh)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "PASS" } else { "FAIL" };
        let started = self.started_at.format(&Rfc3339).map_err(|_| fmt::Error)?;
        let elapsed = Duration::from_millis(
            u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
        );
        write!(
            f,
            "{status} {} (started {started}, took {})",
            self.scenario,
            humantime::format_duration(elapsed)
        )?;
        if let Some(name) = &self.resource_name {
            write!(f, " [{name}]")?;
        }
        if let Some(failure) = &self.failure {
            write!(f, "\n  {} failed: {}", failure.step, failure.error)?;
        }
        if let Err(err) = &self.teardown {
            write!(f, "\n  {err}")?;
        }
        Ok(())
    }
}

/// Everything a scenario needs to talk to the builder and runtime.
#[derive(Debug, Clone)]
pub struct Harness {
    pub pack: Pack,
    pub docker: Docker,
    pub fixtures_root: PathBuf,
    pub pull_policy: String,
    pub no_color: bool,
    pub default_buildpacks: Vec<String>,
    pub poll: PollPolicy,
    pub tls_min_version: TlsVersion,
    pub name_prefix: String,
}

impl Harness {
    /// Builds a harness from validated settings.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        settings.validate()?;
        Ok(Self {
            pack: Pack::new(&settings.builder.command),
            docker: Docker::new(&settings.runtime.command),
            fixtures_root: settings.fixtures.root.clone(),
            pull_policy: settings.builder.pull_policy.clone(),
            no_color: settings.builder.no_color,
            default_buildpacks: settings.builder.buildpacks.clone(),
            poll: settings.poll_policy()?,
            tls_min_version: settings.tls_min_version()?,
            name_prefix: settings.names.prefix.clone(),
        })
    }

    /// Runs one scenario to completion. Teardown always runs, exactly once,
    /// whatever happened before it.
    pub async fn run(&self, plan: &ScenarioPlan) -> ScenarioReport {
        let started_at = time::OffsetDateTime::now_utc();
        let clock = Instant::now();
        let mut tracker = PhaseTracker::new(&plan.name);
        let mut teardown = Teardown::new(self.docker.clone());

        let (resource_name, failure) = match names::random_name(&self.name_prefix) {
            Ok(name) => {
                let span = info_span!("scenario", scenario = %plan.name, name = %name);
                let outcome = self
                    .drive(plan, &name, &mut teardown, &mut tracker)
                    .instrument(span)
                    .await;
                (Some(name), outcome.err())
            }
            Err(err) => (
                None,
                Some(ScenarioFailure {
                    step: Step::Name,
                    error: HarnessError::Runtime(err.to_string()),
                }),
            ),
        };

        if let Some(failure) = &failure {
            warn!(
                "Scenario '{}' failed during {}: {}",
                plan.name, failure.step, failure.error
            );
            tracker.advance(Phase::Failed);
        }
        let teardown = teardown.run().await;
        tracker.advance(Phase::TornDown);

        ScenarioReport {
            scenario: plan.name.clone(),
            resource_name,
            started_at,
            elapsed: clock.elapsed(),
            phases: tracker.phases,
            failure,
            teardown,
        }
    }

    async fn drive(
        &self,
        plan: &ScenarioPlan,
        name: &str,
        teardown: &mut Teardown,
        tracker: &mut PhaseTracker,
    ) -> Result<(), ScenarioFailure> {
        let fixture = fixture::provision(&self.fixtures_root, &plan.fixture)
            .await
            .map_err(fail(Step::Provision))?;
        let mut written = Ok(());
        for (relative, contents) in &plan.files {
            written = fixture.write_file(relative, contents.as_bytes()).await.map(drop);
            if written.is_err() {
                break;
            }
        }
        let source = fixture.path().to_path_buf();
        teardown.fixture(fixture);
        written.map_err(fail(Step::Provision))?;
        tracker.advance(Phase::Provisioned);

        // The builder may create cache volumes even when the build fails.
        teardown.volumes(names::cache_volume_names(name));
        let request = self.build_request(plan, name, &source);
        let BuildResult { image, transcript } = self
            .pack
            .build(&request, &self.docker)
            .await
            .map_err(fail(Step::Build))?;
        teardown.image(image.id.clone());
        tracker.advance(Phase::Built);

        transcript
            .expect_in_order(&plan.expect.banners)
            .and_then(|()| transcript.expect_absent(&plan.expect.absent))
            .and_then(|()| verify_image(&image, &plan.expect))
            .map_err(fail(Step::VerifyBuild))?;

        let options = resolve_run_options(&plan.run, &source);
        let container = self
            .docker
            .run(&image.id, name, &options)
            .await
            .map_err(fail(Step::Run))?;
        teardown.container(container.id.clone());
        tracker.advance(Phase::Running);

        for check in &plan.checks {
            self.verify_runtime(check, &container, &source)
                .await
                .map_err(fail(Step::VerifyRuntime))?;
        }
        tracker.advance(Phase::Verified);
        Ok(())
    }

    fn build_request(&self, plan: &ScenarioPlan, name: &str, source: &Path) -> BuildRequest {
        let buildpacks = if plan.build.buildpacks.is_empty() {
            self.default_buildpacks.clone()
        } else {
            plan.build.buildpacks.clone()
        };
        BuildRequest {
            name: name.to_string(),
            source: source.to_path_buf(),
            buildpacks,
            pull_policy: self.pull_policy.clone(),
            env: plan.build.env.clone(),
            no_color: self.no_color,
        }
    }

    async fn verify_runtime(
        &self,
        check: &RuntimeCheck,
        container: &Container,
        fixture: &Path,
    ) -> Result<()> {
        let policy = match check.timeout() {
            Ok(Some(timeout)) => self.poll.with_timeout(timeout),
            Ok(None) => self.poll,
            Err(err) => return Err(HarnessError::Config(err.to_string())),
        };

        match check {
            RuntimeCheck::Log { contains, .. } => {
                wait_for_log(&self.docker, &container.id, contains, &policy).await?;
            }
            RuntimeCheck::Http {
                port,
                path,
                tls,
                status,
                body_contains,
                ..
            } => {
                let host_port = container.host_port(port).ok_or_else(|| {
                    HarnessError::assertion(format!("container port {port} is not published"))
                })?;
                let (client, scheme) = match tls {
                    Some(dir) => {
                        let material = TlsMaterial::from_dir(&fixture.join(dir)).await?;
                        (
                            ProbeClient::mutual_tls(&material, self.tls_min_version)?,
                            "https",
                        )
                    }
                    None => (ProbeClient::plain()?, "http"),
                };
                let url = format!("{scheme}://localhost:{host_port}{path}");
                let what = format!("GET {url} to return {status}");
                eventually(
                    &policy,
                    &what,
                    || client.get(&url),
                    |response| {
                        response.status.as_u16() == *status
                            && body_contains
                                .as_deref()
                                .is_none_or(|needle| response.body.contains(needle))
                    },
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Runs scenarios concurrently, at most `jobs` at a time, and returns their
/// reports in plan order.
///
/// # Errors
/// Returns an error if a scenario task panics or is cancelled.
pub async fn run_all(
    harness: Arc<Harness>,
    plans: Vec<ScenarioPlan>,
    jobs: usize,
) -> anyhow::Result<Vec<ScenarioReport>> {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks = JoinSet::new();
    for (index, plan) in plans.into_iter().enumerate() {
        let harness = Arc::clone(&harness);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire().await?;
            Ok::<_, anyhow::Error>((index, harness.run(&plan).await))
        });
    }

    let mut reports = Vec::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(err)) => {
                error!("Scenario task failed: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(err) => {
                error!("Scenario task join error: {err}");
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("Scenario task join error: {err}"));
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    reports.sort_by_key(|(index, _)| *index);
    Ok(reports.into_iter().map(|(_, report)| report).collect())
}

/// Polls container logs until they contain `needle`.
///
/// # Errors
/// Returns [`HarnessError::Timeout`] if the logs never contain `needle`.
pub async fn wait_for_log(
    docker: &Docker,
    container_id: &str,
    needle: &str,
    policy: &PollPolicy,
) -> Result<String> {
    let what = format!("container logs to contain '{needle}'");
    eventually(
        policy,
        &what,
        || docker.logs(container_id),
        |logs| logs.contains(needle),
    )
    .await
}

/// Checks stage identifiers, stage metadata and labels of a built image.
///
/// # Errors
/// Returns [`HarnessError::Assertion`] describing the first mismatch.
pub fn verify_image(image: &Image, expect: &BuildExpectations) -> Result<()> {
    if let Some(expected) = &expect.stage_ids {
        let actual: Vec<&str> = image.stages.keys().collect();
        let matches = actual.len() == expected.len()
            && actual.iter().zip(expected).all(|(key, id)| {
                *key == id.as_str() || key.rsplit('/').next() == Some(id.as_str())
            });
        if !matches {
            return Err(HarnessError::assertion(format!(
                "expected stages {expected:?}, image has {actual:?}"
            )));
        }
    }

    for stage in &expect.stages {
        let Some(index) = image.stages.index_of(&stage.id) else {
            return Err(HarnessError::assertion(format!(
                "expected stage '{}' to participate; image has {:?}",
                stage.id,
                image.stages.keys().collect::<Vec<_>>()
            )));
        };
        if let Some(expected_index) = stage.index
            && expected_index != index
        {
            return Err(HarnessError::assertion(format!(
                "expected stage '{}' at index {expected_index}, found at {index}",
                stage.id
            )));
        }
        if let (Some(layer), Some(field)) = (&stage.layer, &stage.field) {
            let actual = image.stages.metadata(&stage.id, layer, field);
            match (&stage.value, actual) {
                (Some(expected), Some(actual)) if expected == actual => {}
                (None, Some(_)) => {}
                (expected, actual) => {
                    return Err(HarnessError::assertion(format!(
                        "stage '{}' layer '{layer}' field '{field}': expected {expected:?}, found {actual:?}",
                        stage.id
                    )));
                }
            }
        }
    }

    for (key, value) in &expect.labels {
        match image.labels.get(key) {
            Some(actual) if actual == value => {}
            actual => {
                return Err(HarnessError::assertion(format!(
                    "expected image label {key}={value}, found {actual:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Makes fixture-relative volume sources absolute.
fn resolve_run_options(options: &RunOptions, fixture: &Path) -> RunOptions {
    let mut resolved = options.clone();
    for volume in &mut resolved.volumes {
        if volume.host.is_relative() {
            volume.host = fixture.join(&volume.host);
        }
    }
    resolved
}

fn fail(step: Step) -> impl Fn(HarnessError) -> ScenarioFailure {
    move |error| ScenarioFailure { step, error }
}

struct PhaseTracker {
    scenario: String,
    phases: Vec<Phase>,
}

impl PhaseTracker {
    fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            phases: vec![Phase::Fresh],
        }
    }

    fn advance(&mut self, next: Phase) {
        let current = self.phases.last().copied().unwrap_or(Phase::Fresh);
        info!("Scenario '{}': {current:?} -> {next:?}", self.scenario);
        self.phases.push(next);
    }
}
