#[cfg(unix)]
mod support;

#[cfg(unix)]
mod unix_integration {
    use std::sync::Arc;

    use anyhow::Result;
    use buildcheck::HarnessError;
    use buildcheck::error::Resource;
    use buildcheck::plan::{PlanFile, ScenarioPlan};
    use buildcheck::scenario::{Phase, Step, run_all};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::support::{CONTAINER_ID, FakeTools, IMAGE_ID, stages};

    const BUILD_OUTPUT: &str = "\
Paketo Buildpack for MRI 0.2.0
  Installing MRI 2.7.1
Paketo Buildpack for Bundler 0.1.0
Paketo Buildpack for Bundle Install 0.1.0
Paketo Buildpack for Rake 0.1.0
  Assigning launch processes:
    web (default): bundle exec rake
Successfully built image
";

    fn scenario(raw: &str) -> ScenarioPlan {
        let plan = PlanFile::parse(raw).unwrap();
        plan.scenarios.into_iter().next().unwrap()
    }

    fn rake_tools() -> Result<FakeTools> {
        let tools = FakeTools::new()?;
        tools.add_template("rake", &[("Gemfile", "source 'https://rubygems.org'\n"), ("Rakefile", "task :default\n")])?;
        tools.set_build_output(BUILD_OUTPUT, "", 0)?;
        tools.set_image(
            &[("some-label", "some-value")],
            &json!([
                {"key": "paketo-buildpacks/mri"},
                {"key": "paketo-buildpacks/bundler"},
                {"key": "paketo-buildpacks/bundle-install"},
                {"key": "paketo-buildpacks/rake"},
                {"key": "paketo-buildpacks/environment-variables", "layers": {
                    "environment-variables": {"metadata": {"variables": {"SOME_VARIABLE": "SOME_VALUE"}}}
                }}
            ]),
        )?;
        tools.set_container_logs("booting\nI am a rake task\n")?;
        Ok(tools)
    }

    const RAKE_PLAN: &str = r#"
[[scenario]]
name = "rake"
fixture = "rake"
files = { "Procfile" = "web: bundle exec rake" }

[scenario.build]
env = { BPE_SOME_VARIABLE = "SOME_VALUE" }

[scenario.expect]
banners = ["Buildpack for MRI", "Buildpack for Bundler", "Buildpack for Rake"]
absent = ["Buildpack for Procfile"]
labels = { some-label = "some-value" }

[[scenario.expect.stages]]
id = "environment-variables"
index = 4
layer = "environment-variables"
field = "variables"
value = { SOME_VARIABLE = "SOME_VALUE" }

[[scenario.checks]]
kind = "log"
contains = "I am a rake task"
"#;

    #[tokio::test]
    async fn test_successful_scenario_tears_down_in_reverse_order() -> Result<()> {
        let tools = rake_tools()?;
        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;

        assert!(report.passed(), "{report}");
        assert_eq!(
            report.phases,
            vec![
                Phase::Fresh,
                Phase::Provisioned,
                Phase::Built,
                Phase::Running,
                Phase::Verified,
                Phase::TornDown
            ]
        );
        let name = report.resource_name.clone().unwrap();
        assert!(name.starts_with("buildcheck-"));
        assert!(tools.build_source_listing().contains("Procfile"));

        let calls = tools.calls();
        assert_eq!(calls.len(), 7, "{calls:#?}");
        assert!(calls[0].starts_with(&format!("pack --no-color build {name} --path ")));
        assert!(calls[0].contains("--buildpack paketo-buildpacks/ruby"));
        assert!(calls[0].contains("--pull-policy never"));
        assert!(calls[0].contains("--env BPE_SOME_VARIABLE=SOME_VALUE"));
        assert_eq!(calls[1], format!("docker image inspect {name}"));
        assert_eq!(
            calls[2],
            format!("docker container run --detach --name {name} {IMAGE_ID}")
        );
        assert_eq!(calls[3], format!("docker container logs {CONTAINER_ID}"));
        assert_eq!(calls[4], format!("docker container rm --force {CONTAINER_ID}"));
        assert_eq!(calls[5], format!("docker image rm --force {IMAGE_ID}"));
        assert!(calls[6].starts_with(&format!(
            "docker volume rm --force pack-cache-library_{name}_latest-"
        )));
        assert_eq!(calls[6].split_whitespace().count(), 7);

        let source = tools.build_source().unwrap();
        assert!(!source.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_build_failure_reports_transcript_and_still_cleans_up() -> Result<()> {
        let tools = rake_tools()?;
        tools.set_build_output(
            "Paketo Buildpack for MRI 0.2.0\n",
            "ERROR: failed to build: exit status 1\n",
            1,
        )?;

        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;
        assert!(!report.passed());
        assert_eq!(
            report.phases,
            vec![Phase::Fresh, Phase::Provisioned, Phase::Failed, Phase::TornDown]
        );
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Build);
        match &failure.error {
            HarnessError::Build { transcript, .. } => {
                assert!(transcript.contains("Paketo Buildpack for MRI 0.2.0"));
                assert!(transcript.contains("ERROR: failed to build"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(report.teardown.is_ok());

        let calls = tools.calls();
        assert_eq!(calls.len(), 2, "{calls:#?}");
        assert!(calls[0].starts_with("pack "));
        assert!(calls[1].starts_with("docker volume rm --force pack-cache-library_"));
        assert!(!tools.build_source().unwrap().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_assertion_still_removes_image() -> Result<()> {
        let tools = rake_tools()?;
        tools.set_build_output(
            &format!("{BUILD_OUTPUT}Paketo Buildpack for Procfile 5.0.0\n"),
            "",
            0,
        )?;

        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::VerifyBuild);
        assert!(matches!(failure.error, HarnessError::Assertion(_)));
        assert_eq!(report.final_phase(), Phase::TornDown);

        let calls = tools.calls();
        assert!(!calls.iter().any(|call| call.starts_with("docker container run")));
        assert!(calls.contains(&format!("docker image rm --force {IMAGE_ID}")));
        Ok(())
    }

    #[tokio::test]
    async fn test_teardown_failures_are_aggregated() -> Result<()> {
        let tools = rake_tools()?;
        tools.fail("container", "rm")?;
        tools.fail("volume", "rm")?;

        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;
        assert!(report.failure.is_none());
        assert!(!report.passed());

        let Err(HarnessError::Teardown(failures)) = &report.teardown else {
            panic!("expected teardown failure, got {:?}", report.teardown);
        };
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0].resource,
            Resource::Container(CONTAINER_ID.to_string())
        );
        assert!(matches!(failures[1].resource, Resource::Volumes(ref names) if names.len() == 3));

        let calls = tools.calls();
        assert!(calls.contains(&format!("docker image rm --force {IMAGE_ID}")));
        assert!(!tools.build_source().unwrap().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_log_check_times_out_and_removes_container() -> Result<()> {
        let tools = rake_tools()?;
        tools.set_container_logs("rake aborted!\n")?;

        let plan = scenario(&RAKE_PLAN.replace(
            "contains = \"I am a rake task\"",
            "contains = \"I am a rake task\"\ntimeout = \"300ms\"",
        ));
        let report = tools.harness().run(&plan).await;

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::VerifyRuntime);
        match &failure.error {
            HarnessError::Timeout { last_observed, .. } => {
                assert!(last_observed.contains("rake aborted!"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            tools
                .calls()
                .contains(&format!("docker container rm --force {CONTAINER_ID}"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_run_failure_removes_named_container_and_build_artifacts() -> Result<()> {
        let tools = rake_tools()?;
        tools.fail("container", "run")?;

        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;
        assert_eq!(
            report.phases,
            vec![
                Phase::Fresh,
                Phase::Provisioned,
                Phase::Built,
                Phase::Failed,
                Phase::TornDown
            ]
        );
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Run);
        assert!(matches!(failure.error, HarnessError::Run { .. }));
        assert!(report.teardown.is_ok(), "{:?}", report.teardown);

        let name = report.resource_name.clone().unwrap();
        let calls = tools.calls();
        assert_eq!(calls.len(), 6, "{calls:#?}");
        assert_eq!(
            calls[2],
            format!("docker container run --detach --name {name} {IMAGE_ID}")
        );
        assert_eq!(calls[3], format!("docker container rm --force {name}"));
        assert_eq!(calls[4], format!("docker image rm --force {IMAGE_ID}"));
        assert!(calls[5].starts_with("docker volume rm --force pack-cache-library_"));
        assert!(!tools.build_source().unwrap().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_container_created_but_not_started_is_removed() -> Result<()> {
        let tools = rake_tools()?;
        tools.fail_with_output("container", "run", "created-cid-1\n")?;

        let report = tools.harness().run(&scenario(RAKE_PLAN)).await;
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Run);
        match &failure.error {
            HarnessError::Run { reason, .. } => {
                assert!(reason.contains("refused by fake runtime"), "{reason}");
                assert!(!reason.contains("cleanup also failed"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(report.teardown.is_ok(), "{:?}", report.teardown);

        let calls = tools.calls();
        assert!(calls.contains(&"docker container rm --force created-cid-1".to_string()));
        assert!(calls.contains(&format!("docker image rm --force {IMAGE_ID}")));
        assert!(
            calls
                .iter()
                .any(|call| call.starts_with("docker volume rm --force pack-cache-library_"))
        );
        assert!(!tools.build_source().unwrap().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_port_resolution_failure_removes_started_container() -> Result<()> {
        let tools = rake_tools()?;
        tools.fail("container", "inspect")?;

        let plan = scenario(&RAKE_PLAN.replace(
            "[[scenario.checks]]",
            "[scenario.run]\npublish = [\"8080\"]\n\n[[scenario.checks]]",
        ));
        let report = tools.harness().run(&plan).await;

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Run);
        match &failure.error {
            HarnessError::Run { reason, .. } => {
                assert!(reason.contains("failed to resolve published ports"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(report.teardown.is_ok(), "{:?}", report.teardown);

        let calls = tools.calls();
        let inspect = calls
            .iter()
            .position(|call| *call == format!("docker container inspect {CONTAINER_ID}"))
            .unwrap();
        assert_eq!(
            calls[inspect + 1],
            format!("docker container rm --force {CONTAINER_ID}")
        );
        assert!(calls.contains(&format!("docker image rm --force {IMAGE_ID}")));
        assert!(!calls.iter().any(|call| call.starts_with("docker container logs")));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_extra_file_still_disposes_fixture() -> Result<()> {
        let tools = rake_tools()?;
        let plan = scenario(&RAKE_PLAN.replace(
            "files = { \"Procfile\" = \"web: bundle exec rake\" }",
            "files = { \"../escape\" = \"outside\" }",
        ));

        let report = tools.harness().run(&plan).await;
        assert_eq!(
            report.phases,
            vec![Phase::Fresh, Phase::Failed, Phase::TornDown]
        );
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Provision);
        assert!(failure.error.to_string().contains("refusing to write outside the fixture"));
        assert!(report.teardown.is_ok());
        assert!(tools.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_template_fails_provisioning() -> Result<()> {
        let tools = FakeTools::new()?;
        let report = tools
            .harness()
            .run(&scenario(
                r#"
[[scenario]]
name = "missing"
fixture = "does-not-exist"
"#,
            ))
            .await;

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, Step::Provision);
        assert!(matches!(failure.error, HarnessError::Provision { .. }));
        assert!(report.teardown.is_ok());
        assert!(tools.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_http_check_polls_published_port() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello world!"))
            .mount(&server)
            .await;
        let host_port = server.address().port();

        let tools = FakeTools::new()?;
        tools.add_template("web", &[("config.ru", "run App\n")])?;
        tools.set_build_output("Paketo Buildpack for Puma 0.1.0\n", "", 0)?;
        tools.set_image(&[], &stages(&["paketo-buildpacks/mri", "paketo-buildpacks/puma"]))?;
        tools.set_published_port(8080, host_port)?;

        let plan = scenario(
            r#"
[[scenario]]
name = "web"
fixture = "web"

[scenario.expect]
stage_ids = ["mri", "puma"]

[scenario.run]
publish = ["8080"]
env = { PORT = "8080" }

[[scenario.checks]]
kind = "http"
port = "8080"
path = "/health"
body_contains = "Hello world"
"#,
        );
        let report = tools.harness().run(&plan).await;
        assert!(report.passed(), "{report}");

        let name = report.resource_name.clone().unwrap();
        let calls = tools.calls();
        assert!(calls.contains(&format!(
            "docker container run --detach --name {name} --env PORT=8080 --publish 8080 {IMAGE_ID}"
        )));
        assert!(calls.contains(&format!("docker container inspect {CONTAINER_ID}")));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_all_keeps_plan_order_with_unique_names() -> Result<()> {
        let tools = rake_tools()?;
        let plan = PlanFile::parse(
            r#"
[[scenario]]
name = "first"
fixture = "rake"

[[scenario]]
name = "second"
fixture = "rake"

[[scenario]]
name = "third"
fixture = "missing"
"#,
        )?;

        let reports = run_all(Arc::new(tools.harness()), plan.scenarios, 2).await?;
        let names: Vec<_> = reports.iter().map(|r| r.scenario.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(reports[0].passed());
        assert!(reports[1].passed());
        assert!(!reports[2].passed());
        assert_ne!(reports[0].resource_name, reports[1].resource_name);
        Ok(())
    }
}
