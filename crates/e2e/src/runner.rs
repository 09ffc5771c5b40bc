//! Main test runner that provisions fixtures, drives pages and reports

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actors::{ActorIdentity, ActorScript, ConvergenceProbe, MultiActorSynchronizer};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::page::{Browser, ContextOptions, Page};
use crate::readiness::ReadinessProber;
use crate::report::{slug, Report, ReportSink, ScenarioRecorder, ScenarioResult};
use crate::spec::{ActorsBlock, Scenario};
use crate::steps::{StepExecutor, Variables};
use crate::token::TokenFixtureProvider;

/// Default location of scenario files
pub const DEFAULT_SPECS_DIR: &str = "tests/e2e/specs";

/// How long failure context may take once a scenario has timed out
const TIMEOUT_CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Main E2E test runner
pub struct TestRunner {
    config: HarnessConfig,
    browser: Arc<dyn Browser>,
    tokens: TokenFixtureProvider,
    specs_dir: PathBuf,
}

impl TestRunner {
    pub fn new(config: HarnessConfig, browser: Arc<dyn Browser>, tokens: TokenFixtureProvider) -> Self {
        Self {
            config,
            browser,
            tokens,
            specs_dir: PathBuf::from(DEFAULT_SPECS_DIR),
        }
    }

    pub fn with_specs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.specs_dir = dir.into();
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run all scenarios in the specs directory
    pub async fn run_all(&self) -> E2eResult<Report> {
        let scenarios = Scenario::load_all(&self.specs_dir)?;
        self.run_scenarios(&scenarios).await
    }

    /// Run scenarios matching a tag
    pub async fn run_tagged(&self, tag: &str) -> E2eResult<Report> {
        let scenarios = Scenario::load_all(&self.specs_dir)?;
        let filtered: Vec<Scenario> = Scenario::filter_by_tag(&scenarios, tag).into_iter().cloned().collect();
        self.run_scenarios(&filtered).await
    }

    /// Run a specific scenario by name
    pub async fn run_test(&self, name: &str) -> E2eResult<Report> {
        let scenarios = Scenario::load_all(&self.specs_dir)?;
        let scenario = scenarios
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| E2eError::SpecParse(format!("Test not found: {}", name)))?;
        self.run_scenarios(std::slice::from_ref(&scenario)).await
    }

    /// Run scenarios one after another and aggregate their results
    pub async fn run_scenarios(&self, scenarios: &[Scenario]) -> E2eResult<Report> {
        Scenario::ensure_unique_names(scenarios)?;
        let sink = ReportSink::new();
        info!("Running {} scenario(s) (run {})...", scenarios.len(), sink.run_id());

        for scenario in scenarios {
            let result = self.run_scenario(scenario).await?;
            sink.record(&scenario.name, result)?;
        }

        Ok(sink.flush())
    }

    /// Run one scenario on its own page.
    ///
    /// Test failures and harness errors end up in the returned result; an
    /// `Err` means the result itself could not be produced.
    pub async fn run_scenario(&self, scenario: &Scenario) -> E2eResult<ScenarioResult> {
        debug!("Running scenario: {}", scenario.name);
        let artifact_dir = self.config.output_dir.join("artifacts").join(slug(&scenario.name));
        clear_previous_artifacts(&artifact_dir)?;
        let mut recorder = ScenarioRecorder::start(&scenario.name, &artifact_dir)?;
        let prober = ReadinessProber::from_config(&self.config);

        let page = match self.browser.new_page(ContextOptions::labeled(&scenario.name)).await {
            Ok(page) => page,
            Err(e) => {
                recorder.error(None, &e).await?;
                return recorder.finish();
            }
        };

        let timeout = scenario
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.scenario_timeout());

        let outcome = tokio::time::timeout(
            timeout,
            self.drive(scenario, page.as_ref(), &prober, &artifact_dir, &mut recorder),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                recorder.set_last_condition(prober.last_attempted());
                conclude_with(&mut recorder, Some(page.as_ref()), &e).await;
            }
            Err(_) => {
                let err = E2eError::ScenarioTimeout {
                    name: scenario.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                recorder.set_last_condition(prober.last_attempted());
                if tokio::time::timeout(TIMEOUT_CAPTURE_GRACE, recorder.capture_failure_context(page.as_ref()))
                    .await
                    .is_err()
                {
                    warn!("[{}] failure context capture timed out", scenario.name);
                }
                conclude_with(&mut recorder, None, &err).await;
            }
        }

        if let Err(e) = page.close().await {
            warn!("[{}] failed to close page: {}", scenario.name, e);
        }

        recorder.finish()
    }

    async fn drive(
        &self,
        scenario: &Scenario,
        page: &dyn Page,
        prober: &ReadinessProber,
        artifact_dir: &Path,
        recorder: &mut ScenarioRecorder,
    ) -> E2eResult<()> {
        let mut vars = Variables::new();
        vars.set("base_url", self.config.base_url.clone());

        if let Some(request) = &scenario.token {
            let pair = self.tokens.create_token_pair(request).await?;
            recorder.soft_check(
                &format!("token pair {}/{} registered with the application", pair.host_token, pair.user_token),
                pair.registered,
            );
            vars.set("host_token", pair.host_token)
                .set("user_token", pair.user_token)
                .set("session_id", pair.session_id.to_string());
        }

        if !scenario.steps.is_empty() {
            let mut executor = StepExecutor::new(page, prober, &self.config.base_url, vars.clone())
                .with_recorder(recorder)
                .with_screenshot_dir(artifact_dir);
            executor.run_all(&scenario.steps).await?;
        }

        if let Some(actors) = &scenario.actors {
            self.run_actors(actors, &vars, prober, artifact_dir, recorder).await?;
        }

        Ok(())
    }

    async fn run_actors(
        &self,
        actors: &ActorsBlock,
        vars: &Variables,
        prober: &ReadinessProber,
        artifact_dir: &Path,
        recorder: &mut ScenarioRecorder,
    ) -> E2eResult<()> {
        let token = vars.get("user_token").unwrap_or_default();
        let scripts: Vec<ActorScript> = actors
            .identities
            .iter()
            .map(|identity| ActorScript {
                identity: ActorIdentity::new(&identity.name, &identity.email, &identity.country, token),
                steps: actors.steps.clone(),
            })
            .collect();

        let mut probe = ConvergenceProbe::from_config(actors.observe_selector.clone(), &self.config);
        if let Some(ms) = actors.convergence_timeout_ms {
            probe.timeout = Duration::from_millis(ms);
        }

        let outcomes = MultiActorSynchronizer::new(self.browser.as_ref(), prober, probe)
            .mode(actors.mode)
            .base_url(self.config.base_url.clone())
            .variables(vars.clone())
            .screenshot_dir(artifact_dir)
            .run_concurrent_actors(scripts)
            .await?;

        for outcome in &outcomes {
            for note in &outcome.soft_notes {
                recorder.soft_check(&format!("[{}] {}", outcome.actor, note), false);
            }
            if let Some(error) = &outcome.error {
                let err = E2eError::AssertionFailed(format!("actor '{}': {}", outcome.actor, error));
                recorder.fail(None, &err).await?;
            }
            for failure in outcome.failures() {
                recorder.fail(None, &failure).await?;
            }
        }

        Ok(())
    }

    /// Write the report to the configured output directory
    pub fn write_results(&self, report: &Report) -> E2eResult<PathBuf> {
        report.write(&self.config.output_dir)
    }
}

/// Artifacts are write-once within a run; files left by an earlier run into
/// the same output directory are discarded first.
fn clear_previous_artifacts(dir: &Path) -> E2eResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!("Cleared artifacts of a previous run in {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Record `err` unless the scenario already reached an outcome, e.g. through
/// a hard check that failed before the error surfaced.
async fn conclude_with(recorder: &mut ScenarioRecorder, page: Option<&dyn Page>, err: &E2eError) {
    if recorder.status().is_terminal() {
        debug!("[{}] already {}, not recording: {}", recorder.result().name, recorder.status(), err);
        return;
    }
    if let Err(e) = recorder.record_error(page, err).await {
        warn!("[{}] could not record error: {}", recorder.result().name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ScenarioStatus;
    use crate::testing::FakeBrowser;
    use crate::token::LocalTokenSource;

    fn runner(output: &Path, browser: FakeBrowser) -> TestRunner {
        let config = HarnessConfig {
            base_url: "https://app.test".to_string(),
            output_dir: output.to_path_buf(),
            ..Default::default()
        };
        TestRunner::new(config, Arc::new(browser), TokenFixtureProvider::new(LocalTokenSource::offline()))
    }

    #[tokio::test]
    async fn test_token_variables_reach_steps() {
        let dir = tempfile::tempdir().unwrap();
        let browser = FakeBrowser::new();
        let runner = runner(dir.path(), browser.clone());

        let scenario = Scenario::from_yaml(
            r#"
name: token-navigation
token: { sessionId: 212 }
steps:
  - action: navigate
    url: /host/control-panel/{host_token}
"#,
        )
        .unwrap();

        let result = runner.run_scenario(&scenario).await.unwrap();
        assert_eq!(result.status, ScenarioStatus::Passed);

        let page = browser.page("token-navigation").unwrap();
        let url = page.current_url().unwrap();
        assert!(url.starts_with("https://app.test/host/control-panel/"));
        assert!(!url.contains("{host_token}"));
        assert!(page.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_timeout_errors_and_closes_page() {
        let dir = tempfile::tempdir().unwrap();
        let browser = FakeBrowser::new();
        let runner = runner(dir.path(), browser.clone());

        let scenario = Scenario::from_yaml(
            r#"
name: slow
timeout_ms: 1000
steps:
  - action: sleep
    ms: 60000
"#,
        )
        .unwrap();

        let result = runner.run_scenario(&scenario).await.unwrap();
        assert_eq!(result.status, ScenarioStatus::Errored);
        assert!(result.failures[0].contains("exceeded its 1000 ms timeout"));
        assert!(browser.page("slow").unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_actors_tears_down_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let browser = FakeBrowser::new();
        let runner = runner(dir.path(), browser.clone());

        let scenario = Scenario::from_yaml(
            r#"
name: stuck-registration
timeout_ms: 1000
token: {}
actors:
  observe_selector: '[data-testid="participant-name"]'
  identities:
    - { name: Spider-Man, email: spiderman@example.com }
    - { name: Wonder Woman, email: wonderwoman@example.com }
  steps:
    - action: navigate
      url: /user/landing/{token}
    - action: sleep
      ms: 60000
"#,
        )
        .unwrap();

        let result = runner.run_scenario(&scenario).await.unwrap();
        assert_eq!(result.status, ScenarioStatus::Errored);

        let pages = browser.pages();
        assert_eq!(pages.len(), 3);
        for page in &pages {
            assert!(page.is_torn_down(), "page '{}' left open", page.label());
        }
        // Actor pages were cut off mid-script, not closed by the synchronizer
        let actor = browser.page("Spider-Man").unwrap();
        assert!(actor.is_released());
        assert!(!actor.is_closed());
    }
}
