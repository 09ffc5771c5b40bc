//! Assertion and report sink
//!
//! Each scenario moves through `Pending -> Running -> {Passed | Failed |
//! Errored}` exactly once. Failure context (screenshot, DOM snapshot) is
//! captured when the failure happens, and every artifact is written once and
//! fingerprinted with SHA-256.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::CapturedEvents;
use crate::error::{E2eError, E2eResult};
use crate::page::Page;

/// Name of the report file written to the output directory
pub const REPORT_FILE: &str = "test-results.json";

/// Per-scenario state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Errored,
}

impl ScenarioStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Errored)
    }

    fn can_transition_to(&self, next: ScenarioStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Errored)
                | (Self::Running, Self::Passed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Errored)
        )
    }
}

impl std::fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Snapshot,
    Events,
    Log,
}

/// A file attached to a scenario result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Outcome of one scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    /// Hard assertion failures and errors
    pub failures: Vec<String>,
    /// Soft checks that did not hold; recorded but never fatal
    pub soft_notes: Vec<String>,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
    /// Readiness condition attempted last before the outcome
    pub last_condition: Option<String>,
}

impl ScenarioResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ScenarioStatus::Pending,
            failures: Vec::new(),
            soft_notes: Vec::new(),
            artifacts: Vec::new(),
            duration_ms: 0,
            last_condition: None,
        }
    }

    /// Move to `next`, refusing anything out of a terminal state
    pub fn transition(&mut self, next: ScenarioStatus) -> E2eResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(E2eError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Scenario '{}': {} -> {}", self.name, self.status, next);
        self.status = next;
        Ok(())
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }
}

/// Per-scenario handle for checks and failure capture
pub struct ScenarioRecorder {
    result: ScenarioResult,
    artifact_dir: PathBuf,
    started: Instant,
}

impl ScenarioRecorder {
    /// Create the result and move it to `Running`
    pub fn start(name: impl Into<String>, artifact_dir: impl Into<PathBuf>) -> E2eResult<Self> {
        let mut result = ScenarioResult::new(name);
        result.transition(ScenarioStatus::Running)?;
        Ok(Self {
            result,
            artifact_dir: artifact_dir.into(),
            started: Instant::now(),
        })
    }

    pub fn status(&self) -> ScenarioStatus {
        self.result.status
    }

    pub fn result(&self) -> &ScenarioResult {
        &self.result
    }

    pub fn set_last_condition(&mut self, condition: Option<String>) {
        if condition.is_some() {
            self.result.last_condition = condition;
        }
    }

    /// Non-fatal expectation. Returns `ok` so callers can branch on it.
    pub fn soft_check(&mut self, description: &str, ok: bool) -> bool {
        if !ok {
            warn!("[{}] soft check failed: {}", self.result.name, description);
            self.result.soft_notes.push(description.to_string());
        }
        ok
    }

    /// Hard expectation. A false `ok` fails the scenario and returns
    /// `AssertionFailed`.
    pub async fn hard_check(&mut self, page: Option<&dyn Page>, description: &str, ok: bool) -> E2eResult<()> {
        if ok {
            return Ok(());
        }
        let err = E2eError::AssertionFailed(description.to_string());
        self.fail(page, &err).await?;
        Err(err)
    }

    /// Transition to `Failed`, capturing page context first
    pub async fn fail(&mut self, page: Option<&dyn Page>, err: &E2eError) -> E2eResult<()> {
        self.conclude(page, err, ScenarioStatus::Failed).await
    }

    /// Transition to `Errored`, capturing page context first
    pub async fn error(&mut self, page: Option<&dyn Page>, err: &E2eError) -> E2eResult<()> {
        self.conclude(page, err, ScenarioStatus::Errored).await
    }

    /// `fail` for test failures, `error` for harness problems
    pub async fn record_error(&mut self, page: Option<&dyn Page>, err: &E2eError) -> E2eResult<()> {
        if err.is_test_failure() {
            self.fail(page, err).await
        } else {
            self.error(page, err).await
        }
    }

    /// A failed scenario may collect further failures; any other move out of
    /// a terminal state is rejected.
    async fn conclude(&mut self, page: Option<&dyn Page>, err: &E2eError, status: ScenarioStatus) -> E2eResult<()> {
        let already = self.result.status;
        if already.is_terminal() && !(already == ScenarioStatus::Failed && status == ScenarioStatus::Failed) {
            return Err(E2eError::InvalidTransition {
                from: already.to_string(),
                to: status.to_string(),
            });
        }
        error!("[{}] {}", self.result.name, err);
        self.result.failures.push(err.to_string());
        if let Some(page) = page {
            self.capture_failure_context(page).await;
        }
        if already == status {
            return Ok(());
        }
        self.result.transition(status)
    }

    /// Screenshot and DOM snapshot of the page as it is now. Capture problems
    /// are logged; they never mask the failure being recorded.
    pub async fn capture_failure_context(&mut self, page: &dyn Page) {
        let index = self.result.failures.len();
        let base = format!("{}-failure-{}", slug(&self.result.name), index);

        let screenshot = format!("{}.png", base);
        if let Err(e) = self.attach_screenshot(page, &screenshot).await.map(|_| ()) {
            warn!("[{}] failure screenshot not captured: {}", self.result.name, e);
        }

        match page.content().await {
            Ok(html) => {
                let written = self
                    .write_artifact(&format!("{}.html", base), ArtifactKind::Snapshot, html.as_bytes())
                    .map(|_| ());
                if let Err(e) = written {
                    warn!("[{}] DOM snapshot not written: {}", self.result.name, e);
                }
            }
            Err(e) => warn!("[{}] DOM snapshot not captured: {}", self.result.name, e),
        }
    }

    /// Take a named screenshot
    pub async fn attach_screenshot(&mut self, page: &dyn Page, name: &str) -> E2eResult<&Artifact> {
        let path = self.reserve(name)?;
        page.screenshot(&path).await?;
        let bytes = std::fs::read(&path)?;
        Ok(self.push_artifact(name, ArtifactKind::Screenshot, path, &bytes))
    }

    /// Persist captured events as JSON
    pub fn attach_events(&mut self, name: &str, events: &CapturedEvents) -> E2eResult<&Artifact> {
        let json = serde_json::to_vec_pretty(events)?;
        self.write_artifact(name, ArtifactKind::Events, &json)
    }

    /// Write bytes as a new artifact. Names and files are write-once.
    pub fn write_artifact(&mut self, name: &str, kind: ArtifactKind, bytes: &[u8]) -> E2eResult<&Artifact> {
        let path = self.reserve(name)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => E2eError::ArtifactExists(path.display().to_string()),
                _ => E2eError::Io(e),
            })?;
        file.write_all(bytes)?;
        Ok(self.push_artifact(name, kind, path, bytes))
    }

    fn reserve(&self, name: &str) -> E2eResult<PathBuf> {
        if self.result.artifact(name).is_some() {
            return Err(E2eError::ArtifactExists(name.to_string()));
        }
        std::fs::create_dir_all(&self.artifact_dir)?;
        let path = self.artifact_dir.join(name);
        if path.exists() {
            return Err(E2eError::ArtifactExists(path.display().to_string()));
        }
        Ok(path)
    }

    fn push_artifact(&mut self, name: &str, kind: ArtifactKind, path: PathBuf, bytes: &[u8]) -> &Artifact {
        let sha256 = hex::encode(Sha256::digest(bytes));
        debug!("[{}] artifact {} ({} bytes, sha256 {})", self.result.name, name, bytes.len(), sha256);
        self.result.artifacts.push(Artifact {
            name: name.to_string(),
            kind,
            path,
            sha256,
            size_bytes: bytes.len() as u64,
        });
        &self.result.artifacts[self.result.artifacts.len() - 1]
    }

    /// Close the scenario. A still-running scenario passes.
    pub fn finish(mut self) -> E2eResult<ScenarioResult> {
        if self.result.status == ScenarioStatus::Running {
            self.result.transition(ScenarioStatus::Passed)?;
        }
        self.result.duration_ms = self.started.elapsed().as_millis() as u64;
        Ok(self.result)
    }
}

pub(crate) fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Aggregated run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub results: Vec<ScenarioResult>,
}

impl Report {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    /// Write `test-results.json` into `output_dir`
    pub fn write(&self, output_dir: &Path) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Collects terminal scenario results
pub struct ReportSink {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    results: Mutex<Vec<ScenarioResult>>,
}

impl Default for ReportSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record a finished scenario. Each name is recorded once, with a
    /// terminal status.
    pub fn record(&self, scenario_name: &str, mut result: ScenarioResult) -> E2eResult<()> {
        if !result.status.is_terminal() {
            return Err(E2eError::InvalidTransition {
                from: result.status.to_string(),
                to: "recorded".to_string(),
            });
        }
        result.name = scenario_name.to_string();

        let mut results = self.results.lock();
        if let Some(existing) = results.iter().find(|r| r.name == scenario_name) {
            return Err(E2eError::InvalidTransition {
                from: existing.status.to_string(),
                to: result.status.to_string(),
            });
        }

        match result.status {
            ScenarioStatus::Passed => info!("✓ {} ({} ms)", result.name, result.duration_ms),
            _ => error!(
                "✗ {} [{}] - {}",
                result.name,
                result.status,
                result.failures.first().map(String::as_str).unwrap_or("unknown error")
            ),
        }
        results.push(result);
        Ok(())
    }

    /// Drain recorded results into a report
    pub fn flush(&self) -> Report {
        let results = std::mem::take(&mut *self.results.lock());
        let count = |status: ScenarioStatus| results.iter().filter(|r| r.status == status).count();
        let report = Report {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total: results.len(),
            passed: count(ScenarioStatus::Passed),
            failed: count(ScenarioStatus::Failed),
            errored: count(ScenarioStatus::Errored),
            results,
        };
        info!(
            "Test Results: {} passed, {} failed, {} errored",
            report.passed, report.failed, report.errored
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let mut result = ScenarioResult::new("host flow");
        result.transition(ScenarioStatus::Running).unwrap();
        result.transition(ScenarioStatus::Passed).unwrap();

        for next in [
            ScenarioStatus::Running,
            ScenarioStatus::Failed,
            ScenarioStatus::Errored,
            ScenarioStatus::Passed,
        ] {
            assert!(matches!(
                result.transition(next),
                Err(E2eError::InvalidTransition { .. })
            ));
        }
        assert_eq!(result.status, ScenarioStatus::Passed);
    }

    #[test]
    fn test_pending_cannot_pass_directly() {
        let mut result = ScenarioResult::new("x");
        assert!(result.transition(ScenarioStatus::Passed).is_err());
        assert!(result.transition(ScenarioStatus::Errored).is_ok());
    }

    #[test]
    fn test_artifacts_are_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ScenarioRecorder::start("artifacts", dir.path()).unwrap();

        let artifact = recorder.write_artifact("console.log", ArtifactKind::Log, b"hello").unwrap();
        assert_eq!(
            artifact.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(matches!(
            recorder.write_artifact("console.log", ArtifactKind::Log, b"again"),
            Err(E2eError::ArtifactExists(_))
        ));
        assert_eq!(std::fs::read(dir.path().join("console.log")).unwrap(), b"hello");
    }

    #[test]
    fn test_sink_rejects_non_terminal_and_duplicates() {
        let sink = ReportSink::new();
        assert!(sink.record("a", ScenarioResult::new("a")).is_err());

        let recorder = ScenarioRecorder::start("a", std::env::temp_dir()).unwrap();
        let passed = recorder.finish().unwrap();
        sink.record("a", passed.clone()).unwrap();
        assert!(sink.record("a", passed).is_err());

        let report = sink.flush();
        assert_eq!(report.total, 1);
        assert_eq!(report.passed, 1);
        assert!(report.success());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Host: Session Opener (cascade)"), "host-session-opener-cascade");
    }
}
