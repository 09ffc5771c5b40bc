//! Error types for E2E orchestration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Fixture unavailable: {0}")]
    FixtureUnavailable(String),

    #[error("Readiness timeout: '{condition}' not satisfied after {elapsed_ms} ms (timeout: {timeout_ms} ms)")]
    ReadinessTimeout {
        condition: String,
        elapsed_ms: u64,
        timeout_ms: u64,
    },

    #[error("Cascade broken at step {step} ('{name}'): '{condition}' not satisfied after {elapsed_ms} ms")]
    CascadeBroken {
        step: usize,
        name: String,
        condition: String,
        elapsed_ms: u64,
    },

    #[error("No events captured for {filter} (expected at least {expected})")]
    CaptureEmpty { filter: String, expected: usize },

    #[error("Convergence timeout: '{observer}' never observed '{peer}' within {elapsed_ms} ms")]
    ConvergenceTimeout {
        observer: String,
        peer: String,
        elapsed_ms: u64,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Invalid scenario transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Artifact already recorded: {0}")]
    ArtifactExists(String),

    #[error("Scenario '{name}' exceeded its {timeout_ms} ms timeout")]
    ScenarioTimeout { name: String, timeout_ms: u64 },

    #[error("Application unavailable at {url} after {attempts} attempts")]
    AppUnavailable { url: String, attempts: usize },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Errors that describe the application under test misbehaving, as opposed
    /// to the harness itself failing.
    pub fn is_test_failure(&self) -> bool {
        matches!(
            self,
            E2eError::ReadinessTimeout { .. }
                | E2eError::CascadeBroken { .. }
                | E2eError::CaptureEmpty { .. }
                | E2eError::ConvergenceTimeout { .. }
                | E2eError::AssertionFailed(_)
        )
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
