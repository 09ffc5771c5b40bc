//! Harness configuration
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CANVAS_E2E_BASE_URL` | `https://localhost:9091` |
//! | `CANVAS_E2E_IGNORE_HTTPS_ERRORS` | `true` |
//! | `CANVAS_E2E_TIMEOUT_MS` | `10000` |
//! | `CANVAS_E2E_POLL_MS` | `100` |
//! | `CANVAS_E2E_CONVERGENCE_MS` | `10000` |
//! | `CANVAS_E2E_SCENARIO_TIMEOUT_MS` | `120000` |
//! | `CANVAS_E2E_OUTPUT_DIR` | `test-results` |
//! | `CANVAS_E2E_BROWSER` | `chromium` |
//! | `CANVAS_E2E_HEADLESS` | `true` |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::E2eResult;

pub const DEFAULT_BASE_URL: &str = "https://localhost:9091";
pub const DEFAULT_CONDITION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_CONVERGENCE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SCENARIO_TIMEOUT_MS: u64 = 120_000;

pub const ENV_BASE_URL: &str = "CANVAS_E2E_BASE_URL";
pub const ENV_IGNORE_HTTPS_ERRORS: &str = "CANVAS_E2E_IGNORE_HTTPS_ERRORS";
pub const ENV_TIMEOUT_MS: &str = "CANVAS_E2E_TIMEOUT_MS";
pub const ENV_POLL_MS: &str = "CANVAS_E2E_POLL_MS";
pub const ENV_CONVERGENCE_MS: &str = "CANVAS_E2E_CONVERGENCE_MS";
pub const ENV_SCENARIO_TIMEOUT_MS: &str = "CANVAS_E2E_SCENARIO_TIMEOUT_MS";
pub const ENV_OUTPUT_DIR: &str = "CANVAS_E2E_OUTPUT_DIR";
pub const ENV_BROWSER: &str = "CANVAS_E2E_BROWSER";
pub const ENV_HEADLESS: &str = "CANVAS_E2E_HEADLESS";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base URL of the application under test
    pub base_url: String,

    /// Accept self-signed certificates (local development)
    pub ignore_https_errors: bool,

    /// Per-condition readiness timeout
    pub condition_timeout_ms: u64,

    /// Poll interval for readiness, cascade and convergence loops
    pub poll_interval_ms: u64,

    /// How long actors are given to observe each other's state
    pub convergence_timeout_ms: u64,

    /// Scenario-level cancellation timeout
    pub scenario_timeout_ms: u64,

    /// Directory for reports and artifacts
    pub output_dir: PathBuf,

    /// Browser settings
    pub browser: BrowserSettings,
}

/// Browser launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// chromium, firefox or webkit
    pub engine: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ignore_https_errors: true,
            condition_timeout_ms: DEFAULT_CONDITION_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            convergence_timeout_ms: DEFAULT_CONVERGENCE_TIMEOUT_MS,
            scenario_timeout_ms: DEFAULT_SCENARIO_TIMEOUT_MS,
            output_dir: PathBuf::from("test-results"),
            browser: BrowserSettings::default(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            engine: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> E2eResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::E2eError::SpecParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(flag) = lookup(ENV_IGNORE_HTTPS_ERRORS).and_then(|v| parse_bool(&v)) {
            self.ignore_https_errors = flag;
        }
        if let Some(ms) = lookup(ENV_TIMEOUT_MS).and_then(|v| v.parse().ok()) {
            self.condition_timeout_ms = ms;
        }
        if let Some(ms) = lookup(ENV_POLL_MS).and_then(|v| v.parse().ok()) {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = lookup(ENV_CONVERGENCE_MS).and_then(|v| v.parse().ok()) {
            self.convergence_timeout_ms = ms;
        }
        if let Some(ms) = lookup(ENV_SCENARIO_TIMEOUT_MS).and_then(|v| v.parse().ok()) {
            self.scenario_timeout_ms = ms;
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(engine) = lookup(ENV_BROWSER) {
            self.browser.engine = engine.to_lowercase();
        }
        if let Some(flag) = lookup(ENV_HEADLESS).and_then(|v| parse_bool(&v)) {
            self.browser.headless = flag;
        }
        self
    }

    pub fn condition_timeout(&self) -> Duration {
        Duration::from_millis(self.condition_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_millis(self.scenario_timeout_ms)
    }

    /// Resolve a scenario URL against the base URL
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
