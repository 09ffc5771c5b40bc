//! Declarative YAML scenarios

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::actors::LaunchMode;
use crate::capture::FilterSpec;
use crate::cascade::{CascadeStep, SelectLevel};
use crate::error::{E2eError, E2eResult};
use crate::readiness::ReadinessCondition;
use crate::report::slug;
use crate::token::TokenRequest;

/// A complete scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Token pair to create before the steps run. Exposed to steps as
    /// `{host_token}`, `{user_token}` and `{session_id}`.
    #[serde(default)]
    pub token: Option<TokenRequest>,

    /// Overrides the configured scenario timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Steps for the scenario's own page, executed in order
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,

    /// Multi-actor phase, run after `steps`
    #[serde(default)]
    pub actors: Option<ActorsBlock>,
}

/// Several identities driven through the same script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorsBlock {
    #[serde(default)]
    pub mode: LaunchMode,

    /// Selector whose text lists the identities each actor can see
    pub observe_selector: String,

    #[serde(default)]
    pub convergence_timeout_ms: Option<u64>,

    pub identities: Vec<IdentitySpec>,

    /// Script run by every actor; `{name}`, `{email}`, `{country}` and
    /// `{token}` are replaced per actor
    pub steps: Vec<ScenarioStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySpec {
    pub name: String,
    pub email: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "US".to_string()
}

/// A single step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Navigate to a URL (relative to base) and wait for readiness
    Navigate {
        url: String,
        #[serde(default)]
        ready: Vec<ReadinessCondition>,
    },

    /// Click an element
    Click { selector: String },

    /// Click the first visible candidate
    ClickFirst { candidates: Vec<String> },

    /// Fill an input field
    Fill {
        selector: String,
        value: String,
        /// Clear, fill, then dispatch `input` and `change` so Blazor
        /// bindings observe the new value
        #[serde(default)]
        blazor: bool,
    },

    /// Select an option from a dropdown
    Select { selector: String, value: String },

    /// Wait for a readiness condition
    Wait {
        condition: ReadinessCondition,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Wait for a dependent chain
    Cascade {
        steps: Vec<CascadeStep>,
        #[serde(default = "default_inter_step_delay")]
        inter_step_delay_ms: u64,
    },

    /// Select through dependent dropdowns
    SelectCascade {
        levels: Vec<SelectLevel>,
        #[serde(default = "default_inter_step_delay")]
        inter_step_delay_ms: u64,
        #[serde(default)]
        guard_default_values: bool,
    },

    /// Wait for a fixed amount of time (use sparingly)
    Sleep { ms: u64 },

    /// Assert something about an element
    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        count: Option<usize>,
        /// Record a note instead of failing
        #[serde(default)]
        soft: bool,
    },

    /// Take a screenshot
    Screenshot { name: String },

    /// Start listening for events before the steps that trigger them
    StartCapture {
        name: String,
        #[serde(default)]
        filter: FilterSpec,
    },

    /// Stop a capture and check what it saw
    ExpectCaptured {
        name: String,
        #[serde(default = "default_min_count")]
        min_count: usize,
        #[serde(default)]
        soft: bool,
    },

    /// Log a message (for debugging)
    Log { message: String },
}

fn default_inter_step_delay() -> u64 {
    2000
}

fn default_min_count() -> usize {
    1
}

impl Scenario {
    /// Parse a scenario from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all scenarios from a directory. Names must be unique across
    /// files since results are keyed by name.
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut scenarios = Vec::new();
        let mut origins: HashMap<String, PathBuf> = HashMap::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            let scenario = Self::from_file(entry.path())?;
            if let Some(first) = origins.get(&scenario.name) {
                return Err(E2eError::SpecParse(format!(
                    "scenario name '{}' is declared by both {} and {}",
                    scenario.name,
                    first.display(),
                    entry.path().display()
                )));
            }
            origins.insert(scenario.name.clone(), entry.path().to_path_buf());
            scenarios.push(scenario);
        }

        Ok(scenarios)
    }

    /// Reject a batch in which two scenarios share a name, or names that
    /// map to the same artifact directory
    pub fn ensure_unique_names(scenarios: &[Self]) -> E2eResult<()> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for scenario in scenarios {
            if let Some(other) = seen.insert(slug(&scenario.name), &scenario.name) {
                let msg = if other == scenario.name {
                    format!("scenario name '{}' appears more than once", other)
                } else {
                    format!("scenarios '{}' and '{}' share an artifact directory", other, scenario.name)
                };
                return Err(E2eError::SpecParse(msg));
            }
        }
        Ok(())
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> E2eResult<()> {
        if self.steps.is_empty() && self.actors.is_none() {
            return Err(E2eError::SpecParse(format!("scenario '{}' has no steps", self.name)));
        }
        if let Some(actors) = &self.actors {
            if actors.identities.is_empty() {
                return Err(E2eError::SpecParse(format!("scenario '{}' declares no actors", self.name)));
            }
            let mut names: Vec<&str> = actors.identities.iter().map(|i| i.name.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            if names.len() != actors.identities.len() {
                return Err(E2eError::SpecParse(format!(
                    "scenario '{}' has duplicate actor names",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
