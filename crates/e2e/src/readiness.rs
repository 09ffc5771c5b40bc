//! Navigation and readiness probing
//!
//! A [`ReadinessCondition`] is a pure query over page state. The prober polls
//! a condition until it holds or its per-condition timeout elapses; it never
//! proceeds silently past a condition that did not resolve.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::page::Page;

/// A predicate over page state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadinessCondition {
    /// Element matches and is visible
    Visible { selector: String },

    /// Element is absent or hidden
    Hidden { selector: String },

    /// No request in flight and no network activity for `idle_ms`
    NetworkIdle {
        #[serde(default = "default_idle_ms")]
        idle_ms: u64,
    },

    /// Fixed delay; the fallback when nothing observable exists
    Delay { ms: u64 },

    /// Select has more than `min` options
    OptionCountAbove {
        selector: String,
        #[serde(default = "default_min_options")]
        min: usize,
    },

    /// Input or select has a non-empty value
    ValueNonEmpty { selector: String },

    /// Input or select has exactly this value
    ValueEquals { selector: String, value: String },

    /// Some matching element's text contains `text`
    TextContains { selector: String, text: String },

    /// A console message containing `text` has been logged
    ConsoleContains { text: String },

    /// A page-owned flag announced through console output is not set: the
    /// most recent message mentioning either marker mentions `clear_marker`,
    /// or neither marker was ever logged.
    FlagCleared { set_marker: String, clear_marker: String },

    /// Ordered fallback chain; satisfied by the first candidate that holds
    FirstMatch { candidates: Vec<ReadinessCondition> },
}

fn default_idle_ms() -> u64 {
    500
}

fn default_min_options() -> usize {
    1
}

impl ReadinessCondition {
    pub fn visible(selector: impl Into<String>) -> Self {
        Self::Visible { selector: selector.into() }
    }

    pub fn hidden(selector: impl Into<String>) -> Self {
        Self::Hidden { selector: selector.into() }
    }

    pub fn value_non_empty(selector: impl Into<String>) -> Self {
        Self::ValueNonEmpty { selector: selector.into() }
    }

    pub fn value_equals(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::ValueEquals {
            selector: selector.into(),
            value: value.into(),
        }
    }

    /// More than one option, i.e. populated beyond the placeholder
    pub fn populated(selector: impl Into<String>) -> Self {
        Self::OptionCountAbove {
            selector: selector.into(),
            min: 1,
        }
    }

    pub fn text_contains(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self::TextContains {
            selector: selector.into(),
            text: text.into(),
        }
    }

    pub fn console_contains(text: impl Into<String>) -> Self {
        Self::ConsoleContains { text: text.into() }
    }

    pub fn flag_cleared(set_marker: impl Into<String>, clear_marker: impl Into<String>) -> Self {
        Self::FlagCleared {
            set_marker: set_marker.into(),
            clear_marker: clear_marker.into(),
        }
    }

    pub fn first_match(candidates: Vec<ReadinessCondition>) -> Self {
        Self::FirstMatch { candidates }
    }

    pub fn delay(ms: u64) -> Self {
        Self::Delay { ms }
    }

    /// False only for fixed delays
    pub fn is_observable(&self) -> bool {
        match self {
            Self::Delay { .. } => false,
            Self::FirstMatch { candidates } => candidates.iter().any(|c| c.is_observable()),
            _ => true,
        }
    }
}

impl std::fmt::Display for ReadinessCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Visible { selector } => write!(f, "visible({})", selector),
            Self::Hidden { selector } => write!(f, "hidden({})", selector),
            Self::NetworkIdle { idle_ms } => write!(f, "network-idle({}ms)", idle_ms),
            Self::Delay { ms } => write!(f, "delay({}ms)", ms),
            Self::OptionCountAbove { selector, min } => write!(f, "options({}) > {}", selector, min),
            Self::ValueNonEmpty { selector } => write!(f, "value({}) non-empty", selector),
            Self::ValueEquals { selector, value } => write!(f, "value({}) == '{}'", selector, value),
            Self::TextContains { selector, text } => write!(f, "text({}) contains '{}'", selector, text),
            Self::ConsoleContains { text } => write!(f, "console contains '{}'", text),
            Self::FlagCleared { set_marker, .. } => write!(f, "flag '{}' cleared", set_marker),
            Self::FirstMatch { candidates } => {
                let parts: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
                write!(f, "first-match[{}]", parts.join(" | "))
            }
        }
    }
}

/// Outcome of a satisfied wait
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub elapsed: Duration,
    /// Index of the matching candidate for `FirstMatch`
    pub matched: Option<usize>,
}

/// Polls readiness conditions with a bounded per-condition timeout
#[derive(Debug)]
pub struct ReadinessProber {
    timeout: Duration,
    poll_interval: Duration,
    last_attempted: Mutex<Option<String>>,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(crate::config::DEFAULT_CONDITION_TIMEOUT_MS),
            Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
        )
    }
}

impl ReadinessProber {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            last_attempted: Mutex::new(None),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.condition_timeout(), config.poll_interval())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Description of the most recent condition waited on
    pub fn last_attempted(&self) -> Option<String> {
        self.last_attempted.lock().clone()
    }

    /// Navigate, then wait for each condition in order
    pub async fn goto_and_wait(
        &self,
        page: &dyn Page,
        url: &str,
        readiness: &[ReadinessCondition],
    ) -> E2eResult<Vec<WaitOutcome>> {
        debug!("[{}] goto {}", page.label(), url);
        page.goto(url).await?;

        let mut outcomes = Vec::with_capacity(readiness.len());
        for condition in readiness {
            outcomes.push(self.wait_for(page, condition).await?);
        }
        Ok(outcomes)
    }

    /// Wait for one condition using the prober's timeout
    pub async fn wait_for(&self, page: &dyn Page, condition: &ReadinessCondition) -> E2eResult<WaitOutcome> {
        self.wait_for_within(page, condition, self.timeout).await
    }

    /// Wait for one condition with an explicit timeout
    pub async fn wait_for_within(
        &self,
        page: &dyn Page,
        condition: &ReadinessCondition,
        timeout: Duration,
    ) -> E2eResult<WaitOutcome> {
        *self.last_attempted.lock() = Some(condition.to_string());
        let start = Instant::now();

        if let ReadinessCondition::Delay { ms } = condition {
            debug!("[{}] fixed delay of {} ms", page.label(), ms);
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            return Ok(WaitOutcome {
                elapsed: start.elapsed(),
                matched: None,
            });
        }

        let deadline = start + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // A hung driver call must not outlive the condition's deadline
            let evaluated = match tokio::time::timeout(remaining, matching(page, condition, Some(start))).await {
                Ok(result) => result?,
                Err(_) => None,
            };

            if let Some(matched) = evaluated {
                let elapsed = start.elapsed();
                debug!("[{}] {} satisfied after {:?}", page.label(), condition, elapsed);
                return Ok(WaitOutcome { elapsed, matched });
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!("[{}] {} not satisfied after {} ms", page.label(), condition, elapsed_ms);
                return Err(E2eError::ReadinessTimeout {
                    condition: condition.to_string(),
                    elapsed_ms,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Evaluate once without waiting
    pub async fn check(&self, page: &dyn Page, condition: &ReadinessCondition) -> E2eResult<bool> {
        Ok(matching(page, condition, None).await?.is_some())
    }
}

/// `Some(candidate index)` when satisfied. Non-`FirstMatch` conditions
/// report `Some(None)`.
///
/// `started` is when the wait began; a `Delay` holds once that much time has
/// passed, so as a `FirstMatch` candidate it is a timed fallback. One-off
/// checks pass `None` and treat delays as satisfied.
async fn matching(
    page: &dyn Page,
    condition: &ReadinessCondition,
    started: Option<Instant>,
) -> E2eResult<Option<Option<usize>>> {
    if let ReadinessCondition::FirstMatch { candidates } = condition {
        for (index, candidate) in candidates.iter().enumerate() {
            if evaluate(page, candidate, started).await? {
                return Ok(Some(Some(index)));
            }
        }
        return Ok(None);
    }

    Ok(evaluate(page, condition, started).await?.then_some(None))
}

fn evaluate<'a>(
    page: &'a dyn Page,
    condition: &'a ReadinessCondition,
    started: Option<Instant>,
) -> futures::future::BoxFuture<'a, E2eResult<bool>> {
    Box::pin(async move {
        let satisfied = match condition {
            ReadinessCondition::Visible { selector } => page.is_visible(selector).await?,
            ReadinessCondition::Hidden { selector } => !page.is_visible(selector).await?,
            ReadinessCondition::NetworkIdle { idle_ms } => page
                .network_state()
                .is_idle_for(Duration::from_millis(*idle_ms), Instant::now()),
            ReadinessCondition::Delay { ms } => started
                .map(|s| s.elapsed() >= Duration::from_millis(*ms))
                .unwrap_or(true),
            ReadinessCondition::OptionCountAbove { selector, min } => page.option_count(selector).await? > *min,
            ReadinessCondition::ValueNonEmpty { selector } => page
                .input_value(selector)
                .await?
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false),
            ReadinessCondition::ValueEquals { selector, value } => {
                page.input_value(selector).await?.as_deref() == Some(value.as_str())
            }
            ReadinessCondition::TextContains { selector, text } => page
                .text_contents(selector)
                .await?
                .iter()
                .any(|t| t.contains(text.as_str())),
            ReadinessCondition::ConsoleContains { text } => {
                page.console_messages().iter().any(|m| m.contains(text.as_str()))
            }
            ReadinessCondition::FlagCleared { set_marker, clear_marker } => {
                flag_cleared(&page.console_messages(), set_marker, clear_marker)
            }
            ReadinessCondition::FirstMatch { candidates } => {
                for candidate in candidates {
                    if evaluate(page, candidate, started).await? {
                        return Ok(true);
                    }
                }
                false
            }
        };
        Ok(satisfied)
    })
}

fn flag_cleared(messages: &[String], set_marker: &str, clear_marker: &str) -> bool {
    messages
        .iter()
        .rev()
        .find_map(|m| {
            if m.contains(clear_marker) {
                Some(true)
            } else if m.contains(set_marker) {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(true)
}
