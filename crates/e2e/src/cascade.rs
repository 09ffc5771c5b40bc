//! Cascading-state waits
//!
//! Dependent controls populate one after another: choosing an album fetches
//! categories, choosing a category fetches sessions. Each link is polled on
//! its own observable signal, and a link that never resolves is reported by
//! index instead of as one aggregate timeout.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::page::Page;
use crate::readiness::{ReadinessCondition, ReadinessProber};

/// Console markers the host panel logs while it applies default selections
pub const DEFAULT_VALUES_SET_MARKER: &str = "IsSettingDefaultValues=true";
pub const DEFAULT_VALUES_CLEAR_MARKER: &str = "IsSettingDefaultValues=false";

/// One link in a dependent chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStep {
    pub name: String,

    /// Observable signal for this link; `None` falls back to the fixed
    /// inter-step delay
    #[serde(default)]
    pub condition: Option<ReadinessCondition>,

    /// Page-owned in-flight guard that must hold before the link counts as
    /// settled
    #[serde(default)]
    pub settled_when: Option<ReadinessCondition>,

    /// Overrides the prober's per-condition timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CascadeStep {
    pub fn new(name: impl Into<String>, condition: ReadinessCondition) -> Self {
        Self {
            name: name.into(),
            condition: Some(condition),
            settled_when: None,
            timeout_ms: None,
        }
    }

    /// A link with nothing to observe
    pub fn unobservable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            settled_when: None,
            timeout_ms: None,
        }
    }

    pub fn settled_when(mut self, guard: ReadinessCondition) -> Self {
        self.settled_when = Some(guard);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// An ordered chain of dependent steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cascade {
    pub steps: Vec<CascadeStep>,
}

impl Cascade {
    pub fn new(steps: Vec<CascadeStep>) -> Self {
        Self { steps }
    }

    /// Chain of selects where each level populates from its parent's value.
    ///
    /// For every level the parent's value is confirmed non-empty before the
    /// child's option count is evaluated.
    pub fn dependent_selects(levels: &[(&str, &str)]) -> Self {
        let mut steps = Vec::new();
        for (index, (name, selector)) in levels.iter().enumerate() {
            if index > 0 {
                let (parent_name, parent_selector) = levels[index - 1];
                steps.push(CascadeStep::new(
                    format!("{} selected", parent_name),
                    ReadinessCondition::value_non_empty(parent_selector),
                ));
            }
            steps.push(CascadeStep::new(
                format!("{} populated", name),
                ReadinessCondition::populated(*selector),
            ));
        }
        Self { steps }
    }

    /// Guard every step on the page's default-values flag
    pub fn guarded_by_default_values_flag(mut self) -> Self {
        for step in &mut self.steps {
            step.settled_when = Some(ReadinessCondition::flag_cleared(
                DEFAULT_VALUES_SET_MARKER,
                DEFAULT_VALUES_CLEAR_MARKER,
            ));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One level of a dependent select chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectLevel {
    pub name: String,
    pub selector: String,
    /// Value to choose once populated; `None` only waits
    #[serde(default)]
    pub value: Option<String>,
}

/// Timing of a resolved link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: usize,
    pub name: String,
    pub elapsed_ms: u64,
    /// True when the link had no signal and the fixed delay was used
    pub fell_back_to_delay: bool,
}

/// Waits for cascades using a readiness prober
pub struct CascadeWaiter<'a> {
    prober: &'a ReadinessProber,
}

impl<'a> CascadeWaiter<'a> {
    pub fn new(prober: &'a ReadinessProber) -> Self {
        Self { prober }
    }

    /// Resolve each step in order
    pub async fn wait_for_cascade(
        &self,
        page: &dyn Page,
        cascade: &Cascade,
        inter_step_delay: Duration,
    ) -> E2eResult<Vec<StepTiming>> {
        info!("[{}] waiting for {}-step cascade", page.label(), cascade.len());
        self.resolve(page, &cascade.steps, 0, inter_step_delay).await
    }

    /// Walk a chain of dependent selects, choosing each level's value once its
    /// options have populated. Step indices in errors and timings refer to
    /// [`Cascade::dependent_selects`] over the same levels.
    pub async fn select_through(
        &self,
        page: &dyn Page,
        levels: &[SelectLevel],
        inter_step_delay: Duration,
        guard_default_values: bool,
    ) -> E2eResult<Vec<StepTiming>> {
        let pairs: Vec<(&str, &str)> = levels
            .iter()
            .map(|l| (l.name.as_str(), l.selector.as_str()))
            .collect();
        let mut cascade = Cascade::dependent_selects(&pairs);
        if guard_default_values {
            cascade = cascade.guarded_by_default_values_flag();
        }
        info!("[{}] selecting through {} level(s)", page.label(), levels.len());

        let mut timings = Vec::with_capacity(cascade.len());
        let mut offset = 0;
        for (index, level) in levels.iter().enumerate() {
            // Level 0 has only its own "populated" link; later levels first
            // confirm the parent selection.
            let links = if index == 0 { 1 } else { 2 };
            let chunk = &cascade.steps[offset..offset + links];
            timings.extend(self.resolve(page, chunk, offset, inter_step_delay).await?);
            offset += links;

            if let Some(value) = &level.value {
                debug!("[{}] selecting {}={}", page.label(), level.selector, value);
                page.select_option(&level.selector, value).await?;
            }
        }
        Ok(timings)
    }

    async fn resolve(
        &self,
        page: &dyn Page,
        steps: &[CascadeStep],
        base_index: usize,
        inter_step_delay: Duration,
    ) -> E2eResult<Vec<StepTiming>> {
        let mut timings = Vec::with_capacity(steps.len());

        for (offset, step) in steps.iter().enumerate() {
            let index = base_index + offset;
            let start = Instant::now();
            let timeout = step
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.prober.timeout());

            // The guard is waited on first and re-checked after the link
            // resolves: state seen while the page is still applying its own
            // defaults does not count.
            let fell_back = loop {
                if let Some(guard) = &step.settled_when {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    self.prober
                        .wait_for_within(page, guard, remaining)
                        .await
                        .map_err(|e| broken(index, step, guard, e))?;
                }

                let remaining = timeout.saturating_sub(start.elapsed());
                let fell_back = self.link(page, step, index, remaining, inter_step_delay).await?;

                match &step.settled_when {
                    Some(guard) if !self.prober.check(page, guard).await? => {
                        if start.elapsed() >= timeout {
                            return Err(broken_after(index, step, guard, start.elapsed()));
                        }
                        debug!(
                            "[{}] step {} '{}' resolved while {} was not held, waiting again",
                            page.label(),
                            index,
                            step.name,
                            guard
                        );
                    }
                    _ => break fell_back,
                }
            };

            let elapsed_ms = start.elapsed().as_millis() as u64;
            debug!("[{}] step {} '{}' resolved in {} ms", page.label(), index, step.name, elapsed_ms);
            timings.push(StepTiming {
                step: index,
                name: step.name.clone(),
                elapsed_ms,
                fell_back_to_delay: fell_back,
            });
        }

        Ok(timings)
    }

    /// Wait for the link's own signal. Returns true when it fell back to a
    /// fixed delay.
    async fn link(
        &self,
        page: &dyn Page,
        step: &CascadeStep,
        index: usize,
        timeout: Duration,
        inter_step_delay: Duration,
    ) -> E2eResult<bool> {
        match &step.condition {
            Some(condition) if condition.is_observable() => {
                self.prober
                    .wait_for_within(page, condition, timeout)
                    .await
                    .map_err(|e| broken(index, step, condition, e))?;
                Ok(false)
            }
            Some(fixed) => {
                debug!("[{}] step {} '{}' uses {}", page.label(), index, step.name, fixed);
                self.prober.wait_for_within(page, fixed, timeout).await?;
                Ok(true)
            }
            None => {
                debug!(
                    "[{}] step {} '{}' has no observable signal, sleeping {:?}",
                    page.label(),
                    index,
                    step.name,
                    inter_step_delay
                );
                tokio::time::sleep(inter_step_delay).await;
                Ok(true)
            }
        }
    }
}

fn broken_after(index: usize, step: &CascadeStep, condition: &ReadinessCondition, elapsed: Duration) -> E2eError {
    let elapsed_ms = elapsed.as_millis() as u64;
    warn!("Cascade broke at step {} '{}' after {} ms", index, step.name, elapsed_ms);
    E2eError::CascadeBroken {
        step: index,
        name: step.name.clone(),
        condition: condition.to_string(),
        elapsed_ms,
    }
}

fn broken(index: usize, step: &CascadeStep, condition: &ReadinessCondition, err: E2eError) -> E2eError {
    match err {
        E2eError::ReadinessTimeout { elapsed_ms, .. } => {
            warn!("Cascade broke at step {} '{}' after {} ms", index, step.name, elapsed_ms);
            E2eError::CascadeBroken {
                step: index,
                name: step.name.clone(),
                condition: condition.to_string(),
                elapsed_ms,
            }
        }
        other => other,
    }
}
