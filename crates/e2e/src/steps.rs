//! Executes scenario steps against a page

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{start_capture, CaptureHandle, CapturedEvents};
use crate::cascade::{Cascade, CascadeWaiter};
use crate::error::{E2eError, E2eResult};
use crate::page::Page;
use crate::readiness::{ReadinessCondition, ReadinessProber};
use crate::report::ScenarioRecorder;
use crate::spec::ScenarioStep;

/// `{key}` placeholders available to step strings
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Replace every known `{key}`; unknown placeholders are left as-is
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.values {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }

    /// Names of `{placeholder}`s in `text` that no variable covers
    pub fn unresolved(&self, text: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else { break };
            let name = &after[..close];
            let is_ident = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if is_ident && !self.values.contains_key(name) {
                names.push(name.to_string());
            }
            rest = &after[close + 1..];
        }
        names
    }

    fn render_condition(&self, condition: &ReadinessCondition) -> ReadinessCondition {
        // Round-trip through JSON so every string field gets rendered
        let rendered = serde_json::to_value(condition)
            .and_then(|value| serde_json::from_value::<ReadinessCondition>(self.render_json(value)));
        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("condition {} left unrendered: {}", condition, e);
                condition.clone()
            }
        };
        let missing = self.unresolved(&rendered.to_string());
        if !missing.is_empty() {
            warn!("condition {} has unresolved placeholder(s): {}", rendered, missing.join(", "));
        }
        rendered
    }

    fn render_json(&self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.render(&s)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.render_json(v)).collect()),
            Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, self.render_json(v))).collect()),
            other => other,
        }
    }
}

/// Clear, fill, then dispatch `input` and `change` so framework bindings
/// pick up the value
pub async fn fill_blazor_input(page: &dyn Page, selector: &str, value: &str) -> E2eResult<()> {
    page.fill(selector, "").await?;
    page.fill(selector, value).await?;
    page.dispatch_event(selector, "input").await?;
    page.dispatch_event(selector, "change").await?;
    Ok(())
}

/// Runs steps in source order against one page
pub struct StepExecutor<'a> {
    page: &'a dyn Page,
    prober: &'a ReadinessProber,
    vars: Variables,
    base_url: String,
    recorder: Option<&'a mut ScenarioRecorder>,
    screenshot_dir: PathBuf,
    captures: HashMap<String, CaptureHandle>,
    soft_notes: Vec<String>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(page: &'a dyn Page, prober: &'a ReadinessProber, base_url: &str, vars: Variables) -> Self {
        Self {
            page,
            prober,
            vars,
            base_url: base_url.trim_end_matches('/').to_string(),
            recorder: None,
            screenshot_dir: std::env::temp_dir(),
            captures: HashMap::new(),
            soft_notes: Vec::new(),
        }
    }

    /// Route soft checks and screenshots to a scenario recorder
    pub fn with_recorder(mut self, recorder: &'a mut ScenarioRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Where screenshots go when no recorder is attached
    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    /// Soft notes collected without a recorder
    pub fn soft_notes(&self) -> &[String] {
        &self.soft_notes
    }

    pub fn into_soft_notes(self) -> Vec<String> {
        self.soft_notes
    }

    fn url(&self, url: &str) -> String {
        let url = self.vars.render(url);
        if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn soft(&mut self, description: &str, ok: bool) {
        match self.recorder.as_deref_mut() {
            Some(recorder) => {
                recorder.soft_check(description, ok);
            }
            None if !ok => {
                warn!("[{}] soft check failed: {}", self.page.label(), description);
                self.soft_notes.push(description.to_string());
            }
            None => {}
        }
    }

    /// Run every step, stopping at the first error
    pub async fn run_all(&mut self, steps: &[ScenarioStep]) -> E2eResult<()> {
        for (index, step) in steps.iter().enumerate() {
            debug!("[{}] step {}: {:?}", self.page.label(), index, step);
            self.execute(step).await?;
        }
        Ok(())
    }

    pub async fn execute(&mut self, step: &ScenarioStep) -> E2eResult<()> {
        let page = self.page;
        match step {
            ScenarioStep::Navigate { url, ready } => {
                let ready: Vec<ReadinessCondition> = ready.iter().map(|c| self.vars.render_condition(c)).collect();
                self.prober.goto_and_wait(page, &self.url(url), &ready).await?;
            }

            ScenarioStep::Click { selector } => {
                page.click(&self.vars.render(selector)).await?;
            }

            ScenarioStep::ClickFirst { candidates } => {
                let conditions = candidates
                    .iter()
                    .map(|c| ReadinessCondition::visible(self.vars.render(c)))
                    .collect();
                let outcome = self
                    .prober
                    .wait_for(page, &ReadinessCondition::first_match(conditions))
                    .await?;
                let index = outcome.matched.unwrap_or(0);
                let selector = self.vars.render(&candidates[index]);
                debug!("[{}] clicking candidate {} ({})", page.label(), index, selector);
                page.click(&selector).await?;
            }

            ScenarioStep::Fill { selector, value, blazor } => {
                let selector = self.vars.render(selector);
                let value = self.vars.render(value);
                if *blazor {
                    fill_blazor_input(page, &selector, &value).await?;
                } else {
                    page.fill(&selector, &value).await?;
                }
            }

            ScenarioStep::Select { selector, value } => {
                page.select_option(&self.vars.render(selector), &self.vars.render(value))
                    .await?;
            }

            ScenarioStep::Wait { condition, timeout_ms } => {
                let condition = self.vars.render_condition(condition);
                let timeout = timeout_ms.map(Duration::from_millis).unwrap_or_else(|| self.prober.timeout());
                self.prober.wait_for_within(page, &condition, timeout).await?;
            }

            ScenarioStep::Cascade {
                steps,
                inter_step_delay_ms,
            } => {
                CascadeWaiter::new(self.prober)
                    .wait_for_cascade(page, &Cascade::new(steps.clone()), Duration::from_millis(*inter_step_delay_ms))
                    .await?;
            }

            ScenarioStep::SelectCascade {
                levels,
                inter_step_delay_ms,
                guard_default_values,
            } => {
                let mut levels = levels.clone();
                for level in &mut levels {
                    level.value = level.value.as_ref().map(|v| self.vars.render(v));
                }
                CascadeWaiter::new(self.prober)
                    .select_through(
                        page,
                        &levels,
                        Duration::from_millis(*inter_step_delay_ms),
                        *guard_default_values,
                    )
                    .await?;
            }

            ScenarioStep::Sleep { ms } => {
                debug!("[{}] sleeping {} ms", page.label(), ms);
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }

            ScenarioStep::Assert {
                selector,
                visible,
                text_contains,
                count,
                soft,
            } => {
                let selector = self.vars.render(selector);
                let mut problems = Vec::new();

                if let Some(expected) = visible {
                    let actual = page.is_visible(&selector).await?;
                    if actual != *expected {
                        problems.push(format!("{} visible={} (expected {})", selector, actual, expected));
                    }
                }
                if text_contains.is_some() || count.is_some() {
                    let texts = page.text_contents(&selector).await?;
                    if let Some(needle) = text_contains {
                        let needle = self.vars.render(needle);
                        if !texts.iter().any(|t| t.contains(&needle)) {
                            problems.push(format!("{} has no text containing '{}'", selector, needle));
                        }
                    }
                    if let Some(expected) = count {
                        if texts.len() != *expected {
                            problems.push(format!("{} matched {} element(s) (expected {})", selector, texts.len(), expected));
                        }
                    }
                }

                if !problems.is_empty() {
                    let description = problems.join("; ");
                    if *soft {
                        self.soft(&description, false);
                    } else {
                        return Err(E2eError::AssertionFailed(description));
                    }
                }
            }

            ScenarioStep::Screenshot { name } => {
                let file = format!("{}.png", self.vars.render(name));
                match self.recorder.as_deref_mut() {
                    Some(recorder) => {
                        recorder.attach_screenshot(page, &file).await?;
                    }
                    None => {
                        std::fs::create_dir_all(&self.screenshot_dir)?;
                        let path = self.screenshot_dir.join(format!("{}-{}", page.label(), file));
                        page.screenshot(&path).await?;
                    }
                }
            }

            ScenarioStep::StartCapture { name, filter } => {
                let handle = start_capture(page, filter.build()?);
                if self.captures.insert(name.clone(), handle).is_some() {
                    warn!("[{}] capture '{}' restarted", page.label(), name);
                }
            }

            ScenarioStep::ExpectCaptured { name, min_count, soft } => {
                let handle = self
                    .captures
                    .remove(name)
                    .ok_or_else(|| E2eError::SpecParse(format!("capture '{}' was never started", name)))?;
                let events: CapturedEvents = handle.stop();

                if let Some(recorder) = self.recorder.as_deref_mut() {
                    recorder.attach_events(&format!("capture-{}.json", name), &events)?;
                }

                if let Err(e) = events.expect_at_least(*min_count) {
                    if *soft {
                        self.soft(&e.to_string(), false);
                    } else {
                        return Err(e);
                    }
                }
            }

            ScenarioStep::Log { message } => {
                info!("[{}] {}", page.label(), self.vars.render(message));
            }
        }
        Ok(())
    }
}
