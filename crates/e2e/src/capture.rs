//! Event and response interception
//!
//! A capture subscribes to the page's event stream when it is started, so the
//! listener exists before the action that triggers the traffic runs. Events
//! are buffered in an unbounded channel and filtered when the capture stops.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::page::{CapturedEvent, EventKind, Page};

type Predicate = Arc<dyn Fn(&CapturedEvent) -> bool + Send + Sync>;

/// Selects which events a capture keeps
#[derive(Clone, Default)]
pub struct EventFilter {
    kinds: Vec<EventKind>,
    contains: Option<String>,
    pattern: Option<Regex>,
    predicate: Option<Predicate>,
    description: Option<String>,
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventFilter({})", self.describe())
    }
}

impl EventFilter {
    /// Matches every event
    pub fn all() -> Self {
        Self::default()
    }

    pub fn requests() -> Self {
        Self::default().kind(EventKind::Request)
    }

    pub fn responses() -> Self {
        Self::default().kind(EventKind::Response)
    }

    pub fn console() -> Self {
        Self::default().kind(EventKind::Console)
    }

    /// Add an accepted kind; no kinds means any kind
    pub fn kind(mut self, kind: EventKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    /// URL or message text contains `needle`
    pub fn containing(mut self, needle: impl Into<String>) -> Self {
        self.contains = Some(needle.into());
        self
    }

    /// URL or message text matches a regex
    pub fn matching(mut self, pattern: &str) -> E2eResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| E2eError::SpecParse(format!("invalid capture pattern '{}': {}", pattern, e)))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    pub fn with_predicate<F>(mut self, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&CapturedEvent) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self.description = Some(description.into());
        self
    }

    pub fn accepts(&self, event: &CapturedEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(needle) = &self.contains {
            if !event.target.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&event.target) {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }

    /// Human-readable summary used in errors and logs
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.kinds.is_empty() {
            let kinds: Vec<String> = self.kinds.iter().map(|k| k.to_string()).collect();
            parts.push(kinds.join("|"));
        }
        if let Some(needle) = &self.contains {
            parts.push(format!("containing '{}'", needle));
        }
        if let Some(pattern) = &self.pattern {
            parts.push(format!("matching /{}/", pattern.as_str()));
        }
        if let Some(description) = &self.description {
            parts.push(description.clone());
        }
        if parts.is_empty() {
            "all events".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Serialisable form of a filter, used by scenario files
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub kinds: Vec<EventKind>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl FilterSpec {
    pub fn build(&self) -> E2eResult<EventFilter> {
        let mut filter = EventFilter::all();
        for kind in &self.kinds {
            filter = filter.kind(*kind);
        }
        if let Some(needle) = &self.contains {
            filter = filter.containing(needle.clone());
        }
        if let Some(pattern) = &self.pattern {
            filter = filter.matching(pattern)?;
        }
        Ok(filter)
    }
}

/// A running capture
pub struct CaptureHandle {
    rx: mpsc::UnboundedReceiver<CapturedEvent>,
    filter: EventFilter,
    label: String,
}

/// Register a listener on `page` immediately
pub fn start_capture(page: &dyn Page, filter: EventFilter) -> CaptureHandle {
    debug!("[{}] capture started for {}", page.label(), filter.describe());
    CaptureHandle {
        rx: page.subscribe(),
        filter,
        label: page.label().to_string(),
    }
}

impl CaptureHandle {
    /// Stop listening and return the matching events in arrival order
    pub fn stop(mut self) -> CapturedEvents {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            if self.filter.accepts(&event) {
                events.push(event);
            }
        }
        self.rx.close();
        debug!(
            "[{}] capture stopped with {} event(s) for {}",
            self.label,
            events.len(),
            self.filter.describe()
        );
        CapturedEvents {
            events,
            filter: self.filter.describe(),
        }
    }
}

/// Register, run `action`, then stop
pub async fn capture_during<F, Fut, T>(
    page: &dyn Page,
    filter: EventFilter,
    action: F,
) -> E2eResult<(T, CapturedEvents)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    let handle = start_capture(page, filter);
    let value = action().await?;
    Ok((value, handle.stop()))
}

/// Events collected by a stopped capture
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvents {
    events: Vec<CapturedEvent>,
    filter: String,
}

impl CapturedEvents {
    pub fn events(&self) -> &[CapturedEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<CapturedEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Did any event whose target contains `needle` happen
    pub fn any(&self, needle: &str) -> bool {
        self.events.iter().any(|e| e.target.contains(needle))
    }

    /// How many events have a target containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.events.iter().filter(|e| e.target.contains(needle)).count()
    }

    pub fn first(&self, needle: &str) -> Option<&CapturedEvent> {
        self.events.iter().find(|e| e.target.contains(needle))
    }

    /// The first event matching `earlier` precedes the first matching `later`.
    /// False if either never happened.
    pub fn happened_before(&self, earlier: &str, later: &str) -> bool {
        match (self.first(earlier), self.first(later)) {
            (Some(a), Some(b)) => a.seq < b.seq,
            _ => false,
        }
    }

    /// Fail with `CaptureEmpty` unless at least `min` events were captured
    pub fn expect_at_least(&self, min: usize) -> E2eResult<&Self> {
        if self.events.len() < min {
            return Err(E2eError::CaptureEmpty {
                filter: self.filter.clone(),
                expected: min,
            });
        }
        Ok(self)
    }
}
