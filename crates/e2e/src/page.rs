//! Browser driver seam
//!
//! Every harness component talks to the browser through [`Page`] and
//! [`Browser`]. Conditions and captures never depend on a concrete driver,
//! so the same waits run against Playwright or the in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::E2eResult;

/// Kind of an observed page event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Request,
    Response,
    Console,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Request => write!(f, "request"),
            EventKind::Response => write!(f, "response"),
            EventKind::Console => write!(f, "console"),
        }
    }
}

/// A network request, response or console message seen on a page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedEvent {
    /// Per-page monotonic sequence number
    pub seq: u64,
    pub kind: EventKind,
    /// URL for network events, message text for console events
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// In-flight request accounting used by network-idle readiness
#[derive(Debug, Clone, Copy)]
pub struct NetworkState {
    pub in_flight: usize,
    pub last_activity: Option<Instant>,
}

impl NetworkState {
    /// Idle when nothing is in flight and nothing happened for `quiet`
    pub fn is_idle_for(&self, quiet: std::time::Duration, now: Instant) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        match self.last_activity {
            Some(at) => now.saturating_duration_since(at) >= quiet,
            None => true,
        }
    }
}

/// Options for a new isolated browser context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Label used in logs and as the User-Agent suffix
    pub label: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl ContextOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            extra_headers: HashMap::new(),
        }
    }
}

/// A single page in its own browser context
///
/// Query methods must not change page state: readiness re-evaluation relies
/// on them being side-effect free.
#[async_trait]
pub trait Page: Send + Sync {
    /// Label of the owning context
    fn label(&self) -> &str;

    async fn goto(&self, url: &str) -> E2eResult<()>;

    async fn is_visible(&self, selector: &str) -> E2eResult<bool>;

    /// Current value of an input or select, `None` when the element is absent
    async fn input_value(&self, selector: &str) -> E2eResult<Option<String>>;

    /// Number of `<option>` children of a select
    async fn option_count(&self, selector: &str) -> E2eResult<usize>;

    /// Text content of every element matching the selector
    async fn text_contents(&self, selector: &str) -> E2eResult<Vec<String>>;

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn click(&self, selector: &str) -> E2eResult<()>;

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()>;

    /// Dispatch a DOM event (e.g. `input`, `change`) on the element
    async fn dispatch_event(&self, selector: &str, event: &str) -> E2eResult<()>;

    async fn screenshot(&self, path: &Path) -> E2eResult<()>;

    /// Serialized DOM for failure snapshots
    async fn content(&self) -> E2eResult<String>;

    /// Register an event listener. Every event emitted after this call is
    /// delivered; the channel is unbounded.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<CapturedEvent>;

    /// All console messages seen since the page opened
    fn console_messages(&self) -> Vec<String>;

    fn network_state(&self) -> NetworkState;

    async fn close(&self) -> E2eResult<()>;
}

/// Factory for isolated pages
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self, options: ContextOptions) -> E2eResult<Box<dyn Page>>;
}

/// Fan-out of page events to subscribers, with network and console
/// bookkeeping. Shared by the drivers.
#[derive(Default)]
pub struct EventHub {
    seq: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CapturedEvent>>>,
    console: Mutex<Vec<String>>,
    network: Mutex<(usize, Option<Instant>)>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CapturedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Record an event and deliver it to live subscribers
    pub fn emit(&self, kind: EventKind, target: impl Into<String>, payload: serde_json::Value) {
        let event = CapturedEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            kind,
            target: target.into(),
            timestamp: Utc::now(),
            payload,
        };

        match kind {
            EventKind::Request => {
                let mut network = self.network.lock();
                network.0 += 1;
                network.1 = Some(Instant::now());
            }
            EventKind::Response => {
                let mut network = self.network.lock();
                network.0 = network.0.saturating_sub(1);
                network.1 = Some(Instant::now());
            }
            EventKind::Console => self.console.lock().push(event.target.clone()),
        }

        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn console_messages(&self) -> Vec<String> {
        self.console.lock().clone()
    }

    pub fn network_state(&self) -> NetworkState {
        let (in_flight, last_activity) = *self.network.lock();
        NetworkState {
            in_flight,
            last_activity,
        }
    }
}
