//! NOOR Canvas E2E Test Harness
//!
//! This crate orchestrates end-to-end scenarios against the Canvas web
//! application:
//! - Provisions unique host/user token pairs per scenario
//! - Waits on observable page signals instead of fixed sleeps
//! - Waits through dependent dropdown cascades in order
//! - Captures requests, responses and console messages around actions
//! - Drives several identities at once and checks they see each other
//! - Records soft and hard checks, failure artifacts and a JSON report
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Test Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── TokenFixtureProvider -> TokenPair                    │
//! │    ├── Browser::new_page() -> Page (one context each)       │
//! │    ├── StepExecutor::run_all(steps)                         │
//! │    │     ├── ReadinessProber   (navigate, wait)             │
//! │    │     ├── CascadeWaiter     (cascade, select_cascade)    │
//! │    │     └── CaptureHandle     (start_capture, expect)      │
//! │    ├── MultiActorSynchronizer -> [ActorOutcome]             │
//! │    └── ScenarioRecorder -> ReportSink -> Report              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Page drivers                                               │
//! │    ├── PlaywrightBrowser (Node bridge, JSON lines)          │
//! │    └── FakeBrowser       (scripted, in memory)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod actors;
pub mod api;
pub mod capture;
pub mod cascade;
pub mod config;
pub mod error;
pub mod health;
pub mod page;
pub mod playwright;
pub mod readiness;
pub mod report;
pub mod runner;
pub mod spec;
pub mod steps;
pub mod testing;
pub mod token;

pub use actors::{ActorIdentity, ActorOutcome, ActorScript, LaunchMode, MultiActorSynchronizer};
pub use capture::{capture_during, start_capture, CapturedEvents, EventFilter};
pub use cascade::{Cascade, CascadeStep, CascadeWaiter};
pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use page::{Browser, CapturedEvent, EventKind, Page};
pub use readiness::{ReadinessCondition, ReadinessProber};
pub use report::{Report, ReportSink, ScenarioRecorder, ScenarioResult, ScenarioStatus};
pub use runner::TestRunner;
pub use spec::{Scenario, ScenarioStep};
pub use token::{TokenFixtureProvider, TokenPair};
