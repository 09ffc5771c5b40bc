//! Multi-actor synchronization
//!
//! Drives several identities, each in its own browser context, through a
//! shared script and then checks that every other live actor observes the
//! new identity. Propagation is not instantaneous, so each (observer, peer)
//! pair is polled up to the convergence timeout and reported on its own.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::page::{Browser, ContextOptions, Page};
use crate::readiness::{ReadinessCondition, ReadinessProber};
use crate::spec::ScenarioStep;
use crate::steps::{StepExecutor, Variables};

/// Who an actor is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub name: String,
    pub email: String,
    pub country: String,
    /// Token the actor joins with
    pub token: String,
}

impl ActorIdentity {
    pub fn new(name: &str, email: &str, country: &str, token: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            country: country.to_string(),
            token: token.to_string(),
        }
    }

    fn variables(&self, base: &Variables) -> Variables {
        let mut vars = base.clone();
        vars.set("name", self.name.clone())
            .set("email", self.email.clone())
            .set("country", self.country.clone())
            .set("token", self.token.clone());
        vars
    }
}

/// One actor's script
#[derive(Debug, Clone)]
pub struct ActorScript {
    pub identity: ActorIdentity,
    pub steps: Vec<ScenarioStep>,
}

/// How actors are started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// All actors start at once
    #[default]
    Concurrent,
    /// Each actor completes before the next starts
    Staggered,
}

/// What convergence means for a run
#[derive(Debug, Clone)]
pub struct ConvergenceProbe {
    /// Selector whose text lists the identities an actor can see
    pub observe_selector: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ConvergenceProbe {
    pub fn new(observe_selector: impl Into<String>, timeout: Duration) -> Self {
        Self {
            observe_selector: observe_selector.into(),
            timeout,
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn from_config(observe_selector: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            observe_selector: observe_selector.into(),
            timeout: config.convergence_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Whether `observer` saw `peer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCheck {
    pub observer: String,
    pub peer: String,
    pub converged: bool,
    pub elapsed_ms: u64,
}

/// Result of one actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorOutcome {
    pub actor: String,
    /// Script ran to the end
    pub completed: bool,
    pub error: Option<String>,
    pub soft_notes: Vec<String>,
    pub duration_ms: u64,
    /// How every other live actor fared at observing this one
    pub peer_checks: Vec<PeerCheck>,
}

impl ActorOutcome {
    /// A `ConvergenceTimeout` per pair that never converged
    pub fn failures(&self) -> Vec<E2eError> {
        self.peer_checks
            .iter()
            .filter(|c| !c.converged)
            .map(|c| E2eError::ConvergenceTimeout {
                observer: c.observer.clone(),
                peer: c.peer.clone(),
                elapsed_ms: c.elapsed_ms,
            })
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.completed && self.peer_checks.iter().all(|c| c.converged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorState {
    Waiting,
    Running,
    Done,
    Failed,
}

/// Runs actor scripts and cross-checks their views
pub struct MultiActorSynchronizer<'a> {
    browser: &'a dyn Browser,
    prober: &'a ReadinessProber,
    probe: ConvergenceProbe,
    mode: LaunchMode,
    base_url: String,
    vars: Variables,
    screenshot_dir: PathBuf,
}

impl<'a> MultiActorSynchronizer<'a> {
    pub fn new(browser: &'a dyn Browser, prober: &'a ReadinessProber, probe: ConvergenceProbe) -> Self {
        Self {
            browser,
            prober,
            probe,
            mode: LaunchMode::Concurrent,
            base_url: crate::config::DEFAULT_BASE_URL.to_string(),
            vars: Variables::new(),
            screenshot_dir: std::env::temp_dir(),
        }
    }

    pub fn mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Variables shared by every actor, e.g. `{user_token}`
    pub fn variables(mut self, vars: Variables) -> Self {
        self.vars = vars;
        self
    }

    pub fn screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    /// Run every script, one isolated page per actor. Pages are closed before
    /// returning, whatever happened.
    pub async fn run_concurrent_actors(&self, scripts: Vec<ActorScript>) -> E2eResult<Vec<ActorOutcome>> {
        info!("Running {} actor(s), {:?} launch", scripts.len(), self.mode);

        let mut pages: Vec<Box<dyn Page>> = Vec::with_capacity(scripts.len());
        for script in &scripts {
            match self
                .browser
                .new_page(ContextOptions::labeled(script.identity.name.clone()))
                .await
            {
                Ok(page) => pages.push(page),
                Err(e) => {
                    close_all(&pages).await;
                    return Err(e);
                }
            }
        }

        // Concurrent actors are all live from the start, even before their
        // first step is polled.
        let initial = match self.mode {
            LaunchMode::Concurrent => ActorState::Running,
            LaunchMode::Staggered => ActorState::Waiting,
        };
        let run = ActorRun {
            scripts: &scripts,
            pages: &pages,
            states: Mutex::new(vec![initial; scripts.len()]),
            checks: Mutex::new(Vec::new()),
        };

        let results: Vec<(bool, Option<String>, Vec<String>, u64)> = match self.mode {
            LaunchMode::Concurrent => join_all((0..scripts.len()).map(|i| self.drive(&run, i))).await,
            LaunchMode::Staggered => {
                let mut results = Vec::with_capacity(scripts.len());
                for i in 0..scripts.len() {
                    results.push(self.drive(&run, i).await);
                }
                results
            }
        };

        close_all(&pages).await;

        // An observer whose own script failed is reported through its error
        let states = run.states.into_inner();
        let checks: Vec<PeerCheck> = run
            .checks
            .into_inner()
            .into_iter()
            .filter(|c| {
                scripts
                    .iter()
                    .position(|s| s.identity.name == c.observer)
                    .map(|o| states[o] != ActorState::Failed)
                    .unwrap_or(true)
            })
            .collect();
        let outcomes = scripts
            .iter()
            .zip(results)
            .map(|(script, (completed, error, soft_notes, duration_ms))| ActorOutcome {
                actor: script.identity.name.clone(),
                completed,
                error,
                soft_notes,
                duration_ms,
                peer_checks: checks
                    .iter()
                    .filter(|c| c.peer == script.identity.name)
                    .cloned()
                    .collect(),
            })
            .collect::<Vec<_>>();

        for outcome in &outcomes {
            for failure in outcome.failures() {
                warn!("{}", failure);
            }
        }
        Ok(outcomes)
    }

    /// Run actor `i`'s script, then poll the pairs it completes
    async fn drive(&self, run: &ActorRun<'_>, i: usize) -> (bool, Option<String>, Vec<String>, u64) {
        let script = &run.scripts[i];
        let page = run.pages[i].as_ref();
        let start = Instant::now();
        run.set_state(i, ActorState::Running);

        let mut executor = StepExecutor::new(page, self.prober, &self.base_url, script.identity.variables(&self.vars))
            .with_screenshot_dir(self.screenshot_dir.clone());
        let result = executor.run_all(&script.steps).await;
        let soft_notes = executor.into_soft_notes();
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Err(e) = result {
            error!("[{}] script failed: {}", script.identity.name, e);
            run.set_state(i, ActorState::Failed);
            return (false, Some(e.to_string()), soft_notes, duration_ms);
        }

        run.set_state(i, ActorState::Done);
        debug!("[{}] script completed in {} ms", script.identity.name, duration_ms);

        // Concurrent: every other live actor must see this one. Staggered:
        // earlier actors must see this one, and this one must see them.
        let mut pairs = Vec::new();
        for j in 0..run.scripts.len() {
            if j == i || !run.is_live(j) {
                continue;
            }
            match self.mode {
                LaunchMode::Concurrent => pairs.push((j, i)),
                LaunchMode::Staggered => {
                    if j < i {
                        pairs.push((j, i));
                        pairs.push((i, j));
                    }
                }
            }
        }

        let checks = join_all(pairs.into_iter().map(|(observer, peer)| self.observe(run, observer, peer))).await;
        run.checks.lock().extend(checks);

        (true, None, soft_notes, duration_ms)
    }

    async fn observe(&self, run: &ActorRun<'_>, observer: usize, peer: usize) -> PeerCheck {
        let observer_name = &run.scripts[observer].identity.name;
        let peer_name = &run.scripts[peer].identity.name;
        let condition = ReadinessCondition::text_contains(&self.probe.observe_selector, peer_name.as_str());
        let prober = ReadinessProber::new(self.probe.timeout, self.probe.poll_interval);

        // The observer cannot see anyone until its own script is done, so
        // the convergence clock starts from there.
        loop {
            match run.state(observer) {
                ActorState::Done => break,
                ActorState::Failed => {
                    return PeerCheck {
                        observer: observer_name.clone(),
                        peer: peer_name.clone(),
                        converged: false,
                        elapsed_ms: 0,
                    }
                }
                ActorState::Waiting | ActorState::Running => tokio::time::sleep(self.probe.poll_interval).await,
            }
        }
        let start = Instant::now();

        let converged = match prober
            .wait_for_within(run.pages[observer].as_ref(), &condition, self.probe.timeout)
            .await
        {
            Ok(_) => true,
            Err(E2eError::ReadinessTimeout { .. }) => false,
            Err(e) => {
                warn!("[{}] could not observe '{}': {}", observer_name, peer_name, e);
                false
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            "[{}] {} '{}' after {} ms",
            observer_name,
            if converged { "observed" } else { "never observed" },
            peer_name,
            elapsed_ms
        );
        PeerCheck {
            observer: observer_name.clone(),
            peer: peer_name.clone(),
            converged,
            elapsed_ms,
        }
    }
}

struct ActorRun<'r> {
    scripts: &'r [ActorScript],
    pages: &'r [Box<dyn Page>],
    states: Mutex<Vec<ActorState>>,
    checks: Mutex<Vec<PeerCheck>>,
}

impl ActorRun<'_> {
    fn set_state(&self, i: usize, state: ActorState) {
        self.states.lock()[i] = state;
    }

    fn state(&self, i: usize) -> ActorState {
        self.states.lock()[i]
    }

    /// Started and not failed
    fn is_live(&self, i: usize) -> bool {
        matches!(self.states.lock()[i], ActorState::Running | ActorState::Done)
    }
}

async fn close_all(pages: &[Box<dyn Page>]) {
    for page in pages {
        if let Err(e) = page.close().await {
            warn!("[{}] close failed: {}", page.label(), e);
        }
    }
}
