//! Playwright browser automation
//!
//! A single Node process runs a generated bridge script that owns the
//! browser. Commands go to it as JSON lines on stdin; replies and page events
//! (requests, responses, console messages) come back as JSON lines on
//! stdout. Events are fed into each page's [`EventHub`] as they arrive, so
//! captures see them without any polling.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::page::{Browser, CapturedEvent, ContextOptions, EventHub, EventKind, NetworkState, Page};

/// How long the bridge may take to launch the browser
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Firefox => "firefox",
            BrowserEngine::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserEngine {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserEngine::Chromium),
            "firefox" => Ok(BrowserEngine::Firefox),
            "webkit" | "safari" => Ok(BrowserEngine::Webkit),
            other => Err(E2eError::Driver(format!("unknown browser engine '{}'", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub engine: BrowserEngine,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub ignore_https_errors: bool,
    /// Directory whose `node_modules` provides `playwright`
    pub project_dir: PathBuf,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            engine: BrowserEngine::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            ignore_https_errors: true,
            project_dir: PathBuf::from("."),
        }
    }
}

impl PlaywrightConfig {
    pub fn from_harness(config: &HarnessConfig) -> E2eResult<Self> {
        Ok(Self {
            engine: config.browser.engine.parse()?,
            headless: config.browser.headless,
            viewport_width: config.browser.viewport_width,
            viewport_height: config.browser.viewport_height,
            ignore_https_errors: config.ignore_https_errors,
            ..Default::default()
        })
    }
}

/// Check if Playwright is installed
pub fn check_playwright_installed() -> E2eResult<()> {
    let output = Command::new("npx")
        .args(["playwright", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match output {
        Ok(status) if status.success() => Ok(()),
        _ => Err(E2eError::PlaywrightNotFound),
    }
}

const BRIDGE_TEMPLATE: &str = r#"
const { chromium, firefox, webkit } = require('playwright');
const readline = require('readline');

const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const browser = await __ENGINE__.launch({ headless: __HEADLESS__ });
  const pages = new Map();
  let nextPage = 0;

  const get = (id) => {
    const entry = pages.get(id);
    if (!entry) throw new Error('unknown page ' + id);
    return entry.page;
  };

  const handlers = {
    async newPage({ label, extraHeaders }) {
      const context = await browser.newContext({
        ignoreHTTPSErrors: __IGNORE_HTTPS__,
        viewport: { width: __WIDTH__, height: __HEIGHT__ },
        extraHTTPHeaders: extraHeaders || {},
      });
      const page = await context.newPage();
      const id = 'p' + (++nextPage);
      page.on('request', (r) => send({ event: 'request', page: id, target: r.url(), payload: { method: r.method() } }));
      page.on('response', (r) => send({ event: 'response', page: id, target: r.url(), payload: { status: r.status() } }));
      page.on('requestfailed', (r) => send({ event: 'response', page: id, target: r.url(), payload: { failed: true } }));
      page.on('console', (m) => send({ event: 'console', page: id, target: m.text(), payload: { type: m.type() } }));
      pages.set(id, { context, page, label });
      return id;
    },
    async goto({ page, url }) { await get(page).goto(url); },
    async isVisible({ page, selector }) { return await get(page).locator(selector).first().isVisible(); },
    async inputValue({ page, selector }) {
      const locator = get(page).locator(selector).first();
      if ((await locator.count()) === 0) return null;
      return await locator.inputValue();
    },
    async optionCount({ page, selector }) { return await get(page).locator(selector).first().locator('option').count(); },
    async textContents({ page, selector }) { return await get(page).locator(selector).allTextContents(); },
    async fill({ page, selector, value }) { await get(page).fill(selector, value); },
    async click({ page, selector }) { await get(page).click(selector); },
    async selectOption({ page, selector, value }) { await get(page).selectOption(selector, value); },
    async dispatchEvent({ page, selector, event }) { await get(page).dispatchEvent(selector, event); },
    async screenshot({ page, path }) { await get(page).screenshot({ path, fullPage: true }); },
    async content({ page }) { return await get(page).content(); },
    async closePage({ page }) {
      const entry = pages.get(page);
      if (entry) {
        pages.delete(page);
        await entry.context.close();
      }
    },
    async shutdown() {
      await browser.close();
      process.exit(0);
    },
  };

  const rl = readline.createInterface({ input: process.stdin });
  rl.on('line', async (line) => {
    let msg;
    try { msg = JSON.parse(line); } catch (e) { return; }
    try {
      const handler = handlers[msg.cmd];
      if (!handler) throw new Error('unknown command ' + msg.cmd);
      const result = await handler(msg.args || {});
      send({ id: msg.id, ok: true, result: result === undefined ? null : result });
    } catch (e) {
      send({ id: msg.id, ok: false, error: String((e && e.message) || e) });
    }
  });
  rl.on('close', async () => {
    await browser.close();
    process.exit(0);
  });

  send({ event: 'ready' });
})().catch((e) => {
  console.error(e);
  process.exit(1);
});
"#;

/// Generate the bridge script for a configuration
pub fn build_bridge_script(config: &PlaywrightConfig) -> String {
    BRIDGE_TEMPLATE
        .replace("__ENGINE__", config.engine.as_str())
        .replace("__HEADLESS__", &config.headless.to_string())
        .replace("__IGNORE_HTTPS__", &config.ignore_https_errors.to_string())
        .replace("__WIDTH__", &config.viewport_width.to_string())
        .replace("__HEIGHT__", &config.viewport_height.to_string())
}

/// A line from the bridge: either a reply (`id`) or an event (`event`)
#[derive(Debug, Deserialize)]
struct BridgeMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    page: Option<String>,
    #[serde(default)]
    target: String,
    #[serde(default)]
    payload: Value,
}

type Reply = Result<Value, String>;

/// Connection to the bridge process, shared by the browser and its pages
struct Bridge {
    outbox: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    hubs: Mutex<HashMap<String, Arc<EventHub>>>,
    next_id: AtomicU64,
}

impl Bridge {
    fn send_line(&self, id: u64, cmd: &str, args: Value) -> E2eResult<()> {
        let line = serde_json::to_string(&json!({ "id": id, "cmd": cmd, "args": args }))?;
        self.outbox
            .send(line)
            .map_err(|_| E2eError::Driver("playwright bridge is not running".to_string()))
    }

    /// Send a command without waiting for its reply
    fn post(&self, cmd: &str, args: Value) -> E2eResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.send_line(id, cmd, args)
    }

    async fn call(&self, cmd: &str, args: Value) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast reply cannot be missed
        self.pending.lock().insert(id, tx);
        if let Err(e) = self.send_line(id, cmd, args) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(E2eError::Driver(format!("{}: {}", cmd, message))),
            Err(_) => Err(E2eError::Driver("playwright bridge exited".to_string())),
        }
    }

    fn dispatch(&self, message: BridgeMessage) {
        if let Some(id) = message.id {
            let reply = if message.ok {
                Ok(message.result)
            } else {
                Err(message.error.unwrap_or_else(|| "unknown error".to_string()))
            };
            if let Some(tx) = self.pending.lock().remove(&id) {
                let _ = tx.send(reply);
            }
            return;
        }

        let kind = match message.event.as_deref() {
            Some("request") => EventKind::Request,
            Some("response") => EventKind::Response,
            Some("console") => EventKind::Console,
            _ => return,
        };
        let hub = message.page.and_then(|page| self.hubs.lock().get(&page).cloned());
        if let Some(hub) = hub {
            hub.emit(kind, message.target, message.payload);
        }
    }
}

/// Browser backed by a Playwright bridge process
pub struct PlaywrightBrowser {
    bridge: Arc<Bridge>,
    child: tokio::sync::Mutex<Child>,
    _script_dir: tempfile::TempDir,
}

impl PlaywrightBrowser {
    /// Start the bridge and wait until the browser is launched
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        check_playwright_installed()?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, build_bridge_script(&config))?;
        debug!("Playwright bridge script: {}", script_path.display());

        let node_modules = std::fs::canonicalize(&config.project_dir)
            .unwrap_or_else(|_| config.project_dir.clone())
            .join("node_modules");

        let mut child = TokioCommand::new("node")
            .arg(&script_path)
            .current_dir(&config.project_dir)
            .env("NODE_PATH", node_modules)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let (outbox, mut outgoing) = mpsc::unbounded_channel::<String>();
        let bridge = Arc::new(Bridge {
            outbox,
            pending: Mutex::new(HashMap::new()),
            hubs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outgoing.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let reader_bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<BridgeMessage>(&line) {
                    Ok(message) if message.event.as_deref() == Some("ready") => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(message) => reader_bridge.dispatch(message),
                    Err(_) => debug!("[bridge] {}", line),
                }
            }
            // Fail every outstanding call
            reader_bridge.pending.lock().clear();
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[bridge] {}", line);
                }
            });
        }

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                let _ = child.kill().await;
                return Err(E2eError::Driver(format!(
                    "{} did not start within {:?}",
                    config.engine.as_str(),
                    READY_TIMEOUT
                )));
            }
        }

        info!("Playwright {} ready (headless: {})", config.engine.as_str(), config.headless);
        Ok(Self {
            bridge,
            child: tokio::sync::Mutex::new(child),
            _script_dir: script_dir,
        })
    }

    /// Close the browser and wait for the bridge to exit
    pub async fn shutdown(&self) -> E2eResult<()> {
        let _ = self.bridge.post("shutdown", Value::Null);
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => {
                debug!("Playwright bridge exited: {:?}", status?);
            }
            Err(_) => {
                warn!("Playwright bridge did not exit, killing it");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn new_page(&self, options: ContextOptions) -> E2eResult<Box<dyn Page>> {
        let result = self
            .bridge
            .call(
                "newPage",
                json!({ "label": options.label, "extraHeaders": options.extra_headers }),
            )
            .await?;
        let id: String = serde_json::from_value(result)?;

        let hub = Arc::new(EventHub::new());
        self.bridge.hubs.lock().insert(id.clone(), Arc::clone(&hub));
        debug!("[{}] opened page {}", options.label, id);

        Ok(Box::new(PlaywrightPage {
            id,
            label: options.label,
            hub,
            bridge: Arc::clone(&self.bridge),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One page in its own browser context
pub struct PlaywrightPage {
    id: String,
    label: String,
    hub: Arc<EventHub>,
    bridge: Arc<Bridge>,
    closed: AtomicBool,
}

impl PlaywrightPage {
    async fn call(&self, cmd: &str, mut args: Value) -> E2eResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(E2eError::Driver(format!("page '{}' is closed", self.label)));
        }
        args["page"] = Value::String(self.id.clone());
        self.bridge.call(cmd, args).await
    }

    async fn call_as<T: serde::de::DeserializeOwned>(&self, cmd: &str, args: Value) -> E2eResult<T> {
        Ok(serde_json::from_value(self.call(cmd, args).await?)?)
    }
}

#[async_trait]
impl Page for PlaywrightPage {
    fn label(&self) -> &str {
        &self.label
    }

    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.call("goto", json!({ "url": url })).await.map(|_| ())
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        self.call_as("isVisible", json!({ "selector": selector })).await
    }

    async fn input_value(&self, selector: &str) -> E2eResult<Option<String>> {
        self.call_as("inputValue", json!({ "selector": selector })).await
    }

    async fn option_count(&self, selector: &str) -> E2eResult<usize> {
        self.call_as("optionCount", json!({ "selector": selector })).await
    }

    async fn text_contents(&self, selector: &str) -> E2eResult<Vec<String>> {
        self.call_as("textContents", json!({ "selector": selector })).await
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("fill", json!({ "selector": selector, "value": value }))
            .await
            .map(|_| ())
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.call("click", json!({ "selector": selector })).await.map(|_| ())
    }

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("selectOption", json!({ "selector": selector, "value": value }))
            .await
            .map(|_| ())
    }

    async fn dispatch_event(&self, selector: &str, event: &str) -> E2eResult<()> {
        self.call("dispatchEvent", json!({ "selector": selector, "event": event }))
            .await
            .map(|_| ())
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        // The bridge runs in its own working directory
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.call("screenshot", json!({ "path": path.to_string_lossy() }))
            .await
            .map(|_| ())
    }

    async fn content(&self) -> E2eResult<String> {
        self.call_as("content", json!({})).await
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<CapturedEvent> {
        self.hub.subscribe()
    }

    fn console_messages(&self) -> Vec<String> {
        self.hub.console_messages()
    }

    fn network_state(&self) -> NetworkState {
        self.hub.network_state()
    }

    async fn close(&self) -> E2eResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.bridge.hubs.lock().remove(&self.id);
        self.bridge
            .call("closePage", json!({ "page": self.id }))
            .await
            .map(|_| ())
    }
}

impl Drop for PlaywrightPage {
    fn drop(&mut self) {
        // Dropped without close(), e.g. on scenario cancellation
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bridge.hubs.lock().remove(&self.id);
            let _ = self.bridge.post("closePage", json!({ "page": self.id }));
        }
    }
}
