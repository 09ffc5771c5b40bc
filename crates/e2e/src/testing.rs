//! In-memory page and browser for exercising harness code without a real
//! browser.
//!
//! A [`FakePage`] is a map of selectors to element state plus an event hub.
//! Tests script the application by mutating elements after a delay or in
//! response to actions. Every query and action is logged so ordering can be
//! asserted afterwards.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{E2eError, E2eResult};
use crate::page::{Browser, CapturedEvent, ContextOptions, EventHub, EventKind, NetworkState, Page};

/// Bytes written by [`FakePage::screenshot`]
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

/// State of one element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeElement {
    pub visible: bool,
    pub value: Option<String>,
    pub options: Vec<String>,
    pub texts: Vec<String>,
}

type ActionHook = Arc<dyn Fn(&FakePage, &str) + Send + Sync>;

struct Inner {
    label: String,
    elements: Mutex<HashMap<String, FakeElement>>,
    hub: EventHub,
    url: Mutex<Option<String>>,
    actions: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
    action_hooks: Mutex<HashMap<String, Vec<ActionHook>>>,
    goto_hooks: Mutex<Vec<ActionHook>>,
    closed: AtomicBool,
    released: AtomicBool,
}

/// Scriptable in-memory page.
///
/// Clones share state. The handle given out by [`FakeBrowser::new_page`]
/// owns the page: dropping it marks the page released, as a real driver
/// tears down a context whose handle goes away.
pub struct FakePage {
    inner: Arc<Inner>,
    owner: bool,
}

impl Clone for FakePage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: false,
        }
    }
}

impl Drop for FakePage {
    fn drop(&mut self) {
        if self.owner {
            self.inner.released.store(true, Ordering::SeqCst);
        }
    }
}

impl FakePage {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                elements: Mutex::new(HashMap::new()),
                hub: EventHub::new(),
                url: Mutex::new(None),
                actions: Mutex::new(Vec::new()),
                queries: Mutex::new(Vec::new()),
                action_hooks: Mutex::new(HashMap::new()),
                goto_hooks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
            owner: false,
        }
    }

    /// Owning handle; see [`FakePage::is_released`]
    fn owning_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: true,
        }
    }

    fn update(&self, selector: &str, f: impl FnOnce(&mut FakeElement)) {
        let mut elements = self.inner.elements.lock();
        f(elements.entry(selector.to_string()).or_default());
    }

    pub fn set_visible(&self, selector: &str, visible: bool) {
        self.update(selector, |e| e.visible = visible);
    }

    pub fn set_value(&self, selector: &str, value: Option<&str>) {
        self.update(selector, |e| e.value = value.map(str::to_string));
    }

    /// Replace a select's options; the element becomes visible
    pub fn set_options(&self, selector: &str, options: &[&str]) {
        self.update(selector, |e| {
            e.visible = true;
            e.options = options.iter().map(|o| o.to_string()).collect();
        });
    }

    pub fn set_texts(&self, selector: &str, texts: &[&str]) {
        self.update(selector, |e| {
            e.visible = true;
            e.texts = texts.iter().map(|t| t.to_string()).collect();
        });
    }

    pub fn push_text(&self, selector: &str, text: &str) {
        self.update(selector, |e| {
            e.visible = true;
            e.texts.push(text.to_string());
        });
    }

    pub fn remove(&self, selector: &str) {
        self.inner.elements.lock().remove(selector);
    }

    pub fn element(&self, selector: &str) -> Option<FakeElement> {
        self.inner.elements.lock().get(selector).cloned()
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.element(selector).and_then(|e| e.value)
    }

    /// Emit a network or console event
    pub fn emit(&self, kind: EventKind, target: &str) {
        self.inner.hub.emit(kind, target, serde_json::Value::Null);
    }

    pub fn emit_with(&self, kind: EventKind, target: &str, payload: serde_json::Value) {
        self.inner.hub.emit(kind, target, payload);
    }

    pub fn log_console(&self, text: &str) {
        self.emit(EventKind::Console, text);
    }

    /// Run `f` against this page after `delay`
    pub fn after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(&FakePage) + Send + 'static,
    {
        let page = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(&page);
        });
    }

    /// Run `f` whenever `selector` is clicked, filled or selected. The hook
    /// receives the value written (empty for clicks).
    pub fn on_action<F>(&self, selector: &str, f: F)
    where
        F: Fn(&FakePage, &str) + Send + Sync + 'static,
    {
        self.inner
            .action_hooks
            .lock()
            .entry(selector.to_string())
            .or_default()
            .push(Arc::new(f));
    }

    /// Run `f` on every navigation with the target URL
    pub fn on_goto<F>(&self, f: F)
    where
        F: Fn(&FakePage, &str) + Send + Sync + 'static,
    {
        self.inner.goto_hooks.lock().push(Arc::new(f));
    }

    /// Actions performed, e.g. `click #register`, `fill #name=Spider-Man`
    pub fn actions(&self) -> Vec<String> {
        self.inner.actions.lock().clone()
    }

    /// Queries performed, e.g. `options #category-select`
    pub fn queries(&self) -> Vec<String> {
        self.inner.queries.lock().clone()
    }

    pub fn current_url(&self) -> Option<String> {
        self.inner.url.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The browser's handle was dropped, closed or not
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Closed explicitly, or its handle dropped
    pub fn is_torn_down(&self) -> bool {
        self.is_closed() || self.is_released()
    }

    fn ensure_open(&self) -> E2eResult<()> {
        if self.is_closed() {
            return Err(E2eError::Driver(format!("page '{}' is closed", self.inner.label)));
        }
        Ok(())
    }

    fn query(&self, what: &str, selector: &str) -> E2eResult<Option<FakeElement>> {
        self.ensure_open()?;
        self.inner.queries.lock().push(format!("{} {}", what, selector));
        Ok(self.element(selector))
    }

    fn act(&self, entry: String, selector: &str, value: &str) -> E2eResult<()> {
        self.ensure_open()?;
        self.inner.actions.lock().push(entry);
        let hooks = self
            .inner
            .action_hooks
            .lock()
            .get(selector)
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            hook(self, value);
        }
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    fn label(&self) -> &str {
        &self.inner.label
    }

    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.ensure_open()?;
        *self.inner.url.lock() = Some(url.to_string());
        self.inner.actions.lock().push(format!("goto {}", url));
        let hooks = self.inner.goto_hooks.lock().clone();
        for hook in hooks {
            hook(self, url);
        }
        Ok(())
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        Ok(self.query("visible", selector)?.map(|e| e.visible).unwrap_or(false))
    }

    async fn input_value(&self, selector: &str) -> E2eResult<Option<String>> {
        Ok(self.query("value", selector)?.and_then(|e| e.value))
    }

    async fn option_count(&self, selector: &str) -> E2eResult<usize> {
        Ok(self.query("options", selector)?.map(|e| e.options.len()).unwrap_or(0))
    }

    async fn text_contents(&self, selector: &str) -> E2eResult<Vec<String>> {
        Ok(self.query("texts", selector)?.map(|e| e.texts).unwrap_or_default())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.ensure_open()?;
        self.update(selector, |e| e.value = Some(value.to_string()));
        self.act(format!("fill {}={}", selector, value), selector, value)
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.act(format!("click {}", selector), selector, "")
    }

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.ensure_open()?;
        let known = self
            .element(selector)
            .map(|e| e.options.iter().any(|o| o == value))
            .unwrap_or(false);
        if !known {
            return Err(E2eError::Driver(format!("{} has no option '{}'", selector, value)));
        }
        self.update(selector, |e| e.value = Some(value.to_string()));
        self.act(format!("select {}={}", selector, value), selector, value)
    }

    async fn dispatch_event(&self, selector: &str, event: &str) -> E2eResult<()> {
        self.ensure_open()?;
        self.inner.actions.lock().push(format!("dispatch {} {}", selector, event));
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        self.ensure_open()?;
        std::fs::write(path, FAKE_PNG)?;
        Ok(())
    }

    async fn content(&self) -> E2eResult<String> {
        self.ensure_open()?;
        let elements = self.inner.elements.lock();
        let mut selectors: Vec<&String> = elements.keys().collect();
        selectors.sort();
        let mut html = String::from("<html><body>\n");
        for selector in selectors {
            let e = &elements[selector];
            html.push_str(&format!(
                "<!-- {} visible={} value={:?} options={} --> {}\n",
                selector,
                e.visible,
                e.value,
                e.options.len(),
                e.texts.join(" ")
            ));
        }
        html.push_str("</body></html>\n");
        Ok(html)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<CapturedEvent> {
        self.inner.hub.subscribe()
    }

    fn console_messages(&self) -> Vec<String> {
        self.inner.hub.console_messages()
    }

    fn network_state(&self) -> NetworkState {
        self.inner.hub.network_state()
    }

    async fn close(&self) -> E2eResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type PageSetup = Arc<dyn Fn(&FakePage) + Send + Sync>;

/// Hands out a fresh [`FakePage`] per context
#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Arc<Mutex<Vec<FakePage>>>,
    setup: Option<PageSetup>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `setup` to every page the browser creates
    pub fn with_setup<F>(setup: F) -> Self
    where
        F: Fn(&FakePage) + Send + Sync + 'static,
    {
        Self {
            pages: Arc::new(Mutex::new(Vec::new())),
            setup: Some(Arc::new(setup)),
        }
    }

    /// Every page created so far
    pub fn pages(&self) -> Vec<FakePage> {
        self.pages.lock().clone()
    }

    pub fn page(&self, label: &str) -> Option<FakePage> {
        self.pages.lock().iter().find(|p| p.label() == label).cloned()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self, options: ContextOptions) -> E2eResult<Box<dyn Page>> {
        let page = FakePage::new(options.label);
        if let Some(setup) = &self.setup {
            setup(&page);
        }
        self.pages.lock().push(page.clone());
        Ok(Box::new(page.owning_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_action_hooks_fire() {
        let page = FakePage::new("host");
        page.on_action("#album-select", |p, value| {
            if value == "18" {
                p.set_options("#category-select", &["Select category", "55"]);
            }
        });
        page.set_options("#album-select", &["Select album", "18"]);

        page.select_option("#album-select", "18").await.unwrap();
        assert_eq!(page.option_count("#category-select").await.unwrap(), 2);
        assert_eq!(page.actions(), vec!["select #album-select=18".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_page_rejects_calls() {
        let page = FakePage::new("user");
        page.close().await.unwrap();
        assert!(page.is_closed());
        assert!(matches!(page.click("#x").await, Err(E2eError::Driver(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_applies_mutation() {
        let page = FakePage::new("user");
        page.after(Duration::from_secs(2), |p| p.set_visible("h1", true));
        assert!(!page.is_visible("h1").await.unwrap());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(page.is_visible("h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_handle_marks_page_released() {
        let browser = FakeBrowser::new();
        let handle = browser.new_page(ContextOptions::labeled("Wonder Woman")).await.unwrap();
        let page = browser.page("Wonder Woman").unwrap();

        // Test-side clones never release the page
        drop(page.clone());
        assert!(!page.is_torn_down());

        drop(handle);
        assert!(page.is_released());
        assert!(!page.is_closed());
        assert!(page.is_torn_down());
    }
}
