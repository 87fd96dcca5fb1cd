#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harvest_adapters::{PaginationSelectors, ProfileExtractor, ProfileLayoutV1};
use harvest_sync::{RenderSession, SessionError, SessionFactory, SessionOptions};
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;

pub fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

pub fn fixture(rel: &str) -> String {
    let path = fixtures_root().join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

pub fn selectors() -> PaginationSelectors {
    ProfileLayoutV1.pagination()
}

/// How a scripted profile page behaves once rendered.
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    pub source: String,
    /// Item titles shown on each page; the next control exists while a
    /// further page does.
    pub pages: Vec<Vec<String>>,
    /// Next control never disappears and the titles never change.
    pub stuck: bool,
    pub network: Vec<JsonValue>,
    pub bodies: HashMap<String, String>,
}

impl PageScript {
    pub fn profile(source: String) -> Self {
        Self {
            source,
            pages: vec![vec!["Intro".into(), "Advanced".into()]],
            ..Default::default()
        }
    }

    pub fn with_response(mut self, request_id: &str, url: &str, body: String) -> Self {
        self.network.push(json!({
            "method": "Network.responseReceived",
            "params": {
                "requestId": request_id,
                "timestamp": 100.0 + self.network.len() as f64,
                "response": { "url": url, "status": 200 }
            }
        }));
        self.bodies.insert(request_id.to_string(), body);
        self
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub activations: AtomicUsize,
    /// Sessions opened and not yet closed.
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub open_times: Mutex<Vec<Instant>>,
    pub navigations: Mutex<Vec<String>>,
}

impl SessionStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn navigations_to(&self, url: &str) -> usize {
        self.navigations
            .lock()
            .expect("navigations")
            .iter()
            .filter(|u| *u == url)
            .count()
    }
}

#[derive(Default)]
pub struct MockState {
    pub scripts: HashMap<String, PageScript>,
    /// Remaining navigation failures per target.
    pub failures: Mutex<HashMap<String, usize>>,
    pub stats: SessionStats,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, PageScript)>) -> Self {
        Self::with_failures(scripts, std::iter::empty::<(&'static str, usize)>())
    }

    pub fn with_failures(
        scripts: impl IntoIterator<Item = (&'static str, PageScript)>,
        failures: impl IntoIterator<Item = (&'static str, usize)>,
    ) -> Self {
        let state = MockState {
            scripts: scripts
                .into_iter()
                .map(|(url, script)| (url.to_string(), script))
                .collect(),
            failures: Mutex::new(
                failures
                    .into_iter()
                    .map(|(url, n)| (url.to_string(), n))
                    .collect(),
            ),
            stats: SessionStats::default(),
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.state.stats
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn open(&self, _options: &SessionOptions) -> Result<Box<dyn RenderSession>, SessionError> {
        let stats = &self.state.stats;
        stats.opens.fetch_add(1, Ordering::SeqCst);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        stats.open_times.lock().expect("open times").push(Instant::now());
        Ok(Box::new(MockSession::new(Arc::clone(&self.state))))
    }
}

pub struct MockSession {
    state: Arc<MockState>,
    script: Option<PageScript>,
    page: usize,
    closed: bool,
}

impl MockSession {
    pub fn new(state: Arc<MockState>) -> Self {
        Self {
            state,
            script: None,
            page: 0,
            closed: false,
        }
    }

    /// Session already showing `script`, bypassing navigation.
    pub fn rendering(script: PageScript) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            script: Some(script),
            page: 0,
            closed: false,
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.state.stats
    }

    fn script(&self) -> Result<&PageScript, SessionError> {
        self.script.as_ref().ok_or(SessionError::Closed)
    }

    fn has_next(&self, script: &PageScript) -> bool {
        script.stuck || self.page + 1 < script.pages.len()
    }
}

#[async_trait]
impl RenderSession for MockSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.state
            .stats
            .navigations
            .lock()
            .expect("navigations")
            .push(url.to_string());
        {
            let mut failures = self.state.failures.lock().expect("failures");
            if let Some(remaining) = failures.get_mut(url).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(SessionError::Navigate {
                    url: url.to_string(),
                    reason: "renderer crashed".to_string(),
                });
            }
        }
        let script = self.state.scripts.get(url).cloned().ok_or_else(|| SessionError::Navigate {
            url: url.to_string(),
            reason: "no script".to_string(),
        })?;
        self.script = Some(script);
        self.page = 0;
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        Ok(self.script()?.source.clone())
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>, SessionError> {
        let script = self.script()?;
        let selectors = selectors();
        if selector == selectors.next_control {
            return Ok(if self.has_next(script) {
                vec!["Next".to_string()]
            } else {
                Vec::new()
            });
        }
        if selector == selectors.item_titles {
            return Ok(script.pages.get(self.page).cloned().unwrap_or_default());
        }
        Ok(Vec::new())
    }

    async fn activate(&mut self, selector: &str) -> Result<bool, SessionError> {
        self.state.stats.activations.fetch_add(1, Ordering::SeqCst);
        let script = self.script()?.clone();
        if selector != selectors().next_control || !self.has_next(&script) {
            return Ok(false);
        }
        if !script.stuck {
            self.page += 1;
        }
        Ok(true)
    }

    async fn performance_log(&mut self) -> Result<Vec<JsonValue>, SessionError> {
        Ok(self.script()?.network.clone())
    }

    async fn response_body(&mut self, request_id: &str) -> Result<String, SessionError> {
        self.script()?
            .bodies
            .get(request_id)
            .cloned()
            .ok_or(SessionError::Command {
                op: "get_response_body",
                reason: format!("no body for {request_id}"),
            })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            let stats = &self.state.stats;
            stats.closes.fetch_add(1, Ordering::SeqCst);
            let _ = stats
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        }
        Ok(())
    }
}
