//! Chromium-backed [`RenderSession`] over CDP.
//!
//! Each session launches its own browser process on a throwaway profile
//! directory, so sessions never share profile state. Network events are recorded
//! from the moment the page is created so the performance log covers every
//! request made while the profile is rendered and paginated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams, RequestId,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::{RenderSession, SessionError, SessionFactory, SessionOptions};

const HIDE_WEBDRIVER: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

#[derive(Debug, Clone)]
pub struct ChromiumSessionFactory {
    pub chrome_executable: Option<PathBuf>,
    pub request_timeout: Duration,
    pub window_size: (u32, u32),
}

impl Default for ChromiumSessionFactory {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            request_timeout: Duration::from_secs(60),
            window_size: (1366, 900),
        }
    }
}

fn command_error(op: &'static str) -> impl Fn(chromiumoxide::error::CdpError) -> SessionError {
    move |err| SessionError::Command {
        op,
        reason: err.to_string(),
    }
}

/// Fresh profile directory for one browser process, removed on close.
fn profile_dir() -> Result<TempDir, SessionError> {
    tempfile::Builder::new()
        .prefix("harvest-chromium-")
        .tempdir()
        .map_err(|err| SessionError::Launch(format!("creating profile directory: {err}")))
}

type EventLog = Arc<Mutex<Vec<JsonValue>>>;

fn record<T: Serialize>(log: &EventLog, method: &str, event: &T) {
    match serde_json::to_value(event) {
        Ok(params) => {
            if let Ok(mut entries) = log.lock() {
                entries.push(json!({ "method": method, "params": params }));
            }
        }
        Err(err) => debug!(method, error = %err, "unserializable network event"),
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn RenderSession>, SessionError> {
        let (width, height) = self.window_size;
        let profile = profile_dir()?;
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .window_size(width, height)
            .request_timeout(self.request_timeout)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-sandbox")
            .arg(format!("--user-agent={}", options.user_agent));
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(SessionError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut session = ChromiumSession {
            browser: Some(browser),
            page: None,
            events: Arc::new(Mutex::new(Vec::new())),
            tasks: vec![handler_task],
            profile: Some(profile),
        };
        // A half-built session still owns a browser process.
        if let Err(err) = session.prepare_page().await {
            let _ = session.close().await;
            return Err(err);
        }
        Ok(Box::new(session))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Option<Page>,
    events: EventLog,
    tasks: Vec<JoinHandle<()>>,
    profile: Option<TempDir>,
}

impl ChromiumSession {
    async fn prepare_page(&mut self) -> Result<(), SessionError> {
        let browser = self.browser.as_ref().ok_or(SessionError::Closed)?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(command_error("new_page"))?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(HIDE_WEBDRIVER))
            .await
            .map_err(command_error("add_init_script"))?;
        page.execute(EnableParams::default())
            .await
            .map_err(command_error("network_enable"))?;

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(command_error("listen_requests"))?;
        let log = Arc::clone(&self.events);
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                record(&log, "Network.requestWillBeSent", &*event);
            }
        }));

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(command_error("listen_responses"))?;
        let log = Arc::clone(&self.events);
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                record(&log, "Network.responseReceived", &*event);
            }
        }));

        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page, SessionError> {
        self.page.as_ref().ok_or(SessionError::Closed)
    }

    async fn evaluate<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        script: String,
    ) -> Result<T, SessionError> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(command_error(op))?
            .into_value()
            .map_err(|err| SessionError::Command {
                op,
                reason: err.to_string(),
            })
    }
}

fn selector_literal(selector: &str) -> String {
    serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.page()?
            .goto(url)
            .await
            .map_err(|err| SessionError::Navigate {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, SessionError> {
        self.page()?
            .content()
            .await
            .map_err(command_error("page_source"))
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>, SessionError> {
        let script = format!(
            "Array.from(document.querySelectorAll({})).map(el => el.innerText)",
            selector_literal(selector)
        );
        self.evaluate("find_elements", script).await
    }

    async fn activate(&mut self, selector: &str) -> Result<bool, SessionError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); \
             if (!el) return false; \
             el.scrollIntoView({{ block: 'center' }}); el.click(); return true; }})()",
            selector_literal(selector)
        );
        self.evaluate("activate", script).await
    }

    async fn performance_log(&mut self) -> Result<Vec<JsonValue>, SessionError> {
        self.events
            .lock()
            .map(|entries| entries.clone())
            .map_err(|_| SessionError::Command {
                op: "performance_log",
                reason: "event log poisoned".to_string(),
            })
    }

    async fn response_body(&mut self, request_id: &str) -> Result<String, SessionError> {
        let returns = self
            .page()?
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .map_err(command_error("get_response_body"))?
            .result;
        if returns.base64_encoded {
            return Err(SessionError::Command {
                op: "get_response_body",
                reason: "binary body".to_string(),
            });
        }
        Ok(returns.body)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if let Some(page) = self.page.take() {
            if let Err(err) = page.close().await {
                debug!(error = %err, "closing page");
            }
        }
        if let Some(mut browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "closing browser");
            }
            if let Err(err) = browser.wait().await {
                warn!(error = %err, "waiting for browser exit");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(profile) = self.profile.take() {
            if let Err(err) = profile.close() {
                debug!(error = %err, "removing profile directory");
            }
        }
        Ok(())
    }
}
