//! Rendering-session boundary. One session renders exactly one target and is
//! never shared between workers.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("launching session: {0}")]
    Launch(String),
    #[error("navigating to {url}: {reason}")]
    Navigate { url: String, reason: String },
    #[error("{op} failed: {reason}")]
    Command { op: &'static str, reason: String },
    #[error("session already closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub headless: bool,
    pub user_agent: String,
}

#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Current rendered DOM serialized as HTML.
    async fn page_source(&mut self) -> Result<String, SessionError>;

    /// Visible text of every element matching `selector`, in DOM order.
    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>, SessionError>;

    /// Scroll the first match into view and click it. `false` when nothing
    /// matched.
    async fn activate(&mut self, selector: &str) -> Result<bool, SessionError>;

    /// Network events observed since the session opened, as
    /// `{"method": .., "params": ..}` entries.
    async fn performance_log(&mut self) -> Result<Vec<JsonValue>, SessionError>;

    /// Body of a previously observed response.
    async fn response_body(&mut self, request_id: &str) -> Result<String, SessionError>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn RenderSession>, SessionError>;
}
