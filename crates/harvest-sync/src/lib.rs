//! Harvest orchestration: target discovery, the scrape worker pool and the
//! run-level entry points used by the CLI.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_adapters::{extractor_for_layout, ProfileExtractor, DEFAULT_LAYOUT};
use harvest_core::Target;
use harvest_storage::{
    BackoffPolicy, CacheError, HttpClientConfig, HttpFetcher, ResultSink, SeenTargets, SinkError,
    TargetCache,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[cfg(feature = "browser")]
pub mod browser;
pub mod capture;
pub mod discovery;
pub mod orchestrator;
pub mod session;
pub mod traversal;

pub use discovery::{DiscoveryConfig, DiscoveryError, ListingClient, TargetListManager};
pub use orchestrator::{
    DispatchReport, OrchestratorConfig, ScrapeError, ScrapeOrchestrator, TargetOutcome,
    TargetReport,
};
pub use session::{RenderSession, SessionError, SessionFactory, SessionOptions};
pub use traversal::{PageTraversal, TraversalConfig, TraversalError, TraversalState};

pub const CRATE_NAME: &str = "harvest-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36";
pub const DEFAULT_INDEX_URL: &str = "https://www.udemy.com/sitemap.xml";
pub const DEFAULT_LISTING_PATTERN: &str = "https://www.udemy.com/sitemap/instructors.xml?p=";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("target discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("output write failed: {0}")]
    Write(#[from] SinkError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("no extractor registered for layout {0:?}")]
    UnknownLayout(String),
    #[error("building http client: {0}")]
    HttpClient(String),
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("worker task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_path: PathBuf,
    pub targets_path: PathBuf,
    pub concurrency: usize,
    pub proxy: Option<String>,
    /// Pause after each listing page and after each scraped target.
    pub delay: Duration,
    pub clean: bool,
    /// Total attempts per target.
    pub max_retries: usize,
    pub headless: bool,
    pub user_agent: String,
    pub index_url: String,
    pub listing_pattern: String,
    pub page_settle: Duration,
    pub traversal_wait: Duration,
    pub traversal_poll: Duration,
    pub max_traversal_steps: usize,
    /// Consecutive unchanged advances before a traversal gives up early.
    pub max_traversal_stalls: Option<usize>,
    pub backoff_base: Duration,
    pub backoff_step: Duration,
    pub http_timeout: Duration,
    pub layout: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        let traversal = TraversalConfig::default();
        Self {
            output_path: PathBuf::from("udemy_courses.csv"),
            targets_path: PathBuf::from("urls.txt"),
            concurrency: 1,
            proxy: None,
            delay: Duration::from_secs(5),
            clean: false,
            max_retries: backoff.max_retries,
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            index_url: DEFAULT_INDEX_URL.to_string(),
            listing_pattern: DEFAULT_LISTING_PATTERN.to_string(),
            page_settle: Duration::from_secs(6),
            traversal_wait: traversal.wait,
            traversal_poll: traversal.poll,
            max_traversal_steps: traversal.max_steps,
            max_traversal_stalls: traversal.max_stalls,
            backoff_base: backoff.base_delay,
            backoff_step: backoff.step,
            http_timeout: Duration::from_secs(30),
            layout: DEFAULT_LAYOUT.to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<f64>(key)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_path: std::env::var("HARVEST_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            targets_path: std::env::var("HARVEST_URLS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.targets_path),
            concurrency: env_parse("HARVEST_THREADS").unwrap_or(defaults.concurrency),
            proxy: std::env::var("HARVEST_PROXY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or(defaults.proxy),
            delay: env_secs("HARVEST_DELAY_SECS").unwrap_or(defaults.delay),
            clean: env_flag("HARVEST_CLEAN").unwrap_or(defaults.clean),
            max_retries: env_parse("HARVEST_MAX_RETRIES").unwrap_or(defaults.max_retries),
            headless: env_flag("HARVEST_HEADLESS").unwrap_or(defaults.headless),
            user_agent: std::env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            index_url: std::env::var("HARVEST_INDEX_URL").unwrap_or(defaults.index_url),
            listing_pattern: std::env::var("HARVEST_LISTING_PATTERN")
                .unwrap_or(defaults.listing_pattern),
            page_settle: env_secs("HARVEST_PAGE_SETTLE_SECS").unwrap_or(defaults.page_settle),
            traversal_wait: env_secs("HARVEST_TRAVERSAL_WAIT_SECS")
                .unwrap_or(defaults.traversal_wait),
            traversal_poll: defaults.traversal_poll,
            max_traversal_steps: defaults.max_traversal_steps,
            max_traversal_stalls: env_parse("HARVEST_TRAVERSAL_MAX_STALLS")
                .filter(|n: &usize| *n > 0)
                .or(defaults.max_traversal_stalls),
            backoff_base: env_secs("HARVEST_BACKOFF_BASE_SECS").unwrap_or(defaults.backoff_base),
            backoff_step: env_secs("HARVEST_BACKOFF_STEP_SECS").unwrap_or(defaults.backoff_step),
            http_timeout: env_secs("HARVEST_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout),
            layout: std::env::var("HARVEST_LAYOUT").unwrap_or(defaults.layout),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: self.backoff_base,
            step: self.backoff_step,
        }
    }

    pub fn traversal(&self) -> TraversalConfig {
        TraversalConfig {
            max_steps: self.max_traversal_steps,
            wait: self.traversal_wait,
            poll: self.traversal_poll,
            max_stalls: self.max_traversal_stalls,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            headless: self.headless,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency.max(1),
            backoff: self.backoff(),
            target_delay: self.delay,
            page_settle: self.page_settle,
            traversal: self.traversal(),
            session: self.session_options(),
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            index_url: self.index_url.clone(),
            listing_pattern: self.listing_pattern.clone(),
            delay: self.delay,
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            proxy: self.proxy.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub skipped_seen: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub unavailable: usize,
    pub failed: usize,
    pub rows_written: usize,
    pub output_path: String,
    pub targets: Vec<TargetReport>,
}

/// Progress of the cached target list against the output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub cache_present: bool,
    pub total: usize,
    pub done: usize,
    pub remaining: usize,
}

pub struct HarvestRunner {
    config: HarvestConfig,
    sessions: Option<Arc<dyn SessionFactory>>,
    listing_client: Option<Arc<dyn ListingClient>>,
}

impl HarvestRunner {
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            config,
            sessions: None,
            listing_client: None,
        }
    }

    pub fn with_session_factory(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_listing_client(mut self, client: Arc<dyn ListingClient>) -> Self {
        self.listing_client = Some(client);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    fn session_factory(&self) -> Result<Arc<dyn SessionFactory>, RunError> {
        if let Some(sessions) = &self.sessions {
            return Ok(Arc::clone(sessions));
        }
        #[cfg(feature = "browser")]
        {
            Ok(Arc::new(browser::ChromiumSessionFactory::default()))
        }
        #[cfg(not(feature = "browser"))]
        {
            Err(RunError::Unsupported(
                "built without browser support; rebuild with `--features browser`",
            ))
        }
    }

    fn extractor(&self) -> Result<Arc<dyn ProfileExtractor>, RunError> {
        extractor_for_layout(&self.config.layout)
            .map(Arc::from)
            .ok_or_else(|| RunError::UnknownLayout(self.config.layout.clone()))
    }

    pub fn target_list(&self) -> Result<TargetListManager, RunError> {
        let client = match &self.listing_client {
            Some(client) => Arc::clone(client),
            None => {
                let fetcher = HttpFetcher::new(self.config.http_client())
                    .map_err(|err| RunError::HttpClient(format!("{err:#}")))?;
                Arc::new(fetcher)
            }
        };
        Ok(TargetListManager::new(
            client,
            TargetCache::new(&self.config.targets_path),
            self.config.discovery(),
        ))
    }

    pub async fn discover(&self, force_refresh: bool) -> Result<Vec<Target>, RunError> {
        Ok(self.target_list()?.discover(force_refresh).await?)
    }

    /// Discover targets, then scrape every one not yet present in the output.
    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let sessions = self.session_factory()?;
        let extractor = self.extractor()?;

        let targets = self.discover(self.config.clean).await?;
        let discovered = targets.len();
        info!(%run_id, discovered, layout = extractor.layout(), "starting harvest");

        let orchestrator =
            ScrapeOrchestrator::new(sessions, extractor, self.config.orchestrator());
        let sink = ResultSink::new(&self.config.output_path);
        let dispatch = orchestrator
            .run(run_id, targets, sink, self.config.clean)
            .await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            discovered,
            skipped_seen: dispatch.skipped_seen,
            dispatched: dispatch.targets.len(),
            succeeded: dispatch.count(|o| matches!(o, TargetOutcome::Scraped { .. })),
            unavailable: dispatch
                .count(|o| matches!(o, TargetOutcome::NotFound | TargetOutcome::Private)),
            failed: dispatch.count(|o| matches!(o, TargetOutcome::Failed { .. })),
            rows_written: dispatch.rows_written,
            output_path: self.config.output_path.display().to_string(),
            targets: dispatch.targets,
        };
        info!(
            %run_id,
            succeeded = summary.succeeded,
            unavailable = summary.unavailable,
            failed = summary.failed,
            rows_written = summary.rows_written,
            "harvest finished"
        );
        Ok(summary)
    }

    pub async fn status(&self) -> Result<StatusReport, RunError> {
        let cached = TargetCache::new(&self.config.targets_path).load().await?;
        let seen = SeenTargets::read_from(&self.config.output_path)?;
        let cache_present = cached.is_some();
        let targets = cached.unwrap_or_default();
        let done = targets.iter().filter(|t| seen.contains(t)).count();
        Ok(StatusReport {
            cache_present,
            total: targets.len(),
            done,
            remaining: targets.len() - done,
        })
    }
}

pub async fn run_harvest_from_env() -> Result<RunSummary, RunError> {
    HarvestRunner::new(HarvestConfig::from_env()).run_once().await
}
