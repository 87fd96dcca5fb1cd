//! Bounded worker pool: each worker pulls one target at a time, renders it in
//! a fresh session and hands the resulting rows to a single output writer.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_adapters::{extract_items, AdapterError, PageStatus, ProfileExtractor, ITEMS_ENDPOINT};
use harvest_core::{OutputRow, Target};
use harvest_storage::{BackoffPolicy, ResultSink, SeenTargets};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capture::capture;
use crate::session::{RenderSession, SessionError, SessionFactory, SessionOptions};
use crate::traversal::{PageTraversal, TraversalConfig, TraversalError};
use crate::RunError;

/// One failed attempt. Every variant is retried.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("traversal: {0}")]
    Traversal(#[from] TraversalError),
    #[error("extraction: {0}")]
    Extraction(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Scraped { rows: usize },
    NotFound,
    Private,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target: Target,
    pub outcome: TargetOutcome,
    /// Session cycles spent on the target.
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub skipped_seen: usize,
    pub duplicates: usize,
    pub rows_written: usize,
    pub targets: Vec<TargetReport>,
}

impl DispatchReport {
    pub fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|r| pred(&r.outcome)).count()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Pause after a successfully scraped target, before the worker takes
    /// the next one.
    pub target_delay: Duration,
    /// Pause after navigation before the page is read.
    pub page_settle: Duration,
    pub traversal: TraversalConfig,
    pub session: SessionOptions,
}

pub struct ScrapeOrchestrator {
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn ProfileExtractor>,
    config: Arc<OrchestratorConfig>,
}

impl ScrapeOrchestrator {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        extractor: Arc<dyn ProfileExtractor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            factory,
            extractor,
            config: Arc::new(config),
        }
    }

    /// Scrape every target not already present in the sink's output.
    ///
    /// With `clean` set the existing output is discarded first, so nothing
    /// counts as seen.
    pub async fn run(
        &self,
        run_id: Uuid,
        targets: Vec<Target>,
        sink: ResultSink,
        clean: bool,
    ) -> Result<DispatchReport, RunError> {
        if clean {
            sink.discard()?;
            info!(path = %sink.path().display(), "discarded previous output");
        }
        let seen = SeenTargets::read_from(sink.path())?;

        let mut report = DispatchReport::default();
        let mut queued = HashSet::new();
        let mut queue = VecDeque::new();
        for target in targets {
            if seen.contains(&target) {
                report.skipped_seen += 1;
            } else if !queued.insert(target.clone()) {
                report.duplicates += 1;
            } else {
                queue.push_back(target);
            }
        }
        info!(
            pending = queue.len(),
            skipped_seen = report.skipped_seen,
            duplicates = report.duplicates,
            "dispatching targets"
        );
        if queue.is_empty() {
            return Ok(report);
        }

        let workers = self.config.concurrency.clamp(1, queue.len());
        let queue = Arc::new(Mutex::new(queue));
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Vec<OutputRow>>(workers * 2);
        let writer = tokio::spawn(write_batches(sink, rx));

        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                run_id,
                factory: Arc::clone(&self.factory),
                extractor: Arc::clone(&self.extractor),
                config: Arc::clone(&self.config),
                queue: Arc::clone(&queue),
                abort: Arc::clone(&abort),
                rows: tx.clone(),
            };
            pool.spawn(worker.run());
        }
        drop(tx);

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(reports) => report.targets.extend(reports),
                Err(err) => error!(error = %err, "worker task failed"),
            }
        }

        report.rows_written = writer
            .await
            .map_err(|err| RunError::Task(err.to_string()))??;
        Ok(report)
    }
}

/// Single owner of the sink. Each batch is appended on the blocking pool and
/// batches are written in arrival order.
async fn write_batches(
    mut sink: ResultSink,
    mut rx: mpsc::Receiver<Vec<OutputRow>>,
) -> Result<usize, RunError> {
    let mut written = 0;
    while let Some(rows) = rx.recv().await {
        let (returned, appended) = tokio::task::spawn_blocking(move || {
            let appended = sink.append(&rows);
            (sink, appended)
        })
        .await
        .map_err(|err| RunError::Task(err.to_string()))?;
        sink = returned;
        written += appended?;
    }
    Ok(written)
}

enum Attempt {
    Rows(Vec<OutputRow>),
    Unavailable(TargetOutcome),
}

struct Worker {
    id: usize,
    run_id: Uuid,
    factory: Arc<dyn SessionFactory>,
    extractor: Arc<dyn ProfileExtractor>,
    config: Arc<OrchestratorConfig>,
    queue: Arc<Mutex<VecDeque<Target>>>,
    abort: Arc<AtomicBool>,
    rows: mpsc::Sender<Vec<OutputRow>>,
}

impl Worker {
    async fn run(self) -> Vec<TargetReport> {
        let mut reports = Vec::new();
        while !self.abort.load(Ordering::SeqCst) {
            let Some(target) = self.next_target() else {
                break;
            };
            let (mut report, rows) = self.scrape_with_retries(&target).await;

            if let Some(rows) = rows {
                if self.rows.send(rows).await.is_err() {
                    self.abort.store(true, Ordering::SeqCst);
                    warn!(worker = self.id, target = %target, "output writer stopped; halting dispatch");
                    report.outcome = TargetOutcome::Failed {
                        error: "output writer stopped".to_string(),
                    };
                    reports.push(report);
                    break;
                }
                reports.push(report);
                sleep(self.config.target_delay).await;
            } else {
                reports.push(report);
            }
        }
        reports
    }

    fn next_target(&self) -> Option<Target> {
        self.queue.lock().ok()?.pop_front()
    }

    async fn scrape_with_retries(&self, target: &Target) -> (TargetReport, Option<Vec<OutputRow>>) {
        let attempts = self.config.backoff.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let span = info_span!(
                "scrape_target",
                run_id = %self.run_id,
                worker = self.id,
                target = %target,
                attempt
            );
            let result = self.scrape_once(target).instrument(span.clone()).await;

            let (outcome, rows) = match result {
                Ok(Attempt::Rows(rows)) => {
                    span.in_scope(|| info!(rows = rows.len(), "target scraped"));
                    (TargetOutcome::Scraped { rows: rows.len() }, Some(rows))
                }
                Ok(Attempt::Unavailable(outcome)) => {
                    span.in_scope(|| warn!(outcome = ?outcome, "target unavailable"));
                    (outcome, None)
                }
                Err(err) if attempt < attempts => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    span.in_scope(|| {
                        warn!(
                            error = %err,
                            remaining = attempts - attempt,
                            retry_in_secs = delay.as_secs_f64(),
                            "attempt failed"
                        )
                    });
                    sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    span.in_scope(|| error!(error = %err, attempts, "retries exhausted"));
                    (
                        TargetOutcome::Failed {
                            error: err.to_string(),
                        },
                        None,
                    )
                }
            };

            let report = TargetReport {
                target: target.clone(),
                outcome,
                attempts: attempt,
            };
            return (report, rows);
        }
    }

    /// One full session cycle. The session is closed whatever the result.
    async fn scrape_once(&self, target: &Target) -> Result<Attempt, ScrapeError> {
        let mut session = self.factory.open(&self.config.session).await?;
        let result = self.drive(session.as_mut(), target).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing session");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut dyn RenderSession,
        target: &Target,
    ) -> Result<Attempt, ScrapeError> {
        session.navigate(target.as_str()).await?;
        sleep(self.config.page_settle).await;

        let source = session.page_source().await?;
        match self.extractor.classify(&source)? {
            PageStatus::Available => {}
            PageStatus::NotFound => return Ok(Attempt::Unavailable(TargetOutcome::NotFound)),
            PageStatus::Private => return Ok(Attempt::Unavailable(TargetOutcome::Private)),
        }
        let profile = self.extractor.parse_profile(&source)?.with_target(target);

        PageTraversal::new(self.extractor.pagination(), self.config.traversal)
            .run_to_exhaustion(session)
            .await?;

        let captures = capture(session, Some(ITEMS_ENDPOINT)).await?;
        let items = extract_items(&captures);
        Ok(Attempt::Rows(OutputRow::merge(profile, items)))
    }
}
