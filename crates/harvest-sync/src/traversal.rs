//! Pagination traversal over a rendered profile.
//!
//! `Loaded -> HasMorePages -> PageAdvanced -> ... -> Exhausted`, with a hard
//! ceiling on the number of advances. Reaching the ceiling is an error rather
//! than a silent stop.

use std::time::Duration;

use harvest_adapters::PaginationSelectors;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::session::{RenderSession, SessionError};

pub const DEFAULT_MAX_STEPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Loaded,
    HasMorePages,
    PageAdvanced,
    Exhausted,
}

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("pagination did not exhaust after {steps} steps")]
    Stuck { steps: usize },
    #[error("page content unchanged for {stalls} consecutive advances (step {steps})")]
    Stalled { steps: usize, stalls: usize },
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalConfig {
    pub max_steps: usize,
    /// Upper bound on waiting for one advance to show new content. An elapsed
    /// wait only counts the step, so content that never changes costs up to
    /// `max_steps * wait` per attempt unless `max_stalls` is set.
    pub wait: Duration,
    pub poll: Duration,
    /// Consecutive unchanged advances tolerated before failing with
    /// [`TraversalError::Stalled`]. `None` leaves only the step ceiling.
    pub max_stalls: Option<usize>,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            wait: Duration::from_secs(30),
            poll: Duration::from_millis(500),
            max_stalls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraversalReport {
    pub steps: usize,
    /// Advances whose wait elapsed without a content change.
    pub stalled: usize,
}

pub struct PageTraversal {
    selectors: PaginationSelectors,
    config: TraversalConfig,
    state: TraversalState,
    report: TraversalReport,
    consecutive_stalls: usize,
}

impl PageTraversal {
    pub fn new(selectors: PaginationSelectors, config: TraversalConfig) -> Self {
        Self {
            selectors,
            config,
            state: TraversalState::Loaded,
            report: TraversalReport::default(),
            consecutive_stalls: 0,
        }
    }

    pub fn state(&self) -> TraversalState {
        self.state
    }

    pub fn report(&self) -> TraversalReport {
        self.report
    }

    /// Perform one transition and return the new state.
    pub async fn step(
        &mut self,
        session: &mut dyn RenderSession,
    ) -> Result<TraversalState, TraversalError> {
        self.state = match self.state {
            TraversalState::Loaded | TraversalState::PageAdvanced => {
                let controls = session.find_elements(self.selectors.next_control).await?;
                if controls.is_empty() {
                    TraversalState::Exhausted
                } else {
                    TraversalState::HasMorePages
                }
            }
            TraversalState::HasMorePages => {
                if self.report.steps >= self.config.max_steps {
                    return Err(TraversalError::Stuck {
                        steps: self.report.steps,
                    });
                }
                self.report.steps += 1;

                let before = fingerprint(session, self.selectors.item_titles).await?;
                if !session.activate(self.selectors.next_control).await? {
                    debug!(step = self.report.steps, "next control vanished before activation");
                } else if self.wait_for_change(session, &before).await? {
                    self.consecutive_stalls = 0;
                } else {
                    self.report.stalled += 1;
                    self.consecutive_stalls += 1;
                    warn!(
                        step = self.report.steps,
                        wait_secs = self.config.wait.as_secs_f64(),
                        "page content unchanged after advance"
                    );
                    if self
                        .config
                        .max_stalls
                        .is_some_and(|limit| self.consecutive_stalls >= limit)
                    {
                        return Err(TraversalError::Stalled {
                            steps: self.report.steps,
                            stalls: self.consecutive_stalls,
                        });
                    }
                }
                TraversalState::PageAdvanced
            }
            TraversalState::Exhausted => TraversalState::Exhausted,
        };
        Ok(self.state)
    }

    /// Drive the machine until no further page exists.
    pub async fn run_to_exhaustion(
        &mut self,
        session: &mut dyn RenderSession,
    ) -> Result<TraversalReport, TraversalError> {
        while self.step(session).await? != TraversalState::Exhausted {}
        debug!(steps = self.report.steps, stalled = self.report.stalled, "pagination exhausted");
        Ok(self.report)
    }

    /// `true` once the fingerprint is non-empty and differs from `before`,
    /// `false` when the wait elapsed first.
    async fn wait_for_change(
        &self,
        session: &mut dyn RenderSession,
        before: &str,
    ) -> Result<bool, SessionError> {
        let poll = self.config.poll;
        let item_titles = self.selectors.item_titles;
        let changed = async {
            loop {
                let current = fingerprint(session, item_titles).await?;
                if !current.is_empty() && current != before {
                    return Ok::<_, SessionError>(());
                }
                sleep(poll).await;
            }
        };
        match timeout(self.config.wait, changed).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }
}

/// Item titles currently shown, joined in display order.
pub async fn fingerprint(
    session: &mut dyn RenderSession,
    item_titles: &str,
) -> Result<String, SessionError> {
    Ok(session.find_elements(item_titles).await?.join(","))
}
