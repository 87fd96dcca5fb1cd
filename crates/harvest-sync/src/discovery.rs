//! Target list discovery from the site index, with a local cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_adapters::{listing_refs, target_refs, AdapterError};
use harvest_core::Target;
use harvest_storage::{CacheError, FetchError, HttpFetcher, TargetCache};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing listing document: {0}")]
    Parse(#[from] AdapterError),
    #[error("no listing pages referenced by {url}")]
    NoListings { url: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Plain GET used for the index and listing pages.
#[async_trait]
pub trait ListingClient: Send + Sync {
    async fn get(&self, url: &str, via_proxy: bool) -> Result<String, FetchError>;
}

#[async_trait]
impl ListingClient for HttpFetcher {
    async fn get(&self, url: &str, via_proxy: bool) -> Result<String, FetchError> {
        self.get_text(url, via_proxy).await
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub index_url: String,
    /// Substring that identifies listing pages among the index references.
    pub listing_pattern: String,
    /// Pause after each listing page.
    pub delay: Duration,
}

pub struct TargetListManager {
    client: Arc<dyn ListingClient>,
    cache: TargetCache,
    config: DiscoveryConfig,
}

impl TargetListManager {
    pub fn new(client: Arc<dyn ListingClient>, cache: TargetCache, config: DiscoveryConfig) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &TargetCache {
        &self.cache
    }

    /// Return the ordered target list. The cache wins unless `force_refresh`
    /// is set; a fresh list replaces the cache atomically.
    pub async fn discover(&self, force_refresh: bool) -> Result<Vec<Target>, DiscoveryError> {
        let span = info_span!("discover_targets", force_refresh);
        async move {
            if !force_refresh {
                if let Some(targets) = self.cache.load().await? {
                    info!(
                        count = targets.len(),
                        path = %self.cache.path().display(),
                        "using cached target list"
                    );
                    return Ok(targets);
                }
            }

            let targets = self.fetch_targets().await?;
            self.cache.store(&targets).await?;
            info!(
                count = targets.len(),
                path = %self.cache.path().display(),
                "target list cached"
            );
            Ok(targets)
        }
        .instrument(span)
        .await
    }

    async fn fetch_targets(&self) -> Result<Vec<Target>, DiscoveryError> {
        let index_url = &self.config.index_url;
        let index = self.fetch(index_url, false).await?;
        let listings = listing_refs(&index, &self.config.listing_pattern)?;
        if listings.is_empty() {
            return Err(DiscoveryError::NoListings {
                url: index_url.clone(),
            });
        }
        info!(listings = listings.len(), "listing pages found");

        let mut targets = Vec::new();
        for (idx, listing) in listings.iter().enumerate() {
            let page = self.fetch(listing, true).await?;
            let found = target_refs(&page)?;
            info!(
                page = idx + 1,
                of = listings.len(),
                targets = found.len(),
                "listing page fetched"
            );
            targets.extend(found);
            tokio::time::sleep(self.config.delay).await;
        }
        Ok(targets)
    }

    async fn fetch(&self, url: &str, via_proxy: bool) -> Result<String, DiscoveryError> {
        self.client
            .get(url, via_proxy)
            .await
            .map_err(|source| DiscoveryError::Fetch {
                url: url.to_string(),
                source,
            })
    }
}
