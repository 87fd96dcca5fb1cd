mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::fixture;
use harvest_core::Target;
use harvest_storage::{FetchError, TargetCache};
use harvest_sync::{
    DiscoveryConfig, DiscoveryError, HarvestConfig, HarvestRunner, ListingClient,
    TargetListManager, DEFAULT_INDEX_URL, DEFAULT_LISTING_PATTERN,
};

const LISTING_P1: &str = "https://www.udemy.com/sitemap/instructors.xml?p=1";
const LISTING_P2: &str = "https://www.udemy.com/sitemap/instructors.xml?p=2";

#[derive(Default)]
struct FakeClient {
    pages: HashMap<String, String>,
    requests: Mutex<Vec<(String, bool)>>,
}

impl FakeClient {
    fn sitemap() -> Self {
        let mut pages = HashMap::new();
        pages.insert(DEFAULT_INDEX_URL.to_string(), fixture("sitemap/index.xml"));
        pages.insert(LISTING_P1.to_string(), fixture("sitemap/instructors_p1.xml"));
        pages.insert(
            LISTING_P2.to_string(),
            "<urlset><url><loc>https://www.udemy.com/user/lee-park/</loc></url></urlset>".into(),
        );
        Self {
            pages,
            ..Default::default()
        }
    }

    fn requests(&self) -> Vec<(String, bool)> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl ListingClient for FakeClient {
    async fn get(&self, url: &str, via_proxy: bool) -> Result<String, FetchError> {
        self.requests
            .lock()
            .expect("requests")
            .push((url.to_string(), via_proxy));
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

fn discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        index_url: DEFAULT_INDEX_URL.to_string(),
        listing_pattern: DEFAULT_LISTING_PATTERN.to_string(),
        delay: Duration::from_secs(5),
    }
}

fn manager(client: Arc<FakeClient>, cache: TargetCache) -> TargetListManager {
    TargetListManager::new(client, cache, discovery_config())
}

#[tokio::test(start_paused = true)]
async fn fresh_discovery_walks_listings_and_caches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = TargetCache::new(dir.path().join("urls.txt"));
    let client = Arc::new(FakeClient::sitemap());
    let started = tokio::time::Instant::now();

    let targets = manager(Arc::clone(&client), cache.clone())
        .discover(false)
        .await
        .expect("discover");

    assert_eq!(
        targets,
        vec![
            Target::from("https://www.udemy.com/user/jane-doe/"),
            Target::from("https://www.udemy.com/user/sam-lee/"),
            Target::from("https://www.udemy.com/user/kim-ortiz/"),
            Target::from("https://www.udemy.com/user/lee-park/"),
        ]
    );
    assert_eq!(
        client.requests(),
        vec![
            (DEFAULT_INDEX_URL.to_string(), false),
            (LISTING_P1.to_string(), true),
            (LISTING_P2.to_string(), true),
        ]
    );
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(cache.load().await.expect("load"), Some(targets));
}

#[tokio::test]
async fn cached_list_short_circuits_network() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = TargetCache::new(dir.path().join("urls.txt"));
    let cached = vec![Target::from("https://www.udemy.com/user/cached/")];
    cache.store(&cached).await.expect("store");
    let client = Arc::new(FakeClient::sitemap());

    let targets = manager(Arc::clone(&client), cache)
        .discover(false)
        .await
        .expect("discover");

    assert_eq!(targets, cached);
    assert!(client.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn forced_refresh_replaces_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = TargetCache::new(dir.path().join("urls.txt"));
    cache
        .store(&[Target::from("https://www.udemy.com/user/stale/")])
        .await
        .expect("store");
    let client = Arc::new(FakeClient::sitemap());

    let targets = manager(Arc::clone(&client), cache.clone())
        .discover(true)
        .await
        .expect("discover");

    assert_eq!(targets.len(), 4);
    assert_eq!(cache.load().await.expect("load").map(|t| t.len()), Some(4));
}

#[tokio::test]
async fn index_without_listings_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut client = FakeClient::default();
    client.pages.insert(
        DEFAULT_INDEX_URL.to_string(),
        "<sitemapindex><sitemap><loc>https://www.udemy.com/sitemap/courses.xml</loc></sitemap></sitemapindex>".into(),
    );
    let cache = TargetCache::new(dir.path().join("urls.txt"));

    let err = manager(Arc::new(client), cache.clone())
        .discover(false)
        .await
        .expect_err("no listings");

    assert!(matches!(err, DiscoveryError::NoListings { .. }));
    assert_eq!(cache.load().await.expect("load"), None);
}

#[tokio::test(start_paused = true)]
async fn failed_listing_fetch_surfaces_url() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut client = FakeClient::sitemap();
    client.pages.remove(LISTING_P2);

    let err = manager(Arc::new(client), TargetCache::new(dir.path().join("urls.txt")))
        .discover(false)
        .await
        .expect_err("listing missing");

    match err {
        DiscoveryError::Fetch { url, .. } => assert_eq!(url, LISTING_P2),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn runner_discovers_through_injected_client() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner = HarvestRunner::new(HarvestConfig {
        targets_path: dir.path().join("urls.txt"),
        delay: Duration::ZERO,
        ..HarvestConfig::default()
    })
    .with_listing_client(Arc::new(FakeClient::sitemap()));

    let targets = runner.discover(false).await.expect("discover");
    assert_eq!(targets.len(), 4);
    assert!(dir.path().join("urls.txt").exists());
}
