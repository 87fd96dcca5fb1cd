//! Page-layout extractors, listing parsers and network-capture mapping.
//!
//! Everything here is pure: it turns page sources, listing documents and
//! captured network traffic into harvester records without touching the
//! network or a browser.

use std::collections::HashMap;

use harvest_core::{ItemRecord, ProfileRecord, Target};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "harvest-adapters";

/// Layout name used when the configuration does not pick one.
pub const DEFAULT_LAYOUT: &str = "v1";

/// URL fragment identifying the paged catalog-items endpoint.
pub const ITEMS_ENDPOINT: &str = "taught-profile-courses";

/// Origin prepended to the relative item URLs in catalog responses.
pub const SITE_ORIGIN: &str = "https://www.udemy.com";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

/// Classification of a rendered profile page before any traversal starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    Available,
    NotFound,
    Private,
}

/// DOM selectors the traversal state machine drives for one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationSelectors {
    /// Matches only an enabled "next page" control.
    pub next_control: &'static str,
    /// Matches the visible item titles used as the traversal fingerprint.
    pub item_titles: &'static str,
}

/// Field extraction for one version of the remote profile layout.
///
/// Missing elements never fail a record: the corresponding field is left empty.
pub trait ProfileExtractor: Send + Sync {
    fn layout(&self) -> &'static str;

    fn pagination(&self) -> PaginationSelectors;

    fn classify(&self, page_source: &str) -> Result<PageStatus, AdapterError>;

    fn parse_profile(&self, page_source: &str) -> Result<ProfileRecord, AdapterError>;
}

pub fn extractor_for_layout(layout: &str) -> Option<Box<dyn ProfileExtractor>> {
    match layout {
        "v1" => Some(Box::new(ProfileLayoutV1)),
        _ => None,
    }
}

/* ---------------- selector helpers ---------------- */

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Text nodes trimmed individually and joined with newlines.
fn joined_text_lines(element: ElementRef<'_>) -> Option<String> {
    let lines = element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Attribute lookup by local name, so `xlink:href` on SVG content matches `href`.
fn attr_by_local_name<'a>(element: ElementRef<'a>, local: &str) -> Option<&'a str> {
    element
        .value()
        .attrs()
        .find(|(name, _)| *name == local)
        .map(|(_, value)| value)
}

/// `youtube` -> `Youtube`, `personal-site` -> `Personal-Site`.
fn title_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut at_word_start = true;
    for ch in word.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

/* ---------------- layout v1 ---------------- */

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileLayoutV1;

impl ProfileLayoutV1 {
    const NAME: &'static str = r#"h1[class*="title-area-module--instructor-name"]"#;
    const HEADLINE: &'static str = r#"h1[class*="title-area-module--instructor-title"]"#;
    const PHOTO: &'static str = r#"img[class*="sidebar-area-module--sidebar-image"]"#;
    const DESCRIPTION: &'static str = r#"div[data-purpose="instructor-description"]"#;
    const STAT_BLOCK: &'static str = r#"div[class*="value-props-module--body"]"#;
    const STAT_LABEL: &'static str = r#"div[class*="value-props-module--label"]"#;
    const STAT_VALUE: &'static str = r#"div[class*="ud-heading-md"]"#;
    const SOCIAL_LINK: &'static str = r#"div[class*="social-links-module--sidebar-social-links"] > a"#;
    const SOCIAL_ICON: &'static str = "svg use";
    const ERROR_GREETING: &'static str = r#"h1[class*="error__greeting"]"#;
    const PRIVATE_CONTAINER: &'static str = r#"div[class*="private-profile--container"]"#;

    fn parse_stats(document: &Html, record: &mut ProfileRecord) -> Result<(), AdapterError> {
        let block_sel = selector(Self::STAT_BLOCK)?;
        let label_sel = selector(Self::STAT_LABEL)?;
        let value_sel = selector(Self::STAT_VALUE)?;

        for block in document.select(&block_sel) {
            let Some(label) = block.select(&label_sel).next().and_then(element_text) else {
                continue;
            };
            let value = block.select(&value_sel).next().and_then(element_text);
            match label.to_lowercase().as_str() {
                "total learners" => record.total_learners = value,
                "reviews" => record.total_reviews = value,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_socials(document: &Html, record: &mut ProfileRecord) -> Result<(), AdapterError> {
        let link_sel = selector(Self::SOCIAL_LINK)?;
        let icon_sel = selector(Self::SOCIAL_ICON)?;

        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href").and_then(|h| text_or_none(h.to_string()))
            else {
                continue;
            };
            let Some(icon) = link
                .select(&icon_sel)
                .next()
                .and_then(|u| attr_by_local_name(u, "href"))
            else {
                continue;
            };
            let platform = title_case(icon.trim_start_matches('#').trim_start_matches("icon-"));
            let platform = if platform == "Link" {
                "Website".to_string()
            } else {
                platform
            };
            record.socials.insert(platform, href);
        }
        Ok(())
    }
}

impl ProfileExtractor for ProfileLayoutV1 {
    fn layout(&self) -> &'static str {
        "v1"
    }

    fn pagination(&self) -> PaginationSelectors {
        PaginationSelectors {
            next_control: r#"a[class*="pagination-module--next"]:not(.ud-btn-disabled)"#,
            item_titles: r#"h3[class*="card-title-module--title"]"#,
        }
    }

    fn classify(&self, page_source: &str) -> Result<PageStatus, AdapterError> {
        let document = Html::parse_document(page_source);

        if let Some(greeting) = select_first_text(&document, Self::ERROR_GREETING)? {
            if greeting.contains("Oops!") {
                return Ok(PageStatus::NotFound);
            }
        }

        let h1 = selector("h1")?;
        let private_heading = document
            .select(&h1)
            .filter_map(element_text)
            .any(|text| text.contains("This profile is private"));
        let private_container = document.select(&selector(Self::PRIVATE_CONTAINER)?).next().is_some();
        if private_heading || private_container {
            return Ok(PageStatus::Private);
        }

        Ok(PageStatus::Available)
    }

    fn parse_profile(&self, page_source: &str) -> Result<ProfileRecord, AdapterError> {
        let document = Html::parse_document(page_source);
        let description = document
            .select(&selector(Self::DESCRIPTION)?)
            .next()
            .and_then(joined_text_lines);

        let mut record = ProfileRecord {
            name: select_first_text(&document, Self::NAME)?,
            headline: select_first_text(&document, Self::HEADLINE)?,
            photo_url: select_first_attr(&document, Self::PHOTO, "src")?,
            description,
            ..Default::default()
        };
        Self::parse_stats(&document, &mut record)?;
        Self::parse_socials(&document, &mut record)?;
        Ok(record)
    }
}

/* ---------------- listing documents ---------------- */

/// `<loc>` values of a sitemap-style listing document, in document order.
pub fn extract_locs(xml: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(xml);
    let sel = selector("loc")?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

/// Listing-page references in the top-level index that match `pattern`.
pub fn listing_refs(index_xml: &str, pattern: &str) -> Result<Vec<String>, AdapterError> {
    Ok(extract_locs(index_xml)?
        .into_iter()
        .filter(|loc| loc.contains(pattern))
        .collect())
}

/// Absolute target references on one listing page.
pub fn target_refs(listing_xml: &str) -> Result<Vec<Target>, AdapterError> {
    Ok(extract_locs(listing_xml)?
        .into_iter()
        .filter(|loc| loc.contains("https:"))
        .map(Target::from)
        .collect())
}

/* ---------------- network capture ---------------- */

/// One observed network response with its body and, when the request carried
/// one, the decoded request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCapture {
    pub url: String,
    pub body: String,
    pub request_payload: Option<JsonValue>,
    pub timestamp: f64,
}

/// A `Network.responseReceived` event whose body has not been fetched yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub request_id: String,
    pub url: String,
    pub timestamp: f64,
}

/// Response events plus request payloads keyed by request id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkLog {
    pub responses: Vec<ResponseEvent>,
    pub payloads: HashMap<String, JsonValue>,
}

impl NetworkLog {
    pub fn payload_for(&self, request_id: &str) -> Option<&JsonValue> {
        self.payloads.get(request_id)
    }
}

/// Accept both `{method, params}` events and driver-style log entries whose
/// `message` field is a JSON string wrapping `{"message": {method, params}}`.
fn normalize_log_entry(entry: &JsonValue) -> Option<JsonValue> {
    match entry.get("message") {
        Some(JsonValue::String(raw)) => serde_json::from_str::<JsonValue>(raw)
            .ok()?
            .get("message")
            .cloned(),
        _ if entry.get("method").is_some() => Some(entry.clone()),
        _ => None,
    }
}

/// Split raw log entries into response events and request payloads.
/// Entries that do not decode are dropped individually.
pub fn correlate_network_events(entries: &[JsonValue]) -> NetworkLog {
    let mut log = NetworkLog::default();

    for entry in entries {
        let Some(event) = normalize_log_entry(entry) else {
            debug!("dropping undecodable log entry");
            continue;
        };
        let method = event.get("method").and_then(JsonValue::as_str).unwrap_or_default();
        let params = event.get("params");
        let request_id = params
            .and_then(|p| p.get("requestId"))
            .and_then(JsonValue::as_str);

        match (method, request_id) {
            ("Network.requestWillBeSent", Some(id)) => {
                let payload = params
                    .and_then(|p| p.pointer("/request/postData"))
                    .and_then(JsonValue::as_str)
                    .and_then(|raw| serde_json::from_str::<JsonValue>(raw).ok());
                if let Some(payload) = payload {
                    log.payloads.insert(id.to_string(), payload);
                }
            }
            ("Network.responseReceived", Some(id)) => {
                let Some(url) = params
                    .and_then(|p| p.pointer("/response/url"))
                    .and_then(JsonValue::as_str)
                else {
                    continue;
                };
                let timestamp = params
                    .and_then(|p| p.get("timestamp"))
                    .and_then(JsonValue::as_f64)
                    .unwrap_or(0.0);
                log.responses.push(ResponseEvent {
                    request_id: id.to_string(),
                    url: url.to_string(),
                    timestamp,
                });
            }
            _ => {}
        }
    }

    log
}

/* ---------------- catalog items ---------------- */

#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    #[serde(default)]
    results: Vec<JsonValue>,
}

fn scalar_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn item_price(element: &JsonValue) -> Option<String> {
    match element.get("price_detail") {
        Some(detail) if detail.as_object().is_some_and(|o| !o.is_empty()) => {
            scalar_string(detail.get("price_string"))
        }
        _ => scalar_string(element.get("price")),
    }
}

fn map_item(element: &JsonValue) -> ItemRecord {
    ItemRecord {
        title: scalar_string(element.get("title")),
        url: scalar_string(element.get("url")).map(|path| format!("{SITE_ORIGIN}{path}")),
        lectures: scalar_string(element.get("num_published_lectures")),
        reviews: scalar_string(element.get("num_reviews")),
        rating: scalar_string(element.get("rating")),
        content_info: scalar_string(element.get("content_info")),
        price: item_price(element),
    }
}

/// Map every catalog-items response in `captures` to item records, in capture
/// order. Repeated captures of the same page are not deduplicated.
pub fn extract_items(captures: &[NetworkCapture]) -> Vec<ItemRecord> {
    let mut items = Vec::new();
    for capture in captures.iter().filter(|c| c.url.contains(ITEMS_ENDPOINT)) {
        match serde_json::from_str::<ItemsEnvelope>(capture.body.trim()) {
            Ok(envelope) => items.extend(envelope.results.iter().map(map_item)),
            Err(err) => warn!(url = %capture.url, error = %err, "skipping malformed catalog response"),
        }
    }
    items
}
