//! Core domain model for the instructor harvester: targets, scraped records and
//! the fixed output schema they are flattened into.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Identifier column carried by every output row.
pub const TARGET_COLUMN: &str = "URL";

/// Output column order. Appends always use exactly this schema.
pub const COLUMNS: [&str; 19] = [
    TARGET_COLUMN,
    "Name",
    "What is (s)he an instructor in",
    "Instructor_Photo_URL",
    "Description",
    "Total Learners",
    "Total Reviews",
    "Social Website",
    "Social Youtube",
    "Social Facebook",
    "Social Linkedin",
    "Social Twitter",
    "Course Title",
    "Course URL",
    "Total number of lectures",
    "Total number of reviews",
    "Course Rating",
    "Content Info",
    "Course Price",
];

const SOCIAL_PREFIX: &str = "Social ";

/// One profile page to scrape. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Attributes of the profile owner. Missing selectors leave fields as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub url: Option<Target>,
    pub name: Option<String>,
    pub headline: Option<String>,
    pub photo_url: Option<String>,
    pub description: Option<String>,
    pub total_learners: Option<String>,
    pub total_reviews: Option<String>,
    /// Social link references keyed by platform (`Website`, `Youtube`, ...).
    pub socials: BTreeMap<String, String>,
}

impl ProfileRecord {
    pub fn with_target(mut self, target: &Target) -> Self {
        self.url = Some(target.clone());
        self
    }

    fn field(&self, column: &str) -> Option<&str> {
        match column {
            TARGET_COLUMN => self.url.as_ref().map(Target::as_str),
            "Name" => self.name.as_deref(),
            "What is (s)he an instructor in" => self.headline.as_deref(),
            "Instructor_Photo_URL" => self.photo_url.as_deref(),
            "Description" => self.description.as_deref(),
            "Total Learners" => self.total_learners.as_deref(),
            "Total Reviews" => self.total_reviews.as_deref(),
            other => other
                .strip_prefix(SOCIAL_PREFIX)
                .and_then(|platform| self.socials.get(platform))
                .map(String::as_str),
        }
    }
}

/// One catalog item belonging to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemRecord {
    pub title: Option<String>,
    pub url: Option<String>,
    pub lectures: Option<String>,
    pub reviews: Option<String>,
    pub rating: Option<String>,
    pub content_info: Option<String>,
    pub price: Option<String>,
}

impl ItemRecord {
    fn field(&self, column: &str) -> Option<&str> {
        match column {
            "Course Title" => self.title.as_deref(),
            "Course URL" => self.url.as_deref(),
            "Total number of lectures" => self.lectures.as_deref(),
            "Total number of reviews" => self.reviews.as_deref(),
            "Course Rating" => self.rating.as_deref(),
            "Content Info" => self.content_info.as_deref(),
            "Course Price" => self.price.as_deref(),
            _ => None,
        }
    }
}

/// Flattened union of a profile and one of its items (or the profile alone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub profile: Arc<ProfileRecord>,
    pub item: Option<ItemRecord>,
}

impl OutputRow {
    /// Merge a profile with its items. A profile without items still yields
    /// one row with the item columns left empty.
    pub fn merge(profile: ProfileRecord, items: Vec<ItemRecord>) -> Vec<OutputRow> {
        let profile = Arc::new(profile);
        if items.is_empty() {
            return vec![OutputRow {
                profile,
                item: None,
            }];
        }
        items
            .into_iter()
            .map(|item| OutputRow {
                profile: Arc::clone(&profile),
                item: Some(item),
            })
            .collect()
    }

    pub fn target(&self) -> Option<&Target> {
        self.profile.url.as_ref()
    }

    /// Value for a schema column; item fields win over profile fields.
    pub fn field(&self, column: &str) -> Option<&str> {
        self.item
            .as_ref()
            .and_then(|item| item.field(column))
            .or_else(|| self.profile.field(column))
    }

    /// Cells in [`COLUMNS`] order, empty where the row has no value.
    pub fn cells(&self) -> Vec<&str> {
        COLUMNS
            .iter()
            .map(|column| self.field(column).unwrap_or_default())
            .collect()
    }
}
