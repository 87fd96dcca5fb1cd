//! Target cache, CSV result sink + HTTP fetch utilities for the harvester.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use harvest_core::{OutputRow, Target, COLUMNS, TARGET_COLUMN};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

/* ---------------- Target cache ---------------- */

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading target cache {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing target cache {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One target identifier per line, UTF-8, overwritten wholesale.
#[derive(Debug, Clone)]
pub struct TargetCache {
    path: PathBuf,
}

impl TargetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached targets in file order, or `None` when no cache exists yet.
    pub async fn load(&self) -> Result<Option<Vec<Target>>, CacheError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(Target::from)
                .collect(),
        ))
    }

    /// Replace the cache via temp-file write and atomic rename.
    pub async fn store(&self, targets: &[Target]) -> Result<(), CacheError> {
        let write_err = |source| CacheError::Write {
            path: self.path.clone(),
            source,
        };
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let body = targets
            .iter()
            .map(Target::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), targets.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err)?;
        file.write_all(body.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/* ---------------- Result sink ---------------- */

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("opening output {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing output {}: {source}", .path.display())]
    Write { path: PathBuf, source: csv::Error },
    #[error("terminating partial row in {}: {source}", .path.display())]
    Terminate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("flushing output {}: {source}", .path.display())]
    Flush {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("reading output {}: {source}", .path.display())]
    Read { path: PathBuf, source: csv::Error },
    #[error("output {} has no URL column", .path.display())]
    MissingTargetColumn { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Empty,
    Terminated,
    Unterminated,
}

/// Append-only CSV output with a fixed column schema.
///
/// The header is written once, on the first append to an empty or missing
/// file. Callers must serialize appends; the sink takes `&mut self` so a single
/// owner holds it.
#[derive(Debug)]
pub struct ResultSink {
    path: PathBuf,
}

impl ResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the existing output so the next append starts a fresh file.
    pub fn discard(&self) -> Result<(), SinkError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SinkError::Open {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// How the existing file ends. A missing file reads as empty.
    fn tail(&self) -> Result<Tail, SinkError> {
        let open_err = |source| SinkError::Open {
            path: self.path.clone(),
            source,
        };
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Tail::Empty),
            Err(source) => return Err(open_err(source)),
        };
        if file.metadata().map_err(open_err)?.len() == 0 {
            return Ok(Tail::Empty);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1)).map_err(open_err)?;
        file.read_exact(&mut last).map_err(open_err)?;
        Ok(if last[0] == b'\n' {
            Tail::Terminated
        } else {
            Tail::Unterminated
        })
    }

    /// Append rows, writing the header first if the file is new. A trailing
    /// row cut short by an earlier crash is terminated before anything else is
    /// written. Returns the number of data rows written.
    pub fn append(&mut self, rows: &[OutputRow]) -> Result<usize, SinkError> {
        let tail = self.tail()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| SinkError::Open {
                path: self.path.clone(),
                source,
            })?;
        if tail == Tail::Unterminated {
            warn!(path = %self.path.display(), "terminating partial trailing row");
            file.write_all(b"\n").map_err(|source| SinkError::Terminate {
                path: self.path.clone(),
                source,
            })?;
        }

        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::NonNumeric)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(file);

        let write_err = |source| SinkError::Write {
            path: self.path.clone(),
            source,
        };
        if tail == Tail::Empty {
            writer.write_record(COLUMNS).map_err(write_err)?;
        }
        for row in rows {
            writer.write_record(row.cells()).map_err(write_err)?;
        }
        writer.flush().map_err(|source| SinkError::Flush {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), rows = rows.len(), "appended output rows");
        Ok(rows.len())
    }
}

/// Targets already present in the output's identifier column. Computed once
/// per run and never re-derived mid-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenTargets(HashSet<Target>);

impl SeenTargets {
    pub fn contains(&self, target: &Target) -> bool {
        self.0.contains(target)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read identifiers from an existing output file; a missing file means
    /// nothing has been seen. Truncated trailing rows still count.
    pub fn read_from(path: &Path) -> Result<Self, SinkError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(SinkError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            return Ok(Self::default());
        }

        let read_err = |source| SinkError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let index = reader
            .headers()
            .map_err(read_err)?
            .iter()
            .position(|h| h == TARGET_COLUMN)
            .ok_or_else(|| SinkError::MissingTargetColumn {
                path: path.to_path_buf(),
            })?;

        let mut seen = HashSet::new();
        for record in reader.records() {
            let record = record.map_err(read_err)?;
            if let Some(value) = record.get(index).map(str::trim) {
                if !value.is_empty() {
                    seen.insert(Target::from(value));
                }
            }
        }
        Ok(Self(seen))
    }
}

impl FromIterator<Target> for SeenTargets {
    fn from_iter<I: IntoIterator<Item = Target>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/* ---------------- Retry backoff ---------------- */

/// Linear backoff between full re-attempts of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts per target, including the first.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(20),
            step: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }

    /// Sleep after the `attempt`-th (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_add(self.step.saturating_mul(factor))
    }
}

/* ---------------- Bulk HTTP client ---------------- */

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            proxy: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET client used for listing retrieval. Holds a direct client and,
/// when configured, a second client routed through the proxy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    proxied: Option<reqwest::Client>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = Self::builder(&config)
            .build()
            .context("building reqwest client")?;

        let proxied = match &config.proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .with_context(|| format!("parsing proxy {proxy}"))?;
                Some(
                    Self::builder(&config)
                        .proxy(proxy)
                        .build()
                        .context("building proxied reqwest client")?,
                )
            }
            None => None,
        };

        Ok(Self { client, proxied })
    }

    fn builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    pub fn has_proxy(&self) -> bool {
        self.proxied.is_some()
    }

    /// GET `url` as text. `via_proxy` routes through the proxy when one is
    /// configured and is ignored otherwise.
    pub async fn get_text(&self, url: &str, via_proxy: bool) -> Result<String, FetchError> {
        let client = match (&self.proxied, via_proxy) {
            (Some(proxied), true) => proxied,
            _ => &self.client,
        };

        async move {
            let resp = client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            Ok::<_, FetchError>(resp.text().await?)
        }
        .instrument(info_span!("http_fetch", url, via_proxy))
        .await
    }
}
