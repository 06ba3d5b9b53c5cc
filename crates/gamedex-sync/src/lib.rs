//! Scrape pipeline: batch scraping, Game Pass availability matching and
//! parquet export, run once per console.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use gamedex_adapters::{extract_game_record, fetch_game_page, ExtractionError};
use gamedex_core::{columns, ExceptionRecord, GameRecord, DEFAULT_GAMEPASS_STATUS};
use gamedex_storage::{
    write_atomic, FetchError, FetchExhaustedError, HttpClientConfig, HttpFetcher, PageFetcher,
    RetryPolicy,
};
use parquet::arrow::ArrowWriter;
use rapidfuzz::distance::indel;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gamedex-sync";

pub const DEFAULT_REFERENCE_URL: &str = "https://docs.google.com/spreadsheet/ccc?key=1kspw-4paT-eE5-mrCrc4R9tg70lH2ZTFrJOUmOtOytg&output=csv";
pub const DEFAULT_MATCH_THRESHOLD: u8 = 60;

/// Where the availability spreadsheet is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSource {
    Url(String),
    File(PathBuf),
}

impl ReferenceSource {
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub console: String,
    pub links_dir: PathBuf,
    pub output_dir: PathBuf,
    pub reference_source: ReferenceSource,
    pub reference_name_column: String,
    pub reference_status_column: String,
    pub retry: RetryPolicy,
    pub match_threshold: u8,
    pub concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    /// Built-in defaults for `console`, ignoring the environment.
    pub fn new(console: impl Into<String>) -> Self {
        Self {
            console: console.into(),
            links_dir: PathBuf::from("./links"),
            output_dir: PathBuf::from("./scraped_data"),
            reference_source: ReferenceSource::Url(DEFAULT_REFERENCE_URL.to_string()),
            reference_name_column: "Game".to_string(),
            reference_status_column: "Status".to_string(),
            retry: RetryPolicy::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            concurrency: 1,
            user_agent: concat!("gamedex/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout_secs: 20,
        }
    }

    pub fn from_env() -> Result<Self> {
        let console = std::env::var("CONSOLE")
            .or_else(|_| std::env::var("console"))
            .context("CONSOLE is not set")?;
        Ok(Self::new(console).with_env_overrides())
    }

    /// Applies every `GAMEDEX_*` variable that is set on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("GAMEDEX_LINKS_DIR") {
            self.links_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("GAMEDEX_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Ok(source) = std::env::var("GAMEDEX_REFERENCE_SOURCE") {
            self.reference_source = ReferenceSource::parse(&source);
        }
        if let Some(attempts) = env_parse("GAMEDEX_MAX_ATTEMPTS") {
            self.retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse("GAMEDEX_RETRY_DELAY_MS") {
            self.retry.delay = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse("GAMEDEX_MATCH_THRESHOLD") {
            self.match_threshold = threshold;
        }
        if let Some(concurrency) = env_parse("GAMEDEX_CONCURRENCY") {
            self.concurrency = concurrency;
        }
        if let Ok(user_agent) = std::env::var("GAMEDEX_USER_AGENT") {
            self.user_agent = user_agent;
        }
        if let Some(secs) = env_parse("GAMEDEX_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs;
        }
        self
    }

    pub fn item_list_path(&self) -> PathBuf {
        self.links_dir.join(format!("{}.txt", self.console))
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}-games.parquet", self.console))
    }

    pub fn exceptions_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}-exceptions.json", self.console))
    }

    fn validate(&self) -> Result<()> {
        let console = self.console.trim();
        if console.is_empty() {
            bail!("console identifier is empty");
        }
        if console.contains(['/', '\\']) || console.contains("..") {
            bail!("console identifier {console:?} is not a plain name");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Reads the newline-delimited item list; blank lines are skipped.
pub async fn read_item_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading item list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchExhaustedError),
    #[error(transparent)]
    Extract(#[from] ExtractionError),
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub records: Vec<GameRecord>,
    pub exceptions: Vec<ExceptionRecord>,
}

/// Runs fetch + extract for every item. A failing item becomes an
/// [`ExceptionRecord`]; it never stops the batch.
pub struct BatchScraper<'a> {
    fetcher: &'a dyn PageFetcher,
    retry: RetryPolicy,
    concurrency: usize,
}

impl<'a> BatchScraper<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            retry,
            concurrency: 1,
        }
    }

    /// Items in flight at once. Results keep input order regardless.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn scrape(&self, urls: &[String]) -> BatchOutcome {
        let total = urls.len();
        let results = stream::iter(urls.iter().enumerate())
            .map(|(index, url)| async move {
                info!(url = %url, item = index + 1, total, "processing game page");
                (url, self.scrape_one(url).await)
            })
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut outcome = BatchOutcome::default();
        for (url, result) in results {
            match result {
                Ok(record) => outcome.records.push(record),
                Err(err) => {
                    warn!(url = %url, error = %err, "game page skipped");
                    outcome.exceptions.push(ExceptionRecord::new(url.as_str(), &err));
                }
            }
        }
        outcome
    }

    pub async fn scrape_one(&self, url: &str) -> Result<GameRecord, ItemError> {
        let document = fetch_game_page(self.fetcher, url, &self.retry).await?;
        Ok(extract_game_record(&document, url)?)
    }
}

#[derive(Debug, Error)]
pub enum ReferenceSourceError {
    #[error("fetching reference source {location}: {error}")]
    Fetch {
        location: String,
        #[source]
        error: FetchError,
    },
    #[error("reading reference file {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("reference csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("reference source has no {0:?} column")]
    MissingColumn(String),
}

/// Index-aligned reference names and their availability statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceAvailabilityTable {
    names: Vec<String>,
    statuses: Vec<String>,
}

impl ReferenceAvailabilityTable {
    pub fn from_pairs<I, N, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        let (names, statuses): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(n, s)| (n.into(), s.into()))
            .unzip();
        Self { names, statuses }
    }

    /// Parses the spreadsheet export: the first line is a preamble, the second
    /// is the header row, and the name/status columns are located by header.
    pub fn from_csv_text(
        text: &str,
        name_column: &str,
        status_column: &str,
    ) -> Result<Self, ReferenceSourceError> {
        let body = text.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(body.as_bytes());

        let headers = reader.headers()?.clone();
        let column = |wanted: &str| {
            headers
                .iter()
                .position(|h| h.trim() == wanted)
                .ok_or_else(|| ReferenceSourceError::MissingColumn(wanted.to_string()))
        };
        let name_idx = column(name_column)?;
        let status_idx = column(status_column)?;

        let mut table = Self::default();
        for row in reader.records() {
            let row = row?;
            let name = row.get(name_idx).map(str::trim).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let status = row
                .get(status_idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_GAMEPASS_STATUS);
            table.names.push(name.to_string());
            table.statuses.push(status.to_string());
        }
        Ok(table)
    }

    pub async fn load(
        source: &ReferenceSource,
        http: &HttpFetcher,
        name_column: &str,
        status_column: &str,
    ) -> Result<Self, ReferenceSourceError> {
        let text = match source {
            ReferenceSource::Url(url) => {
                let body = http
                    .fetch_bytes(url)
                    .await
                    .map_err(|error| ReferenceSourceError::Fetch {
                        location: url.clone(),
                        error,
                    })?;
                String::from_utf8_lossy(&body).into_owned()
            }
            ReferenceSource::File(path) => {
                fs::read_to_string(path)
                    .await
                    .map_err(|error| ReferenceSourceError::Io {
                        path: path.clone(),
                        error,
                    })?
            }
        };
        Self::from_csv_text(&text, name_column, status_column)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Status paired with the first occurrence of `name`.
    pub fn status_for(&self, name: &str) -> Option<&str> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.statuses.get(idx).map(String::as_str)
    }
}

/// Latin-1 supplement characters are removed before tokenizing.
fn is_dropped_latin1(c: char) -> bool {
    ('\u{80}'..='\u{ff}').contains(&c)
}

fn sorted_tokens(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| !is_dropped_latin1(*c))
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    let mut tokens = cleaned.split_whitespace().collect::<Vec<_>>();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Word-order-insensitive similarity on a 0-100 scale: the indel ratio
/// `2 * matches / (len_a + len_b)` over the sorted token strings, rounded half
/// to even. Case and punctuation are ignored; an input that is empty after
/// cleanup scores 0.
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    let a = sorted_tokens(a);
    let b = sorted_tokens(b);
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let similarity = indel::normalized_similarity(a.chars(), b.chars());
    (similarity * 100.0).round_ties_even() as u8
}

pub struct AvailabilityMatcher {
    table: ReferenceAvailabilityTable,
    threshold: u8,
}

impl AvailabilityMatcher {
    pub fn new(table: ReferenceAvailabilityTable, threshold: u8) -> Self {
        Self { table, threshold }
    }

    /// Highest-scoring reference name; the earliest candidate wins ties.
    pub fn best_match(&self, name: &str) -> Option<(&str, u8)> {
        let mut best: Option<(&str, u8)> = None;
        for candidate in self.table.names() {
            let score = token_sort_ratio(name, candidate);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate.as_str(), score));
            }
        }
        best
    }

    pub fn resolve(&self, name: Option<&str>) -> &str {
        let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
            return DEFAULT_GAMEPASS_STATUS;
        };
        match self.best_match(name) {
            Some((matched, score)) if score >= self.threshold => self
                .table
                .status_for(matched)
                .unwrap_or(DEFAULT_GAMEPASS_STATUS),
            _ => DEFAULT_GAMEPASS_STATUS,
        }
    }

    pub fn annotate(&self, records: Vec<GameRecord>) -> Vec<GameRecord> {
        records
            .into_iter()
            .map(|record| {
                let status = self.resolve(Some(record.name.as_str())).to_string();
                record.with_gamepass_status(status)
            })
            .collect()
    }
}

pub fn game_records_schema() -> Schema {
    Schema::new(vec![
        ArrowField::new(columns::NAME, DataType::Utf8, false),
        ArrowField::new(columns::RELEASE_DATE, DataType::Date32, false),
        ArrowField::new(columns::MATURITY_RATING, DataType::Utf8, false),
        ArrowField::new(columns::GENRE, DataType::Utf8, false),
        ArrowField::new(columns::PLATFORM, DataType::Utf8, true),
        ArrowField::new(columns::DEVELOPER, DataType::Utf8, true),
        ArrowField::new(columns::PUBLISHER, DataType::Utf8, false),
        ArrowField::new(columns::META_SCORE, DataType::Int64, true),
        ArrowField::new(columns::CRITIC_REVIEWS_COUNT, DataType::Int64, false),
        ArrowField::new(columns::USER_SCORE, DataType::Float64, true),
        ArrowField::new(columns::USER_RATING_COUNT, DataType::Int64, false),
        ArrowField::new(columns::SUMMARY, DataType::Utf8, true),
        ArrowField::new(columns::IMAGE, DataType::Utf8, false),
        ArrowField::new(columns::GAMEPASS_STATUS, DataType::Utf8, false),
    ])
}

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn game_records_batch(records: &[GameRecord]) -> Result<RecordBatch> {
    fn strings<'a>(records: &'a [GameRecord], f: impl Fn(&'a GameRecord) -> &'a str) -> ArrayRef {
        Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
    }
    fn nullable_strings<'a>(
        records: &'a [GameRecord],
        f: impl Fn(&'a GameRecord) -> Option<&'a str>,
    ) -> ArrayRef {
        Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
    }

    let release_dates = Date32Array::from(
        records
            .iter()
            .map(|r| days_since_epoch(r.release_date))
            .collect::<Vec<_>>(),
    );
    let meta_scores = Int64Array::from(records.iter().map(|r| r.meta_score).collect::<Vec<_>>());
    let critic_counts =
        Int64Array::from(records.iter().map(|r| r.critic_review_count).collect::<Vec<_>>());
    let user_scores = Float64Array::from(records.iter().map(|r| r.user_score).collect::<Vec<_>>());
    let user_counts =
        Int64Array::from(records.iter().map(|r| r.user_rating_count).collect::<Vec<_>>());

    let arrays: Vec<ArrayRef> = vec![
        strings(records, |r| r.name.as_str()),
        Arc::new(release_dates),
        strings(records, |r| r.maturity_rating.as_str()),
        strings(records, |r| r.genre.as_str()),
        nullable_strings(records, |r| r.platform.as_deref()),
        nullable_strings(records, |r| r.developer.as_deref()),
        strings(records, |r| r.publisher.as_str()),
        Arc::new(meta_scores),
        Arc::new(critic_counts),
        Arc::new(user_scores),
        Arc::new(user_counts),
        nullable_strings(records, |r| r.summary.as_deref()),
        strings(records, |r| r.image.as_str()),
        strings(records, |r| r.gamepass_status.as_str()),
    ];

    RecordBatch::try_new(Arc::new(game_records_schema()), arrays)
        .context("building game records batch")
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub console: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: usize,
    pub scraped: usize,
    pub failed: usize,
    pub output_path: String,
    pub output_sha256: String,
    pub exceptions_path: String,
}

pub struct ScrapePipeline {
    config: PipelineConfig,
    http: HttpFetcher,
    pages: Box<dyn PageFetcher>,
}

impl ScrapePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            config,
            pages: Box::new(http.clone()),
            http,
        })
    }

    /// Replaces the page fetcher; the reference source still goes through HTTP
    /// when it is a URL.
    pub fn with_fetcher(mut self, pages: Box<dyn PageFetcher>) -> Self {
        self.pages = pages;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let console = self.config.console.as_str();

        let urls = read_item_list(&self.config.item_list_path()).await?;
        info!(%run_id, console, items = urls.len(), "starting scrape run");

        let outcome = BatchScraper::new(&*self.pages, self.config.retry)
            .with_concurrency(self.config.concurrency)
            .scrape(&urls)
            .await;

        let table = ReferenceAvailabilityTable::load(
            &self.config.reference_source,
            &self.http,
            &self.config.reference_name_column,
            &self.config.reference_status_column,
        )
        .await
        .context("loading availability reference table")?;
        info!(references = table.len(), "availability reference table loaded");
        let records = AvailabilityMatcher::new(table, self.config.match_threshold)
            .annotate(outcome.records);

        let bytes = encode_parquet(&game_records_batch(&records)?)?;
        let diagnostics = serde_json::to_vec_pretty(&outcome.exceptions)
            .context("serializing exception records")?;

        // Parquet last: a failed sidecar write leaves no new output file.
        let exceptions_path = self.config.exceptions_path();
        write_atomic(&exceptions_path, &diagnostics).await?;
        let output_path = self.config.output_path();
        write_atomic(&output_path, &bytes).await?;

        let summary = RunSummary {
            run_id,
            console: console.to_string(),
            started_at,
            finished_at: Utc::now(),
            requested: urls.len(),
            scraped: records.len(),
            failed: outcome.exceptions.len(),
            output_path: output_path.display().to_string(),
            output_sha256: sha256_hex(&bytes),
            exceptions_path: exceptions_path.display().to_string(),
        };
        info!(
            %run_id,
            console,
            requested = summary.requested,
            scraped = summary.scraped,
            failed = summary.failed,
            output = %summary.output_path,
            "scrape run complete"
        );
        Ok(summary)
    }
}

pub async fn run_pipeline_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    ScrapePipeline::new(config)?.run_once().await
}
