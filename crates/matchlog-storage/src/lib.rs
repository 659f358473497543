//! Rate-limited HTTP fetch utilities + document sinks for matchlog.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use matchlog_core::{FetchRequest, FetchResult, HttpMethod, MatchDocument};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "matchlog-storage";

/// Header carrying the static API credential.
pub const TOKEN_HEADER: &str = "x-riot-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Success,
    RateLimited,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    if status == StatusCode::OK {
        ResponseDisposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseDisposition::RateLimited
    } else {
        ResponseDisposition::Rejected
    }
}

/// Reads `Retry-After` as whole seconds. HTTP-date values are not used by the remote API.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// What happens to an admission slot while a request sleeps off a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffSlot {
    /// Keep the slot for the whole retry chain.
    #[default]
    Hold,
    /// Give the slot back during the wait and queue for a new one before retrying.
    Release,
}

impl FromStr for BackoffSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hold" => Ok(BackoffSlot::Hold),
            "release" => Ok(BackoffSlot::Release),
            other => Err(format!("unknown backoff slot mode `{other}` (expected hold or release)")),
        }
    }
}

/// 429 handling. Both bounds default to `None`, i.e. retry for as long as the server asks.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_retries: Option<u32>,
    pub max_total_wait: Option<Duration>,
    pub fallback_retry_after: Duration,
    pub slot: BackoffSlot,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            max_total_wait: None,
            fallback_retry_after: Duration::from_secs(120),
            slot: BackoffSlot::Hold,
        }
    }
}

impl RateLimitPolicy {
    /// Whether one more wait of `next` fits after `retries` waits totalling `waited`.
    pub fn allows(&self, retries: u32, waited: Duration, next: Duration) -> bool {
        if let Some(max) = self.max_retries {
            if retries >= max {
                return false;
            }
        }
        if let Some(max) = self.max_total_wait {
            if waited.saturating_add(next) > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_token: Option<String>,
    /// Size of the admission gate: max requests in flight at once.
    pub concurrency: usize,
    /// Courtesy delay held after each decoded (or undecodable) gated response.
    pub pacing: Duration,
    pub rate_limit: RateLimitPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_token: None,
            concurrency: 20,
            pacing: Duration::from_secs(1),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

#[derive(Debug)]
enum Attempt {
    Decoded { status: StatusCode, body: JsonValue },
    Undecodable { status: StatusCode },
    RateLimited { retry_after: Option<Duration> },
    /// Status line arrived but the body could not be read.
    Truncated { status: StatusCode, error: reqwest::Error },
    Transport(reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Gated,
    Direct,
}

/// Shared HTTP client behind a counting admission gate.
///
/// Cloning is cheap; clones share the client, the gate and the cancellation token.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    gate: Arc<Semaphore>,
    concurrency: usize,
    pacing: Duration,
    rate_limit: RateLimitPolicy,
    cancel: CancellationToken,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.api_token {
            let mut value =
                HeaderValue::from_str(token.trim()).context("api token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let concurrency = config.concurrency.max(1);

        Ok(Self {
            client,
            gate: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            pacing: config.pacing,
            rate_limit: config.rate_limit,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// One gated request: acquire a slot, follow the 429 protocol, pace, release.
    pub async fn fetch_json(&self, request: &FetchRequest) -> FetchResult {
        self.run(request, Admission::Gated).await
    }

    /// Ungated request with the same 429 protocol and no pacing. Used for sequential calls.
    pub async fn get_json(&self, request: &FetchRequest) -> FetchResult {
        self.run(request, Admission::Direct).await
    }

    /// Spawns one task per request and gathers exactly one result per request,
    /// in completion order.
    pub async fn fetch_all(&self, run_id: Uuid, requests: Vec<FetchRequest>) -> Vec<FetchResult> {
        let mut outstanding: HashMap<String, usize> = HashMap::new();
        let mut tasks = JoinSet::new();

        for request in requests {
            *outstanding.entry(request.url.clone()).or_default() += 1;
            let fetcher = self.clone();
            let span = info_span!("http_fetch", %run_id, url = %request.url);
            tasks.spawn(async move { fetcher.fetch_json(&request).await }.instrument(span));
        }

        let mut results = Vec::with_capacity(outstanding.values().sum());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(count) = outstanding.get_mut(&result.url) {
                        *count = count.saturating_sub(1);
                    }
                    results.push(result);
                }
                Err(err) => warn!(error = %err, "fetch task did not complete"),
            }
        }

        // Tasks that panicked never reported back; account for them as failures.
        for (url, count) in outstanding {
            for _ in 0..count {
                results.push(FetchResult::failed(url.clone(), None));
            }
        }
        results
    }

    async fn run(&self, request: &FetchRequest, admission: Admission) -> FetchResult {
        let url = request.url.as_str();
        let mut permit: Option<OwnedSemaphorePermit> = None;
        let mut retries = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            if admission == Admission::Gated && permit.is_none() {
                match self.acquire_slot().await {
                    Some(p) => permit = Some(p),
                    None => return FetchResult::failed(url, None),
                }
            }

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FetchResult::failed(url, None),
                attempt = self.attempt(request) => attempt,
            };

            match attempt {
                Attempt::RateLimited { retry_after } => {
                    let wait = retry_after.unwrap_or(self.rate_limit.fallback_retry_after);
                    if !self.rate_limit.allows(retries, waited, wait) {
                        warn!(url, retries, waited_secs = waited.as_secs(), "rate limit retry budget exhausted");
                        return FetchResult::failed(url, Some(StatusCode::TOO_MANY_REQUESTS.as_u16()));
                    }
                    retries += 1;
                    waited += wait;
                    info!(url, wait_secs = wait.as_secs(), retries, "rate limited; waiting");
                    if self.rate_limit.slot == BackoffSlot::Release {
                        permit = None;
                    }
                    if !self.sleep(wait).await {
                        return FetchResult::failed(url, None);
                    }
                }
                Attempt::Decoded { status, body } if classify_status(status) == ResponseDisposition::Success => {
                    if admission == Admission::Gated {
                        self.sleep(self.pacing).await;
                    }
                    return FetchResult::ok(url, status.as_u16(), body);
                }
                Attempt::Decoded { status, .. } => {
                    debug!(url, status = status.as_u16(), "non-OK response");
                    return FetchResult::failed(url, Some(status.as_u16()));
                }
                Attempt::Undecodable { status } => {
                    info!(url, status = status.as_u16(), "response body is not JSON");
                    if admission == Admission::Gated {
                        self.sleep(self.pacing).await;
                    }
                    return FetchResult::failed(url, Some(status.as_u16()));
                }
                Attempt::Truncated { status, error } => {
                    warn!(url, status = status.as_u16(), error = %error, "response body could not be read");
                    return FetchResult::failed(url, Some(status.as_u16()));
                }
                Attempt::Transport(err) => {
                    warn!(url, error = %err, "request failed");
                    return FetchResult::failed(url, None);
                }
            }
        }
    }

    async fn attempt(&self, request: &FetchRequest) -> Attempt {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if let Some(payload) = &request.payload {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(payload.clone());
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => return Attempt::Transport(err),
        };

        let status = resp.status();
        if classify_status(status) == ResponseDisposition::RateLimited {
            return Attempt::RateLimited {
                retry_after: parse_retry_after(resp.headers()),
            };
        }

        let json_content = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(true);
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => return Attempt::Truncated { status, error },
        };
        if !json_content {
            return Attempt::Undecodable { status };
        }
        match serde_json::from_slice::<JsonValue>(&bytes) {
            Ok(body) => Attempt::Decoded { status, body },
            Err(_) => Attempt::Undecodable { status },
        }
    }

    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.gate.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Returns `false` when the wait was cut short by cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("could not connect to document store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("invalid collection name `{0}`: expected letters, digits and underscores")]
    InvalidCollection(String),
    #[error("document store operation failed: {0}")]
    Operation(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub deleted: u64,
    pub inserted: u64,
}

/// Destination collection for normalized documents.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    fn target(&self) -> String;

    async fn delete_all(&self) -> Result<u64, SinkError>;

    async fn insert_many(&self, documents: &[MatchDocument]) -> Result<u64, SinkError>;
}

/// Refresh a collection: delete everything, then bulk insert.
///
/// The two steps are not transactional. A crash in between leaves the collection empty
/// until the next run.
pub async fn load_documents(
    sink: &dyn DocumentSink,
    documents: &[MatchDocument],
) -> Result<LoadReport, SinkError> {
    let started = Instant::now();
    let deleted = sink.delete_all().await?;
    info!(collection = %sink.target(), deleted, "deleted existing documents");

    let inserted = if documents.is_empty() {
        0
    } else {
        sink.insert_many(documents).await?
    };
    info!(
        collection = %sink.target(),
        inserted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "inserted documents"
    );
    Ok(LoadReport { deleted, inserted })
}

pub fn validate_collection_name(name: &str) -> Result<(), SinkError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(SinkError::InvalidCollection(name.to_string()))
    }
}

/// Postgres-backed collection: one JSONB document per row.
#[derive(Debug, Clone)]
pub struct PgDocumentSink {
    pool: PgPool,
    database: String,
    collection: String,
}

impl PgDocumentSink {
    pub async fn connect(database_url: &str, database: &str, collection: &str) -> Result<Self, SinkError> {
        validate_collection_name(collection)?;
        let options = PgConnectOptions::from_str(database_url)
            .map_err(SinkError::Connect)?
            .database(database);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(SinkError::Connect)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{collection}\" (id BIGSERIAL PRIMARY KEY, document JSONB NOT NULL)"
        ))
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }
}

#[async_trait]
impl DocumentSink for PgDocumentSink {
    fn target(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    async fn delete_all(&self) -> Result<u64, SinkError> {
        let done = sqlx::query(&format!("DELETE FROM \"{}\"", self.collection))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn insert_many(&self, documents: &[MatchDocument]) -> Result<u64, SinkError> {
        let batch = JsonValue::Array(documents.iter().cloned().map(JsonValue::Object).collect());
        let done = sqlx::query(&format!(
            "INSERT INTO \"{}\" (document) SELECT value FROM jsonb_array_elements($1)",
            self.collection
        ))
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

/// In-process collection, used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentSink {
    collection: String,
    documents: Arc<Mutex<Vec<MatchDocument>>>,
}

impl MemoryDocumentSink {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Arc::default(),
        }
    }

    pub fn with_documents(collection: impl Into<String>, documents: Vec<MatchDocument>) -> Self {
        Self {
            collection: collection.into(),
            documents: Arc::new(Mutex::new(documents)),
        }
    }

    pub async fn documents(&self) -> Vec<MatchDocument> {
        self.documents.lock().await.clone()
    }
}

#[async_trait]
impl DocumentSink for MemoryDocumentSink {
    fn target(&self) -> String {
        format!("memory.{}", self.collection)
    }

    async fn delete_all(&self) -> Result<u64, SinkError> {
        let mut docs = self.documents.lock().await;
        let deleted = docs.len() as u64;
        docs.clear();
        Ok(deleted)
    }

    async fn insert_many(&self, documents: &[MatchDocument]) -> Result<u64, SinkError> {
        let mut docs = self.documents.lock().await;
        docs.extend(documents.iter().cloned());
        Ok(documents.len() as u64)
    }
}
