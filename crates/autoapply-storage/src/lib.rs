//! Rate budget, HTTP fetch utilities and the durable store for AutoApply.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use autoapply_core::{
    Application, ApplicationStatus, ApplicationTransition, AtsKind, Company, CompanyCount,
    NewCompany, NewPosting, Posting, RateBudgetStatus, StatusCount,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "autoapply-storage";

#[derive(Debug, Clone, Copy)]
pub struct RateBudgetConfig {
    pub capacity: u32,
    pub refill_window: Duration,
}

impl Default for RateBudgetConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            refill_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Process-wide token bucket shared by every outbound provider operation.
///
/// Refill is computed lazily on each call; there is no background timer.
/// Check-and-debit happens under one lock, so concurrent callers can never
/// overdraw the bucket.
#[derive(Debug)]
pub struct RateBudget {
    capacity: u32,
    refill_window: Duration,
    state: Mutex<RateBudgetState>,
}

#[derive(Debug, Clone, Copy)]
struct RateBudgetState {
    tokens: f64,
    last_refill: Instant,
}

impl RateBudget {
    pub fn new(config: RateBudgetConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_window: config.refill_window,
            state: Mutex::new(RateBudgetState {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn refill(&self, state: &mut RateBudgetState) {
        let now = Instant::now();
        let capacity = f64::from(self.capacity);
        if self.refill_window.is_zero() {
            state.tokens = capacity;
        } else {
            let elapsed = now.saturating_duration_since(state.last_refill);
            let earned =
                elapsed.as_secs_f64() * capacity / self.refill_window.as_secs_f64();
            state.tokens = (state.tokens + earned).min(capacity);
        }
        state.last_refill = now;
    }

    /// Debits `n` tokens if and only if at least `n` are available.
    pub async fn try_consume(&self, n: u32) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        let wanted = f64::from(n);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    pub async fn status(&self) -> RateBudgetStatus {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        RateBudgetStatus {
            capacity: self.capacity,
            available_tokens: state.tokens.max(0.0).floor() as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0;
            loop {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(url).await?.text())
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error("applications cannot transition back to {0}")]
    InvalidTransition(ApplicationStatus),
}

/// Repository the pipeline reads and writes companies, postings and applications through.
///
/// Relationships are resolved by id lookup only. Both inserts are
/// insert-if-absent so repeated ingestion and materialization stay idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Insert-or-ignore keyed by `(domain, ats)`. Returns whether a row was created.
    async fn upsert_company(&self, company: &NewCompany) -> Result<bool, StoreError>;

    async fn companies_missing_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError>;

    async fn companies_with_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError>;

    async fn set_company_handle(
        &self,
        company_id: i64,
        handle: &str,
        confidence: f64,
    ) -> Result<(), StoreError>;

    /// Insert keyed by canonical URL. Returns `false` when the URL is already known.
    async fn insert_posting_if_absent(&self, posting: &NewPosting) -> Result<bool, StoreError>;

    async fn get_posting(&self, posting_id: i64) -> Result<Option<Posting>, StoreError>;

    /// Creates one queued application for every posting of `ats` that has none.
    async fn materialize_applications(&self, ats: AtsKind) -> Result<u64, StoreError>;

    /// Queued applications for `ats` in creation order.
    async fn queued_applications(
        &self,
        ats: AtsKind,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError>;

    async fn get_application(&self, application_id: i64)
        -> Result<Option<Application>, StoreError>;

    /// Applies `transition` only while the application is still queued.
    /// Returns `false` when the row was already moved on.
    async fn record_transition(
        &self,
        application_id: i64,
        transition: &ApplicationTransition,
    ) -> Result<bool, StoreError>;

    /// Most recently updated first.
    async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError>;

    async fn company_counts(&self) -> Result<Vec<CompanyCount>, StoreError>;

    async fn missing_handle_count(&self) -> Result<u64, StoreError>;

    async fn application_counts(&self) -> Result<Vec<StatusCount>, StoreError>;
}

fn guard_transition(transition: &ApplicationTransition) -> Result<(), StoreError> {
    if transition.status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition(transition.status))
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    companies: Vec<Company>,
    postings: Vec<Posting>,
    applications: Vec<Application>,
}

/// In-process store with the same semantics as [`SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn postings(&self) -> Vec<Posting> {
        self.tables.lock().await.postings.clone()
    }

    pub async fn companies(&self) -> Vec<Company> {
        self.tables.lock().await.companies.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_company(&self, company: &NewCompany) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .companies
            .iter()
            .any(|c| c.domain == company.domain && c.ats == company.ats)
        {
            return Ok(false);
        }
        let id = tables.companies.len() as i64 + 1;
        tables.companies.push(Company {
            id,
            name: company.name.clone(),
            domain: company.domain.clone(),
            country_code: company.country_code.clone(),
            ats: company.ats,
            handle: None,
            handle_confidence: 0.0,
        });
        Ok(true)
    }

    async fn companies_missing_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .companies
            .iter()
            .filter(|c| c.ats == ats && c.board_handle().is_none())
            .cloned()
            .collect())
    }

    async fn companies_with_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .companies
            .iter()
            .filter(|c| c.ats == ats && c.board_handle().is_some())
            .cloned()
            .collect())
    }

    async fn set_company_handle(
        &self,
        company_id: i64,
        handle: &str,
        confidence: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(company) = tables.companies.iter_mut().find(|c| c.id == company_id) {
            company.handle = Some(handle.to_string());
            company.handle_confidence = confidence;
        }
        Ok(())
    }

    async fn insert_posting_if_absent(&self, posting: &NewPosting) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.postings.iter().any(|p| p.url == posting.url) {
            return Ok(false);
        }
        let id = tables.postings.len() as i64 + 1;
        tables.postings.push(Posting {
            id,
            company_id: posting.company_id,
            ats: posting.ats,
            external_id: posting.external_id.clone(),
            title: posting.title.clone(),
            location: posting.location.clone(),
            remote: posting.remote,
            url: posting.url.clone(),
            apply_url: posting.apply_url.clone(),
            posted_at: posting.posted_at,
            raw: posting.raw.clone(),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn get_posting(&self, posting_id: i64) -> Result<Option<Posting>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.postings.iter().find(|p| p.id == posting_id).cloned())
    }

    async fn materialize_applications(&self, ats: AtsKind) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let pending: Vec<i64> = tables
            .postings
            .iter()
            .filter(|p| p.ats == ats)
            .filter(|p| !tables.applications.iter().any(|a| a.posting_id == p.id))
            .map(|p| p.id)
            .collect();
        let now = Utc::now();
        for posting_id in &pending {
            let id = tables.applications.len() as i64 + 1;
            tables.applications.push(Application {
                id,
                posting_id: *posting_id,
                status: ApplicationStatus::Queued,
                reason: String::new(),
                result: None,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(pending.len() as u64)
    }

    async fn queued_applications(
        &self,
        ats: AtsKind,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .applications
            .iter()
            .filter(|a| a.status == ApplicationStatus::Queued)
            .filter(|a| {
                tables
                    .postings
                    .iter()
                    .any(|p| p.id == a.posting_id && p.ats == ats)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_application(
        &self,
        application_id: i64,
    ) -> Result<Option<Application>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .applications
            .iter()
            .find(|a| a.id == application_id)
            .cloned())
    }

    async fn record_transition(
        &self,
        application_id: i64,
        transition: &ApplicationTransition,
    ) -> Result<bool, StoreError> {
        guard_transition(transition)?;
        let mut tables = self.tables.lock().await;
        let Some(app) = tables
            .applications
            .iter_mut()
            .find(|a| a.id == application_id && a.status == ApplicationStatus::Queued)
        else {
            return Ok(false);
        };
        app.status = transition.status;
        app.reason = transition.reason.clone();
        if let Some(result) = &transition.result {
            app.result = Some(result.clone());
        }
        app.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Application> = tables
            .applications
            .iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn company_counts(&self) -> Result<Vec<CompanyCount>, StoreError> {
        let tables = self.tables.lock().await;
        let mut counts = std::collections::BTreeMap::<AtsKind, u64>::new();
        for company in &tables.companies {
            *counts.entry(company.ats).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(ats, count)| CompanyCount { ats, count })
            .collect())
    }

    async fn missing_handle_count(&self) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .companies
            .iter()
            .filter(|c| c.board_handle().is_none())
            .count() as u64)
    }

    async fn application_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let tables = self.tables.lock().await;
        let mut counts = std::collections::BTreeMap::<ApplicationStatus, u64>::new();
        for app in &tables.applications {
            *counts.entry(app.status).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        domain TEXT NOT NULL,
        country_code TEXT NOT NULL DEFAULT 'US',
        ats TEXT NOT NULL,
        handle TEXT,
        handle_confidence REAL NOT NULL DEFAULT 0,
        UNIQUE(domain, ats)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS postings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        company_id INTEGER NOT NULL REFERENCES companies(id),
        ats TEXT NOT NULL,
        external_id TEXT,
        title TEXT,
        location TEXT,
        remote INTEGER,
        url TEXT NOT NULL UNIQUE,
        apply_url TEXT,
        posted_at TEXT,
        raw TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS applications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        posting_id INTEGER NOT NULL UNIQUE REFERENCES postings(id),
        status TEXT NOT NULL CHECK (status IN ('queued', 'submitted', 'blocked', 'failed')),
        reason TEXT NOT NULL DEFAULT '',
        result TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_companies_ats ON companies(ats)",
    "CREATE INDEX IF NOT EXISTS idx_postings_ats ON postings(ats)",
    "CREATE INDEX IF NOT EXISTS idx_applications_status ON applications(status)",
];

const COMPANY_COLUMNS: &str =
    "id, name, domain, country_code, ats, handle, handle_confidence";
const POSTING_COLUMNS: &str = "id, company_id, ats, external_id, title, location, remote, url, \
     apply_url, posted_at, raw, created_at";
const APPLICATION_COLUMNS: &str =
    "a.id, a.posting_id, a.status, a.reason, a.result, a.created_at, a.updated_at";

/// SQLite-backed store (sqlx).
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url`.
    ///
    /// In-memory databases get a single long-lived connection so every query
    /// sees the same schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_ats(value: &str) -> Result<AtsKind, StoreError> {
    value
        .parse()
        .map_err(|e: autoapply_core::UnknownVariant| StoreError::Decode(e.to_string()))
}

fn parse_status(value: &str) -> Result<ApplicationStatus, StoreError> {
    value
        .parse()
        .map_err(|e: autoapply_core::UnknownVariant| StoreError::Decode(e.to_string()))
}

fn company_from_row(row: &SqliteRow) -> Result<Company, StoreError> {
    let ats: String = row.try_get("ats")?;
    Ok(Company {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        domain: row.try_get("domain")?,
        country_code: row.try_get("country_code")?,
        ats: parse_ats(&ats)?,
        handle: row.try_get("handle")?,
        handle_confidence: row.try_get("handle_confidence")?,
    })
}

fn posting_from_row(row: &SqliteRow) -> Result<Posting, StoreError> {
    let ats: String = row.try_get("ats")?;
    let raw: String = row.try_get("raw")?;
    Ok(Posting {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        ats: parse_ats(&ats)?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        remote: row.try_get("remote")?,
        url: row.try_get("url")?,
        apply_url: row.try_get("apply_url")?,
        posted_at: row.try_get::<Option<DateTime<Utc>>, _>("posted_at")?,
        raw: serde_json::from_str(&raw)?,
        created_at: row.try_get("created_at")?,
    })
}

fn application_from_row(row: &SqliteRow) -> Result<Application, StoreError> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(Application {
        id: row.try_get("id")?,
        posting_id: row.try_get("posting_id")?,
        status: parse_status(&status)?,
        reason: row.try_get("reason")?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn count_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl Store for SqliteStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_company(&self, company: &NewCompany) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO companies (name, domain, country_code, ats)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&company.name)
        .bind(&company.domain)
        .bind(&company.country_code)
        .bind(company.ats.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn companies_missing_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies
              WHERE ats = ?1 AND (handle IS NULL OR TRIM(handle) = '')
              ORDER BY id"
        ))
        .bind(ats.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn companies_with_handle(&self, ats: AtsKind) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies
              WHERE ats = ?1 AND handle IS NOT NULL AND TRIM(handle) != ''
              ORDER BY id"
        ))
        .bind(ats.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn set_company_handle(
        &self,
        company_id: i64,
        handle: &str,
        confidence: f64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE companies SET handle = ?1, handle_confidence = ?2 WHERE id = ?3")
            .bind(handle)
            .bind(confidence)
            .bind(company_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_posting_if_absent(&self, posting: &NewPosting) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(&posting.raw)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO postings
                (company_id, ats, external_id, title, location, remote, url, apply_url,
                 posted_at, raw, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(posting.company_id)
        .bind(posting.ats.as_str())
        .bind(&posting.external_id)
        .bind(&posting.title)
        .bind(&posting.location)
        .bind(posting.remote)
        .bind(&posting.url)
        .bind(&posting.apply_url)
        .bind(posting.posted_at)
        .bind(raw)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_posting(&self, posting_id: i64) -> Result<Option<Posting>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE id = ?1"
        ))
        .bind(posting_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn materialize_applications(&self, ats: AtsKind) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO applications (posting_id, status, reason, result, created_at, updated_at)
            SELECT p.id, 'queued', '', NULL, ?1, ?1
              FROM postings p
              LEFT JOIN applications a ON a.posting_id = p.id
             WHERE a.id IS NULL
               AND p.ats = ?2
             ORDER BY p.id
            "#,
        )
        .bind(now)
        .bind(ats.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queued_applications(
        &self,
        ats: AtsKind,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPLICATION_COLUMNS}
               FROM applications a
               JOIN postings p ON p.id = a.posting_id
              WHERE a.status = 'queued' AND p.ats = ?1
              ORDER BY a.id
              LIMIT ?2"
        ))
        .bind(ats.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(application_from_row).collect()
    }

    async fn get_application(
        &self,
        application_id: i64,
    ) -> Result<Option<Application>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications a WHERE a.id = ?1"
        ))
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(application_from_row).transpose()
    }

    async fn record_transition(
        &self,
        application_id: i64,
        transition: &ApplicationTransition,
    ) -> Result<bool, StoreError> {
        guard_transition(transition)?;
        let result_json = transition
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE applications
               SET status = ?1,
                   reason = ?2,
                   result = COALESCE(?3, result),
                   updated_at = ?4
             WHERE id = ?5
               AND status = 'queued'
            "#,
        )
        .bind(transition.status.as_str())
        .bind(&transition.reason)
        .bind(result_json)
        .bind(Utc::now())
        .bind(application_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        limit: usize,
    ) -> Result<Vec<Application>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications a
                      WHERE a.status = ?1
                      ORDER BY a.updated_at DESC, a.id DESC
                      LIMIT ?2"
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {APPLICATION_COLUMNS} FROM applications a
                      ORDER BY a.updated_at DESC, a.id DESC
                      LIMIT ?1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(application_from_row).collect()
    }

    async fn company_counts(&self) -> Result<Vec<CompanyCount>, StoreError> {
        let rows = sqlx::query("SELECT ats, COUNT(*) AS c FROM companies GROUP BY ats ORDER BY ats")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ats: String = row.try_get("ats")?;
            let count: i64 = row.try_get("c")?;
            out.push(CompanyCount {
                ats: parse_ats(&ats)?,
                count: count_to_u64(count),
            });
        }
        out.sort_by_key(|c| c.ats);
        Ok(out)
    }

    async fn missing_handle_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM companies WHERE handle IS NULL OR TRIM(handle) = ''",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count_to_u64(count))
    }

    async fn application_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS c FROM applications GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("c")?;
            out.push(StatusCount {
                status: parse_status(&status)?,
                count: count_to_u64(count),
            });
        }
        out.sort_by_key(|c| c.status);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoapply_core::{SubmitOutcome, BOT_DETECTED_REASON};
    use serde_json::json;
    use tempfile::tempdir;

    fn budget(capacity: u32, window_secs: u64) -> RateBudget {
        RateBudget::new(RateBudgetConfig {
            capacity,
            refill_window: Duration::from_secs(window_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn budget_starts_full_and_never_overdraws() {
        let budget = budget(3, 3600);
        assert_eq!(budget.status().await.available_tokens, 3);
        assert!(budget.try_consume(2).await);
        assert!(!budget.try_consume(2).await);
        assert!(budget.try_consume(1).await);
        assert!(!budget.try_consume(1).await);
        assert_eq!(budget.status().await.available_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refills_linearly_with_elapsed_time() {
        let budget = budget(120, 3600);
        for _ in 0..120 {
            assert!(budget.try_consume(1).await);
        }
        assert!(!budget.try_consume(1).await);

        // One token per 30s at 120/hour.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!budget.try_consume(1).await);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(budget.try_consume(1).await);
        assert!(!budget.try_consume(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refill_is_capped_at_capacity() {
        let budget = budget(5, 60);
        assert!(budget.try_consume(5).await);
        tokio::time::advance(Duration::from_secs(600)).await;
        let status = budget.status().await;
        assert_eq!(status.capacity, 5);
        assert_eq!(status.available_tokens, 5);
        assert!(!budget.try_consume(6).await);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_budget_always_refuses() {
        let budget = budget(0, 3600);
        assert!(!budget.try_consume(1).await);
        tokio::time::advance(Duration::from_secs(7200)).await;
        assert!(!budget.try_consume(1).await);
        assert_eq!(budget.status().await.available_tokens, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    fn acme() -> NewCompany {
        NewCompany::new("Acme", "acme.com", Some("US"), AtsKind::Greenhouse)
    }

    fn posting(company_id: i64, ats: AtsKind, url: &str) -> NewPosting {
        NewPosting {
            company_id,
            ats,
            external_id: Some("42".into()),
            title: Some("Platform Engineer".into()),
            location: Some("Remote - US".into()),
            remote: Some(true),
            url: url.to_string(),
            apply_url: Some(format!("{url}#app")),
            posted_at: None,
            raw: json!({ "absolute_url": url }),
        }
    }

    async fn exercise_store_contract(store: &dyn Store) {
        store.migrate().await.unwrap();

        assert!(store.upsert_company(&acme()).await.unwrap());
        assert!(!store.upsert_company(&acme()).await.unwrap());
        assert!(store
            .upsert_company(&NewCompany::new("Acme", "acme.com", None, AtsKind::Lever))
            .await
            .unwrap());

        let missing = store
            .companies_missing_handle(AtsKind::Greenhouse)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(store.missing_handle_count().await.unwrap(), 2);
        let company = &missing[0];

        store
            .set_company_handle(company.id, "acme", 0.95)
            .await
            .unwrap();
        let with_handle = store.companies_with_handle(AtsKind::Greenhouse).await.unwrap();
        assert_eq!(with_handle.len(), 1);
        assert_eq!(with_handle[0].handle.as_deref(), Some("acme"));
        assert!((with_handle[0].handle_confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(store.missing_handle_count().await.unwrap(), 1);

        let a = posting(company.id, AtsKind::Greenhouse, "https://boards.greenhouse.io/acme/jobs/1");
        let b = posting(company.id, AtsKind::Greenhouse, "https://boards.greenhouse.io/acme/jobs/2");
        assert!(store.insert_posting_if_absent(&a).await.unwrap());
        assert!(!store.insert_posting_if_absent(&a).await.unwrap());
        assert!(store.insert_posting_if_absent(&b).await.unwrap());

        assert_eq!(store.materialize_applications(AtsKind::Greenhouse).await.unwrap(), 2);
        assert_eq!(store.materialize_applications(AtsKind::Greenhouse).await.unwrap(), 0);
        assert_eq!(store.materialize_applications(AtsKind::Lever).await.unwrap(), 0);

        let queued = store.queued_applications(AtsKind::Greenhouse, 8).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued[0].id < queued[1].id);
        assert!(store
            .queued_applications(AtsKind::Lever, 8)
            .await
            .unwrap()
            .is_empty());

        let first_posting = store.get_posting(queued[0].posting_id).await.unwrap().unwrap();
        assert_eq!(first_posting.url, a.url);
        assert_eq!(first_posting.remote, Some(true));
        assert_eq!(first_posting.raw, a.raw);

        let submitted = SubmitOutcome::success().into_transition();
        assert!(store.record_transition(queued[0].id, &submitted).await.unwrap());
        // Terminal rows are never moved again.
        let blocked = SubmitOutcome::failure("captcha").into_transition();
        assert!(!store.record_transition(queued[0].id, &blocked).await.unwrap());
        assert!(store.record_transition(queued[1].id, &blocked).await.unwrap());

        let first = store.get_application(queued[0].id).await.unwrap().unwrap();
        assert_eq!(first.status, ApplicationStatus::Submitted);
        assert_eq!(first.result, Some(json!({ "ok": true })));
        let second = store.get_application(queued[1].id).await.unwrap().unwrap();
        assert_eq!(second.status, ApplicationStatus::Blocked);
        assert_eq!(second.reason, BOT_DETECTED_REASON);

        let requeue = ApplicationTransition {
            status: ApplicationStatus::Queued,
            reason: String::new(),
            result: None,
        };
        assert!(matches!(
            store.record_transition(queued[0].id, &requeue).await,
            Err(StoreError::InvalidTransition(ApplicationStatus::Queued))
        ));

        let counts = store.application_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![
                StatusCount { status: ApplicationStatus::Submitted, count: 1 },
                StatusCount { status: ApplicationStatus::Blocked, count: 1 },
            ]
        );
        let companies = store.company_counts().await.unwrap();
        assert_eq!(
            companies,
            vec![
                CompanyCount { ats: AtsKind::Greenhouse, count: 1 },
                CompanyCount { ats: AtsKind::Lever, count: 1 },
            ]
        );

        let blocked_only = store
            .list_applications(Some(ApplicationStatus::Blocked), 10)
            .await
            .unwrap();
        assert_eq!(blocked_only.len(), 1);
        assert_eq!(store.list_applications(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_honours_store_contract() {
        exercise_store_contract(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_memory_store_honours_store_contract() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        exercise_store_contract(&store).await;
    }

    #[tokio::test]
    async fn sqlite_file_store_persists_between_connections() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("autoapply.db").display());

        let store = SqliteStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store.upsert_company(&acme()).await.unwrap();
        store.pool().close().await;

        let reopened = SqliteStore::connect(&url).await.unwrap();
        reopened.migrate().await.unwrap();
        let missing = reopened
            .companies_missing_handle(AtsKind::Greenhouse)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].domain, "acme.com");
    }
}
