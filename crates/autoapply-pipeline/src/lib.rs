//! Application pipeline: handle resolution, job ingestion, the application queue and the
//! orchestration loop that drives them for one selected provider.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autoapply_adapters::{
    AdapterError, DryRunFormDriver, FormDriver, HandleDiscovery, HttpHandleDiscovery,
    ProviderAdapter, ProviderRegistry, RawPosting,
};
use autoapply_core::{
    Answers, Application, ApplicationStatus, ApplicationTransition, AtsKind, CandidateProfile,
    Company, CompanyCount, NewCompany, RateBudgetStatus, StatusCount,
};
use autoapply_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, RateBudget, RateBudgetConfig, SqliteStore,
    Store, StoreError,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "autoapply-pipeline";

/// Fault description recorded when a provider call exceeds its time bound.
pub const TIMEOUT_REASON: &str = "timeout";

pub const DRY_RUN_SUBMIT_MODE: &str = "dry-run";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub rate_limit_per_hour: u32,
    pub rate_window: Duration,
    pub budget_backoff: Duration,
    pub cycle_delay: Duration,
    pub drain_batch: usize,
    pub default_ats: AtsKind,
    pub config_dir: PathBuf,
    pub providers_file: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub provider_timeout: Duration,
    pub submit_mode: String,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://autoapply.db".to_string()),
            rate_limit_per_hour: parse_or(&lookup, "RATE_LIMIT_PER_HOUR", 120),
            rate_window: Duration::from_secs(parse_or(&lookup, "RATE_WINDOW_SECS", 3600)),
            budget_backoff: Duration::from_millis(parse_or(
                &lookup,
                "AUTOAPPLY_BUDGET_BACKOFF_MS",
                1200,
            )),
            cycle_delay: Duration::from_millis(parse_or(&lookup, "AUTOAPPLY_CYCLE_DELAY_MS", 4000)),
            drain_batch: parse_or(&lookup, "AUTOAPPLY_DRAIN_BATCH", 8),
            default_ats: parse_or(&lookup, "AUTOAPPLY_DEFAULT_ATS", AtsKind::Greenhouse),
            config_dir: lookup("AUTOAPPLY_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./config")),
            providers_file: lookup("AUTOAPPLY_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./providers.yaml")),
            workspace_root: PathBuf::from("."),
            user_agent: lookup("AUTOAPPLY_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0 AutoApplyBot/0.2".to_string()),
            http_timeout_secs: parse_or(&lookup, "AUTOAPPLY_HTTP_TIMEOUT_SECS", 20),
            http_retries: parse_or(&lookup, "AUTOAPPLY_HTTP_RETRIES", 0),
            provider_timeout: Duration::from_secs(parse_or(
                &lookup,
                "AUTOAPPLY_PROVIDER_TIMEOUT_SECS",
                120,
            )),
            submit_mode: lookup("AUTOAPPLY_SUBMIT_MODE")
                .unwrap_or_else(|| DRY_RUN_SUBMIT_MODE.to_string()),
        }
    }

    pub fn rate_budget(&self) -> RateBudgetConfig {
        RateBudgetConfig {
            capacity: self.rate_limit_per_hour,
            refill_window: self.rate_window,
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            budget_backoff: self.budget_backoff,
            cycle_delay: self.cycle_delay,
            drain_batch: self.drain_batch,
            provider_timeout: self.provider_timeout,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Fixed delays and bounds applied by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub budget_backoff: Duration,
    pub cycle_delay: Duration,
    pub drain_batch: usize,
    pub provider_timeout: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            budget_backoff: Duration::from_millis(1200),
            cycle_delay: Duration::from_millis(4000),
            drain_batch: 8,
            provider_timeout: Duration::from_secs(120),
        }
    }
}

pub fn form_driver_for_mode(mode: &str) -> Result<Arc<dyn FormDriver>> {
    match mode.trim() {
        DRY_RUN_SUBMIT_MODE => Ok(Arc::new(DryRunFormDriver)),
        other => anyhow::bail!("unsupported submit mode `{other}` (expected `{DRY_RUN_SUBMIT_MODE}`)"),
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: AtsKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub companies_csv: Option<PathBuf>,
}

/// `providers.yaml`: which providers are registered and where their company lists live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersFile {
    pub providers: Vec<ProviderConfig>,
}

impl Default for ProvidersFile {
    fn default() -> Self {
        Self {
            providers: AtsKind::ALL
                .into_iter()
                .map(|kind| ProviderConfig {
                    kind,
                    enabled: true,
                    companies_csv: None,
                })
                .collect(),
        }
    }
}

impl ProvidersFile {
    /// A missing file enables every provider with default company list locations.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled_kinds(&self) -> Vec<AtsKind> {
        let mut kinds = Vec::new();
        for provider in self.providers.iter().filter(|p| p.enabled) {
            if !kinds.contains(&provider.kind) {
                kinds.push(provider.kind);
            }
        }
        kinds
    }

    pub fn companies_csv(&self, kind: AtsKind, workspace_root: &Path) -> PathBuf {
        let configured = self
            .providers
            .iter()
            .find(|p| p.kind == kind)
            .and_then(|p| p.companies_csv.clone())
            .unwrap_or_else(|| {
                PathBuf::from("data")
                    .join("companies")
                    .join(format!("{}.csv", kind.as_str()))
            });
        if configured.is_absolute() {
            configured
        } else {
            workspace_root.join(configured)
        }
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn read_optional_json_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        warn!(path = %path.display(), "optional config file missing; using empty defaults");
        return Ok(T::default());
    }
    read_json_file(path)
}

/// Candidate identity and canned answers used for every submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateInputs {
    pub profile: CandidateProfile,
    pub answers: Answers,
}

impl CandidateInputs {
    /// `profile.json` is required; `answers.json` may be absent.
    pub fn load(config_dir: &Path) -> Result<Self> {
        Ok(Self {
            profile: read_json_file(&config_dir.join("profile.json"))?,
            answers: read_optional_json_file(&config_dir.join("answers.json"))?,
        })
    }
}

/// Picks the resume to attach for a posting title.
pub trait ResumeSelector: Send + Sync {
    fn select_resume(&self, title: &str) -> Option<PathBuf>;
}

/// `resume_rules.json`: keyword buckets plus a `_map` from bucket to resume path.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResumeRules {
    #[serde(rename = "_map", default)]
    pub map: BTreeMap<String, PathBuf>,
    #[serde(flatten)]
    pub buckets: BTreeMap<String, Vec<String>>,
}

/// Buckets are checked in name order; only resumes that exist on disk are returned.
#[derive(Debug, Clone, Default)]
pub struct KeywordResumeSelector {
    buckets: BTreeMap<String, Vec<String>>,
    paths: BTreeMap<String, PathBuf>,
}

impl KeywordResumeSelector {
    pub fn new(rules: ResumeRules, base_dir: &Path) -> Self {
        let paths = rules
            .map
            .into_iter()
            .map(|(bucket, path)| {
                let resolved = if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                };
                (bucket, resolved)
            })
            .collect();
        let buckets = rules
            .buckets
            .into_iter()
            .map(|(bucket, keywords)| {
                let keywords = keywords
                    .into_iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (bucket, keywords)
            })
            .collect();
        Self { buckets, paths }
    }

    pub fn load(path: &Path, base_dir: &Path) -> Result<Self> {
        let rules: ResumeRules = read_optional_json_file(path)?;
        Ok(Self::new(rules, base_dir))
    }
}

impl ResumeSelector for KeywordResumeSelector {
    fn select_resume(&self, title: &str) -> Option<PathBuf> {
        let title = title.to_lowercase();
        let matched = self
            .buckets
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| title.contains(k.as_str())))
            .find_map(|(bucket, _)| self.paths.get(bucket).filter(|p| p.exists()));
        matched
            .or_else(|| self.paths.values().find(|p| p.exists()))
            .cloned()
    }
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("company list for {ats} not found at {}", path.display())]
    MissingCsv { ats: AtsKind, path: PathBuf },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid company csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct CompanyRow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    company_domain: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Reads a company list, keeping US rows with a domain.
pub fn read_companies_csv<R: Read>(reader: R, ats: AtsKind) -> Result<Vec<NewCompany>, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut companies = Vec::new();

    for record in csv_reader.deserialize::<CompanyRow>() {
        let row = record?;
        let country = non_blank(&row.country_code)
            .or_else(|| non_blank(&row.country))
            .unwrap_or_default();
        if !country.eq_ignore_ascii_case("US") {
            continue;
        }
        let Some(domain) = non_blank(&row.domain).or_else(|| non_blank(&row.company_domain)) else {
            continue;
        };
        let name = non_blank(&row.name)
            .or_else(|| non_blank(&row.company_name))
            .unwrap_or_default();
        companies.push(NewCompany::new(name, domain, Some("US"), ats));
    }

    Ok(companies)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub ats: AtsKind,
    pub read: usize,
    pub inserted: usize,
}

pub async fn seed_companies(store: &dyn Store, ats: AtsKind, path: &Path) -> Result<SeedReport, SeedError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SeedError::MissingCsv {
                ats,
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(SeedError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let companies = read_companies_csv(bytes.as_slice(), ats)?;
    let mut inserted = 0;
    for company in &companies {
        if store.upsert_company(company).await? {
            inserted += 1;
        }
    }
    info!(%ats, read = companies.len(), inserted, path = %path.display(), "seeded companies");
    Ok(SeedReport {
        ats,
        read: companies.len(),
        inserted,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub attempted: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub companies: usize,
    pub listed: usize,
    pub inserted: usize,
    pub already_known: usize,
    pub skipped_without_url: usize,
    pub failed_companies: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub selected: usize,
    pub submitted: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl DrainReport {
    fn count(&mut self, status: ApplicationStatus) {
        match status {
            ApplicationStatus::Submitted => self.submitted += 1,
            ApplicationStatus::Blocked => self.blocked += 1,
            ApplicationStatus::Failed => self.failed += 1,
            ApplicationStatus::Queued => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub ats: AtsKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resolve: ResolveReport,
    pub ingest: IngestReport,
    pub materialized: u64,
    pub drain: DrainReport,
}

/// Handle Resolver, Job Ingestion and the Application Queue over one store.
pub struct Pipeline {
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    discovery: Arc<dyn HandleDiscovery>,
    resumes: Arc<dyn ResumeSelector>,
    budget: Arc<RateBudget>,
    candidate: CandidateInputs,
    pacing: Pacing,
    providers: ProvidersFile,
    workspace_root: PathBuf,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ProviderRegistry,
        discovery: Arc<dyn HandleDiscovery>,
        budget: Arc<RateBudget>,
        pacing: Pacing,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            discovery,
            resumes: Arc::new(KeywordResumeSelector::default()),
            budget,
            candidate: CandidateInputs::default(),
            pacing,
            providers: ProvidersFile::default(),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn with_candidate(mut self, candidate: CandidateInputs) -> Self {
        self.candidate = candidate;
        self
    }

    pub fn with_resume_selector(mut self, resumes: Arc<dyn ResumeSelector>) -> Self {
        self.resumes = resumes;
        self
    }

    pub fn with_company_lists(mut self, providers: ProvidersFile, workspace_root: PathBuf) -> Self {
        self.providers = providers;
        self.workspace_root = workspace_root;
        self
    }

    /// Wires the SQLite store, HTTP adapters and discovery from configuration.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        store.migrate().await.context("migrating database")?;

        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let providers = ProvidersFile::load(&config.providers_file)?;
        let driver = form_driver_for_mode(&config.submit_mode)?;
        let registry = ProviderRegistry::standard(&providers.enabled_kinds(), http.clone(), driver);
        let candidate = CandidateInputs::load(&config.config_dir)?;
        let resumes = KeywordResumeSelector::load(
            &config.config_dir.join("resume_rules.json"),
            &config.workspace_root,
        )?;

        info!(
            database_url = %config.database_url,
            providers = ?registry.kinds(),
            submit_mode = %config.submit_mode,
            "pipeline configured"
        );

        Ok(Self::new(
            Arc::new(store),
            registry,
            Arc::new(HttpHandleDiscovery::new(http)),
            Arc::new(RateBudget::new(config.rate_budget())),
            config.pacing(),
        )
        .with_candidate(candidate)
        .with_resume_selector(Arc::new(resumes))
        .with_company_lists(providers, config.workspace_root.clone()))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    fn adapter(&self, ats: AtsKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.registry
            .get(ats)
            .with_context(|| format!("no adapter registered for {ats}"))
    }

    /// Debits one unit, or waits out the fixed backoff when the budget is empty.
    /// The caller proceeds either way.
    async fn pace(&self) {
        if self.budget.try_consume(1).await {
            return;
        }
        debug!(backoff_ms = self.pacing.budget_backoff.as_millis() as u64, "rate budget exhausted; backing off");
        tokio::time::sleep(self.pacing.budget_backoff).await;
    }

    /// Profile-level resume, used when no keyword rule applies.
    fn profile_resume(&self) -> Option<PathBuf> {
        let path = self.candidate.profile.resume_path.as_ref()?;
        let path = if path.is_absolute() {
            path.clone()
        } else {
            self.workspace_root.join(path)
        };
        path.exists().then_some(path)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, AdapterError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        match tokio::time::timeout(self.pacing.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Message(TIMEOUT_REASON.to_string())),
        }
    }

    pub async fn seed(&self, ats: AtsKind) -> Result<SeedReport, SeedError> {
        let path = self.providers.companies_csv(ats, &self.workspace_root);
        seed_companies(self.store.as_ref(), ats, &path).await
    }

    /// Probes every company of `ats` that still lacks a handle.
    pub async fn resolve_handles(&self, ats: AtsKind) -> Result<ResolveReport> {
        let companies = self.store.companies_missing_handle(ats).await?;
        let mut report = ResolveReport::default();

        for company in companies {
            report.attempted += 1;
            self.pace().await;
            match self.bounded(self.discovery.probe(&company.domain, ats)).await {
                Ok(found) => {
                    let handle = found
                        .handle
                        .as_deref()
                        .map(str::trim)
                        .filter(|h| !h.is_empty());
                    match handle {
                        Some(handle) => {
                            self.store
                                .set_company_handle(company.id, handle, found.confidence)
                                .await?;
                            info!(
                                company = %company.name,
                                domain = %company.domain,
                                handle,
                                confidence = found.confidence,
                                "resolved board handle"
                            );
                            report.resolved += 1;
                        }
                        None => {
                            debug!(domain = %company.domain, "no board handle found");
                            report.unresolved += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(domain = %company.domain, error = %err, "handle discovery failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Lists postings for every company of `ats` with a handle. A failing company is skipped.
    pub async fn ingest(&self, ats: AtsKind) -> Result<IngestReport> {
        let adapter = self.adapter(ats)?;
        let companies = self.store.companies_with_handle(ats).await?;
        let mut report = IngestReport::default();

        for company in companies {
            let Some(handle) = company.board_handle() else {
                continue;
            };
            report.companies += 1;
            self.pace().await;
            let raws = match self.bounded(adapter.list_postings(handle)).await {
                Ok(raws) => raws,
                Err(err) => {
                    warn!(company = %company.name, domain = %company.domain, handle, error = %err, "listing postings failed");
                    report.failed_companies += 1;
                    continue;
                }
            };
            self.store_postings(adapter.as_ref(), &company, &raws, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn store_postings(
        &self,
        adapter: &dyn ProviderAdapter,
        company: &Company,
        raws: &[RawPosting],
        report: &mut IngestReport,
    ) -> Result<()> {
        report.listed += raws.len();
        for raw in raws {
            let Some(posting) = adapter.normalize(company, raw) else {
                debug!(domain = %company.domain, "skipping posting without canonical url");
                report.skipped_without_url += 1;
                continue;
            };
            if self.store.insert_posting_if_absent(&posting).await? {
                report.inserted += 1;
            } else {
                report.already_known += 1;
            }
        }
        Ok(())
    }

    /// Queues one application for every posting of `ats` that has none yet.
    pub async fn materialize(&self, ats: AtsKind) -> Result<u64> {
        let created = self.store.materialize_applications(ats).await?;
        if created > 0 {
            info!(%ats, created, "queued new applications");
        }
        Ok(created)
    }

    /// Submits up to one batch of queued applications, oldest first.
    pub async fn drain(&self, ats: AtsKind) -> Result<DrainReport> {
        let adapter = self.adapter(ats)?;
        let queue = self
            .store
            .queued_applications(ats, self.pacing.drain_batch)
            .await?;
        let mut report = DrainReport {
            selected: queue.len(),
            ..Default::default()
        };

        for application in queue {
            let status = self.process_application(adapter.as_ref(), &application).await?;
            report.count(status);
        }

        Ok(report)
    }

    async fn process_application(
        &self,
        adapter: &dyn ProviderAdapter,
        application: &Application,
    ) -> Result<ApplicationStatus> {
        let transition = match self.store.get_posting(application.posting_id).await? {
            Some(posting) => {
                self.pace().await;
                let resume = self
                    .resumes
                    .select_resume(posting.title.as_deref().unwrap_or_default())
                    .or_else(|| self.profile_resume());
                let raw = RawPosting::new(posting.raw.clone());
                let submission = adapter.submit(
                    &raw,
                    &self.candidate.profile,
                    &self.candidate.answers,
                    resume.as_deref(),
                );
                match self.bounded(submission).await {
                    Ok(outcome) => outcome.into_transition(),
                    Err(err) => ApplicationTransition::fault(err.to_string()),
                }
            }
            None => ApplicationTransition::fault(format!(
                "posting {} not found",
                application.posting_id
            )),
        };

        let applied = self
            .store
            .record_transition(application.id, &transition)
            .await?;
        if applied {
            info!(
                application_id = application.id,
                posting_id = application.posting_id,
                status = %transition.status,
                reason = %transition.reason,
                "application transitioned"
            );
        } else {
            warn!(application_id = application.id, "application left the queue before its outcome was recorded");
        }
        Ok(transition.status)
    }

    /// One full pass: resolve handles, ingest, materialize, drain.
    pub async fn run_cycle(&self, ats: AtsKind) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id, %ats);
        async {
            let started_at = Utc::now();
            let resolve = self.resolve_handles(ats).await.context("resolving handles")?;
            let ingest = self.ingest(ats).await.context("ingesting postings")?;
            let materialized = self.materialize(ats).await.context("materializing applications")?;
            let drain = self.drain(ats).await.context("draining application queue")?;
            let report = CycleReport {
                cycle_id,
                ats,
                started_at,
                finished_at: Utc::now(),
                resolve,
                ingest,
                materialized,
                drain,
            };
            info!(
                resolved = report.resolve.resolved,
                inserted = report.ingest.inserted,
                materialized,
                submitted = report.drain.submitted,
                blocked = report.drain.blocked,
                failed = report.drain.failed,
                "cycle finished"
            );
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("provider {0} is not enabled")]
    ProviderNotEnabled(AtsKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub running: bool,
    pub selected_provider: AtsKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub selected_provider: AtsKind,
    pub rate: RateBudgetStatus,
    pub companies: Vec<CompanyCount>,
    pub missing_handles: u64,
    pub applications: Vec<StatusCount>,
}

#[derive(Debug)]
struct LoopState {
    running: bool,
    selected: AtsKind,
    worker_active: bool,
    /// Survives worker restarts so a stop/start pair cannot shorten the inter-cycle delay.
    last_cycle_finished: Option<Instant>,
}

/// Run/stop flag and selected provider, plus the single background worker they drive.
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    state: Arc<Mutex<LoopState>>,
    wake: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, initial: AtsKind) -> Self {
        Self {
            pipeline,
            state: Arc::new(Mutex::new(LoopState {
                running: false,
                selected: initial,
                worker_active: false,
                last_cycle_finished: None,
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Sets the flag and optionally switches provider. Spawns the worker only if none is alive.
    pub async fn start(&self, ats: Option<AtsKind>) -> Result<ControlState, ControlError> {
        let mut state = self.state.lock().await;
        let selected = ats.unwrap_or(state.selected);
        if !self.pipeline.registry().contains(selected) {
            return Err(ControlError::ProviderNotEnabled(selected));
        }
        state.selected = selected;
        state.running = true;
        if !state.worker_active {
            state.worker_active = true;
            tokio::spawn(run_worker(
                self.pipeline.clone(),
                self.state.clone(),
                self.wake.clone(),
            ));
            info!(ats = %selected, "orchestration started");
        } else {
            info!(ats = %selected, "orchestration already running; provider updated");
        }
        Ok(ControlState {
            running: true,
            selected_provider: selected,
        })
    }

    /// Prevents the next cycle from starting. An in-flight cycle runs to completion.
    pub async fn stop(&self) -> ControlState {
        let mut state = self.state.lock().await;
        state.running = false;
        self.wake.notify_one();
        info!("orchestration stop requested");
        ControlState {
            running: false,
            selected_provider: state.selected,
        }
    }

    pub async fn control_state(&self) -> ControlState {
        let state = self.state.lock().await;
        ControlState {
            running: state.running,
            selected_provider: state.selected,
        }
    }

    pub async fn worker_active(&self) -> bool {
        self.state.lock().await.worker_active
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let control = self.control_state().await;
        let store = self.pipeline.store();
        Ok(PipelineStatus {
            running: control.running,
            selected_provider: control.selected_provider,
            rate: self.pipeline.budget().status().await,
            companies: store.company_counts().await?,
            missing_handles: store.missing_handle_count().await?,
            applications: store.application_counts().await?,
        })
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, state: Arc<Mutex<LoopState>>, wake: Arc<Notify>) {
    let cycle_delay = pipeline.pacing().cycle_delay;
    loop {
        let (ats, resume_at) = {
            let mut state = state.lock().await;
            if !state.running {
                state.worker_active = false;
                break;
            }
            (state.selected, state.last_cycle_finished.map(|at| at + cycle_delay))
        };

        if let Some(deadline) = resume_at.filter(|deadline| *deadline > Instant::now()) {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = wake.notified() => {}
            }
            continue;
        }

        if let Err(err) = pipeline.run_cycle(ats).await {
            error!(%ats, error = ?err, "cycle failed");
        }
        state.lock().await.last_cycle_finished = Some(Instant::now());
    }
    info!("orchestration worker exited");
}
