//! Provider adapter contracts, the four ATS integrations and board handle discovery.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use autoapply_core::{
    Answers, AtsKind, CandidateProfile, Company, CoverLetterVars, NewPosting, SubmitOutcome,
};
use autoapply_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "autoapply-adapters";

pub const GREENHOUSE_API_BASE: &str = "https://boards-api.greenhouse.io";
pub const LEVER_API_BASE: &str = "https://api.lever.co";
pub const ASHBY_BOARD_BASE: &str = "https://jobs.ashbyhq.com";
pub const SMARTRECRUITERS_CAREERS_BASE: &str = "https://careers.smartrecruiters.com";

const DECLINE_TO_ANSWER: &str = "I do not wish to answer";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected listing payload: {0}")]
    Payload(String),
    #[error("posting has no apply url")]
    MissingApplyUrl,
    #[error("{0}")]
    Message(String),
}

/// Provider-specific posting payload, kept verbatim for submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPosting(pub JsonValue);

impl RawPosting {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    fn lookup(&self, path: &str) -> Option<&JsonValue> {
        let mut cur = &self.0;
        for segment in path.split('.') {
            cur = match segment.parse::<usize>() {
                Ok(index) => cur.get(index)?,
                Err(_) => cur.get(segment)?,
            };
        }
        Some(cur)
    }

    /// First non-empty string (or number, rendered) among dotted `paths`.
    pub fn first_text(&self, paths: &[&str]) -> Option<String> {
        paths.iter().find_map(|path| match self.lookup(path)? {
            JsonValue::String(s) => text_or_none(s),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

impl From<JsonValue> for RawPosting {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Uniform contract implemented once per ATS.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> AtsKind;

    async fn list_postings(&self, handle: &str) -> Result<Vec<RawPosting>, AdapterError>;

    /// `None` when the payload has no canonical URL to deduplicate on.
    fn normalize(&self, company: &Company, raw: &RawPosting) -> Option<NewPosting> {
        normalize_posting(self.kind(), company, raw)
    }

    async fn submit(
        &self,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError>;
}

const EXTERNAL_ID_PATHS: &[&str] = &["id", "job_id"];
const TITLE_PATHS: &[&str] = &["title", "text", "job_title"];
const LOCATION_PATHS: &[&str] = &["location.name", "categories.location", "location"];
const CANONICAL_URL_PATHS: &[&str] = &["absolute_url", "hostedUrl", "url"];
const APPLY_URL_PATHS: &[&str] = &["applyUrl", "absolute_url", "url"];
const POSTED_AT_PATHS: &[&str] = &["updated_at", "postedAt", "createdAt", "posted_at"];

/// Field fallbacks shared by every provider.
pub fn normalize_posting(ats: AtsKind, company: &Company, raw: &RawPosting) -> Option<NewPosting> {
    let url = raw.first_text(CANONICAL_URL_PATHS)?;
    let location = raw.first_text(LOCATION_PATHS);
    Some(NewPosting {
        company_id: company.id,
        ats,
        external_id: raw.first_text(EXTERNAL_ID_PATHS),
        title: raw.first_text(TITLE_PATHS),
        remote: remote_flag(raw, location.as_deref()),
        location,
        apply_url: raw.first_text(APPLY_URL_PATHS),
        posted_at: posted_at(raw),
        raw: raw.as_json().clone(),
        url,
    })
}

fn remote_flag(raw: &RawPosting, location: Option<&str>) -> Option<bool> {
    if let Some(kind) = raw.first_text(&["workplaceType"]) {
        return Some(kind.eq_ignore_ascii_case("remote"));
    }
    match raw.lookup("remote") {
        Some(JsonValue::Bool(b)) => return Some(*b),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => {
            return Some(s.trim().eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("remote"))
        }
        _ => {}
    }
    location
        .filter(|l| l.to_ascii_lowercase().contains("remote"))
        .map(|_| true)
}

fn posted_at(raw: &RawPosting) -> Option<DateTime<Utc>> {
    POSTED_AT_PATHS.iter().find_map(|path| match raw.lookup(path)? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        // Lever reports epoch millis.
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

pub fn parse_greenhouse_jobs(body: &JsonValue) -> Result<Vec<RawPosting>, AdapterError> {
    match body.get("jobs") {
        Some(JsonValue::Array(jobs)) => Ok(jobs.iter().cloned().map(RawPosting).collect()),
        Some(JsonValue::Null) | None => Ok(Vec::new()),
        Some(other) => Err(AdapterError::Payload(format!(
            "greenhouse `jobs` is not an array: {other}"
        ))),
    }
}

pub fn parse_lever_postings(body: &JsonValue) -> Vec<RawPosting> {
    body.as_array()
        .map(|items| items.iter().cloned().map(RawPosting).collect())
        .unwrap_or_default()
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

pub fn parse_ashby_board(html: &str, board_base: &str) -> Result<Vec<RawPosting>, AdapterError> {
    let base = Url::parse(&format!("{}/", board_base.trim_end_matches('/')))
        .map_err(|e| AdapterError::Message(format!("invalid ashby base url: {e}")))?;
    let document = Html::parse_document(html);
    let listing = selector("[data-ashby-job-listing][href]")?;
    Ok(document
        .select(&listing)
        .filter_map(|node| node.value().attr("href"))
        .filter_map(|href| base.join(href.trim_start_matches('/')).ok())
        .map(|url| RawPosting(json!({ "url": url.to_string() })))
        .collect())
}

pub fn parse_smartrecruiters_careers(html: &str) -> Result<Vec<RawPosting>, AdapterError> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    Ok(document
        .select(&links)
        .filter_map(|node| node.value().attr("href"))
        .map(str::trim)
        .filter(|href| href.starts_with("https://jobs.smartrecruiters.com/") && href.contains("/job/"))
        .map(|href| RawPosting(json!({ "url": href })))
        .collect())
}

fn encode_handle(handle: &str) -> String {
    url::form_urlencoded::byte_serialize(handle.trim().as_bytes()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    TextArea,
    Select,
    File,
}

/// One input the driver should fill. Empty `selectors` means match by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub label: String,
    pub selectors: Vec<String>,
    pub kind: FieldKind,
    pub value: String,
}

/// Everything a driver needs to fill and submit one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationForm {
    pub provider: AtsKind,
    pub apply_url: String,
    pub fields: Vec<FormField>,
}

impl ApplicationForm {
    pub fn field(&self, label: &str) -> Option<&FormField> {
        self.fields
            .iter()
            .find(|f| f.label.eq_ignore_ascii_case(label))
    }
}

/// Page interaction seam. A browser-backed driver implements this.
#[async_trait]
pub trait FormDriver: Send + Sync {
    async fn submit_form(&self, form: &ApplicationForm) -> Result<SubmitOutcome, AdapterError>;
}

/// Logs the form and reports success without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunFormDriver;

#[async_trait]
impl FormDriver for DryRunFormDriver {
    async fn submit_form(&self, form: &ApplicationForm) -> Result<SubmitOutcome, AdapterError> {
        let labels: Vec<&str> = form.fields.iter().map(|f| f.label.as_str()).collect();
        info!(
            provider = %form.provider,
            apply_url = %form.apply_url,
            fields = ?labels,
            "dry-run submission"
        );
        Ok(SubmitOutcome::success().with_detail(json!({
            "dry_run": true,
            "apply_url": form.apply_url,
            "fields": form.fields.len(),
        })))
    }
}

#[derive(Debug, Clone, Copy)]
enum ProfileValue {
    FirstName,
    LastName,
    FullName,
    Email,
    Phone,
    LinkedIn,
    Website,
}

impl ProfileValue {
    fn read(self, profile: &CandidateProfile) -> Option<String> {
        match self {
            ProfileValue::FirstName => text_or_none(&profile.first_name),
            ProfileValue::LastName => text_or_none(&profile.last_name),
            ProfileValue::FullName => text_or_none(&profile.full_name()),
            ProfileValue::Email => text_or_none(&profile.email),
            ProfileValue::Phone => profile.phone.as_deref().and_then(text_or_none),
            ProfileValue::LinkedIn => profile.linkedin.as_deref().and_then(text_or_none),
            ProfileValue::Website => profile.website.as_deref().and_then(text_or_none),
        }
    }
}

struct FieldSpec {
    label: &'static str,
    selectors: &'static [&'static str],
    value: ProfileValue,
}

struct FormLayout {
    apply_url_paths: &'static [&'static str],
    fields: &'static [FieldSpec],
    decline_selects: &'static [&'static str],
    resume_selectors: &'static [&'static str],
}

const GENERIC_FILE_INPUT: &[&str] = &[r#"input[type="file"]"#];

const GREENHOUSE_LAYOUT: FormLayout = FormLayout {
    apply_url_paths: &["absolute_url", "hostedUrl", "applyUrl", "url"],
    fields: &[
        FieldSpec {
            label: "First Name",
            selectors: &[r#"input[name="first_name"]"#, "#first_name"],
            value: ProfileValue::FirstName,
        },
        FieldSpec {
            label: "Last Name",
            selectors: &[r#"input[name="last_name"]"#, "#last_name"],
            value: ProfileValue::LastName,
        },
        FieldSpec {
            label: "Email",
            selectors: &[r#"input[name="email"]"#, "#email"],
            value: ProfileValue::Email,
        },
        FieldSpec {
            label: "Phone",
            selectors: &[r#"input[name="phone"]"#, "#phone"],
            value: ProfileValue::Phone,
        },
        FieldSpec {
            label: "LinkedIn",
            selectors: &[r#"input[name*="linkedin"]"#],
            value: ProfileValue::LinkedIn,
        },
        FieldSpec {
            label: "Website",
            selectors: &[r#"input[name*="website"]"#, r#"input[name*="portfolio"]"#],
            value: ProfileValue::Website,
        },
    ],
    decline_selects: &["Gender", "Veteran", "Race|Ethnicity"],
    resume_selectors: &[
        r#"input[type="file"][name*="resume"]"#,
        r#"input[type="file"][id*="resume"]"#,
        r#"input[type="file"]"#,
    ],
};

const LEVER_LAYOUT: FormLayout = FormLayout {
    apply_url_paths: &["applyUrl", "hostedUrl", "url"],
    fields: &[
        FieldSpec {
            label: "Full Name",
            selectors: &[
                r#"input[name="name"]"#,
                r#"input[name="firstName"]"#,
                r#"input[name="first_name"]"#,
            ],
            value: ProfileValue::FullName,
        },
        FieldSpec {
            label: "Email",
            selectors: &[r#"input[name="email"]"#],
            value: ProfileValue::Email,
        },
        FieldSpec {
            label: "Phone",
            selectors: &[r#"input[name="phone"]"#],
            value: ProfileValue::Phone,
        },
        FieldSpec {
            label: "LinkedIn",
            selectors: &[r#"input[name*="linkedin"]"#],
            value: ProfileValue::LinkedIn,
        },
        FieldSpec {
            label: "Website",
            selectors: &[r#"input[name*="website"]"#, r#"input[name*="portfolio"]"#],
            value: ProfileValue::Website,
        },
    ],
    decline_selects: &[],
    resume_selectors: GENERIC_FILE_INPUT,
};

// Ashby and SmartRecruiters forms are matched by visible label.
const ASHBY_LAYOUT: FormLayout = FormLayout {
    apply_url_paths: &["url", "applyUrl"],
    fields: &[
        FieldSpec {
            label: "First Name",
            selectors: &[],
            value: ProfileValue::FirstName,
        },
        FieldSpec {
            label: "Last Name",
            selectors: &[],
            value: ProfileValue::LastName,
        },
        FieldSpec {
            label: "Email",
            selectors: &[],
            value: ProfileValue::Email,
        },
        FieldSpec {
            label: "Phone",
            selectors: &[],
            value: ProfileValue::Phone,
        },
        FieldSpec {
            label: "LinkedIn",
            selectors: &[],
            value: ProfileValue::LinkedIn,
        },
        FieldSpec {
            label: "Website",
            selectors: &[],
            value: ProfileValue::Website,
        },
    ],
    decline_selects: &[],
    resume_selectors: GENERIC_FILE_INPUT,
};

const SMARTRECRUITERS_LAYOUT: FormLayout = FormLayout {
    apply_url_paths: &["url", "applyUrl"],
    fields: &[
        FieldSpec {
            label: "First Name",
            selectors: &[],
            value: ProfileValue::FirstName,
        },
        FieldSpec {
            label: "Last Name",
            selectors: &[],
            value: ProfileValue::LastName,
        },
        FieldSpec {
            label: "Email",
            selectors: &[],
            value: ProfileValue::Email,
        },
        FieldSpec {
            label: "Phone",
            selectors: &[],
            value: ProfileValue::Phone,
        },
        FieldSpec {
            label: "LinkedIn",
            selectors: &[r#"input[placeholder*="LinkedIn" i]"#],
            value: ProfileValue::LinkedIn,
        },
        FieldSpec {
            label: "Website",
            selectors: &[
                r#"input[placeholder*="website" i]"#,
                r#"input[placeholder*="portfolio" i]"#,
            ],
            value: ProfileValue::Website,
        },
    ],
    decline_selects: &[],
    resume_selectors: GENERIC_FILE_INPUT,
};

fn layout_for(kind: AtsKind) -> &'static FormLayout {
    match kind {
        AtsKind::Greenhouse => &GREENHOUSE_LAYOUT,
        AtsKind::Lever => &LEVER_LAYOUT,
        AtsKind::Ashby => &ASHBY_LAYOUT,
        AtsKind::SmartRecruiters => &SMARTRECRUITERS_LAYOUT,
    }
}

fn owned(selectors: &[&str]) -> Vec<String> {
    selectors.iter().map(|s| s.to_string()).collect()
}

/// Builds the provider's form for one posting. Blank profile values are left out.
pub fn build_application_form(
    kind: AtsKind,
    raw: &RawPosting,
    profile: &CandidateProfile,
    answers: &Answers,
    resume: Option<&Path>,
) -> Result<ApplicationForm, AdapterError> {
    let layout = layout_for(kind);
    let apply_url = raw
        .first_text(layout.apply_url_paths)
        .ok_or(AdapterError::MissingApplyUrl)?;

    let mut fields = Vec::new();
    for text_field in layout.fields {
        if let Some(value) = text_field.value.read(profile) {
            fields.push(FormField {
                label: text_field.label.to_string(),
                selectors: owned(text_field.selectors),
                kind: FieldKind::Text,
                value,
            });
        }
    }

    if let Some(path) = resume {
        fields.push(FormField {
            label: "Resume".to_string(),
            selectors: owned(layout.resume_selectors),
            kind: FieldKind::File,
            value: path.display().to_string(),
        });
    }

    for label in layout.decline_selects {
        fields.push(FormField {
            label: label.to_string(),
            selectors: Vec::new(),
            kind: FieldKind::Select,
            value: DECLINE_TO_ANSWER.to_string(),
        });
    }

    for (question, answer) in answers.iter() {
        if let Some(value) = text_or_none(answer) {
            fields.push(FormField {
                label: question.to_string(),
                selectors: Vec::new(),
                kind: FieldKind::Text,
                value,
            });
        }
    }

    let role = raw.first_text(TITLE_PATHS).unwrap_or_default();
    let company = raw
        .first_text(&["company_name", "company"])
        .unwrap_or_default();
    let domain = raw
        .first_text(&["departments.0.name", "categories.team"])
        .unwrap_or_default();
    let vars = CoverLetterVars {
        company: &company,
        domain: &domain,
        role: &role,
        skills: answers.get("skills").unwrap_or_default(),
    };
    if let Some(letter) = profile.render_cover_letter(&vars) {
        fields.push(FormField {
            label: "Cover Letter".to_string(),
            selectors: owned(&[r#"textarea[name*="cover"]"#]),
            kind: FieldKind::TextArea,
            value: letter,
        });
    }

    Ok(ApplicationForm {
        provider: kind,
        apply_url,
        fields,
    })
}

#[derive(Clone)]
struct ProviderContext {
    http: Arc<HttpFetcher>,
    driver: Arc<dyn FormDriver>,
    base_url: String,
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ProviderContext {
    fn new(http: Arc<HttpFetcher>, driver: Arc<dyn FormDriver>, base_url: &str) -> Self {
        Self {
            http,
            driver,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn submit(
        &self,
        kind: AtsKind,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError> {
        let form = build_application_form(kind, raw, profile, answers, resume)?;
        self.driver.submit_form(&form).await
    }
}

macro_rules! provider_constructors {
    ($ty:ident, $default_base:expr) => {
        impl $ty {
            pub fn new(http: Arc<HttpFetcher>, driver: Arc<dyn FormDriver>) -> Self {
                Self::with_base_url(http, driver, $default_base)
            }

            pub fn with_base_url(
                http: Arc<HttpFetcher>,
                driver: Arc<dyn FormDriver>,
                base_url: &str,
            ) -> Self {
                Self {
                    ctx: ProviderContext::new(http, driver, base_url),
                }
            }
        }
    };
}

/// Greenhouse public boards API.
#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    ctx: ProviderContext,
}

provider_constructors!(GreenhouseAdapter, GREENHOUSE_API_BASE);

#[async_trait]
impl ProviderAdapter for GreenhouseAdapter {
    fn kind(&self) -> AtsKind {
        AtsKind::Greenhouse
    }

    async fn list_postings(&self, handle: &str) -> Result<Vec<RawPosting>, AdapterError> {
        let url = format!(
            "{}/v1/boards/{}/jobs?content=true",
            self.ctx.base_url,
            encode_handle(handle)
        );
        let body: JsonValue = self.ctx.http.fetch_json(&url).await?;
        parse_greenhouse_jobs(&body)
    }

    async fn submit(
        &self,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError> {
        self.ctx.submit(self.kind(), raw, profile, answers, resume).await
    }
}

/// Lever postings API (`mode=json`).
#[derive(Debug, Clone)]
pub struct LeverAdapter {
    ctx: ProviderContext,
}

provider_constructors!(LeverAdapter, LEVER_API_BASE);

#[async_trait]
impl ProviderAdapter for LeverAdapter {
    fn kind(&self) -> AtsKind {
        AtsKind::Lever
    }

    async fn list_postings(&self, handle: &str) -> Result<Vec<RawPosting>, AdapterError> {
        let url = format!(
            "{}/v0/postings/{}?mode=json",
            self.ctx.base_url,
            encode_handle(handle)
        );
        let body: JsonValue = self.ctx.http.fetch_json(&url).await?;
        Ok(parse_lever_postings(&body))
    }

    async fn submit(
        &self,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError> {
        self.ctx.submit(self.kind(), raw, profile, answers, resume).await
    }
}

/// Ashby hosted job board, scraped from HTML.
#[derive(Debug, Clone)]
pub struct AshbyAdapter {
    ctx: ProviderContext,
}

provider_constructors!(AshbyAdapter, ASHBY_BOARD_BASE);

#[async_trait]
impl ProviderAdapter for AshbyAdapter {
    fn kind(&self) -> AtsKind {
        AtsKind::Ashby
    }

    async fn list_postings(&self, handle: &str) -> Result<Vec<RawPosting>, AdapterError> {
        let url = format!("{}/{}", self.ctx.base_url, encode_handle(handle));
        let html = self.ctx.http.fetch_text(&url).await?;
        parse_ashby_board(&html, &self.ctx.base_url)
    }

    async fn submit(
        &self,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError> {
        self.ctx.submit(self.kind(), raw, profile, answers, resume).await
    }
}

/// SmartRecruiters careers page, scraped from HTML.
#[derive(Debug, Clone)]
pub struct SmartRecruitersAdapter {
    ctx: ProviderContext,
}

provider_constructors!(SmartRecruitersAdapter, SMARTRECRUITERS_CAREERS_BASE);

#[async_trait]
impl ProviderAdapter for SmartRecruitersAdapter {
    fn kind(&self) -> AtsKind {
        AtsKind::SmartRecruiters
    }

    async fn list_postings(&self, handle: &str) -> Result<Vec<RawPosting>, AdapterError> {
        let url = format!("{}/{}", self.ctx.base_url, encode_handle(handle));
        let html = self.ctx.http.fetch_text(&url).await?;
        parse_smartrecruiters_careers(&html)
    }

    async fn submit(
        &self,
        raw: &RawPosting,
        profile: &CandidateProfile,
        answers: &Answers,
        resume: Option<&Path>,
    ) -> Result<SubmitOutcome, AdapterError> {
        self.ctx.submit(self.kind(), raw, profile, answers, resume).await
    }
}

pub fn adapter_for_kind(
    kind: AtsKind,
    http: Arc<HttpFetcher>,
    driver: Arc<dyn FormDriver>,
) -> Arc<dyn ProviderAdapter> {
    match kind {
        AtsKind::Greenhouse => Arc::new(GreenhouseAdapter::new(http, driver)),
        AtsKind::Lever => Arc::new(LeverAdapter::new(http, driver)),
        AtsKind::Ashby => Arc::new(AshbyAdapter::new(http, driver)),
        AtsKind::SmartRecruiters => Arc::new(SmartRecruitersAdapter::new(http, driver)),
    }
}

/// Static table of adapters keyed by provider kind. Built once, read-only afterwards.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<AtsKind, Arc<dyn ProviderAdapter>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under its own kind, replacing any earlier entry.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn standard(
        kinds: &[AtsKind],
        http: Arc<HttpFetcher>,
        driver: Arc<dyn FormDriver>,
    ) -> Self {
        kinds.iter().fold(Self::new(), |registry, kind| {
            registry.with_adapter(adapter_for_kind(*kind, http.clone(), driver.clone()))
        })
    }

    pub fn get(&self, kind: AtsKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn contains(&self, kind: AtsKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<AtsKind> {
        let mut kinds: Vec<AtsKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub handle: Option<String>,
    pub confidence: f64,
    /// Page the handle was found on.
    pub source_url: Option<String>,
}

impl DiscoveryResult {
    pub fn not_found() -> Self {
        Self {
            handle: None,
            confidence: 0.0,
            source_url: None,
        }
    }

    pub fn found(handle: impl Into<String>, confidence: f64) -> Self {
        Self {
            handle: Some(handle.into()),
            confidence,
            source_url: None,
        }
    }
}

/// Resolves a company's board handle from its domain.
#[async_trait]
pub trait HandleDiscovery: Send + Sync {
    async fn probe(&self, domain: &str, ats: AtsKind) -> Result<DiscoveryResult, AdapterError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub handle: String,
    pub confidence: f64,
}

static RE_GREENHOUSE_BOARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)boards\.greenhouse\.io/([a-z0-9\-_.]+)").unwrap()
});
static RE_GREENHOUSE_EMBED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)greenhouse\.io/embed/job_board\?for=([a-z0-9\-_.]+)").unwrap()
});
static RE_LEVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)jobs\.lever\.co/([a-z0-9\-_.]+)").unwrap());
static RE_ASHBY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)jobs\.ashbyhq\.com/([a-z0-9\-_.]+)").unwrap());
static RE_SMARTRECRUITERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)careers\.smartrecruiters\.com/([a-z0-9\-_.]+)").unwrap()
});

/// Path segments that look like handles but are not.
const GREENHOUSE_SKIP: &[&str] = &["embed"];

struct BoardPattern {
    ats: AtsKind,
    regex: &'static LazyLock<Regex>,
    confidence: f64,
    skip_segments: &'static [&'static str],
}

// Ordered by preference within a provider.
const BOARD_PATTERNS: &[BoardPattern] = &[
    BoardPattern {
        ats: AtsKind::Greenhouse,
        regex: &RE_GREENHOUSE_BOARD,
        confidence: 0.95,
        skip_segments: GREENHOUSE_SKIP,
    },
    BoardPattern {
        ats: AtsKind::Greenhouse,
        regex: &RE_GREENHOUSE_EMBED,
        confidence: 0.85,
        skip_segments: &[],
    },
    BoardPattern {
        ats: AtsKind::Lever,
        regex: &RE_LEVER,
        confidence: 0.9,
        skip_segments: &[],
    },
    BoardPattern {
        ats: AtsKind::Ashby,
        regex: &RE_ASHBY,
        confidence: 0.9,
        skip_segments: &[],
    },
    BoardPattern {
        ats: AtsKind::SmartRecruiters,
        regex: &RE_SMARTRECRUITERS,
        confidence: 0.9,
        skip_segments: &[],
    },
];

/// Scans page markup for a board link of the given provider.
pub fn scan_html(html: &str, ats: AtsKind) -> Option<ScanHit> {
    BOARD_PATTERNS
        .iter()
        .filter(|pattern| pattern.ats == ats)
        .find_map(|pattern| {
            pattern.regex.captures_iter(html).find_map(|cap| {
                let handle = cap[1].trim_end_matches('.');
                if handle.is_empty()
                    || pattern
                        .skip_segments
                        .iter()
                        .any(|skip| handle.eq_ignore_ascii_case(skip))
                {
                    return None;
                }
                Some(ScanHit {
                    handle: handle.to_string(),
                    confidence: pattern.confidence,
                })
            })
        })
}

/// Pages tried, in order, when looking for a careers link.
pub fn candidate_urls(domain: &str) -> Vec<String> {
    let domain = domain.trim().trim_end_matches('/');
    vec![
        format!("https://{domain}"),
        format!("https://www.{domain}"),
        format!("https://{domain}/careers"),
        format!("https://{domain}/jobs"),
        format!("https://{domain}/careers/"),
        format!("https://{domain}/about/careers"),
    ]
}

/// Fetches the company's homepage and careers pages and scans them for a board link.
#[derive(Debug, Clone)]
pub struct HttpHandleDiscovery {
    http: Arc<HttpFetcher>,
}

impl HttpHandleDiscovery {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HandleDiscovery for HttpHandleDiscovery {
    async fn probe(&self, domain: &str, ats: AtsKind) -> Result<DiscoveryResult, AdapterError> {
        for url in candidate_urls(domain) {
            let html = match self.http.fetch_text(&url).await {
                Ok(html) => html,
                Err(err) => {
                    debug!(%url, error = %err, "discovery candidate unavailable");
                    continue;
                }
            };
            if let Some(hit) = scan_html(&html, ats) {
                return Ok(DiscoveryResult {
                    handle: Some(hit.handle),
                    confidence: hit.confidence,
                    source_url: Some(url),
                });
            }
        }
        Ok(DiscoveryResult::not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use autoapply_storage::HttpClientConfig;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_text(provider: &str, file: &str) -> String {
        let path = workspace_root().join("fixtures").join(provider).join(file);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn fixture_json(provider: &str, file: &str) -> JsonValue {
        serde_json::from_str(&fixture_text(provider, file)).expect("parse fixture json")
    }

    fn company(ats: AtsKind) -> Company {
        Company {
            id: 7,
            name: "Acme".into(),
            domain: "acme.com".into(),
            country_code: "US".into(),
            ats,
            handle: Some("acme".into()),
            handle_confidence: 0.95,
        }
    }

    fn profile() -> CandidateProfile {
        CandidateProfile {
            label: "default".into(),
            first_name: "Alex".into(),
            last_name: "Candidate".into(),
            email: "alex@example.com".into(),
            phone: Some("555-0100".into()),
            linkedin: Some("https://linkedin.com/in/alex".into()),
            website: None,
            cover_letter_template: Some("Hello {{company}}, I want the {{role}} role.".into()),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        forms: Mutex<Vec<ApplicationForm>>,
    }

    #[async_trait]
    impl FormDriver for RecordingDriver {
        async fn submit_form(&self, form: &ApplicationForm) -> Result<SubmitOutcome, AdapterError> {
            self.forms.lock().unwrap().push(form.clone());
            Ok(SubmitOutcome::success())
        }
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
    }

    #[test]
    fn greenhouse_fixture_normalizes_jobs() {
        let raws = parse_greenhouse_jobs(&fixture_json("greenhouse", "jobs.json")).unwrap();
        assert_eq!(raws.len(), 2);

        let posting = normalize_posting(AtsKind::Greenhouse, &company(AtsKind::Greenhouse), &raws[0])
            .expect("canonical url");
        assert_eq!(posting.company_id, 7);
        assert_eq!(posting.external_id.as_deref(), Some("4012345"));
        assert_eq!(posting.title.as_deref(), Some("Senior Platform Engineer"));
        assert_eq!(posting.location.as_deref(), Some("Remote - US"));
        assert_eq!(posting.remote, Some(true));
        assert_eq!(posting.url, "https://boards.greenhouse.io/acme/jobs/4012345");
        assert_eq!(posting.apply_url.as_deref(), Some(posting.url.as_str()));
        assert_eq!(
            posting.posted_at.map(|t| t.to_rfc3339()),
            Some("2024-05-01T12:00:00+00:00".to_string())
        );

        let second = normalize_posting(AtsKind::Greenhouse, &company(AtsKind::Greenhouse), &raws[1])
            .unwrap();
        assert_eq!(second.location.as_deref(), Some("San Francisco, CA"));
        assert_eq!(second.remote, None);
    }

    #[test]
    fn greenhouse_payload_without_jobs_is_empty() {
        assert!(parse_greenhouse_jobs(&json!({})).unwrap().is_empty());
        assert!(parse_greenhouse_jobs(&json!({ "jobs": "nope" })).is_err());
    }

    #[test]
    fn lever_fixture_normalizes_postings() {
        let raws = parse_lever_postings(&fixture_json("lever", "postings.json"));
        assert_eq!(raws.len(), 2);
        let posting = normalize_posting(AtsKind::Lever, &company(AtsKind::Lever), &raws[0]).unwrap();
        assert_eq!(posting.title.as_deref(), Some("Backend Engineer"));
        assert_eq!(posting.location.as_deref(), Some("New York, NY"));
        assert_eq!(posting.remote, Some(false));
        assert_eq!(posting.url, "https://jobs.lever.co/acme/5ac21346-8e0c-4494-8e7a-3eb92ff77902");
        assert_eq!(
            posting.apply_url.as_deref(),
            Some("https://jobs.lever.co/acme/5ac21346-8e0c-4494-8e7a-3eb92ff77902/apply")
        );
        assert_eq!(
            posting.posted_at.map(|t| t.timestamp_millis()),
            Some(1_714_564_800_000)
        );

        let remote = normalize_posting(AtsKind::Lever, &company(AtsKind::Lever), &raws[1]).unwrap();
        assert_eq!(remote.remote, Some(true));
        assert!(parse_lever_postings(&json!({ "error": "not found" })).is_empty());
    }

    #[test]
    fn ashby_fixture_yields_absolute_listing_urls() {
        let raws = parse_ashby_board(&fixture_text("ashby", "board.html"), ASHBY_BOARD_BASE).unwrap();
        let urls: Vec<String> = raws
            .iter()
            .filter_map(|r| r.first_text(&["url"]))
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://jobs.ashbyhq.com/acme/0b5f6c1e-1111-4c3e-9d57-1a2b3c4d5e6f".to_string(),
                "https://jobs.ashbyhq.com/acme/7d0e2f3a-2222-4b1c-8e9f-6a5b4c3d2e1f".to_string(),
            ]
        );
    }

    #[test]
    fn smartrecruiters_fixture_keeps_only_job_links() {
        let raws = parse_smartrecruiters_careers(&fixture_text("smartrecruiters", "careers.html")).unwrap();
        let urls: Vec<String> = raws
            .iter()
            .filter_map(|r| r.first_text(&["url"]))
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://jobs.smartrecruiters.com/Acme/job/743999-data-analyst".to_string(),
                "https://jobs.smartrecruiters.com/Acme/job/744001-support-engineer".to_string(),
            ]
        );
    }

    #[test]
    fn raw_posting_without_canonical_url_is_skipped() {
        let raw = RawPosting(json!({ "title": "Ghost role" }));
        assert!(normalize_posting(AtsKind::Lever, &company(AtsKind::Lever), &raw).is_none());
    }

    #[test]
    fn scan_html_matches_each_provider() {
        let html = fixture_text("discovery", "acme-careers.html");
        assert_eq!(
            scan_html(&html, AtsKind::Greenhouse),
            Some(ScanHit {
                handle: "acme".into(),
                confidence: 0.95
            })
        );
        assert_eq!(scan_html(&html, AtsKind::Lever).map(|h| h.handle), Some("acme-labs".into()));
        assert_eq!(scan_html(&html, AtsKind::Ashby), None);

        let sr = r#"<a href="https://careers.smartrecruiters.com/AcmeCorp">Careers</a>"#;
        assert_eq!(
            scan_html(sr, AtsKind::SmartRecruiters),
            Some(ScanHit {
                handle: "AcmeCorp".into(),
                confidence: 0.9
            })
        );
    }

    #[test]
    fn greenhouse_embed_link_is_lower_confidence() {
        let html = fixture_text("discovery", "embed-board.html");
        assert_eq!(
            scan_html(&html, AtsKind::Greenhouse),
            Some(ScanHit {
                handle: "globex".into(),
                confidence: 0.85
            })
        );
    }

    #[test]
    fn candidate_urls_are_tried_in_fixed_order() {
        assert_eq!(
            candidate_urls("acme.com"),
            vec![
                "https://acme.com",
                "https://www.acme.com",
                "https://acme.com/careers",
                "https://acme.com/jobs",
                "https://acme.com/careers/",
                "https://acme.com/about/careers",
            ]
        );
    }

    #[tokio::test]
    async fn greenhouse_submit_builds_form_for_driver() {
        let driver = Arc::new(RecordingDriver::default());
        let adapter = GreenhouseAdapter::new(http(), driver.clone());
        let raws = parse_greenhouse_jobs(&fixture_json("greenhouse", "jobs.json")).unwrap();
        let mut answers = Answers::default();
        answers
            .0
            .insert("Are you authorized to work in the US?".into(), "Yes".into());

        let outcome = adapter
            .submit(&raws[0], &profile(), &answers, Some(Path::new("/resumes/platform.pdf")))
            .await
            .unwrap();
        assert!(outcome.ok);

        let forms = driver.forms.lock().unwrap();
        let form = forms.first().expect("form submitted");
        assert_eq!(form.provider, AtsKind::Greenhouse);
        assert_eq!(form.apply_url, "https://boards.greenhouse.io/acme/jobs/4012345");
        assert_eq!(form.field("First Name").unwrap().value, "Alex");
        assert!(form.field("Website").is_none());
        let resume = form.field("Resume").unwrap();
        assert_eq!(resume.kind, FieldKind::File);
        assert_eq!(resume.value, "/resumes/platform.pdf");
        assert_eq!(form.field("Gender").unwrap().value, DECLINE_TO_ANSWER);
        assert_eq!(
            form.field("Are you authorized to work in the US?").unwrap().value,
            "Yes"
        );
        assert_eq!(
            form.field("Cover Letter").unwrap().value,
            "Hello Acme, I want the Senior Platform Engineer role."
        );
    }

    #[tokio::test]
    async fn lever_submit_uses_full_name_and_apply_url() {
        let driver = Arc::new(RecordingDriver::default());
        let adapter = LeverAdapter::new(http(), driver.clone());
        let raws = parse_lever_postings(&fixture_json("lever", "postings.json"));
        adapter
            .submit(&raws[0], &profile(), &Answers::default(), None)
            .await
            .unwrap();

        let forms = driver.forms.lock().unwrap();
        let form = &forms[0];
        assert!(form.apply_url.ends_with("/apply"));
        assert_eq!(form.field("Full Name").unwrap().value, "Alex Candidate");
        assert!(form.field("Resume").is_none());
        assert!(form.field("Gender").is_none());
    }

    #[tokio::test]
    async fn submit_without_apply_url_is_an_adapter_fault() {
        let adapter = AshbyAdapter::new(http(), Arc::new(DryRunFormDriver));
        let err = adapter
            .submit(&RawPosting(json!({})), &profile(), &Answers::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingApplyUrl));
    }

    #[tokio::test]
    async fn dry_run_driver_reports_success_with_detail() {
        let adapter = SmartRecruitersAdapter::new(http(), Arc::new(DryRunFormDriver));
        let raw = RawPosting(json!({
            "url": "https://jobs.smartrecruiters.com/Acme/job/743999-data-analyst"
        }));
        let outcome = adapter
            .submit(&raw, &profile(), &Answers::default(), None)
            .await
            .unwrap();
        assert!(outcome.ok);
        let detail = outcome.detail.unwrap();
        assert_eq!(detail["dry_run"], json!(true));
        assert_eq!(
            detail["apply_url"],
            json!("https://jobs.smartrecruiters.com/Acme/job/743999-data-analyst")
        );
    }

    #[test]
    fn standard_registry_covers_requested_kinds() {
        let registry = ProviderRegistry::standard(
            &[AtsKind::Lever, AtsKind::Greenhouse],
            http(),
            Arc::new(DryRunFormDriver),
        );
        assert_eq!(registry.kinds(), vec![AtsKind::Greenhouse, AtsKind::Lever]);
        assert_eq!(registry.get(AtsKind::Lever).unwrap().kind(), AtsKind::Lever);
        assert!(registry.get(AtsKind::Ashby).is_none());
        assert!(!registry.contains(AtsKind::SmartRecruiters));
    }
}
