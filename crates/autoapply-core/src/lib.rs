//! Core domain model for the AutoApply pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "autoapply-core";

/// Externally-hosted applicant tracking system a company publishes its board on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtsKind {
    Greenhouse,
    Lever,
    Ashby,
    #[serde(rename = "smartrecruiters")]
    SmartRecruiters,
}

impl AtsKind {
    pub const ALL: [AtsKind; 4] = [
        AtsKind::Greenhouse,
        AtsKind::Lever,
        AtsKind::Ashby,
        AtsKind::SmartRecruiters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AtsKind::Greenhouse => "greenhouse",
            AtsKind::Lever => "lever",
            AtsKind::Ashby => "ashby",
            AtsKind::SmartRecruiters => "smartrecruiters",
        }
    }
}

impl fmt::Display for AtsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for AtsKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        AtsKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownVariant {
                kind: "ats kind",
                value: s.to_string(),
            })
    }
}

/// Company row as loaded from an external company list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCompany {
    pub name: String,
    pub domain: String,
    pub country_code: String,
    pub ats: AtsKind,
}

impl NewCompany {
    /// Name falls back to the domain and the country code to `US`.
    pub fn new(name: &str, domain: &str, country_code: Option<&str>, ats: AtsKind) -> Self {
        let name = if name.trim().is_empty() { domain } else { name };
        Self {
            name: name.trim().to_string(),
            domain: domain.trim().to_ascii_lowercase(),
            country_code: country_code
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or("US")
                .to_ascii_uppercase(),
            ats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub country_code: String,
    pub ats: AtsKind,
    pub handle: Option<String>,
    pub handle_confidence: f64,
}

impl Company {
    /// A company is eligible for ingestion only once it has a non-empty handle.
    pub fn board_handle(&self) -> Option<&str> {
        self.handle.as_deref().map(str::trim).filter(|h| !h.is_empty())
    }
}

/// Normalized posting handed from a provider adapter to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPosting {
    pub company_id: i64,
    pub ats: AtsKind,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    /// Deduplication key.
    pub url: String,
    pub apply_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub company_id: i64,
    pub ats: AtsKind,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub url: String,
    pub apply_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Queued,
    Submitted,
    Blocked,
    Failed,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Queued => "queued",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::Blocked => "blocked",
            ApplicationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApplicationStatus::Queued)
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(ApplicationStatus::Queued),
            "submitted" => Ok(ApplicationStatus::Submitted),
            "blocked" => Ok(ApplicationStatus::Blocked),
            "failed" => Ok(ApplicationStatus::Failed),
            _ => Err(UnknownVariant {
                kind: "application status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub posting_id: i64,
    pub status: ApplicationStatus,
    pub reason: String,
    /// Provider outcome as returned by the adapter; never interpreted here.
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal move applied to a queued application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationTransition {
    pub status: ApplicationStatus,
    pub reason: String,
    /// `None` leaves the stored result untouched.
    pub result: Option<JsonValue>,
}

impl ApplicationTransition {
    /// Submission raised instead of returning an outcome. The stored result is left untouched.
    pub fn fault(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            status: ApplicationStatus::Failed,
            reason: if description.trim().is_empty() {
                UNKNOWN_FAILURE_REASON.to_string()
            } else {
                description
            },
            result: None,
        }
    }
}

/// Reason recorded when a provider reports a captcha or bot challenge.
pub const BOT_DETECTED_REASON: &str = "captcha_or_bot_detected";

/// Reason recorded when a failed outcome carries no error text.
pub const UNKNOWN_FAILURE_REASON: &str = "unknown";

/// Pass/fail outcome reported by a provider submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

impl SubmitOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Case-insensitive match on "captcha", "challenge" or "bot".
    pub fn is_bot_detection(&self) -> bool {
        let Some(error) = self.error.as_deref() else {
            return false;
        };
        let lower = error.to_lowercase();
        ["captcha", "challenge", "bot"]
            .iter()
            .any(|needle| lower.contains(needle))
    }

    /// Maps the outcome onto the application state machine.
    pub fn into_transition(self) -> ApplicationTransition {
        let (status, reason) = if self.ok {
            (ApplicationStatus::Submitted, String::new())
        } else if self.is_bot_detection() {
            (ApplicationStatus::Blocked, BOT_DETECTED_REASON.to_string())
        } else {
            let reason = self
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| UNKNOWN_FAILURE_REASON.to_string());
            (ApplicationStatus::Failed, reason)
        };
        let result = serde_json::to_value(&self).ok();
        ApplicationTransition {
            status,
            reason,
            result,
        }
    }
}

/// Candidate identity bundle used to fill application forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateProfile {
    #[serde(default)]
    pub label: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub resume_path: Option<PathBuf>,
    #[serde(default)]
    pub cover_letter_template: Option<String>,
}

impl CandidateProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Fills `{{company}}`, `{{domain}}`, `{{role}}` and `{{skills}}` placeholders.
    pub fn render_cover_letter(&self, vars: &CoverLetterVars<'_>) -> Option<String> {
        let template = self.cover_letter_template.as_deref()?;
        Some(
            template
                .replace("{{company}}", vars.company)
                .replace("{{domain}}", vars.domain)
                .replace("{{role}}", vars.role)
                .replace("{{skills}}", vars.skills),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoverLetterVars<'a> {
    pub company: &'a str,
    pub domain: &'a str,
    pub role: &'a str,
    pub skills: &'a str,
}

/// Pre-written answers keyed by question label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Answers(pub BTreeMap<String, String>);

impl Answers {
    pub fn get(&self, question: &str) -> Option<&str> {
        self.0.get(question).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudgetStatus {
    pub capacity: u32,
    pub available_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyCount {
    pub ats: AtsKind,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: ApplicationStatus,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ats_kind_round_trips_through_strings() {
        assert_eq!("Greenhouse".parse::<AtsKind>().unwrap(), AtsKind::Greenhouse);
        assert_eq!(
            " smartrecruiters ".parse::<AtsKind>().unwrap(),
            AtsKind::SmartRecruiters
        );
        assert!("workday".parse::<AtsKind>().is_err());
        assert_eq!(
            serde_json::to_value(AtsKind::SmartRecruiters).unwrap(),
            json!("smartrecruiters")
        );
    }

    #[test]
    fn successful_outcome_submits_and_keeps_result() {
        let t = SubmitOutcome::success().into_transition();
        assert_eq!(t.status, ApplicationStatus::Submitted);
        assert_eq!(t.result, Some(json!({"ok": true})));
    }

    #[test]
    fn captcha_text_blocks() {
        let t = SubmitOutcome::failure("Captcha challenge detected").into_transition();
        assert_eq!(t.status, ApplicationStatus::Blocked);
        assert_eq!(t.reason, BOT_DETECTED_REASON);
    }

    #[test]
    fn bot_signature_is_case_insensitive() {
        assert!(SubmitOutcome::failure("Suspected BOT traffic").is_bot_detection());
        assert!(SubmitOutcome::failure("cloudflare Challenge page").is_bot_detection());
        assert!(!SubmitOutcome::failure("element not found").is_bot_detection());
    }

    #[test]
    fn plain_failure_keeps_error_text() {
        let t = SubmitOutcome::failure("element not found").into_transition();
        assert_eq!(t.status, ApplicationStatus::Failed);
        assert_eq!(t.reason, "element not found");
    }

    #[test]
    fn failure_without_error_is_unknown() {
        let outcome = SubmitOutcome {
            ok: false,
            error: None,
            detail: None,
        };
        let t = outcome.into_transition();
        assert_eq!(t.status, ApplicationStatus::Failed);
        assert_eq!(t.reason, UNKNOWN_FAILURE_REASON);
    }

    #[test]
    fn thrown_fault_fails_without_result() {
        let t = ApplicationTransition::fault("timeout");
        assert_eq!(t.status, ApplicationStatus::Failed);
        assert_eq!(t.reason, "timeout");
        assert_eq!(t.result, None);
    }

    #[test]
    fn cover_letter_placeholders_are_filled() {
        let profile = CandidateProfile {
            first_name: "Alex".into(),
            last_name: "Candidate".into(),
            cover_letter_template: Some(
                "I admire {{company}}'s work in {{domain}}. Excited about the {{role}} role.".into(),
            ),
            ..Default::default()
        };
        let letter = profile
            .render_cover_letter(&CoverLetterVars {
                company: "Acme",
                domain: "robotics",
                role: "Platform Engineer",
                skills: "",
            })
            .unwrap();
        assert_eq!(
            letter,
            "I admire Acme's work in robotics. Excited about the Platform Engineer role."
        );
        assert_eq!(profile.full_name(), "Alex Candidate");
    }

    #[test]
    fn new_company_defaults_name_and_country() {
        let c = NewCompany::new("  ", "Acme.COM ", None, AtsKind::Lever);
        assert_eq!(c.name, "Acme.COM");
        assert_eq!(c.domain, "acme.com");
        assert_eq!(c.country_code, "US");
    }

    #[test]
    fn blank_handle_is_not_a_board_handle() {
        let mut company = Company {
            id: 1,
            name: "Acme".into(),
            domain: "acme.com".into(),
            country_code: "US".into(),
            ats: AtsKind::Greenhouse,
            handle: Some("  ".into()),
            handle_confidence: 0.0,
        };
        assert_eq!(company.board_handle(), None);
        company.handle = Some("acme".into());
        assert_eq!(company.board_handle(), Some("acme"));
    }
}
