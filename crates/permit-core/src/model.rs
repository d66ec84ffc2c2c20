//! Records held by the application store and the value types used to query them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest page a listing query may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page size used by the staff dashboard.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Workflow state of an application.
///
/// Nominal flow is `submitted -> under_review -> approved -> ready_for_pickup`,
/// with `rejected` reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Submitted,
    UnderReview,
    Approved,
    ReadyForPickup,
    Rejected,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 5] = [
        Self::Submitted,
        Self::UnderReview,
        Self::Approved,
        Self::ReadyForPickup,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::ReadyForPickup => "ready_for_pickup",
            Self::Rejected => "rejected",
        }
    }

    /// Human-readable form used in notifications ("under review").
    pub fn display_name(&self) -> String {
        self.as_str().replace('_', " ")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReadyForPickup | Self::Rejected)
    }

    /// States reachable from `self` in the nominal flow.
    ///
    /// Informational only: the workflow engine accepts any target status.
    pub fn nominal_successors(&self) -> &'static [ApplicationStatus] {
        match self {
            Self::Submitted => &[Self::UnderReview, Self::Rejected],
            Self::UnderReview => &[Self::Approved, Self::Rejected],
            Self::Approved => &[Self::ReadyForPickup, Self::Rejected],
            Self::ReadyForPickup | Self::Rejected => &[],
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "application status",
                value: s.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Business,
    Building,
    Barangay,
}

impl ApplicationType {
    pub const ALL: [ApplicationType; 3] = [Self::Business, Self::Building, Self::Barangay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Building => "building",
            Self::Barangay => "barangay",
        }
    }

    pub fn reference_prefix(&self) -> &'static str {
        match self {
            Self::Business => "BUS",
            Self::Building => "BLD",
            Self::Barangay => "BRG",
        }
    }
}

impl fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "application type",
                value: s.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            other => Err(ParseEnumError {
                kind: "payment status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub id: Uuid,
    pub full_name: String,
    pub phone: String,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub applicant_id: Uuid,
    #[serde(rename = "type")]
    pub application_type: ApplicationType,
    pub status: ApplicationStatus,
    pub reference_no: String,
    pub fee_amount: f64,
    pub created_at: DateTime<Utc>,
}

/// Applicant fields shown next to an application in listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantContact {
    pub full_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationListing {
    #[serde(flatten)]
    pub application: Application,
    pub applicant: Option<ApplicantContact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub application_id: Uuid,
    pub kind: String,
    pub file_path: String,
    pub uploaded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub amount: f64,
    pub status: PaymentStatus,
    pub external_ref: String,
    pub method: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewApplicant {
    pub full_name: String,
    pub phone: String,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewApplicationRecord {
    pub applicant_id: Uuid,
    pub application_type: ApplicationType,
    pub reference_no: String,
    pub fee_amount: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDocument {
    pub application_id: Uuid,
    pub kind: String,
    pub file_path: String,
    pub uploaded_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewPayment {
    pub application_id: Uuid,
    pub amount: f64,
    pub status: PaymentStatus,
    pub external_ref: String,
    pub method: String,
}

/// Listing filter. All fields are optional and combine with AND.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFilter {
    pub status: Option<ApplicationStatus>,
    /// Case-insensitive substring match on type, id and reference number.
    pub search: Option<String>,
    pub applicant_email: Option<String>,
}

impl ApplicationFilter {
    /// Trimmed, lower-cased search term, or `None` when blank.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, application: &Application, applicant_email: Option<&str>) -> bool {
        if let Some(status) = self.status {
            if application.status != status {
                return false;
            }
        }

        if let Some(ref wanted) = self.applicant_email {
            match applicant_email {
                Some(email) if email.eq_ignore_ascii_case(wanted) => {}
                _ => return false,
            }
        }

        if let Some(term) = self.search_term() {
            let hit = application.application_type.as_str().contains(&term)
                || application.id.to_string().contains(&term)
                || application.reference_no.to_lowercase().contains(&term);
            if !hit {
                return false;
            }
        }

        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    /// Clamp page to >= 1 and page size to `1..=MAX_PAGE_SIZE`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        let size = u64::from(self.page_size.max(1));
        self.total.div_ceil(size).max(1)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub submitted: u64,
    pub under_review: u64,
    pub approved: u64,
    pub ready_for_pickup: u64,
    pub rejected: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ApplicationStatus, n: u64) {
        self.total += n;
        match status {
            ApplicationStatus::Submitted => self.submitted += n,
            ApplicationStatus::UnderReview => self.under_review += n,
            ApplicationStatus::Approved => self.approved += n,
            ApplicationStatus::ReadyForPickup => self.ready_for_pickup += n,
            ApplicationStatus::Rejected => self.rejected += n,
        }
    }
}

/// Row-level change on the applications collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert { new: Application },
    Update { old: Application, new: Application },
    Delete { old: Application },
}

impl ChangeEvent {
    pub fn application_id(&self) -> Uuid {
        match self {
            Self::Insert { new } | Self::Update { new, .. } => new.id,
            Self::Delete { old } => old.id,
        }
    }
}

/// Build a reference number such as `BUS-20261019-4F9A0C`.
pub fn generate_reference_no(application_type: ApplicationType, now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!(
        "{}-{}-{}",
        application_type.reference_prefix(),
        now.format("%Y%m%d"),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application(status: ApplicationStatus, reference_no: &str) -> Application {
        Application {
            id: Uuid::new_v4(),
            applicant_id: Uuid::new_v4(),
            application_type: ApplicationType::Building,
            status,
            reference_no: reference_no.to_string(),
            fee_amount: 0.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in ApplicationStatus::ALL {
            assert_eq!(status.as_str().parse::<ApplicationStatus>(), Ok(status));
        }
        assert!("archived".parse::<ApplicationStatus>().is_err());
        assert!("Submitted".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in ApplicationStatus::ALL {
            assert_eq!(status.is_terminal(), status.nominal_successors().is_empty());
        }
        assert!(ApplicationStatus::Submitted
            .nominal_successors()
            .contains(&ApplicationStatus::Rejected));
    }

    #[test]
    fn display_name_replaces_underscores() {
        assert_eq!(ApplicationStatus::ReadyForPickup.display_name(), "ready for pickup");
    }

    #[test]
    fn reference_numbers_carry_type_prefix_and_date() {
        let now = DateTime::parse_from_rfc3339("2026-10-19T08:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let reference = generate_reference_no(ApplicationType::Barangay, now);
        assert!(reference.starts_with("BRG-20261019-"), "{reference}");
        assert_eq!(reference.len(), "BRG-20261019-".len() + 6);
        assert_ne!(reference, generate_reference_no(ApplicationType::Barangay, now));
    }

    #[test]
    fn filter_matches_status_search_and_owner() {
        let app = application(ApplicationStatus::Approved, "BLD-20260101-ABC123");

        assert!(ApplicationFilter::default().matches(&app, None));
        assert!(ApplicationFilter {
            status: Some(ApplicationStatus::Approved),
            search: Some("  abc1 ".to_string()),
            applicant_email: None,
        }
        .matches(&app, None));
        assert!(!ApplicationFilter {
            status: Some(ApplicationStatus::Rejected),
            ..Default::default()
        }
        .matches(&app, None));
        assert!(ApplicationFilter {
            search: Some("build".to_string()),
            ..Default::default()
        }
        .matches(&app, None));

        let owner = ApplicationFilter {
            applicant_email: Some("Jane@Example.com".to_string()),
            ..Default::default()
        };
        assert!(owner.matches(&app, Some("jane@example.com")));
        assert!(!owner.matches(&app, Some("other@example.com")));
        assert!(!owner.matches(&app, None));
    }

    #[test]
    fn page_request_is_clamped() {
        let page = PageRequest::new(0, 1_000);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }

    #[test]
    fn total_pages_is_at_least_one() {
        let empty: Page<()> = Page {
            items: Vec::new(),
            total: 0,
            page: 1,
            page_size: 10,
        };
        assert_eq!(empty.total_pages(), 1);

        let page: Page<()> = Page {
            items: Vec::new(),
            total: 21,
            page: 1,
            page_size: 10,
        };
        assert_eq!(page.total_pages(), 3);
    }

    #[test]
    fn change_events_serialize_with_op_tag() {
        let app = application(ApplicationStatus::Submitted, "BLD-1");
        let json = serde_json::to_value(ChangeEvent::Delete { old: app.clone() }).expect("json");
        assert_eq!(json["op"], "delete");
        assert_eq!(json["old"]["type"], "building");
        assert_eq!(ChangeEvent::Delete { old: app.clone() }.application_id(), app.id);
    }
}
