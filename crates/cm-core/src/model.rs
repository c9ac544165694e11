//! Domain records shared by the services and the storage layer.
//!
//! Enumerations serialize to the lowercase strings stored in the database
//! and used on the wire; records serialize with camelCase field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $value)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(UserRole { User => "user", Admin => "admin" });

string_enum!(SubscriptionTier {
    FreeTrial => "free_trial",
    Starter => "starter",
    Professional => "professional",
    Business => "business",
});

string_enum!(
    /// Account-level standing shown on the user record.
    AccountStatus {
        Active => "active",
        Trial => "trial",
        Canceled => "canceled",
        Expired => "expired",
        Suspended => "suspended",
    }
);

string_enum!(Language { En => "en", Ar => "ar" });

string_enum!(ContractStatus {
    Uploading => "uploading",
    Processing => "processing",
    Analyzed => "analyzed",
    Error => "error",
});

string_enum!(RiskScore { Low => "low", Medium => "medium", High => "high" });

string_enum!(ComplianceStatus {
    Compliant => "compliant",
    NonCompliant => "non_compliant",
    RequiresReview => "requires_review",
});

string_enum!(DetectedLanguage { En => "en", Ar => "ar", Mixed => "mixed" });

string_enum!(MessageRole { User => "user", Assistant => "assistant", System => "system" });

string_enum!(FeedbackRating { ThumbsUp => "thumbs_up", ThumbsDown => "thumbs_down" });

string_enum!(PaidTier {
    Starter => "starter",
    Professional => "professional",
    Business => "business",
});

string_enum!(SubscriptionStatus {
    Active => "active",
    Canceled => "canceled",
    Expired => "expired",
    Suspended => "suspended",
});

string_enum!(BillingCycle { Monthly => "monthly", Annual => "annual" });

string_enum!(PaymentStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    Refunded => "refunded",
});

string_enum!(TicketStatus {
    Open => "open",
    InProgress => "in_progress",
    Resolved => "resolved",
    Closed => "closed",
});

string_enum!(TicketPriority { Low => "low", Medium => "medium", High => "high" });

string_enum!(SenderType { User => "user", Admin => "admin" });

string_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

string_enum!(
    /// Core Web Vitals reported by the browser client.
    VitalName {
        Lcp => "LCP",
        Cls => "CLS",
        Inp => "INP",
        Fcp => "FCP",
        Ttfb => "TTFB",
        Fid => "FID",
    }
);

string_enum!(VitalRating {
    Good => "good",
    NeedsImprovement => "needs-improvement",
    Poor => "poor",
});

string_enum!(KeyTermImportance { High => "high", Medium => "medium", Low => "low" });

impl From<PaidTier> for SubscriptionTier {
    fn from(tier: PaidTier) -> Self {
        match tier {
            PaidTier::Starter => SubscriptionTier::Starter,
            PaidTier::Professional => SubscriptionTier::Professional,
            PaidTier::Business => SubscriptionTier::Business,
        }
    }
}

impl PaidTier {
    /// List price in halalas (1 SAR = 100 halalas).
    pub fn price_halalas(self, cycle: BillingCycle) -> i64 {
        let sar = match (self, cycle) {
            (PaidTier::Starter, BillingCycle::Monthly) => 299,
            (PaidTier::Starter, BillingCycle::Annual) => 2_990,
            (PaidTier::Professional, BillingCycle::Monthly) => 799,
            (PaidTier::Professional, BillingCycle::Annual) => 7_990,
            (PaidTier::Business, BillingCycle::Monthly) => 1_999,
            (PaidTier::Business, BillingCycle::Annual) => 19_990,
        };
        sar * 100
    }
}

impl BillingCycle {
    pub fn months(self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Annual => 12,
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("limit must be between 1 and {max}")]
    Limit { max: i64 },
    #[error("offset must not be negative")]
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Result<Self, PageError> {
        Self::with_max(limit, offset, MAX_PAGE_LIMIT)
    }

    pub fn with_max(limit: Option<i64>, offset: Option<i64>, max: i64) -> Result<Self, PageError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT.min(max));
        if !(1..=max).contains(&limit) {
            return Err(PageError::Limit { max });
        }
        let offset = offset.unwrap_or(0);
        if offset < 0 {
            return Err(PageError::Offset);
        }
        Ok(Self { limit, offset })
    }

    pub(crate) fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub subscription_tier: SubscriptionTier,
    pub subscription_status: AccountStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_signed_in_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub role: UserRole,
    pub language: Language,
    pub trial_ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub language: Option<Language>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub detected_language: Option<DetectedLanguage>,
    pub status: ContractStatus,
    pub error_message: Option<String>,
    pub risk_score: Option<RiskScore>,
    pub sharia_compliance: Option<ComplianceStatus>,
    pub ksa_compliance: Option<ComplianceStatus>,
    pub analysis_report: Option<AnalysisReport>,
    pub uploaded_at: DateTime<Utc>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Contract {
    /// Chat needs a finished analysis with usable reference text.
    pub fn chat_ready(&self) -> bool {
        self.status == ContractStatus::Analyzed
            && self
                .extracted_text
                .as_deref()
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct NewContract {
    pub user_id: i64,
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyTerm {
    pub term: String,
    pub definition: String,
    pub importance: Option<KeyTermImportance>,
}

/// Narrative part of an analysis, kept alongside the derived fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisReport {
    pub summary: String,
    pub risk_factors: Vec<String>,
    pub sharia_issues: Vec<String>,
    pub ksa_issues: Vec<String>,
    pub key_terms: Vec<KeyTerm>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractAnalysis {
    pub extracted_text: String,
    pub detected_language: DetectedLanguage,
    pub risk_score: RiskScore,
    pub sharia_compliance: ComplianceStatus,
    pub ksa_compliance: ComplianceStatus,
    pub report: AnalysisReport,
}

/// Terminal result of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Analyzed(ContractAnalysis),
    Failed {
        user_message: String,
        internal_error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub job_id: String,
    pub contract_id: i64,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMessage {
    pub id: i64,
    pub contract_id: i64,
    pub user_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: Option<i32>,
    pub prompt_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub contract_id: i64,
    pub user_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: Option<i32>,
    pub prompt_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub rating: FeedbackRating,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
    pub extracted_text: Option<String>,
    pub description: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewKnowledgeDocument {
    pub user_id: i64,
    pub filename: String,
    pub storage_key: String,
    pub storage_url: String,
    pub file_size: i64,
    pub mime_type: String,
    pub extracted_text: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub tier: PaidTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub payment_method_last4: Option<String>,
    pub payment_method_brand: Option<String>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub amount_halalas: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub tier: PaidTier,
    pub billing_cycle: BillingCycle,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: i64,
    pub amount_halalas: i64,
    pub currency: String,
    pub tier: PaidTier,
    pub billing_cycle: BillingCycle,
    pub payment_method: Option<String>,
}

/// Gateway verdict applied to a pending payment.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentSettlement {
    Captured {
        card_brand: Option<String>,
        card_last4: Option<String>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportTicket {
    pub id: i64,
    pub ticket_number: String,
    pub user_id: i64,
    pub subject: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub assigned_to: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketMessage {
    pub id: i64,
    pub ticket_id: i64,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub ticket_number: String,
    pub user_id: i64,
    pub subject: String,
    pub priority: TicketPriority,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct TicketUpdate {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub assigned_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: i64,
    pub admin_user_id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub admin_user_id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub title_ar: Option<String>,
    pub prompt: String,
    pub prompt_ar: Option<String>,
    pub display_order: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewPromptTemplate {
    pub category: String,
    pub title: String,
    pub title_ar: Option<String>,
    pub prompt: String,
    pub prompt_ar: Option<String>,
    pub display_order: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RumMetric {
    pub id: i64,
    pub name: VitalName,
    pub value: i64,
    pub rating: VitalRating,
    pub delta: i64,
    pub client_metric_id: String,
    pub navigation_type: Option<String>,
    pub url: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRumMetric {
    pub name: VitalName,
    pub value: i64,
    pub rating: VitalRating,
    pub delta: i64,
    pub client_metric_id: String,
    pub navigation_type: Option<String>,
    pub url: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfigRecord {
    pub service: String,
    pub version: i64,
    pub config_json: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_users: i64,
    pub active_subscriptions: i64,
    pub open_tickets: i64,
    pub revenue_halalas: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_storage_strings() {
        for status in ComplianceStatus::ALL {
            assert_eq!(status.as_str().parse::<ComplianceStatus>().unwrap(), *status);
        }
        assert_eq!("needs-improvement".parse::<VitalRating>().unwrap(), VitalRating::NeedsImprovement);
        let err = "unknown".parse::<RiskScore>().unwrap_err();
        assert_eq!(err.kind, "RiskScore");
    }

    #[test]
    fn enums_serialize_as_storage_strings() {
        assert_eq!(serde_json::to_value(ComplianceStatus::NonCompliant).unwrap(), "non_compliant");
        assert_eq!(serde_json::to_value(VitalName::Ttfb).unwrap(), "TTFB");
        assert!(serde_json::from_value::<RiskScore>(serde_json::json!("extreme")).is_err());
    }

    #[test]
    fn page_defaults_and_bounds() {
        assert_eq!(Page::new(None, None).unwrap(), Page { limit: 50, offset: 0 });
        assert_eq!(Page::new(Some(0), None), Err(PageError::Limit { max: 100 }));
        assert_eq!(Page::new(Some(101), None), Err(PageError::Limit { max: 100 }));
        assert_eq!(Page::new(Some(10), Some(-1)), Err(PageError::Offset));
        assert_eq!(Page::with_max(Some(1000), None, 1000).unwrap().limit, 1000);
    }

    #[test]
    fn plan_prices_are_in_halalas() {
        assert_eq!(PaidTier::Starter.price_halalas(BillingCycle::Monthly), 29_900);
        assert_eq!(PaidTier::Business.price_halalas(BillingCycle::Annual), 1_999_000);
    }

    #[test]
    fn contract_chat_ready_requires_text() {
        let mut contract = Contract {
            id: 1,
            user_id: 1,
            filename: "a.pdf".into(),
            storage_key: "k".into(),
            storage_url: "https://files.test/k".into(),
            file_size: 10,
            mime_type: "application/pdf".into(),
            extracted_text: Some("   ".into()),
            detected_language: Some(DetectedLanguage::En),
            status: ContractStatus::Analyzed,
            error_message: None,
            risk_score: Some(RiskScore::Low),
            sharia_compliance: Some(ComplianceStatus::Compliant),
            ksa_compliance: Some(ComplianceStatus::Compliant),
            analysis_report: None,
            uploaded_at: Utc::now(),
            analyzed_at: Some(Utc::now()),
        };
        assert!(!contract.chat_ready());
        contract.extracted_text = Some("clause 1".into());
        assert!(contract.chat_ready());
        contract.status = ContractStatus::Processing;
        assert!(!contract.chat_ready());
    }
}
