//! Persistence seams. Each resource gets its own repository trait and
//! [`Store`] bundles them; handlers and workers hold an `Arc<dyn Store>`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::model::{
    AccountStatus, AiMessage, AnalysisJob, AnalysisOutcome, AuditLog, Contract, DashboardStats,
    Feedback, FeedbackRating, KnowledgeDocument, NewAuditLog, NewContract, NewKnowledgeDocument,
    NewMessage, NewPayment, NewPromptTemplate, NewRumMetric, NewTicket, NewUser, Page, Payment,
    PaymentSettlement, ProfileUpdate, PromptTemplate, RumMetric, SenderType, ServiceConfigRecord,
    Subscription, SupportTicket, TicketMessage, TicketStatus, TicketUpdate, UnknownVariant, User,
    UserRole,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the email is taken (case-insensitive).
    async fn create_user(&self, user: NewUser) -> StoreResult<User>;
    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> StoreResult<Option<User>>;
    async fn record_sign_in(&self, user_id: i64) -> StoreResult<()>;
    async fn set_user_role(&self, user_id: i64, role: UserRole) -> StoreResult<Option<User>>;
    async fn set_account_status(
        &self,
        user_id: i64,
        status: AccountStatus,
        audit: NewAuditLog,
    ) -> StoreResult<Option<User>>;
    async fn list_users(&self, page: Page) -> StoreResult<Vec<User>>;
}

#[async_trait]
pub trait ContractRepository: Send + Sync {
    /// Inserts the contract in `processing` together with its pending analysis job.
    async fn create_contract_with_job(
        &self,
        contract: NewContract,
        max_attempts: i32,
    ) -> StoreResult<(Contract, AnalysisJob)>;
    async fn find_contract(&self, contract_id: i64) -> StoreResult<Option<Contract>>;
    /// Newest first.
    async fn list_contracts(&self, user_id: i64, page: Page) -> StoreResult<Vec<Contract>>;
    async fn search_contracts(
        &self,
        user_id: i64,
        query: &str,
        page: Page,
    ) -> StoreResult<Vec<Contract>>;
    async fn delete_contract(&self, contract_id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait AnalysisJobRepository: Send + Sync {
    /// Claims the oldest due job, including running jobs whose lease ran out.
    async fn claim_analysis_job(&self, lease: Duration) -> StoreResult<Option<AnalysisJob>>;
    /// Writes the terminal contract state and closes the job in one step.
    /// Returns false when the contract already left `processing`.
    async fn complete_analysis(
        &self,
        job: &AnalysisJob,
        outcome: &AnalysisOutcome,
    ) -> StoreResult<bool>;
    async fn reschedule_analysis_job(
        &self,
        job: &AnalysisJob,
        error: &str,
        delay: Duration,
    ) -> StoreResult<()>;
    async fn find_analysis_job(&self, contract_id: i64) -> StoreResult<Option<AnalysisJob>>;
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn insert_message(&self, message: NewMessage) -> StoreResult<AiMessage>;
    /// Whole transcript, oldest first.
    async fn list_messages(&self, contract_id: i64) -> StoreResult<Vec<AiMessage>>;
    /// Up to `limit` user/assistant turns older than `before_message_id`, oldest first.
    async fn recent_turns(
        &self,
        contract_id: i64,
        before_message_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<AiMessage>>;
    async fn find_message(&self, message_id: i64) -> StoreResult<Option<AiMessage>>;
    /// One row per message; a second submission replaces the first.
    async fn upsert_feedback(
        &self,
        message_id: i64,
        user_id: i64,
        rating: FeedbackRating,
        comment: Option<String>,
    ) -> StoreResult<Feedback>;
    async fn find_feedback(&self, message_id: i64) -> StoreResult<Option<Feedback>>;
}

#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    async fn create_document(&self, document: NewKnowledgeDocument)
        -> StoreResult<KnowledgeDocument>;
    async fn list_documents(&self, user_id: i64) -> StoreResult<Vec<KnowledgeDocument>>;
    async fn find_document(&self, document_id: i64) -> StoreResult<Option<KnowledgeDocument>>;
    async fn delete_document(&self, document_id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn find_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>>;
    async fn cancel_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>>;
    async fn create_payment(&self, payment: NewPayment) -> StoreResult<Payment>;
    async fn attach_transaction(&self, payment_id: i64, transaction_id: &str) -> StoreResult<()>;
    async fn find_payment_by_transaction(&self, transaction_id: &str)
        -> StoreResult<Option<Payment>>;
    async fn list_payments(&self, user_id: i64, page: Page) -> StoreResult<Vec<Payment>>;
    /// Applies a gateway verdict to a pending payment. Captures also upsert the
    /// subscription and the user's tier. Returns None when nothing was pending.
    async fn settle_payment(
        &self,
        payment_id: i64,
        settlement: PaymentSettlement,
    ) -> StoreResult<Option<Payment>>;
}

#[async_trait]
pub trait SupportRepository: Send + Sync {
    /// Creates the ticket and its opening message.
    async fn create_ticket(&self, ticket: NewTicket) -> StoreResult<SupportTicket>;
    async fn find_ticket(&self, ticket_id: i64) -> StoreResult<Option<SupportTicket>>;
    async fn list_user_tickets(&self, user_id: i64, page: Page) -> StoreResult<Vec<SupportTicket>>;
    async fn list_tickets(
        &self,
        status: Option<TicketStatus>,
        page: Page,
    ) -> StoreResult<Vec<SupportTicket>>;
    async fn list_ticket_messages(&self, ticket_id: i64) -> StoreResult<Vec<TicketMessage>>;
    /// Appends a reply; an `open` ticket moves to `in_progress`.
    async fn add_ticket_message(
        &self,
        ticket_id: i64,
        sender_id: i64,
        sender_type: SenderType,
        message: &str,
    ) -> StoreResult<TicketMessage>;
    async fn update_ticket(
        &self,
        ticket_id: i64,
        update: TicketUpdate,
        audit: NewAuditLog,
    ) -> StoreResult<Option<SupportTicket>>;
}

#[async_trait]
pub trait AdminRepository: Send + Sync {
    async fn insert_audit_log(&self, entry: NewAuditLog) -> StoreResult<AuditLog>;
    async fn list_audit_logs(&self, action: Option<&str>, page: Page) -> StoreResult<Vec<AuditLog>>;
    async fn dashboard_stats(&self) -> StoreResult<DashboardStats>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Active prompts ordered by display order.
    async fn list_prompts(&self, category: Option<&str>) -> StoreResult<Vec<PromptTemplate>>;
    /// Keyed by (category, title).
    async fn upsert_prompt(&self, prompt: NewPromptTemplate) -> StoreResult<PromptTemplate>;
}

#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    async fn insert_rum_metric(&self, metric: NewRumMetric) -> StoreResult<RumMetric>;
    /// Newest first.
    async fn list_rum_metrics(&self, page: Page) -> StoreResult<Vec<RumMetric>>;
}

#[async_trait]
pub trait ServiceConfigRepository: Send + Sync {
    async fn load_service_config(&self, service: &str) -> StoreResult<Option<ServiceConfigRecord>>;
    async fn list_service_configs(&self) -> StoreResult<Vec<ServiceConfigRecord>>;
    /// Bumps the version. A stale `expected_version` yields [`StoreError::Conflict`].
    async fn put_service_config(
        &self,
        service: &str,
        config_json: Value,
        expected_version: Option<i64>,
        updated_by: &str,
        audit: Option<NewAuditLog>,
    ) -> StoreResult<ServiceConfigRecord>;
}

#[async_trait]
pub trait Store:
    UserRepository
    + ContractRepository
    + AnalysisJobRepository
    + ChatRepository
    + KnowledgeRepository
    + BillingRepository
    + SupportRepository
    + AdminRepository
    + CatalogRepository
    + TelemetryRepository
    + ServiceConfigRepository
{
    async fn health_check(&self) -> StoreResult<()>;
}
