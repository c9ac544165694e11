use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::{
    AdminRepository, AnalysisJobRepository, BillingRepository, CatalogRepository,
    ChatRepository, ContractRepository, KnowledgeRepository, ServiceConfigRepository, Store,
    StoreError, StoreResult, SupportRepository, TelemetryRepository, UserRepository,
};
use crate::model::{
    AccountStatus, AiMessage, AnalysisJob, AnalysisOutcome, AuditLog, Contract, DashboardStats,
    Feedback, FeedbackRating, KnowledgeDocument, NewAuditLog, NewContract, NewKnowledgeDocument,
    NewMessage, NewPayment, NewPromptTemplate, NewRumMetric, NewTicket, NewUser, Page, Payment,
    PaymentSettlement, ProfileUpdate, PromptTemplate, RumMetric, SenderType, ServiceConfigRecord,
    Subscription, SubscriptionTier, SupportTicket, TicketMessage, TicketStatus, TicketUpdate,
    UnknownVariant, User, UserRole,
};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const USER_COLUMNS: &str = "user_id, email, name, password_hash, role, subscription_tier, \
     account_status, trial_ends_at, language, created_at, updated_at, last_signed_in_at";
const CONTRACT_COLUMNS: &str = "contract_id, user_id, filename, storage_key, storage_url, \
     file_size, mime_type, extracted_text, detected_language, status, error_message, risk_score, \
     sharia_compliance, ksa_compliance, analysis_report, uploaded_at, analyzed_at";
const JOB_COLUMNS: &str = "job_id, contract_id, status, attempts, max_attempts, last_error, \
     next_run_at, lease_expires_at";
const MESSAGE_COLUMNS: &str =
    "message_id, contract_id, user_id, role, content, tokens_used, prompt_type, created_at";
const FEEDBACK_COLUMNS: &str =
    "feedback_id, message_id, user_id, rating, comment, created_at, updated_at";
const DOCUMENT_COLUMNS: &str = "document_id, user_id, filename, storage_key, storage_url, \
     file_size, mime_type, extracted_text, description, uploaded_at";
const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, tier, status, billing_cycle, \
     current_period_start, current_period_end, payment_method_last4, payment_method_brand, \
     cancel_at_period_end, canceled_at, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "payment_id, user_id, subscription_id, amount_halalas, currency, \
     status, tier, billing_cycle, payment_method, transaction_id, failure_reason, created_at, \
     updated_at";
const TICKET_COLUMNS: &str = "ticket_id, ticket_number, user_id, subject, status, priority, \
     assigned_to, created_at, updated_at";
const TICKET_MESSAGE_COLUMNS: &str =
    "message_id, ticket_id, sender_id, sender_type, message, created_at";
const AUDIT_COLUMNS: &str =
    "audit_id, admin_user_id, action, resource_type, resource_id, details, created_at";
const PROMPT_COLUMNS: &str =
    "prompt_id, category, title, title_ar, prompt, prompt_ar, display_order, is_active";
const RUM_COLUMNS: &str = "metric_id, name, value, rating, delta, client_metric_id, \
     navigation_type, url, user_agent, ip_address, created_at";
const CONFIG_COLUMNS: &str = "service, version, config_json, updated_at, updated_by";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        tracing::info!("migrations applied");
        Ok(())
    }
}

fn enum_col<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    Ok(raw.parse::<T>()?)
}

fn opt_enum_col<T>(row: &PgRow, column: &str) -> StoreResult<Option<T>>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.map(|value| value.parse::<T>()).transpose()?)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        password_hash: row.try_get("password_hash")?,
        role: enum_col(row, "role")?,
        subscription_tier: enum_col(row, "subscription_tier")?,
        subscription_status: enum_col(row, "account_status")?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        language: enum_col(row, "language")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_signed_in_at: row.try_get("last_signed_in_at")?,
    })
}

fn contract_from_row(row: &PgRow) -> StoreResult<Contract> {
    let report: Option<Value> = row.try_get("analysis_report")?;
    Ok(Contract {
        id: row.try_get("contract_id")?,
        user_id: row.try_get("user_id")?,
        filename: row.try_get("filename")?,
        storage_key: row.try_get("storage_key")?,
        storage_url: row.try_get("storage_url")?,
        file_size: row.try_get("file_size")?,
        mime_type: row.try_get("mime_type")?,
        extracted_text: row.try_get("extracted_text")?,
        detected_language: opt_enum_col(row, "detected_language")?,
        status: enum_col(row, "status")?,
        error_message: row.try_get("error_message")?,
        risk_score: opt_enum_col(row, "risk_score")?,
        sharia_compliance: opt_enum_col(row, "sharia_compliance")?,
        ksa_compliance: opt_enum_col(row, "ksa_compliance")?,
        analysis_report: report.map(serde_json::from_value).transpose()?,
        uploaded_at: row.try_get("uploaded_at")?,
        analyzed_at: row.try_get("analyzed_at")?,
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<AnalysisJob> {
    Ok(AnalysisJob {
        job_id: row.try_get("job_id")?,
        contract_id: row.try_get("contract_id")?,
        status: enum_col(row, "status")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        next_run_at: row.try_get("next_run_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<AiMessage> {
    Ok(AiMessage {
        id: row.try_get("message_id")?,
        contract_id: row.try_get("contract_id")?,
        user_id: row.try_get("user_id")?,
        role: enum_col(row, "role")?,
        content: row.try_get("content")?,
        tokens_used: row.try_get("tokens_used")?,
        prompt_type: row.try_get("prompt_type")?,
        created_at: row.try_get("created_at")?,
    })
}

fn feedback_from_row(row: &PgRow) -> StoreResult<Feedback> {
    Ok(Feedback {
        id: row.try_get("feedback_id")?,
        message_id: row.try_get("message_id")?,
        user_id: row.try_get("user_id")?,
        rating: enum_col(row, "rating")?,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn document_from_row(row: &PgRow) -> StoreResult<KnowledgeDocument> {
    Ok(KnowledgeDocument {
        id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        filename: row.try_get("filename")?,
        storage_key: row.try_get("storage_key")?,
        storage_url: row.try_get("storage_url")?,
        file_size: row.try_get("file_size")?,
        mime_type: row.try_get("mime_type")?,
        extracted_text: row.try_get("extracted_text")?,
        description: row.try_get("description")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("subscription_id")?,
        user_id: row.try_get("user_id")?,
        tier: enum_col(row, "tier")?,
        status: enum_col(row, "status")?,
        billing_cycle: enum_col(row, "billing_cycle")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        payment_method_last4: row.try_get("payment_method_last4")?,
        payment_method_brand: row.try_get("payment_method_brand")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        canceled_at: row.try_get("canceled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> StoreResult<Payment> {
    Ok(Payment {
        id: row.try_get("payment_id")?,
        user_id: row.try_get("user_id")?,
        subscription_id: row.try_get("subscription_id")?,
        amount_halalas: row.try_get("amount_halalas")?,
        currency: row.try_get("currency")?,
        status: enum_col(row, "status")?,
        tier: enum_col(row, "tier")?,
        billing_cycle: enum_col(row, "billing_cycle")?,
        payment_method: row.try_get("payment_method")?,
        transaction_id: row.try_get("transaction_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ticket_from_row(row: &PgRow) -> StoreResult<SupportTicket> {
    Ok(SupportTicket {
        id: row.try_get("ticket_id")?,
        ticket_number: row.try_get("ticket_number")?,
        user_id: row.try_get("user_id")?,
        subject: row.try_get("subject")?,
        status: enum_col(row, "status")?,
        priority: enum_col(row, "priority")?,
        assigned_to: row.try_get("assigned_to")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ticket_message_from_row(row: &PgRow) -> StoreResult<TicketMessage> {
    Ok(TicketMessage {
        id: row.try_get("message_id")?,
        ticket_id: row.try_get("ticket_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_type: enum_col(row, "sender_type")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> StoreResult<AuditLog> {
    Ok(AuditLog {
        id: row.try_get("audit_id")?,
        admin_user_id: row.try_get("admin_user_id")?,
        action: row.try_get("action")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

fn prompt_from_row(row: &PgRow) -> StoreResult<PromptTemplate> {
    Ok(PromptTemplate {
        id: row.try_get("prompt_id")?,
        category: row.try_get("category")?,
        title: row.try_get("title")?,
        title_ar: row.try_get("title_ar")?,
        prompt: row.try_get("prompt")?,
        prompt_ar: row.try_get("prompt_ar")?,
        display_order: row.try_get("display_order")?,
        is_active: row.try_get("is_active")?,
    })
}

fn rum_from_row(row: &PgRow) -> StoreResult<RumMetric> {
    Ok(RumMetric {
        id: row.try_get("metric_id")?,
        name: enum_col(row, "name")?,
        value: row.try_get("value")?,
        rating: enum_col(row, "rating")?,
        delta: row.try_get("delta")?,
        client_metric_id: row.try_get("client_metric_id")?,
        navigation_type: row.try_get("navigation_type")?,
        url: row.try_get("url")?,
        user_agent: row.try_get("user_agent")?,
        ip_address: row.try_get("ip_address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn config_from_row(row: &PgRow) -> StoreResult<ServiceConfigRecord> {
    Ok(ServiceConfigRecord {
        service: row.try_get("service")?,
        version: row.try_get("version")?,
        config_json: row.try_get("config_json")?,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

async fn insert_audit<'e, E>(executor: E, entry: &NewAuditLog) -> StoreResult<AuditLog>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO cm_admin.audit_logs (admin_user_id, action, resource_type, resource_id, details) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {AUDIT_COLUMNS}"
    ))
    .bind(entry.admin_user_id)
    .bind(&entry.action)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(&entry.details)
    .fetch_one(executor)
    .await?;
    audit_from_row(&row)
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let result = sqlx::query(&format!(
            "INSERT INTO cm_app.users (email, name, password_hash, role, language, trial_ends_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.language.as_str())
        .bind(user.trial_ends_at)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(row) => user_from_row(&row),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict("email already registered".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM cm_app.users WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM cm_app.users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> StoreResult<Option<User>> {
        let result = sqlx::query(&format!(
            "UPDATE cm_app.users \
             SET name = COALESCE($1, name), email = COALESCE($2, email), \
                 language = COALESCE($3, language), updated_at = NOW() \
             WHERE user_id = $4 RETURNING {USER_COLUMNS}"
        ))
        .bind(&update.name)
        .bind(&update.email)
        .bind(update.language.map(|language| language.as_str()))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await;
        match result {
            Ok(row) => row.as_ref().map(user_from_row).transpose(),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict("email already registered".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn record_sign_in(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE cm_app.users SET last_signed_in_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_role(&self, user_id: i64, role: UserRole) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "UPDATE cm_app.users SET role = $1, updated_at = NOW() WHERE user_id = $2 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(role.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_account_status(
        &self,
        user_id: i64,
        status: AccountStatus,
        audit: NewAuditLog,
    ) -> StoreResult<Option<User>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE cm_app.users SET account_status = $1, updated_at = NOW() WHERE user_id = $2 \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let user = user_from_row(&row)?;
        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(Some(user))
    }

    async fn list_users(&self, page: Page) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM cm_app.users ORDER BY created_at DESC, user_id DESC \
             LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, user_from_row)
    }
}

#[async_trait]
impl ContractRepository for PgStore {
    async fn create_contract_with_job(
        &self,
        contract: NewContract,
        max_attempts: i32,
    ) -> StoreResult<(Contract, AnalysisJob)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.contracts \
             (user_id, filename, storage_key, storage_url, file_size, mime_type, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'processing') RETURNING {CONTRACT_COLUMNS}"
        ))
        .bind(contract.user_id)
        .bind(&contract.filename)
        .bind(&contract.storage_key)
        .bind(&contract.storage_url)
        .bind(contract.file_size)
        .bind(&contract.mime_type)
        .fetch_one(&mut *tx)
        .await?;
        let contract = contract_from_row(&row)?;

        let job_row = sqlx::query(&format!(
            "INSERT INTO cm_app.analysis_jobs (job_id, contract_id, max_attempts) \
             VALUES ($1, $2, $3) RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(contract.id)
        .bind(max_attempts.max(1))
        .fetch_one(&mut *tx)
        .await?;
        let job = job_from_row(&job_row)?;
        tx.commit().await?;
        Ok((contract, job))
    }

    async fn find_contract(&self, contract_id: i64) -> StoreResult<Option<Contract>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM cm_app.contracts WHERE contract_id = $1"
        ))
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(contract_from_row).transpose()
    }

    async fn list_contracts(&self, user_id: i64, page: Page) -> StoreResult<Vec<Contract>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM cm_app.contracts WHERE user_id = $1 \
             ORDER BY uploaded_at DESC, contract_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, contract_from_row)
    }

    async fn search_contracts(
        &self,
        user_id: i64,
        query: &str,
        page: Page,
    ) -> StoreResult<Vec<Contract>> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows = sqlx::query(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM cm_app.contracts \
             WHERE user_id = $1 AND filename ILIKE $2 ESCAPE '\\' \
             ORDER BY uploaded_at DESC, contract_id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(user_id)
        .bind(format!("%{escaped}%"))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, contract_from_row)
    }

    async fn delete_contract(&self, contract_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM cm_app.contracts WHERE contract_id = $1")
            .bind(contract_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AnalysisJobRepository for PgStore {
    async fn claim_analysis_job(&self, lease: Duration) -> StoreResult<Option<AnalysisJob>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT job_id FROM cm_app.analysis_jobs \
             WHERE (status = 'pending' AND next_run_at <= NOW()) \
                OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())) \
             ORDER BY next_run_at ASC, created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job_id: String = row.try_get("job_id")?;

        let claimed = sqlx::query(&format!(
            "UPDATE cm_app.analysis_jobs \
             SET status = 'running', attempts = attempts + 1, started_at = NOW(), \
                 lease_expires_at = NOW() + ($1 * INTERVAL '1 second'), updated_at = NOW() \
             WHERE job_id = $2 RETURNING {JOB_COLUMNS}"
        ))
        .bind(seconds(lease))
        .bind(&job_id)
        .fetch_one(&mut *tx)
        .await?;
        let job = job_from_row(&claimed)?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn complete_analysis(
        &self,
        job: &AnalysisJob,
        outcome: &AnalysisOutcome,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = match outcome {
            AnalysisOutcome::Analyzed(analysis) => {
                sqlx::query(
                    "UPDATE cm_app.contracts \
                     SET status = 'analyzed', extracted_text = $1, detected_language = $2, \
                         risk_score = $3, sharia_compliance = $4, ksa_compliance = $5, \
                         analysis_report = $6, error_message = NULL, analyzed_at = NOW() \
                     WHERE contract_id = $7 AND status = 'processing'",
                )
                .bind(&analysis.extracted_text)
                .bind(analysis.detected_language.as_str())
                .bind(analysis.risk_score.as_str())
                .bind(analysis.sharia_compliance.as_str())
                .bind(analysis.ksa_compliance.as_str())
                .bind(serde_json::to_value(&analysis.report)?)
                .bind(job.contract_id)
                .execute(&mut *tx)
                .await?
            }
            AnalysisOutcome::Failed { user_message, .. } => {
                sqlx::query(
                    "UPDATE cm_app.contracts SET status = 'error', error_message = $1 \
                     WHERE contract_id = $2 AND status = 'processing'",
                )
                .bind(user_message)
                .bind(job.contract_id)
                .execute(&mut *tx)
                .await?
            }
        };

        let (status, last_error) = match outcome {
            AnalysisOutcome::Analyzed(_) => ("succeeded", None),
            AnalysisOutcome::Failed { internal_error, .. } => {
                ("failed", Some(internal_error.as_str()))
            }
        };
        sqlx::query(
            "UPDATE cm_app.analysis_jobs \
             SET status = $1, last_error = $2, lease_expires_at = NULL, completed_at = NOW(), \
                 updated_at = NOW() \
             WHERE job_id = $3",
        )
        .bind(status)
        .bind(last_error)
        .bind(&job.job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn reschedule_analysis_job(
        &self,
        job: &AnalysisJob,
        error: &str,
        delay: Duration,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE cm_app.analysis_jobs \
             SET status = 'pending', next_run_at = NOW() + ($1 * INTERVAL '1 second'), \
                 lease_expires_at = NULL, last_error = $2, updated_at = NOW() \
             WHERE job_id = $3",
        )
        .bind(seconds(delay))
        .bind(error)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_analysis_job(&self, contract_id: i64) -> StoreResult<Option<AnalysisJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM cm_app.analysis_jobs WHERE contract_id = $1"
        ))
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl ChatRepository for PgStore {
    async fn insert_message(&self, message: NewMessage) -> StoreResult<AiMessage> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.ai_messages \
             (contract_id, user_id, role, content, tokens_used, prompt_type) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.contract_id)
        .bind(message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.tokens_used)
        .bind(&message.prompt_type)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    async fn list_messages(&self, contract_id: i64) -> StoreResult<Vec<AiMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM cm_app.ai_messages WHERE contract_id = $1 \
             ORDER BY created_at ASC, message_id ASC"
        ))
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, message_from_row)
    }

    async fn recent_turns(
        &self,
        contract_id: i64,
        before_message_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<AiMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM cm_app.ai_messages \
                 WHERE contract_id = $1 AND message_id < $2 AND role IN ('user', 'assistant') \
                 ORDER BY message_id DESC LIMIT $3 \
             ) recent ORDER BY message_id ASC"
        ))
        .bind(contract_id)
        .bind(before_message_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, message_from_row)
    }

    async fn find_message(&self, message_id: i64) -> StoreResult<Option<AiMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM cm_app.ai_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn upsert_feedback(
        &self,
        message_id: i64,
        user_id: i64,
        rating: FeedbackRating,
        comment: Option<String>,
    ) -> StoreResult<Feedback> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.ai_feedback (message_id, user_id, rating, comment) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (message_id) DO UPDATE \
             SET user_id = EXCLUDED.user_id, rating = EXCLUDED.rating, \
                 comment = EXCLUDED.comment, updated_at = NOW() \
             RETURNING {FEEDBACK_COLUMNS}"
        ))
        .bind(message_id)
        .bind(user_id)
        .bind(rating.as_str())
        .bind(&comment)
        .fetch_one(&self.pool)
        .await?;
        feedback_from_row(&row)
    }

    async fn find_feedback(&self, message_id: i64) -> StoreResult<Option<Feedback>> {
        let row = sqlx::query(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM cm_app.ai_feedback WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(feedback_from_row).transpose()
    }
}

#[async_trait]
impl KnowledgeRepository for PgStore {
    async fn create_document(
        &self,
        document: NewKnowledgeDocument,
    ) -> StoreResult<KnowledgeDocument> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.knowledge_documents \
             (user_id, filename, storage_key, storage_url, file_size, mime_type, extracted_text, description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(document.user_id)
        .bind(&document.filename)
        .bind(&document.storage_key)
        .bind(&document.storage_url)
        .bind(document.file_size)
        .bind(&document.mime_type)
        .bind(&document.extracted_text)
        .bind(&document.description)
        .fetch_one(&self.pool)
        .await?;
        document_from_row(&row)
    }

    async fn list_documents(&self, user_id: i64) -> StoreResult<Vec<KnowledgeDocument>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM cm_app.knowledge_documents WHERE user_id = $1 \
             ORDER BY uploaded_at DESC, document_id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, document_from_row)
    }

    async fn find_document(&self, document_id: i64) -> StoreResult<Option<KnowledgeDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM cm_app.knowledge_documents WHERE document_id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn delete_document(&self, document_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM cm_app.knowledge_documents WHERE document_id = $1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BillingRepository for PgStore {
    async fn find_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM cm_app.subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn cancel_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "UPDATE cm_app.subscriptions \
             SET cancel_at_period_end = TRUE, canceled_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn create_payment(&self, payment: NewPayment) -> StoreResult<Payment> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.payments \
             (user_id, amount_halalas, currency, tier, billing_cycle, payment_method) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.user_id)
        .bind(payment.amount_halalas)
        .bind(&payment.currency)
        .bind(payment.tier.as_str())
        .bind(payment.billing_cycle.as_str())
        .bind(&payment.payment_method)
        .fetch_one(&self.pool)
        .await?;
        payment_from_row(&row)
    }

    async fn attach_transaction(&self, payment_id: i64, transaction_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE cm_app.payments SET transaction_id = $1, updated_at = NOW() WHERE payment_id = $2",
        )
        .bind(transaction_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StoreError::NotFound),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict("transaction already recorded".into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM cm_app.payments WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn list_payments(&self, user_id: i64, page: Page) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM cm_app.payments WHERE user_id = $1 \
             ORDER BY created_at DESC, payment_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, payment_from_row)
    }

    async fn settle_payment(
        &self,
        payment_id: i64,
        settlement: PaymentSettlement,
    ) -> StoreResult<Option<Payment>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM cm_app.payments \
             WHERE payment_id = $1 AND status = 'pending' FOR UPDATE"
        ))
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let payment = payment_from_row(&row)?;

        let updated = match settlement {
            PaymentSettlement::Failed { reason } => {
                sqlx::query(&format!(
                    "UPDATE cm_app.payments \
                     SET status = 'failed', failure_reason = $1, updated_at = NOW() \
                     WHERE payment_id = $2 RETURNING {PAYMENT_COLUMNS}"
                ))
                .bind(&reason)
                .bind(payment_id)
                .fetch_one(&mut *tx)
                .await?
            }
            PaymentSettlement::Captured {
                card_brand,
                card_last4,
                period_start,
                period_end,
            } => {
                let subscription_id: i64 = sqlx::query_scalar(
                    "INSERT INTO cm_app.subscriptions \
                     (user_id, tier, status, billing_cycle, current_period_start, current_period_end, \
                      payment_method_last4, payment_method_brand) \
                     VALUES ($1, $2, 'active', $3, $4, $5, $6, $7) \
                     ON CONFLICT (user_id) DO UPDATE \
                     SET tier = EXCLUDED.tier, status = 'active', \
                         billing_cycle = EXCLUDED.billing_cycle, \
                         current_period_start = EXCLUDED.current_period_start, \
                         current_period_end = EXCLUDED.current_period_end, \
                         payment_method_last4 = EXCLUDED.payment_method_last4, \
                         payment_method_brand = EXCLUDED.payment_method_brand, \
                         cancel_at_period_end = FALSE, canceled_at = NULL, updated_at = NOW() \
                     RETURNING subscription_id",
                )
                .bind(payment.user_id)
                .bind(payment.tier.as_str())
                .bind(payment.billing_cycle.as_str())
                .bind(period_start)
                .bind(period_end)
                .bind(&card_last4)
                .bind(&card_brand)
                .fetch_one(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE cm_app.users \
                     SET subscription_tier = $1, account_status = 'active', updated_at = NOW() \
                     WHERE user_id = $2",
                )
                .bind(SubscriptionTier::from(payment.tier).as_str())
                .bind(payment.user_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(&format!(
                    "UPDATE cm_app.payments \
                     SET status = 'success', subscription_id = $1, updated_at = NOW() \
                     WHERE payment_id = $2 RETURNING {PAYMENT_COLUMNS}"
                ))
                .bind(subscription_id)
                .bind(payment_id)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        let settled = payment_from_row(&updated)?;
        tx.commit().await?;
        Ok(Some(settled))
    }
}

#[async_trait]
impl SupportRepository for PgStore {
    async fn create_ticket(&self, ticket: NewTicket) -> StoreResult<SupportTicket> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.support_tickets (ticket_number, user_id, subject, priority) \
             VALUES ($1, $2, $3, $4) RETURNING {TICKET_COLUMNS}"
        ))
        .bind(&ticket.ticket_number)
        .bind(ticket.user_id)
        .bind(&ticket.subject)
        .bind(ticket.priority.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict("ticket number collision".into())
            } else {
                err.into()
            }
        })?;
        let created = ticket_from_row(&row)?;

        sqlx::query(
            "INSERT INTO cm_app.ticket_messages (ticket_id, sender_id, sender_type, message) \
             VALUES ($1, $2, 'user', $3)",
        )
        .bind(created.id)
        .bind(ticket.user_id)
        .bind(&ticket.message)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn find_ticket(&self, ticket_id: i64) -> StoreResult<Option<SupportTicket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM cm_app.support_tickets WHERE ticket_id = $1"
        ))
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn list_user_tickets(&self, user_id: i64, page: Page) -> StoreResult<Vec<SupportTicket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM cm_app.support_tickets WHERE user_id = $1 \
             ORDER BY created_at DESC, ticket_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, ticket_from_row)
    }

    async fn list_tickets(
        &self,
        status: Option<TicketStatus>,
        page: Page,
    ) -> StoreResult<Vec<SupportTicket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM cm_app.support_tickets \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC, ticket_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(status.map(|status| status.as_str()))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, ticket_from_row)
    }

    async fn list_ticket_messages(&self, ticket_id: i64) -> StoreResult<Vec<TicketMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_MESSAGE_COLUMNS} FROM cm_app.ticket_messages WHERE ticket_id = $1 \
             ORDER BY created_at ASC, message_id ASC"
        ))
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, ticket_message_from_row)
    }

    async fn add_ticket_message(
        &self,
        ticket_id: i64,
        sender_id: i64,
        sender_type: SenderType,
        message: &str,
    ) -> StoreResult<TicketMessage> {
        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query(
            "UPDATE cm_app.support_tickets \
             SET status = CASE WHEN status = 'open' THEN 'in_progress' ELSE status END, \
                 updated_at = NOW() \
             WHERE ticket_id = $1",
        )
        .bind(ticket_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.ticket_messages (ticket_id, sender_id, sender_type, message) \
             VALUES ($1, $2, $3, $4) RETURNING {TICKET_MESSAGE_COLUMNS}"
        ))
        .bind(ticket_id)
        .bind(sender_id)
        .bind(sender_type.as_str())
        .bind(message)
        .fetch_one(&mut *tx)
        .await?;
        let created = ticket_message_from_row(&row)?;
        tx.commit().await?;
        Ok(created)
    }

    async fn update_ticket(
        &self,
        ticket_id: i64,
        update: TicketUpdate,
        audit: NewAuditLog,
    ) -> StoreResult<Option<SupportTicket>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE cm_app.support_tickets \
             SET status = COALESCE($1, status), priority = COALESCE($2, priority), \
                 assigned_to = COALESCE($3, assigned_to), updated_at = NOW() \
             WHERE ticket_id = $4 RETURNING {TICKET_COLUMNS}"
        ))
        .bind(update.status.map(|status| status.as_str()))
        .bind(update.priority.map(|priority| priority.as_str()))
        .bind(update.assigned_to)
        .bind(ticket_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let ticket = ticket_from_row(&row)?;
        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(Some(ticket))
    }
}

#[async_trait]
impl AdminRepository for PgStore {
    async fn insert_audit_log(&self, entry: NewAuditLog) -> StoreResult<AuditLog> {
        insert_audit(&self.pool, &entry).await
    }

    async fn list_audit_logs(&self, action: Option<&str>, page: Page) -> StoreResult<Vec<AuditLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM cm_admin.audit_logs \
             WHERE ($1::TEXT IS NULL OR action = $1) \
             ORDER BY created_at DESC, audit_id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(action)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, audit_from_row)
    }

    async fn dashboard_stats(&self) -> StoreResult<DashboardStats> {
        let row = sqlx::query(
            "SELECT \
                 (SELECT COUNT(*) FROM cm_app.users) AS total_users, \
                 (SELECT COUNT(*) FROM cm_app.subscriptions WHERE status = 'active') AS active_subscriptions, \
                 (SELECT COUNT(*) FROM cm_app.support_tickets WHERE status = 'open') AS open_tickets, \
                 (SELECT COALESCE(SUM(amount_halalas), 0)::BIGINT FROM cm_app.payments WHERE status = 'success') AS revenue_halalas",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(DashboardStats {
            total_users: row.try_get("total_users")?,
            active_subscriptions: row.try_get("active_subscriptions")?,
            open_tickets: row.try_get("open_tickets")?,
            revenue_halalas: row.try_get("revenue_halalas")?,
        })
    }
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn list_prompts(&self, category: Option<&str>) -> StoreResult<Vec<PromptTemplate>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROMPT_COLUMNS} FROM cm_app.prompt_library \
             WHERE is_active = TRUE AND ($1::TEXT IS NULL OR category = $1) \
             ORDER BY display_order ASC, prompt_id ASC"
        ))
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, prompt_from_row)
    }

    async fn upsert_prompt(&self, prompt: NewPromptTemplate) -> StoreResult<PromptTemplate> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.prompt_library \
             (category, title, title_ar, prompt, prompt_ar, display_order) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (category, title) DO UPDATE \
             SET title_ar = EXCLUDED.title_ar, prompt = EXCLUDED.prompt, \
                 prompt_ar = EXCLUDED.prompt_ar, display_order = EXCLUDED.display_order, \
                 is_active = TRUE \
             RETURNING {PROMPT_COLUMNS}"
        ))
        .bind(&prompt.category)
        .bind(&prompt.title)
        .bind(&prompt.title_ar)
        .bind(&prompt.prompt)
        .bind(&prompt.prompt_ar)
        .bind(prompt.display_order)
        .fetch_one(&self.pool)
        .await?;
        prompt_from_row(&row)
    }
}

#[async_trait]
impl TelemetryRepository for PgStore {
    async fn insert_rum_metric(&self, metric: NewRumMetric) -> StoreResult<RumMetric> {
        let row = sqlx::query(&format!(
            "INSERT INTO cm_app.rum_metrics \
             (name, value, rating, delta, client_metric_id, navigation_type, url, user_agent, ip_address) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {RUM_COLUMNS}"
        ))
        .bind(metric.name.as_str())
        .bind(metric.value)
        .bind(metric.rating.as_str())
        .bind(metric.delta)
        .bind(&metric.client_metric_id)
        .bind(&metric.navigation_type)
        .bind(&metric.url)
        .bind(&metric.user_agent)
        .bind(&metric.ip_address)
        .fetch_one(&self.pool)
        .await?;
        rum_from_row(&row)
    }

    async fn list_rum_metrics(&self, page: Page) -> StoreResult<Vec<RumMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUM_COLUMNS} FROM cm_app.rum_metrics \
             ORDER BY created_at DESC, metric_id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, rum_from_row)
    }
}

#[async_trait]
impl ServiceConfigRepository for PgStore {
    async fn load_service_config(&self, service: &str) -> StoreResult<Option<ServiceConfigRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM cm_admin.service_configs WHERE service = $1"
        ))
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn list_service_configs(&self) -> StoreResult<Vec<ServiceConfigRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM cm_admin.service_configs ORDER BY service"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, config_from_row)
    }

    async fn put_service_config(
        &self,
        service: &str,
        config_json: Value,
        expected_version: Option<i64>,
        updated_by: &str,
        audit: Option<NewAuditLog>,
    ) -> StoreResult<ServiceConfigRecord> {
        let mut tx = self.pool.begin().await?;
        let current: i64 = sqlx::query_scalar(
            "SELECT version FROM cm_admin.service_configs WHERE service = $1 FOR UPDATE",
        )
        .bind(service)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if expected_version.map(|expected| expected != current).unwrap_or(false) {
            tx.rollback().await?;
            return Err(StoreError::Conflict("service config version mismatch".into()));
        }

        let row = sqlx::query(&format!(
            "INSERT INTO cm_admin.service_configs (service, version, config_json, updated_by) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (service) DO UPDATE \
             SET version = EXCLUDED.version, config_json = EXCLUDED.config_json, \
                 updated_by = EXCLUDED.updated_by, updated_at = NOW() \
             RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(service)
        .bind(current + 1)
        .bind(&config_json)
        .bind(updated_by)
        .fetch_one(&mut *tx)
        .await?;
        let record = config_from_row(&row)?;
        if let Some(audit) = audit {
            insert_audit(&mut *tx, &audit).await?;
        }
        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
