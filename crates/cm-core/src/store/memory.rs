use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AdminRepository, AnalysisJobRepository, BillingRepository, CatalogRepository,
    ChatRepository, ContractRepository, KnowledgeRepository, ServiceConfigRepository, Store,
    StoreError, StoreResult, SupportRepository, TelemetryRepository, UserRepository,
};
use crate::model::{
    AccountStatus, AiMessage, AnalysisJob, AnalysisOutcome, AuditLog, Contract, ContractStatus,
    DashboardStats, Feedback, FeedbackRating, JobStatus, KnowledgeDocument, MessageRole,
    NewAuditLog, NewContract, NewKnowledgeDocument, NewMessage, NewPayment, NewPromptTemplate,
    NewRumMetric, NewTicket, NewUser, Page, Payment, PaymentSettlement, PaymentStatus,
    ProfileUpdate, PromptTemplate, RumMetric, SenderType, ServiceConfigRecord, Subscription,
    SubscriptionStatus, SubscriptionTier, SupportTicket, TicketMessage, TicketStatus,
    TicketUpdate, User, UserRole,
};

/// Process-local [`Store`] with the same observable semantics as [`super::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    users: BTreeMap<i64, User>,
    contracts: BTreeMap<i64, Contract>,
    jobs: BTreeMap<i64, AnalysisJob>,
    messages: BTreeMap<i64, AiMessage>,
    feedback: HashMap<i64, Feedback>,
    documents: BTreeMap<i64, KnowledgeDocument>,
    subscriptions: HashMap<i64, Subscription>,
    payments: BTreeMap<i64, Payment>,
    tickets: BTreeMap<i64, SupportTicket>,
    ticket_messages: BTreeMap<i64, TicketMessage>,
    audit_logs: BTreeMap<i64, AuditLog>,
    prompts: BTreeMap<i64, PromptTemplate>,
    rum_metrics: BTreeMap<i64, RumMetric>,
    service_configs: BTreeMap<String, ServiceConfigRecord>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.users
            .values()
            .any(|user| Some(user.id) != except && user.email.eq_ignore_ascii_case(email))
    }

    fn push_audit(&mut self, entry: NewAuditLog) -> AuditLog {
        let id = self.next_id();
        let log = AuditLog {
            id,
            admin_user_id: entry.admin_user_id,
            action: entry.action,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            details: entry.details,
            created_at: Utc::now(),
        };
        self.audit_logs.insert(id, log.clone());
        log
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T: Clone>(items: impl DoubleEndedIterator<Item = T>, page: Page) -> Vec<T> {
    let items: Vec<T> = items.rev().collect();
    page.slice(&items)
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.state.lock().await;
        if state.email_taken(&user.email, None) {
            return Err(StoreError::Conflict("email already registered".into()));
        }
        let id = state.next_id();
        let now = Utc::now();
        let record = User {
            id,
            email: user.email,
            name: user.name,
            password_hash: user.password_hash,
            role: user.role,
            subscription_tier: SubscriptionTier::FreeTrial,
            subscription_status: AccountStatus::Trial,
            trial_ends_at: Some(user.trial_ends_at),
            language: user.language,
            created_at: now,
            updated_at: now,
            last_signed_in_at: None,
        };
        state.users.insert(id, record.clone());
        Ok(record)
    }

    async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> StoreResult<Option<User>> {
        let mut state = self.state.lock().await;
        if let Some(email) = update.email.as_deref() {
            if state.email_taken(email, Some(user_id)) {
                return Err(StoreError::Conflict("email already registered".into()));
            }
        }
        let Some(user) = state.users.get_mut(&user_id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            user.name = Some(name);
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(language) = update.language {
            user.language = language;
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn record_sign_in(&self, user_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.last_signed_in_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_user_role(&self, user_id: i64, role: UserRole) -> StoreResult<Option<User>> {
        let mut state = self.state.lock().await;
        Ok(state.users.get_mut(&user_id).map(|user| {
            user.role = role;
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn set_account_status(
        &self,
        user_id: i64,
        status: AccountStatus,
        audit: NewAuditLog,
    ) -> StoreResult<Option<User>> {
        let mut state = self.state.lock().await;
        let Some(user) = state.users.get_mut(&user_id) else {
            return Ok(None);
        };
        user.subscription_status = status;
        user.updated_at = Utc::now();
        let user = user.clone();
        state.push_audit(audit);
        Ok(Some(user))
    }

    async fn list_users(&self, page: Page) -> StoreResult<Vec<User>> {
        let state = self.state.lock().await;
        Ok(newest_first(state.users.values().cloned(), page))
    }
}

#[async_trait]
impl ContractRepository for MemoryStore {
    async fn create_contract_with_job(
        &self,
        contract: NewContract,
        max_attempts: i32,
    ) -> StoreResult<(Contract, AnalysisJob)> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let now = Utc::now();
        let record = Contract {
            id,
            user_id: contract.user_id,
            filename: contract.filename,
            storage_key: contract.storage_key,
            storage_url: contract.storage_url,
            file_size: contract.file_size,
            mime_type: contract.mime_type,
            extracted_text: None,
            detected_language: None,
            status: ContractStatus::Processing,
            error_message: None,
            risk_score: None,
            sharia_compliance: None,
            ksa_compliance: None,
            analysis_report: None,
            uploaded_at: now,
            analyzed_at: None,
        };
        let job = AnalysisJob {
            job_id: Uuid::new_v4().to_string(),
            contract_id: id,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            next_run_at: now,
            lease_expires_at: None,
        };
        state.contracts.insert(id, record.clone());
        state.jobs.insert(id, job.clone());
        Ok((record, job))
    }

    async fn find_contract(&self, contract_id: i64) -> StoreResult<Option<Contract>> {
        Ok(self.state.lock().await.contracts.get(&contract_id).cloned())
    }

    async fn list_contracts(&self, user_id: i64, page: Page) -> StoreResult<Vec<Contract>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .contracts
                .values()
                .filter(|contract| contract.user_id == user_id)
                .cloned(),
            page,
        ))
    }

    async fn search_contracts(
        &self,
        user_id: i64,
        query: &str,
        page: Page,
    ) -> StoreResult<Vec<Contract>> {
        let needle = query.to_lowercase();
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .contracts
                .values()
                .filter(|contract| {
                    contract.user_id == user_id
                        && contract.filename.to_lowercase().contains(&needle)
                })
                .cloned(),
            page,
        ))
    }

    async fn delete_contract(&self, contract_id: i64) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.contracts.remove(&contract_id).is_none() {
            return Ok(false);
        }
        state.jobs.remove(&contract_id);
        let removed: Vec<i64> = state
            .messages
            .values()
            .filter(|message| message.contract_id == contract_id)
            .map(|message| message.id)
            .collect();
        for message_id in removed {
            state.messages.remove(&message_id);
            state.feedback.remove(&message_id);
        }
        Ok(true)
    }
}

#[async_trait]
impl AnalysisJobRepository for MemoryStore {
    async fn claim_analysis_job(&self, lease: Duration) -> StoreResult<Option<AnalysisJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let candidate = state
            .jobs
            .values()
            .filter(|job| match job.status {
                JobStatus::Pending => job.next_run_at <= now,
                JobStatus::Running => job.lease_expires_at.map(|at| at <= now).unwrap_or(true),
                _ => false,
            })
            .min_by_key(|job| (job.next_run_at, job.contract_id))
            .map(|job| job.contract_id);

        let Some(contract_id) = candidate else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&contract_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.lease_expires_at = Some(lease_deadline(now, lease));
        Ok(Some(job.clone()))
    }

    async fn complete_analysis(
        &self,
        job: &AnalysisJob,
        outcome: &AnalysisOutcome,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let applied = match state.contracts.get_mut(&job.contract_id) {
            Some(contract) if contract.status == ContractStatus::Processing => {
                match outcome {
                    AnalysisOutcome::Analyzed(analysis) => {
                        contract.status = ContractStatus::Analyzed;
                        contract.extracted_text = Some(analysis.extracted_text.clone());
                        contract.detected_language = Some(analysis.detected_language);
                        contract.risk_score = Some(analysis.risk_score);
                        contract.sharia_compliance = Some(analysis.sharia_compliance);
                        contract.ksa_compliance = Some(analysis.ksa_compliance);
                        contract.analysis_report = Some(analysis.report.clone());
                        contract.error_message = None;
                        contract.analyzed_at = Some(now);
                    }
                    AnalysisOutcome::Failed { user_message, .. } => {
                        contract.status = ContractStatus::Error;
                        contract.error_message = Some(user_message.clone());
                    }
                }
                true
            }
            _ => false,
        };

        if let Some(record) = state.jobs.get_mut(&job.contract_id) {
            if record.job_id == job.job_id {
                match outcome {
                    AnalysisOutcome::Analyzed(_) => {
                        record.status = JobStatus::Succeeded;
                        record.last_error = None;
                    }
                    AnalysisOutcome::Failed { internal_error, .. } => {
                        record.status = JobStatus::Failed;
                        record.last_error = Some(internal_error.clone());
                    }
                }
                record.lease_expires_at = None;
            }
        }
        Ok(applied)
    }

    async fn reschedule_analysis_job(
        &self,
        job: &AnalysisJob,
        error: &str,
        delay: Duration,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.jobs.get_mut(&job.contract_id) {
            record.status = JobStatus::Pending;
            record.last_error = Some(error.to_string());
            record.next_run_at = lease_deadline(Utc::now(), delay);
            record.lease_expires_at = None;
        }
        Ok(())
    }

    async fn find_analysis_job(&self, contract_id: i64) -> StoreResult<Option<AnalysisJob>> {
        Ok(self.state.lock().await.jobs.get(&contract_id).cloned())
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn insert_message(&self, message: NewMessage) -> StoreResult<AiMessage> {
        let mut state = self.state.lock().await;
        if !state.contracts.contains_key(&message.contract_id) {
            return Err(StoreError::NotFound);
        }
        let id = state.next_id();
        let record = AiMessage {
            id,
            contract_id: message.contract_id,
            user_id: message.user_id,
            role: message.role,
            content: message.content,
            tokens_used: message.tokens_used,
            prompt_type: message.prompt_type,
            created_at: Utc::now(),
        };
        state.messages.insert(id, record.clone());
        Ok(record)
    }

    async fn list_messages(&self, contract_id: i64) -> StoreResult<Vec<AiMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|message| message.contract_id == contract_id)
            .cloned()
            .collect())
    }

    async fn recent_turns(
        &self,
        contract_id: i64,
        before_message_id: i64,
        limit: usize,
    ) -> StoreResult<Vec<AiMessage>> {
        let state = self.state.lock().await;
        let mut turns: Vec<AiMessage> = state
            .messages
            .range(..before_message_id)
            .rev()
            .map(|(_, message)| message)
            .filter(|message| {
                message.contract_id == contract_id
                    && matches!(message.role, MessageRole::User | MessageRole::Assistant)
            })
            .take(limit)
            .cloned()
            .collect();
        turns.reverse();
        Ok(turns)
    }

    async fn find_message(&self, message_id: i64) -> StoreResult<Option<AiMessage>> {
        Ok(self.state.lock().await.messages.get(&message_id).cloned())
    }

    async fn upsert_feedback(
        &self,
        message_id: i64,
        user_id: i64,
        rating: FeedbackRating,
        comment: Option<String>,
    ) -> StoreResult<Feedback> {
        let mut state = self.state.lock().await;
        if !state.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound);
        }
        let now = Utc::now();
        let existing = state
            .feedback
            .get(&message_id)
            .map(|existing| (existing.id, existing.created_at));
        let (id, created_at) = match existing {
            Some(found) => found,
            None => (state.next_id(), now),
        };
        let record = Feedback {
            id,
            message_id,
            user_id,
            rating,
            comment,
            created_at,
            updated_at: now,
        };
        state.feedback.insert(message_id, record.clone());
        Ok(record)
    }

    async fn find_feedback(&self, message_id: i64) -> StoreResult<Option<Feedback>> {
        Ok(self.state.lock().await.feedback.get(&message_id).cloned())
    }
}

#[async_trait]
impl KnowledgeRepository for MemoryStore {
    async fn create_document(
        &self,
        document: NewKnowledgeDocument,
    ) -> StoreResult<KnowledgeDocument> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let record = KnowledgeDocument {
            id,
            user_id: document.user_id,
            filename: document.filename,
            storage_key: document.storage_key,
            storage_url: document.storage_url,
            file_size: document.file_size,
            mime_type: document.mime_type,
            extracted_text: document.extracted_text,
            description: document.description,
            uploaded_at: Utc::now(),
        };
        state.documents.insert(id, record.clone());
        Ok(record)
    }

    async fn list_documents(&self, user_id: i64) -> StoreResult<Vec<KnowledgeDocument>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .values()
            .rev()
            .filter(|document| document.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_document(&self, document_id: i64) -> StoreResult<Option<KnowledgeDocument>> {
        Ok(self.state.lock().await.documents.get(&document_id).cloned())
    }

    async fn delete_document(&self, document_id: i64) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .remove(&document_id)
            .is_some())
    }
}

#[async_trait]
impl BillingRepository for MemoryStore {
    async fn find_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn cancel_subscription(&self, user_id: i64) -> StoreResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.get_mut(&user_id).map(|subscription| {
            let now = Utc::now();
            subscription.cancel_at_period_end = true;
            subscription.canceled_at = Some(now);
            subscription.updated_at = now;
            subscription.clone()
        }))
    }

    async fn create_payment(&self, payment: NewPayment) -> StoreResult<Payment> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let now = Utc::now();
        let record = Payment {
            id,
            user_id: payment.user_id,
            subscription_id: None,
            amount_halalas: payment.amount_halalas,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            tier: payment.tier,
            billing_cycle: payment.billing_cycle,
            payment_method: payment.payment_method,
            transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.payments.insert(id, record.clone());
        Ok(record)
    }

    async fn attach_transaction(&self, payment_id: i64, transaction_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .values()
            .any(|payment| {
                payment.id != payment_id
                    && payment.transaction_id.as_deref() == Some(transaction_id)
            })
        {
            return Err(StoreError::Conflict("transaction already recorded".into()));
        }
        let payment = state.payments.get_mut(&payment_id).ok_or(StoreError::NotFound)?;
        payment.transaction_id = Some(transaction_id.to_string());
        payment.updated_at = Utc::now();
        Ok(())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|payment| payment.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn list_payments(&self, user_id: i64, page: Page) -> StoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .payments
                .values()
                .filter(|payment| payment.user_id == user_id)
                .cloned(),
            page,
        ))
    }

    async fn settle_payment(
        &self,
        payment_id: i64,
        settlement: PaymentSettlement,
    ) -> StoreResult<Option<Payment>> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get(&payment_id).cloned() else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();

        match settlement {
            PaymentSettlement::Failed { reason } => {
                let Some(record) = state.payments.get_mut(&payment_id) else {
                    return Ok(None);
                };
                record.status = PaymentStatus::Failed;
                record.failure_reason = Some(reason);
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            PaymentSettlement::Captured {
                card_brand,
                card_last4,
                period_start,
                period_end,
            } => {
                let existing = state
                    .subscriptions
                    .get(&payment.user_id)
                    .map(|existing| (existing.id, existing.created_at));
                let (subscription_id, created_at) = match existing {
                    Some(found) => found,
                    None => (state.next_id(), now),
                };
                state.subscriptions.insert(
                    payment.user_id,
                    Subscription {
                        id: subscription_id,
                        user_id: payment.user_id,
                        tier: payment.tier,
                        status: SubscriptionStatus::Active,
                        billing_cycle: payment.billing_cycle,
                        current_period_start: period_start,
                        current_period_end: period_end,
                        payment_method_last4: card_last4,
                        payment_method_brand: card_brand,
                        cancel_at_period_end: false,
                        canceled_at: None,
                        created_at,
                        updated_at: now,
                    },
                );
                if let Some(user) = state.users.get_mut(&payment.user_id) {
                    user.subscription_tier = payment.tier.into();
                    user.subscription_status = AccountStatus::Active;
                    user.updated_at = now;
                }
                let Some(record) = state.payments.get_mut(&payment_id) else {
                    return Ok(None);
                };
                record.status = PaymentStatus::Success;
                record.subscription_id = Some(subscription_id);
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
        }
    }
}

#[async_trait]
impl SupportRepository for MemoryStore {
    async fn create_ticket(&self, ticket: NewTicket) -> StoreResult<SupportTicket> {
        let mut state = self.state.lock().await;
        if state
            .tickets
            .values()
            .any(|existing| existing.ticket_number == ticket.ticket_number)
        {
            return Err(StoreError::Conflict("ticket number collision".into()));
        }
        let id = state.next_id();
        let now = Utc::now();
        let record = SupportTicket {
            id,
            ticket_number: ticket.ticket_number,
            user_id: ticket.user_id,
            subject: ticket.subject,
            status: TicketStatus::Open,
            priority: ticket.priority,
            assigned_to: None,
            created_at: now,
            updated_at: now,
        };
        state.tickets.insert(id, record.clone());
        let message_id = state.next_id();
        state.ticket_messages.insert(
            message_id,
            TicketMessage {
                id: message_id,
                ticket_id: id,
                sender_id: ticket.user_id,
                sender_type: SenderType::User,
                message: ticket.message,
                created_at: now,
            },
        );
        Ok(record)
    }

    async fn find_ticket(&self, ticket_id: i64) -> StoreResult<Option<SupportTicket>> {
        Ok(self.state.lock().await.tickets.get(&ticket_id).cloned())
    }

    async fn list_user_tickets(&self, user_id: i64, page: Page) -> StoreResult<Vec<SupportTicket>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .tickets
                .values()
                .filter(|ticket| ticket.user_id == user_id)
                .cloned(),
            page,
        ))
    }

    async fn list_tickets(
        &self,
        status: Option<TicketStatus>,
        page: Page,
    ) -> StoreResult<Vec<SupportTicket>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .tickets
                .values()
                .filter(|ticket| status.map(|s| ticket.status == s).unwrap_or(true))
                .cloned(),
            page,
        ))
    }

    async fn list_ticket_messages(&self, ticket_id: i64) -> StoreResult<Vec<TicketMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .ticket_messages
            .values()
            .filter(|message| message.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn add_ticket_message(
        &self,
        ticket_id: i64,
        sender_id: i64,
        sender_type: SenderType,
        message: &str,
    ) -> StoreResult<TicketMessage> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let ticket = state.tickets.get_mut(&ticket_id).ok_or(StoreError::NotFound)?;
        if ticket.status == TicketStatus::Open {
            ticket.status = TicketStatus::InProgress;
        }
        ticket.updated_at = now;
        let id = state.next_id();
        let record = TicketMessage {
            id,
            ticket_id,
            sender_id,
            sender_type,
            message: message.to_string(),
            created_at: now,
        };
        state.ticket_messages.insert(id, record.clone());
        Ok(record)
    }

    async fn update_ticket(
        &self,
        ticket_id: i64,
        update: TicketUpdate,
        audit: NewAuditLog,
    ) -> StoreResult<Option<SupportTicket>> {
        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
            return Ok(None);
        };
        if let Some(status) = update.status {
            ticket.status = status;
        }
        if let Some(priority) = update.priority {
            ticket.priority = priority;
        }
        if let Some(assigned_to) = update.assigned_to {
            ticket.assigned_to = Some(assigned_to);
        }
        ticket.updated_at = Utc::now();
        let ticket = ticket.clone();
        state.push_audit(audit);
        Ok(Some(ticket))
    }
}

#[async_trait]
impl AdminRepository for MemoryStore {
    async fn insert_audit_log(&self, entry: NewAuditLog) -> StoreResult<AuditLog> {
        Ok(self.state.lock().await.push_audit(entry))
    }

    async fn list_audit_logs(&self, action: Option<&str>, page: Page) -> StoreResult<Vec<AuditLog>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .audit_logs
                .values()
                .filter(|log| action.map(|a| log.action == a).unwrap_or(true))
                .cloned(),
            page,
        ))
    }

    async fn dashboard_stats(&self) -> StoreResult<DashboardStats> {
        let state = self.state.lock().await;
        Ok(DashboardStats {
            total_users: state.users.len() as i64,
            active_subscriptions: state
                .subscriptions
                .values()
                .filter(|subscription| subscription.status == SubscriptionStatus::Active)
                .count() as i64,
            open_tickets: state
                .tickets
                .values()
                .filter(|ticket| ticket.status == TicketStatus::Open)
                .count() as i64,
            revenue_halalas: state
                .payments
                .values()
                .filter(|payment| payment.status == PaymentStatus::Success)
                .map(|payment| payment.amount_halalas)
                .sum(),
        })
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn list_prompts(&self, category: Option<&str>) -> StoreResult<Vec<PromptTemplate>> {
        let state = self.state.lock().await;
        let mut prompts: Vec<PromptTemplate> = state
            .prompts
            .values()
            .filter(|prompt| prompt.is_active)
            .filter(|prompt| category.map(|c| prompt.category == c).unwrap_or(true))
            .cloned()
            .collect();
        prompts.sort_by_key(|prompt| (prompt.display_order, prompt.id));
        Ok(prompts)
    }

    async fn upsert_prompt(&self, prompt: NewPromptTemplate) -> StoreResult<PromptTemplate> {
        let mut state = self.state.lock().await;
        let existing = state
            .prompts
            .values()
            .find(|p| p.category == prompt.category && p.title == prompt.title)
            .map(|p| p.id);
        let id = match existing {
            Some(id) => id,
            None => state.next_id(),
        };
        let record = PromptTemplate {
            id,
            category: prompt.category,
            title: prompt.title,
            title_ar: prompt.title_ar,
            prompt: prompt.prompt,
            prompt_ar: prompt.prompt_ar,
            display_order: prompt.display_order,
            is_active: true,
        };
        state.prompts.insert(id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl TelemetryRepository for MemoryStore {
    async fn insert_rum_metric(&self, metric: NewRumMetric) -> StoreResult<RumMetric> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let record = RumMetric {
            id,
            name: metric.name,
            value: metric.value,
            rating: metric.rating,
            delta: metric.delta,
            client_metric_id: metric.client_metric_id,
            navigation_type: metric.navigation_type,
            url: metric.url,
            user_agent: metric.user_agent,
            ip_address: metric.ip_address,
            created_at: Utc::now(),
        };
        state.rum_metrics.insert(id, record.clone());
        Ok(record)
    }

    async fn list_rum_metrics(&self, page: Page) -> StoreResult<Vec<RumMetric>> {
        let state = self.state.lock().await;
        Ok(newest_first(state.rum_metrics.values().cloned(), page))
    }
}

#[async_trait]
impl ServiceConfigRepository for MemoryStore {
    async fn load_service_config(&self, service: &str) -> StoreResult<Option<ServiceConfigRecord>> {
        Ok(self.state.lock().await.service_configs.get(service).cloned())
    }

    async fn list_service_configs(&self) -> StoreResult<Vec<ServiceConfigRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .service_configs
            .values()
            .cloned()
            .collect())
    }

    async fn put_service_config(
        &self,
        service: &str,
        config_json: Value,
        expected_version: Option<i64>,
        updated_by: &str,
        audit: Option<NewAuditLog>,
    ) -> StoreResult<ServiceConfigRecord> {
        let mut state = self.state.lock().await;
        let current = state
            .service_configs
            .get(service)
            .map(|record| record.version)
            .unwrap_or(0);
        if expected_version.map(|expected| expected != current).unwrap_or(false) {
            return Err(StoreError::Conflict("service config version mismatch".into()));
        }
        let record = ServiceConfigRecord {
            service: service.to_string(),
            version: current + 1,
            config_json,
            updated_at: Utc::now(),
            updated_by: updated_by.to_string(),
        };
        state
            .service_configs
            .insert(service.to_string(), record.clone());
        if let Some(audit) = audit {
            state.push_audit(audit);
        }
        Ok(record)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AnalysisReport, BillingCycle, ComplianceStatus, ContractAnalysis, DetectedLanguage,
        Language, PaidTier, RiskScore,
    };

    async fn seed_user(store: &MemoryStore, email: &str) -> User {
        store
            .create_user(NewUser {
                email: email.into(),
                name: None,
                password_hash: "hash".into(),
                role: UserRole::User,
                language: Language::En,
                trial_ends_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn new_contract(user_id: i64, filename: &str) -> NewContract {
        NewContract {
            user_id,
            filename: filename.into(),
            storage_key: format!("contracts/{filename}"),
            storage_url: format!("https://files.test/{filename}"),
            file_size: 1024,
            mime_type: "text/plain".into(),
        }
    }

    fn analysis() -> AnalysisOutcome {
        AnalysisOutcome::Analyzed(ContractAnalysis {
            extracted_text: "text".into(),
            detected_language: DetectedLanguage::En,
            risk_score: RiskScore::Medium,
            sharia_compliance: ComplianceStatus::Compliant,
            ksa_compliance: ComplianceStatus::RequiresReview,
            report: AnalysisReport::default(),
        })
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_case_insensitively() {
        let store = MemoryStore::new();
        seed_user(&store, "a@example.com").await;
        let err = store
            .create_user(NewUser {
                email: "A@Example.com".into(),
                name: None,
                password_hash: "hash".into(),
                role: UserRole::User,
                language: Language::En,
                trial_ends_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn terminal_write_applies_once() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "a@example.com").await;
        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, "nda.txt"), 1)
            .await
            .unwrap();
        assert_eq!(contract.status, ContractStatus::Processing);

        let job = store
            .claim_analysis_job(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 1);
        assert!(store.complete_analysis(&job, &analysis()).await.unwrap());

        let failed = AnalysisOutcome::Failed {
            user_message: "boom".into(),
            internal_error: "boom".into(),
        };
        assert!(!store.complete_analysis(&job, &failed).await.unwrap());

        let stored = store.find_contract(contract.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContractStatus::Analyzed);
        assert_eq!(stored.risk_score, Some(RiskScore::Medium));
        assert!(stored.error_message.is_none());
        assert!(store
            .claim_analysis_job(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "a@example.com").await;
        store
            .create_contract_with_job(new_contract(user.id, "lease.txt"), 3)
            .await
            .unwrap();

        let first = store
            .claim_analysis_job(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .claim_analysis_job(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.attempts, 2);
        assert!(store
            .claim_analysis_job(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recent_turns_window_excludes_newer_and_system_messages() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "a@example.com").await;
        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, "chat.txt"), 1)
            .await
            .unwrap();

        let mut ids = Vec::new();
        for (index, role) in [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User,
        ]
        .into_iter()
        .enumerate()
        {
            let message = store
                .insert_message(NewMessage {
                    contract_id: contract.id,
                    user_id: user.id,
                    role,
                    content: format!("m{index}"),
                    tokens_used: None,
                    prompt_type: None,
                })
                .await
                .unwrap();
            ids.push(message.id);
        }

        let turns = store.recent_turns(contract.id, ids[5], 3).await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn capture_settles_once_and_activates_subscription() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "a@example.com").await;
        let payment = store
            .create_payment(NewPayment {
                user_id: user.id,
                amount_halalas: PaidTier::Starter.price_halalas(BillingCycle::Monthly),
                currency: "SAR".into(),
                tier: PaidTier::Starter,
                billing_cycle: BillingCycle::Monthly,
                payment_method: Some("card".into()),
            })
            .await
            .unwrap();
        let settlement = PaymentSettlement::Captured {
            card_brand: Some("VISA".into()),
            card_last4: Some("4242".into()),
            period_start: Utc::now(),
            period_end: Utc::now() + chrono::Duration::days(30),
        };

        let settled = store
            .settle_payment(payment.id, settlement.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, PaymentStatus::Success);
        assert!(store
            .settle_payment(payment.id, settlement)
            .await
            .unwrap()
            .is_none());

        let subscription = store.find_subscription(user.id).await.unwrap().unwrap();
        assert_eq!(subscription.tier, PaidTier::Starter);
        let user = store.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.subscription_tier, SubscriptionTier::Starter);
        assert_eq!(user.subscription_status, AccountStatus::Active);
        assert_eq!(store.dashboard_stats().await.unwrap().revenue_halalas, 29_900);
    }

    #[tokio::test]
    async fn stale_config_version_conflicts() {
        let store = MemoryStore::new();
        let first = store
            .put_service_config("analysis", serde_json::json!({}), None, "1", None)
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        let err = store
            .put_service_config("analysis", serde_json::json!({}), Some(0), "1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
