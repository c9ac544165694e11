//! `PgStore` against a real database. Runs when `DATABASE_URL` points at a
//! disposable Postgres; otherwise each test returns early.

use crate::model::{
    AccountStatus, AnalysisOutcome, AnalysisReport, BillingCycle, ComplianceStatus,
    ContractAnalysis, ContractStatus, DetectedLanguage, FeedbackRating, JobStatus, Language,
    MessageRole, NewContract, NewMessage, NewPayment, NewUser, PaidTier, PaymentSettlement,
    PaymentStatus, RiskScore, SubscriptionStatus, SubscriptionTier, User, UserRole,
};
use crate::store::{
    AnalysisJobRepository, BillingRepository, ChatRepository, ContractRepository, PgStore,
    StoreError, UserRepository,
};
use chrono::{Months, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;

static MIGRATIONS: OnceCell<()> = OnceCell::const_new();
static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn lock_tests() -> MutexGuard<'static, ()> {
    TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_id(prefix: &str) -> String {
    let sequence = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", uuid::Uuid::new_v4().simple())
}

async fn connect() -> Option<PgStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set; skipping postgres store test");
        return None;
    };
    let store = PgStore::connect(&database_url, 5)
        .await
        .expect("connect database");
    MIGRATIONS
        .get_or_init(|| async { store.migrate().await.expect("run migrations") })
        .await;
    Some(store)
}

/// Claims are global, so jobs left behind by earlier runs must not be picked up.
async fn park_other_jobs(store: &PgStore) {
    sqlx::query(
        "UPDATE cm_app.analysis_jobs SET status = 'failed', lease_expires_at = NULL \
         WHERE status IN ('pending', 'running')",
    )
    .execute(store.pool())
    .await
    .expect("park leftover jobs");
}

async fn create_user(store: &PgStore) -> User {
    store
        .create_user(NewUser {
            email: format!("{}@contramind.test", next_id("pg-user")),
            name: Some("Store Test".into()),
            password_hash: "hash".into(),
            role: UserRole::User,
            language: Language::En,
            trial_ends_at: Utc::now(),
        })
        .await
        .expect("create user")
}

fn new_contract(user_id: i64) -> NewContract {
    NewContract {
        user_id,
        filename: format!("{}.pdf", next_id("lease")),
        storage_key: "contracts/lease.pdf".into(),
        storage_url: "https://files.contramind.test/contracts/lease.pdf".into(),
        file_size: 2048,
        mime_type: "application/pdf".into(),
    }
}

fn analysis() -> ContractAnalysis {
    ContractAnalysis {
        extracted_text: "Clause 1: rent is due monthly.".into(),
        detected_language: DetectedLanguage::En,
        risk_score: RiskScore::Medium,
        sharia_compliance: ComplianceStatus::Compliant,
        ksa_compliance: ComplianceStatus::RequiresReview,
        report: AnalysisReport::default(),
    }
}

fn new_payment(user_id: i64) -> NewPayment {
    NewPayment {
        user_id,
        amount_halalas: PaidTier::Starter.price_halalas(BillingCycle::Monthly),
        currency: "SAR".into(),
        tier: PaidTier::Starter,
        billing_cycle: BillingCycle::Monthly,
        payment_method: Some("tap".into()),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn contract_and_job_are_written_and_removed_together() {
    let _guard = lock_tests();
    let Some(store) = connect().await else {
        return;
    };
    let user = create_user(&store).await;

    let (contract, job) = store
        .create_contract_with_job(new_contract(user.id), 0)
        .await
        .expect("create contract");
    assert_eq!(contract.status, ContractStatus::Processing);
    assert_eq!(job.contract_id, contract.id);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.max_attempts, 1);
    let stored_job = store
        .find_analysis_job(contract.id)
        .await
        .expect("find job")
        .expect("job row");
    assert_eq!(stored_job.job_id, job.job_id);

    let message = store
        .insert_message(NewMessage {
            contract_id: contract.id,
            user_id: user.id,
            role: MessageRole::Assistant,
            content: "Looks fine.".into(),
            tokens_used: Some(3),
            prompt_type: None,
        })
        .await
        .expect("insert message");
    store
        .upsert_feedback(message.id, user.id, FeedbackRating::ThumbsUp, None)
        .await
        .expect("feedback");

    assert!(store.delete_contract(contract.id).await.expect("delete"));
    assert!(store.find_analysis_job(contract.id).await.expect("job").is_none());
    assert!(store.list_messages(contract.id).await.expect("messages").is_empty());
    assert!(store.find_feedback(message.id).await.expect("feedback").is_none());
    assert!(!store.delete_contract(contract.id).await.expect("delete again"));
}

#[tokio::test(flavor = "current_thread")]
async fn claim_skips_locked_jobs_and_reclaims_expired_leases() {
    let _guard = lock_tests();
    let Some(store) = connect().await else {
        return;
    };
    park_other_jobs(&store).await;
    let user = create_user(&store).await;
    let (first, first_job) = store
        .create_contract_with_job(new_contract(user.id), 3)
        .await
        .expect("first contract");
    let (second, _) = store
        .create_contract_with_job(new_contract(user.id), 3)
        .await
        .expect("second contract");

    // another worker holds the oldest job's row
    let mut other_worker = store.pool().begin().await.expect("begin");
    sqlx::query("SELECT job_id FROM cm_app.analysis_jobs WHERE job_id = $1 FOR UPDATE")
        .bind(&first_job.job_id)
        .fetch_one(&mut *other_worker)
        .await
        .expect("lock first job");
    let claimed = store
        .claim_analysis_job(Duration::from_secs(60))
        .await
        .expect("claim")
        .expect("unlocked job");
    assert_eq!(claimed.contract_id, second.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.lease_expires_at.is_some());
    other_worker.rollback().await.expect("rollback");

    let claimed = store
        .claim_analysis_job(Duration::ZERO)
        .await
        .expect("claim")
        .expect("first job");
    assert_eq!(claimed.contract_id, first.id);
    assert_eq!(claimed.attempts, 1);

    // the zero lease has already run out, the second job's has not
    let reclaimed = store
        .claim_analysis_job(Duration::from_secs(60))
        .await
        .expect("claim")
        .expect("expired lease");
    assert_eq!(reclaimed.job_id, first_job.job_id);
    assert_eq!(reclaimed.attempts, 2);
    assert!(store
        .claim_analysis_job(Duration::from_secs(60))
        .await
        .expect("claim")
        .is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn terminal_write_applies_once() {
    let _guard = lock_tests();
    let Some(store) = connect().await else {
        return;
    };
    park_other_jobs(&store).await;
    let user = create_user(&store).await;
    let (contract, _) = store
        .create_contract_with_job(new_contract(user.id), 1)
        .await
        .expect("create contract");
    let job = store
        .claim_analysis_job(Duration::from_secs(60))
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(job.contract_id, contract.id);

    assert!(store
        .complete_analysis(&job, &AnalysisOutcome::Analyzed(analysis()))
        .await
        .expect("complete"));
    let late_failure = AnalysisOutcome::Failed {
        user_message: "Failed to analyze contract. Please try again.".into(),
        internal_error: "late duplicate".into(),
    };
    assert!(!store
        .complete_analysis(&job, &late_failure)
        .await
        .expect("complete again"));

    let stored = store
        .find_contract(contract.id)
        .await
        .expect("find")
        .expect("contract");
    assert_eq!(stored.status, ContractStatus::Analyzed);
    assert_eq!(stored.risk_score, Some(RiskScore::Medium));
    assert_eq!(stored.sharia_compliance, Some(ComplianceStatus::Compliant));
    assert_eq!(stored.ksa_compliance, Some(ComplianceStatus::RequiresReview));
    assert_eq!(stored.detected_language, Some(DetectedLanguage::En));
    assert!(stored.error_message.is_none());
    assert!(stored.analyzed_at.is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn feedback_upsert_keeps_one_row_per_message() {
    let _guard = lock_tests();
    let Some(store) = connect().await else {
        return;
    };
    let user = create_user(&store).await;
    let (contract, _) = store
        .create_contract_with_job(new_contract(user.id), 1)
        .await
        .expect("create contract");
    let message = store
        .insert_message(NewMessage {
            contract_id: contract.id,
            user_id: user.id,
            role: MessageRole::Assistant,
            content: "ContraMind AI recommends to: review clause 4".into(),
            tokens_used: Some(9),
            prompt_type: Some("risk".into()),
        })
        .await
        .expect("insert message");

    let first = store
        .upsert_feedback(message.id, user.id, FeedbackRating::ThumbsUp, Some("helpful".into()))
        .await
        .expect("first feedback");
    let second = store
        .upsert_feedback(message.id, user.id, FeedbackRating::ThumbsDown, None)
        .await
        .expect("second feedback");
    assert_eq!(first.id, second.id);
    assert_eq!(second.rating, FeedbackRating::ThumbsDown);
    assert!(second.comment.is_none());

    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM cm_app.ai_feedback WHERE message_id = $1")
            .bind(message.id)
            .fetch_one(store.pool())
            .await
            .expect("count feedback");
    assert_eq!(rows, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn settle_payment_activates_subscription_once() {
    let _guard = lock_tests();
    let Some(store) = connect().await else {
        return;
    };
    let user = create_user(&store).await;
    let payment = store
        .create_payment(new_payment(user.id))
        .await
        .expect("create payment");
    assert_eq!(payment.status, PaymentStatus::Pending);
    let charge_id = next_id("chg");
    store
        .attach_transaction(payment.id, &charge_id)
        .await
        .expect("attach");

    let duplicate = store
        .create_payment(new_payment(user.id))
        .await
        .expect("second payment");
    let err = store
        .attach_transaction(duplicate.id, &charge_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let period_start = Utc::now();
    let settled = store
        .settle_payment(
            payment.id,
            PaymentSettlement::Captured {
                card_brand: Some("VISA".into()),
                card_last4: Some("4242".into()),
                period_start,
                period_end: period_start + Months::new(1),
            },
        )
        .await
        .expect("settle")
        .expect("pending payment");
    assert_eq!(settled.status, PaymentStatus::Success);
    assert!(settled.subscription_id.is_some());

    let stored_user = store
        .find_user(user.id)
        .await
        .expect("find user")
        .expect("user");
    assert_eq!(stored_user.subscription_tier, SubscriptionTier::Starter);
    assert_eq!(stored_user.subscription_status, AccountStatus::Active);
    let subscription = store
        .find_subscription(user.id)
        .await
        .expect("find subscription")
        .expect("subscription");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.payment_method_last4.as_deref(), Some("4242"));

    let replay = store
        .settle_payment(
            payment.id,
            PaymentSettlement::Failed {
                reason: "late decline".into(),
            },
        )
        .await
        .expect("settle again");
    assert!(replay.is_none());
    let current = store
        .find_payment_by_transaction(&charge_id)
        .await
        .expect("find payment")
        .expect("payment");
    assert_eq!(current.status, PaymentStatus::Success);

    let failed = store
        .settle_payment(
            duplicate.id,
            PaymentSettlement::Failed {
                reason: "charge could not be recorded".into(),
            },
        )
        .await
        .expect("fail duplicate")
        .expect("pending duplicate");
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("charge could not be recorded")
    );
}
