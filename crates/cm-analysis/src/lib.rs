use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cm_core::email::{self, EmailClient};
use cm_core::model::{AnalysisJob, AnalysisOutcome, ContractAnalysis, ContractStatus};
use cm_core::service_config::{self, ServiceConfigHandle};
use cm_core::store::{PgStore, Store};
use cm_core::{config as env_config, http, logging, metrics, server};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub mod chat;
pub mod config;
pub mod extract;
pub mod llm;
pub mod parse;
pub mod prompt;

use config::AnalysisRuntimeConfig;
use extract::{DocumentFetcher, StoragePolicy};
use llm::{LlmProviderKind, LlmSettings, LlmTurn};

const SERVICE_NAME: &str = "cm-analysis";

/// Shown to the contract owner; the underlying cause stays in the job row.
pub const ANALYSIS_FAILED_MESSAGE: &str = "Failed to analyze contract. Please try again.";

/// Wakes an idle worker as soon as a job is enqueued instead of waiting for
/// the next poll.
#[derive(Clone, Default)]
pub struct JobSignal {
    notify: Arc<Notify>,
}

impl JobSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

#[derive(Clone)]
pub struct AnalysisContext {
    pub store: Arc<dyn Store>,
    pub llm: LlmProviderKind,
    pub fetcher: DocumentFetcher,
    pub email: EmailClient,
    pub config: ServiceConfigHandle,
    pub signal: JobSignal,
    pub service_name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Analyzed,
    Failed,
    Retrying,
    /// The contract left `processing` (or vanished) before the result landed.
    Stale,
}

#[derive(Clone)]
pub struct AnalysisWorkerConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub config_poll_seconds: u64,
    pub storage: StoragePolicy,
}

pub fn load_config() -> Result<AnalysisWorkerConfig> {
    Ok(AnalysisWorkerConfig {
        addr: env_config::socket_addr_from_env("ANALYSIS_WORKER_ADDR", "0.0.0.0:8082")?,
        database_url: env_config::required_env("DATABASE_URL")?,
        config_poll_seconds: env_config::parse_env("CONFIG_POLL_SECONDS", 30u64)?,
        storage: StoragePolicy::from_env()?,
    })
}

/// Builds the worker's collaborators from the environment around an
/// existing store and wake-up signal.
pub async fn build_context(
    store: Arc<dyn Store>,
    signal: JobSignal,
    service_name: &'static str,
    config_poll: Duration,
    storage: StoragePolicy,
) -> Result<AnalysisContext> {
    let config = service_config::watch_service_config(
        Arc::clone(&store),
        service_config::ANALYSIS_SERVICE,
        AnalysisRuntimeConfig::default_json(),
        config_poll,
    )
    .await?;
    let llm = llm::build_provider(&LlmSettings::from_env())?;
    if matches!(llm, LlmProviderKind::Disabled) {
        tracing::warn!("llm provider disabled; analyses will fail until one is configured");
    }
    Ok(AnalysisContext {
        store,
        llm,
        fetcher: DocumentFetcher::new(storage)?,
        email: EmailClient::from_env()?,
        config,
        signal,
        service_name,
    })
}

/// Standalone worker process with its own health and metrics endpoints.
pub async fn run(config: AnalysisWorkerConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    metrics::init(SERVICE_NAME);

    let store = PgStore::connect(&config.database_url, 5).await?;
    let store: Arc<dyn Store> = Arc::new(store);
    let context = build_context(
        Arc::clone(&store),
        JobSignal::new(),
        SERVICE_NAME,
        Duration::from_secs(config.config_poll_seconds),
        config.storage,
    )
    .await?;
    spawn_job_worker(context);

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(store);
    let router = http::apply_standard_layers(router, SERVICE_NAME, &[]);
    server::serve(config.addr, router).await
}

async fn healthz(State(store): State<Arc<dyn Store>>) -> impl IntoResponse {
    match store.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}

pub fn spawn_job_worker(context: AnalysisContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = context.config.get().await;
            let runtime = AnalysisRuntimeConfig::from_json(&snapshot.config_json);
            if !runtime.enabled {
                context.signal.wait(runtime.poll_interval()).await;
                continue;
            }

            match process_next_job(&context, &runtime).await {
                Ok(Some(_)) => {}
                Ok(None) => context.signal.wait(runtime.poll_interval()).await,
                Err(err) => {
                    tracing::warn!(error = %err, "analysis job claim failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Claims and runs at most one job. `Ok(None)` means the queue was empty.
pub async fn process_next_job(
    context: &AnalysisContext,
    runtime: &AnalysisRuntimeConfig,
) -> Result<Option<(AnalysisJob, JobOutcome)>> {
    let Some(job) = context.store.claim_analysis_job(runtime.lease()).await? else {
        return Ok(None);
    };
    tracing::info!(
        job_id = %job.job_id,
        contract_id = job.contract_id,
        attempt = job.attempts,
        "analysis job claimed"
    );

    let started = Instant::now();
    let result = analyze(context, runtime, &job).await;
    let outcome = finish_job(context, runtime, &job, result).await?;
    let label = match outcome {
        JobOutcome::Analyzed | JobOutcome::Stale => metrics::RESULT_SUCCESS,
        JobOutcome::Retrying => metrics::RESULT_RETRY,
        JobOutcome::Failed => metrics::RESULT_ERROR,
    };
    metrics::record_analysis_job(context.service_name, label, started.elapsed());
    Ok(Some((job, outcome)))
}

async fn analyze(
    context: &AnalysisContext,
    runtime: &AnalysisRuntimeConfig,
    job: &AnalysisJob,
) -> Result<ContractAnalysis> {
    let contract = context
        .store
        .find_contract(job.contract_id)
        .await?
        .ok_or_else(|| anyhow!("contract {} no longer exists", job.contract_id))?;
    if contract.status != ContractStatus::Processing {
        return Err(anyhow!("contract {} is {}", contract.id, contract.status));
    }

    let bytes = context
        .fetcher
        .fetch(&contract.storage_url)
        .await
        .context("fetch document")?;
    let text = extract::extract_text(&bytes, &contract.mime_type).context("extract text")?;
    let text = extract::truncate_chars(&text, runtime.llm.max_document_chars);

    let request = [LlmTurn::user(prompt::analysis_prompt(&text))];
    let response = match context
        .llm
        .generate(&request, runtime.llm.request_timeout())
        .await
    {
        Ok(response) => {
            metrics::inc_llm_request(context.service_name, "analysis", metrics::RESULT_SUCCESS);
            response
        }
        Err(err) => {
            metrics::inc_llm_request(context.service_name, "analysis", metrics::RESULT_ERROR);
            return Err(anyhow::Error::new(err).context("model call"));
        }
    };
    let parsed = parse::parse_analysis(&response).context("parse model response")?;

    Ok(ContractAnalysis {
        extracted_text: text,
        detected_language: parsed.detected_language,
        risk_score: parsed.risk_score,
        sharia_compliance: parsed.sharia_compliance,
        ksa_compliance: parsed.ksa_compliance,
        report: parsed.report,
    })
}

async fn finish_job(
    context: &AnalysisContext,
    runtime: &AnalysisRuntimeConfig,
    job: &AnalysisJob,
    result: Result<ContractAnalysis>,
) -> Result<JobOutcome> {
    match result {
        Ok(analysis) => {
            let risk_score = analysis.risk_score;
            let applied = context
                .store
                .complete_analysis(job, &AnalysisOutcome::Analyzed(analysis))
                .await?;
            if !applied {
                tracing::info!(job_id = %job.job_id, contract_id = job.contract_id, "analysis result discarded");
                return Ok(JobOutcome::Stale);
            }
            tracing::info!(job_id = %job.job_id, contract_id = job.contract_id, "contract analyzed");
            notify_owner(context, job.contract_id, risk_score.as_str()).await;
            Ok(JobOutcome::Analyzed)
        }
        Err(err) => {
            let internal_error = format!("{err:#}");
            if job.attempts < job.max_attempts {
                tracing::warn!(
                    job_id = %job.job_id,
                    contract_id = job.contract_id,
                    attempt = job.attempts,
                    error = %internal_error,
                    "analysis failed; retry scheduled"
                );
                context
                    .store
                    .reschedule_analysis_job(job, &internal_error, runtime.retry_delay())
                    .await?;
                return Ok(JobOutcome::Retrying);
            }

            tracing::warn!(
                job_id = %job.job_id,
                contract_id = job.contract_id,
                error = %internal_error,
                "analysis failed"
            );
            let applied = context
                .store
                .complete_analysis(
                    job,
                    &AnalysisOutcome::Failed {
                        user_message: ANALYSIS_FAILED_MESSAGE.to_string(),
                        internal_error,
                    },
                )
                .await?;
            Ok(if applied {
                JobOutcome::Failed
            } else {
                JobOutcome::Stale
            })
        }
    }
}

async fn notify_owner(context: &AnalysisContext, contract_id: i64, risk_score: &str) {
    let lookup = async {
        let contract = context.store.find_contract(contract_id).await?;
        let Some(contract) = contract else {
            return Ok(None);
        };
        let user = context.store.find_user(contract.user_id).await?;
        Ok::<_, cm_core::store::StoreError>(user.map(|user| (user, contract)))
    };
    match lookup.await {
        Ok(Some((user, contract))) => context.email.send_in_background(email::analysis_complete(
            &user.email,
            user.name.as_deref(),
            &contract.filename,
            risk_score,
        )),
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(contract_id, error = %err, "analysis notification lookup failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::tests::{gemini_provider, spawn_gemini_mock};
    use axum::http::header::CONTENT_TYPE;
    use chrono::Utc;
    use cm_core::model::{
        AnalysisReport, ComplianceStatus, Contract, DetectedLanguage, JobStatus, Language,
        NewContract, NewUser, RiskScore, User, UserRole,
    };
    use cm_core::store::MemoryStore;
    use tokio::net::TcpListener;

    pub(crate) const VALID_ANALYSIS: &str = r#"{"summary":"Office lease.","riskScore":"high","riskFactors":["Uncapped penalty"],"shariaCompliance":"non_compliant","shariaIssues":["Late fee accrues interest"],"ksaCompliance":"requires_review","ksaIssues":[],"keyTerms":[],"recommendations":["Remove the interest clause"],"detectedLanguage":"en"}"#;

    pub(crate) async fn seed_user(store: &dyn Store) -> User {
        store
            .create_user(NewUser {
                email: format!("user-{}@example.com", uuid::Uuid::new_v4()),
                name: Some("Test User".into()),
                password_hash: "hash".into(),
                role: UserRole::User,
                language: Language::En,
                trial_ends_at: Utc::now(),
            })
            .await
            .expect("create user")
    }

    pub(crate) fn new_contract(user_id: i64, storage_url: &str, mime_type: &str) -> NewContract {
        NewContract {
            user_id,
            filename: "lease.txt".into(),
            storage_key: "contracts/lease.txt".into(),
            storage_url: storage_url.into(),
            file_size: 128,
            mime_type: mime_type.into(),
        }
    }

    /// A contract already in `analyzed` with `text` as its extracted text.
    pub(crate) async fn analyzed_contract(store: &dyn Store, user_id: i64, text: &str) -> Contract {
        let (contract, _) = store
            .create_contract_with_job(new_contract(user_id, "http://storage.test/x", "text/plain"), 1)
            .await
            .expect("create contract");
        let job = store
            .claim_analysis_job(Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("job");
        let applied = store
            .complete_analysis(
                &job,
                &AnalysisOutcome::Analyzed(ContractAnalysis {
                    extracted_text: text.into(),
                    detected_language: DetectedLanguage::En,
                    risk_score: RiskScore::Low,
                    sharia_compliance: ComplianceStatus::Compliant,
                    ksa_compliance: ComplianceStatus::Compliant,
                    report: AnalysisReport::default(),
                }),
            )
            .await
            .expect("complete");
        assert!(applied);
        store
            .find_contract(contract.id)
            .await
            .expect("find")
            .expect("contract")
    }

    async fn spawn_storage_mock() -> String {
        let app = Router::new()
            .route(
                "/lease.txt",
                get(|| async { ([(CONTENT_TYPE, "text/plain")], "Clause 1: rent of 5,000 SAR with 2% monthly late interest.") }),
            )
            .route("/lease.docx", get(|| async { "PK\u{3}\u{4}" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind storage mock");
        let addr = listener.local_addr().expect("storage mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve storage mock");
        });
        format!("http://{addr}")
    }

    fn loopback_storage(storage: &str) -> StoragePolicy {
        StoragePolicy::new(&[storage])
            .expect("storage policy")
            .allow_private_hosts(true)
    }

    async fn context(store: Arc<dyn Store>, storage: &str, reply: &'static str) -> AnalysisContext {
        let (gemini, _) = spawn_gemini_mock(reply, Duration::ZERO).await;
        AnalysisContext {
            store,
            llm: gemini_provider(gemini),
            fetcher: DocumentFetcher::new(loopback_storage(&storage)).expect("fetcher"),
            email: EmailClient::Disabled,
            config: service_config::static_handle(AnalysisRuntimeConfig::default_json()),
            signal: JobSignal::new(),
            service_name: "test",
        }
    }

    fn runtime(max_attempts: i32) -> AnalysisRuntimeConfig {
        AnalysisRuntimeConfig::from_json(&json!({ "max_attempts": max_attempts }))
    }

    #[tokio::test]
    async fn valid_model_output_analyzes_contract() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;
        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, &format!("{storage}/lease.txt"), "text/plain"), 1)
            .await
            .expect("create");
        assert_eq!(contract.status, ContractStatus::Processing);

        let context = context(Arc::clone(&store), &storage, VALID_ANALYSIS).await;
        let (_, outcome) = process_next_job(&context, &runtime(1))
            .await
            .expect("process")
            .expect("job");
        assert_eq!(outcome, JobOutcome::Analyzed);

        let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
        assert_eq!(stored.status, ContractStatus::Analyzed);
        assert_eq!(stored.risk_score, Some(RiskScore::High));
        assert_eq!(stored.sharia_compliance, Some(ComplianceStatus::NonCompliant));
        assert_eq!(stored.ksa_compliance, Some(ComplianceStatus::RequiresReview));
        assert_eq!(stored.detected_language, Some(DetectedLanguage::En));
        assert!(stored.analyzed_at.is_some());
        assert!(stored.error_message.is_none());
        assert!(stored
            .extracted_text
            .as_deref()
            .unwrap_or_default()
            .contains("late interest"));

        let job = store.find_analysis_job(contract.id).await.expect("job").expect("job row");
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(process_next_job(&context, &runtime(1)).await.expect("process").is_none());
    }

    #[tokio::test]
    async fn invalid_model_output_marks_contract_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;
        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, &format!("{storage}/lease.txt"), "text/plain"), 1)
            .await
            .expect("create");

        let context = context(Arc::clone(&store), &storage, "Sorry, I cannot help with that.").await;
        let (_, outcome) = process_next_job(&context, &runtime(1))
            .await
            .expect("process")
            .expect("job");
        assert_eq!(outcome, JobOutcome::Failed);

        let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
        assert_eq!(stored.status, ContractStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some(ANALYSIS_FAILED_MESSAGE));
        assert!(stored.risk_score.is_none());
        assert!(stored.sharia_compliance.is_none());
        assert!(stored.ksa_compliance.is_none());
        assert!(stored.detected_language.is_none());

        let job = store.find_analysis_job(contract.id).await.expect("job").expect("job row");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap_or_default().contains("parse model response"));
    }

    #[tokio::test]
    async fn documents_outside_storage_origins_are_never_fetched() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;
        let (contract, _) = store
            .create_contract_with_job(
                new_contract(
                    user.id,
                    "http://169.254.169.254/latest/meta-data/iam/security-credentials/",
                    "text/plain",
                ),
                1,
            )
            .await
            .expect("create");

        let context = context(Arc::clone(&store), &storage, VALID_ANALYSIS).await;
        let (_, outcome) = process_next_job(&context, &runtime(1))
            .await
            .expect("process")
            .expect("job");
        assert_eq!(outcome, JobOutcome::Failed);

        let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
        assert_eq!(stored.status, ContractStatus::Error);
        assert!(stored.extracted_text.is_none());
        let job = store.find_analysis_job(contract.id).await.expect("job").expect("job row");
        assert!(job
            .last_error
            .unwrap_or_default()
            .contains("outside the allowed storage origins"));
    }

    #[tokio::test]
    async fn word_documents_fail_without_calling_the_model() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;
        let (contract, _) = store
            .create_contract_with_job(
                new_contract(user.id, &format!("{storage}/lease.docx"), extract::MIME_DOCX),
                1,
            )
            .await
            .expect("create");

        let mut context = context(Arc::clone(&store), &storage, VALID_ANALYSIS).await;
        context.llm = LlmProviderKind::Disabled;
        process_next_job(&context, &runtime(1)).await.expect("process");

        let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
        assert_eq!(stored.status, ContractStatus::Error);
    }

    #[tokio::test]
    async fn failures_with_attempts_left_are_rescheduled() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;
        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, &format!("{storage}/lease.txt"), "text/plain"), 2)
            .await
            .expect("create");

        let context = context(Arc::clone(&store), &storage, "not json").await;
        let (_, outcome) = process_next_job(&context, &runtime(2))
            .await
            .expect("process")
            .expect("job");
        assert_eq!(outcome, JobOutcome::Retrying);

        let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
        assert_eq!(stored.status, ContractStatus::Processing);
        let job = store.find_analysis_job(contract.id).await.expect("job").expect("job row");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_run_at > Utc::now());
        assert!(process_next_job(&context, &runtime(2)).await.expect("process").is_none());
    }

    #[tokio::test]
    async fn signal_wakes_idle_worker() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let storage = spawn_storage_mock().await;
        let user = seed_user(store.as_ref()).await;

        let mut context = context(Arc::clone(&store), &storage, VALID_ANALYSIS).await;
        context.config = service_config::static_handle(json!({ "poll_interval_seconds": 3600 }));
        let worker = spawn_job_worker(context.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (contract, _) = store
            .create_contract_with_job(new_contract(user.id, &format!("{storage}/lease.txt"), "text/plain"), 1)
            .await
            .expect("create");
        context.signal.notify();

        let analyzed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let stored = store.find_contract(contract.id).await.expect("find").expect("contract");
                if stored.status != ContractStatus::Processing {
                    return stored.status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker woke up");
        assert_eq!(analyzed, ContractStatus::Analyzed);
        worker.abort();
    }
}
