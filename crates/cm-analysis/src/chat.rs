//! One chat exchange against an analyzed contract.

use std::time::{Duration, Instant};
use thiserror::Error;

use cm_core::metrics;
use cm_core::model::{AiMessage, Contract, MessageRole, NewMessage};
use cm_core::store::{Store, StoreError};

use crate::llm::{LlmError, LlmProviderKind};
use crate::prompt;

pub const DEFAULT_HISTORY_WINDOW: usize = 5;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("contract has not been analyzed")]
    NotAnalyzed,
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub user_id: i64,
    pub content: &'a str,
    pub prompt_type: Option<String>,
    pub history_window: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ChatExchange {
    pub user_message: AiMessage,
    pub assistant_message: AiMessage,
}

/// Persists the question, asks the model with a bounded history window and
/// persists the reply. A model failure leaves the question in the transcript.
pub async fn exchange(
    store: &dyn Store,
    llm: &LlmProviderKind,
    service_name: &'static str,
    contract: &Contract,
    request: ChatRequest<'_>,
) -> Result<ChatExchange, ChatError> {
    if !contract.chat_ready() {
        return Err(ChatError::NotAnalyzed);
    }
    let contract_text = contract.extracted_text.as_deref().unwrap_or_default();

    let user_message = store
        .insert_message(NewMessage {
            contract_id: contract.id,
            user_id: request.user_id,
            role: MessageRole::User,
            content: request.content.to_string(),
            tokens_used: None,
            prompt_type: request.prompt_type.clone(),
        })
        .await?;

    let history = store
        .recent_turns(contract.id, user_message.id, request.history_window)
        .await?;
    let language = prompt::chat_language(contract.detected_language);
    let system_prompt = prompt::chat_system_prompt(contract_text, language);
    let turns = prompt::chat_turns(&system_prompt, &history, request.history_window, request.content);

    let started = Instant::now();
    let reply = match llm.generate(&turns, request.timeout).await {
        Ok(reply) => {
            metrics::inc_llm_request(service_name, "chat", metrics::RESULT_SUCCESS);
            reply
        }
        Err(err) => {
            metrics::inc_llm_request(service_name, "chat", metrics::RESULT_ERROR);
            tracing::warn!(
                contract_id = contract.id,
                message_id = user_message.id,
                provider = llm.source(),
                error = %err,
                "chat model call failed"
            );
            return Err(err.into());
        }
    };
    tracing::debug!(
        contract_id = contract.id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "chat reply generated"
    );

    let assistant_message = store
        .insert_message(NewMessage {
            contract_id: contract.id,
            user_id: request.user_id,
            role: MessageRole::Assistant,
            tokens_used: Some(prompt::estimate_tokens(&system_prompt, request.content, &reply)),
            content: reply,
            prompt_type: request.prompt_type,
        })
        .await?;

    Ok(ChatExchange {
        user_message,
        assistant_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::{gemini_provider, spawn_gemini_mock};
    use crate::tests::{analyzed_contract, seed_user};
    use cm_core::store::{ChatRepository, MemoryStore};

    fn request(user_id: i64, content: &str) -> ChatRequest<'_> {
        ChatRequest {
            user_id,
            content,
            prompt_type: None,
            history_window: DEFAULT_HISTORY_WINDOW,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn exchange_persists_both_sides() {
        let store = MemoryStore::new();
        let user = seed_user(&store).await;
        let contract = analyzed_contract(&store, user.id, "Clause 1: rent").await;
        let (base, _) =
            spawn_gemini_mock("ContraMind AI recommends to: pay on time", Duration::ZERO).await;
        let llm = gemini_provider(base);

        let result = exchange(&store, &llm, "test", &contract, request(user.id, "When is rent due?"))
            .await
            .expect("exchange");
        assert_eq!(result.user_message.role, MessageRole::User);
        assert_eq!(result.assistant_message.role, MessageRole::Assistant);
        assert!(result.assistant_message.tokens_used.unwrap_or_default() > 0);

        let transcript = store.list_messages(contract.id).await.expect("transcript");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].id, result.user_message.id);
    }

    #[tokio::test]
    async fn model_never_sees_more_than_the_window() {
        let store = MemoryStore::new();
        let user = seed_user(&store).await;
        let contract = analyzed_contract(&store, user.id, "Clause 1: rent").await;
        let (base, requests) = spawn_gemini_mock("ok", Duration::ZERO).await;
        let llm = gemini_provider(base);

        for index in 0..6 {
            let content = format!("question {index}");
            exchange(&store, &llm, "test", &contract, request(user.id, &content))
                .await
                .expect("exchange");
        }
        let requests = requests.lock().expect("lock");
        for body in requests.iter() {
            let turns = body["contents"].as_array().expect("contents").len();
            assert!(turns <= DEFAULT_HISTORY_WINDOW + 3, "sent {turns} turns");
        }
        let last = requests.last().expect("last request");
        assert_eq!(
            last["contents"].as_array().expect("contents").len(),
            DEFAULT_HISTORY_WINDOW + 3
        );
    }

    #[tokio::test]
    async fn processing_contract_is_rejected_before_any_write() {
        let store = MemoryStore::new();
        let user = seed_user(&store).await;
        let mut contract = analyzed_contract(&store, user.id, "text").await;
        contract.status = cm_core::model::ContractStatus::Processing;

        let err = exchange(&store, &LlmProviderKind::Disabled, "test", &contract, request(user.id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotAnalyzed));
        assert!(store.list_messages(contract.id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn model_failure_keeps_the_question() {
        let store = MemoryStore::new();
        let user = seed_user(&store).await;
        let contract = analyzed_contract(&store, user.id, "text").await;

        let err = exchange(&store, &LlmProviderKind::Disabled, "test", &contract, request(user.id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Model(LlmError::Disabled)));
        let transcript = store.list_messages(contract.id).await.expect("list");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, MessageRole::User);
    }
}
