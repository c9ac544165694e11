//! Operator tasks run from the `cm` binary.

use anyhow::{anyhow, Result};

use crate::model::{NewPromptTemplate, User, UserRole};
use crate::store::Store;

/// Grants the admin role to an existing account. Returns false when the
/// account already was an admin.
pub async fn promote_admin(store: &dyn Store, email: &str) -> Result<bool> {
    let email = email.trim();
    if email.is_empty() {
        return Err(anyhow!("email is required"));
    }
    let user: User = store
        .find_user_by_email(email)
        .await?
        .ok_or_else(|| anyhow!("no account registered for {email}"))?;
    if user.role == UserRole::Admin {
        return Ok(false);
    }
    store.set_user_role(user.id, UserRole::Admin).await?;
    tracing::info!(user_id = user.id, "account promoted to admin");
    Ok(true)
}

struct SeedPrompt {
    category: &'static str,
    title: &'static str,
    title_ar: &'static str,
    prompt: &'static str,
    prompt_ar: &'static str,
}

const SEED_PROMPTS: &[SeedPrompt] = &[
    SeedPrompt {
        category: "risk",
        title: "Main risks",
        title_ar: "أهم المخاطر",
        prompt: "What are the main risks in this contract?",
        prompt_ar: "ما هي أهم المخاطر في هذا العقد؟",
    },
    SeedPrompt {
        category: "sharia",
        title: "Sharia compliance",
        title_ar: "التوافق الشرعي",
        prompt: "Is this contract Sharia compliant?",
        prompt_ar: "هل هذا العقد متوافق مع الشريعة الإسلامية؟",
    },
    SeedPrompt {
        category: "obligations",
        title: "My obligations",
        title_ar: "التزاماتي",
        prompt: "What are my obligations under this contract?",
        prompt_ar: "ما هي التزاماتي بموجب هذا العقد؟",
    },
    SeedPrompt {
        category: "fairness",
        title: "Unfair terms",
        title_ar: "البنود غير العادلة",
        prompt: "Are there any unfair terms?",
        prompt_ar: "هل هناك أي بنود غير عادلة؟",
    },
    SeedPrompt {
        category: "termination",
        title: "Termination conditions",
        title_ar: "شروط الإنهاء",
        prompt: "What are the termination conditions?",
        prompt_ar: "ما هي شروط الإنهاء؟",
    },
    SeedPrompt {
        category: "payment",
        title: "Payment terms",
        title_ar: "شروط الدفع",
        prompt: "Explain the payment terms",
        prompt_ar: "اشرح شروط الدفع",
    },
    SeedPrompt {
        category: "liability",
        title: "Legal liabilities",
        title_ar: "المسؤوليات القانونية",
        prompt: "What are the legal liabilities?",
        prompt_ar: "ما هي المسؤوليات القانونية؟",
    },
];

/// Upserts the built-in prompt library. Safe to run repeatedly.
pub async fn seed_prompt_library(store: &dyn Store) -> Result<usize> {
    for (index, seed) in SEED_PROMPTS.iter().enumerate() {
        store
            .upsert_prompt(NewPromptTemplate {
                category: seed.category.to_string(),
                title: seed.title.to_string(),
                title_ar: Some(seed.title_ar.to_string()),
                prompt: seed.prompt.to_string(),
                prompt_ar: Some(seed.prompt_ar.to_string()),
                display_order: index as i32 + 1,
            })
            .await?;
    }
    tracing::info!(count = SEED_PROMPTS.len(), "prompt library seeded");
    Ok(SEED_PROMPTS.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Language, NewUser};
    use crate::store::{CatalogRepository, MemoryStore, UserRepository};
    use chrono::Utc;

    async fn register(store: &MemoryStore, email: &str) -> User {
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
            .expect("create user")
    }

    #[tokio::test]
    async fn promote_admin_is_idempotent() {
        let store = MemoryStore::new();
        let user = register(&store, "ops@example.com").await;

        assert!(promote_admin(&store, "OPS@example.com").await.expect("promote"));
        assert!(!promote_admin(&store, "ops@example.com").await.expect("promote again"));
        let stored = store.find_user(user.id).await.expect("find").expect("user");
        assert_eq!(stored.role, UserRole::Admin);
    }

    #[tokio::test]
    async fn promote_admin_requires_existing_account() {
        let store = MemoryStore::new();
        assert!(promote_admin(&store, "missing@example.com").await.is_err());
        assert!(promote_admin(&store, "  ").await.is_err());
    }

    #[tokio::test]
    async fn seeding_twice_keeps_one_row_per_prompt() {
        let store = MemoryStore::new();
        seed_prompt_library(&store).await.expect("seed");
        seed_prompt_library(&store).await.expect("reseed");
        let prompts = store.list_prompts(None).await.expect("list");
        assert_eq!(prompts.len(), 7);
        assert_eq!(prompts[0].category, "risk");
        assert_eq!(prompts[6].display_order, 7);
        assert_eq!(store.list_prompts(Some("payment")).await.expect("list").len(), 1);
    }
}
