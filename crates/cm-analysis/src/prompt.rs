//! Model prompts for contract analysis and contract chat.

use cm_core::model::{AiMessage, DetectedLanguage, Language, MessageRole};

use crate::llm::LlmTurn;

const CHAT_ACKNOWLEDGEMENT: &str =
    "I understand. I'm ready to answer questions about this contract.";

pub fn analysis_prompt(contract_text: &str) -> String {
    format!(
        r#"You are an expert legal AI assistant specializing in Saudi Arabian contract law, Sharia compliance, and KSA regulatory requirements.

Analyze the following contract and provide a comprehensive analysis in JSON format with the following structure:

{{
  "summary": "Brief 2-3 sentence summary of the contract",
  "riskScore": "low" | "medium" | "high",
  "riskFactors": ["list of identified risk factors"],
  "shariaCompliance": "compliant" | "non_compliant" | "requires_review",
  "shariaIssues": ["list of Sharia compliance issues if any"],
  "ksaCompliance": "compliant" | "non_compliant" | "requires_review",
  "ksaIssues": ["list of KSA regulatory compliance issues if any"],
  "keyTerms": [
    {{ "term": "term name", "definition": "explanation", "importance": "high" | "medium" | "low" }}
  ],
  "recommendations": ["actionable recommendations for the user"],
  "detectedLanguage": "en" | "ar" | "mixed"
}}

Consider:
1. Risk Assessment: unfair terms, liability issues, payment terms, termination clauses
2. Sharia Compliance: interest (riba), excessive uncertainty (gharar), gambling (maysir), prohibited activities
3. KSA Regulatory Compliance: Saudi Labor Law, Commercial Law, Consumer Protection Law
4. Key Terms: important clauses, obligations, rights, and restrictions
5. Language: whether the contract is in English, Arabic, or mixed

Contract Text:
{contract_text}

Provide only the JSON response, no additional text."#
    )
}

/// Arabic contracts get an Arabic system prompt; English and mixed ones get English.
pub fn chat_language(detected: Option<DetectedLanguage>) -> Language {
    match detected {
        Some(DetectedLanguage::Ar) => Language::Ar,
        _ => Language::En,
    }
}

pub fn chat_system_prompt(contract_text: &str, language: Language) -> String {
    match language {
        Language::Ar => format!(
            "أنت مساعد قانوني متخصص في تحليل العقود السعودية باسم ContraMind AI. لديك خبرة في القانون السعودي والامتثال الشرعي والأنظمة التنظيمية في المملكة العربية السعودية.

العقد المرجعي:
{contract_text}

عند الإجابة على الأسئلة:
1. ابدأ دائماً بعبارة: \"ContraMind AI يوصي بـ:\"
2. استخدم جداول Markdown للتحليل المنظم
3. قدم ملخصاً تنفيذياً (≤ 150 كلمة) بعد الجدول
4. استخدم لغة قانونية رسمية ومهنية
5. نظم الإجابة بوضوح مع عناوين وأقسام

قدم إجابات عملية ومفيدة ومنظمة بشكل احترافي."
        ),
        Language::En => format!(
            "You are ContraMind AI, an expert legal assistant specializing in Saudi Arabian contract analysis. You have expertise in Saudi law, Sharia compliance, and KSA regulatory requirements.

Reference Contract:
{contract_text}

When answering questions, ALWAYS follow this structure:

1. Start with: \"ContraMind AI recommends to:\"
2. Use Markdown tables for structured analysis with columns: Clause #/Title | Contract Extract | Issue/Concern | Recommendation
3. Provide an executive summary (≤ 150 words) after the table highlighting top 3 risks/issues
4. Use formal legal English suitable for professional review
5. Organize your answer with clear headings and sections
6. For risk analysis, categorize by: Financial, Legal, Operational, Compliance
7. For Sharia compliance, check: Riba (interest), Gharar (uncertainty), prohibited activities
8. For KSA compliance, reference: Labor Law, Commercial Law, Consumer Protection Law

Provide practical, actionable, and professionally structured responses."
        ),
    }
}

/// Builds the conversation sent to the model: system prompt, acknowledgement,
/// at most `history_window` prior turns, then the new question.
pub fn chat_turns(
    system_prompt: &str,
    history: &[AiMessage],
    history_window: usize,
    question: &str,
) -> Vec<LlmTurn> {
    let prior: Vec<&AiMessage> = history
        .iter()
        .filter(|message| matches!(message.role, MessageRole::User | MessageRole::Assistant))
        .collect();
    let skip = prior.len().saturating_sub(history_window);

    let mut turns = Vec::with_capacity(history_window + 3);
    turns.push(LlmTurn::user(system_prompt));
    turns.push(LlmTurn::model(CHAT_ACKNOWLEDGEMENT));
    for message in prior.into_iter().skip(skip) {
        turns.push(match message.role {
            MessageRole::Assistant => LlmTurn::model(message.content.clone()),
            _ => LlmTurn::user(message.content.clone()),
        });
    }
    turns.push(LlmTurn::user(question));
    turns
}

const SUGGESTED_EN: [&str; 7] = [
    "What are the main risks in this contract?",
    "Is this contract Sharia compliant?",
    "What are my obligations under this contract?",
    "Are there any unfair terms?",
    "What are the termination conditions?",
    "Explain the payment terms",
    "What are the legal liabilities?",
];

const SUGGESTED_AR: [&str; 7] = [
    "ما هي أهم المخاطر في هذا العقد؟",
    "هل هذا العقد متوافق مع الشريعة الإسلامية؟",
    "ما هي التزاماتي بموجب هذا العقد؟",
    "هل هناك أي بنود غير عادلة؟",
    "ما هي شروط الإنهاء؟",
    "اشرح شروط الدفع",
    "ما هي المسؤوليات القانونية؟",
];

pub fn suggested_prompts(language: Language) -> &'static [&'static str] {
    match language {
        Language::En => &SUGGESTED_EN,
        Language::Ar => &SUGGESTED_AR,
    }
}

/// Rough token count for an exchange: one token per four characters.
pub fn estimate_tokens(system_prompt: &str, question: &str, reply: &str) -> i32 {
    let chars = system_prompt.chars().count() + question.chars().count() + reply.chars().count();
    chars.div_ceil(4).min(i32::MAX as usize) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: i64, role: MessageRole, content: &str) -> AiMessage {
        AiMessage {
            id,
            contract_id: 1,
            user_id: 1,
            role,
            content: content.into(),
            tokens_used: None,
            prompt_type: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn chat_turns_keep_only_the_latest_window() {
        let history: Vec<AiMessage> = (1..=12)
            .map(|id| {
                let role = if id % 2 == 1 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                };
                message(id, role, &format!("turn {id}"))
            })
            .collect();
        let turns = chat_turns("system", &history, 5, "next");
        assert_eq!(turns.len(), 5 + 3);
        assert_eq!(turns[2].text, "turn 8");
        assert_eq!(turns[2].role, crate::llm::TurnRole::Model);
        assert_eq!(turns.last().map(|turn| turn.text.as_str()), Some("next"));
    }

    #[test]
    fn chat_turns_skip_system_messages() {
        let history = vec![
            message(1, MessageRole::System, "note"),
            message(2, MessageRole::User, "q"),
        ];
        let turns = chat_turns("system", &history, 5, "next");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].text, "q");
    }

    #[test]
    fn arabic_contracts_get_arabic_prompts() {
        assert_eq!(chat_language(Some(DetectedLanguage::Ar)), Language::Ar);
        assert_eq!(chat_language(Some(DetectedLanguage::Mixed)), Language::En);
        assert!(chat_system_prompt("نص", Language::Ar).contains("العقد المرجعي"));
        assert_eq!(suggested_prompts(Language::Ar).len(), 7);
        assert_eq!(suggested_prompts(Language::En)[0], "What are the main risks in this contract?");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("abcd", "e", ""), 2);
        assert_eq!(estimate_tokens("", "", ""), 0);
    }

    #[test]
    fn analysis_prompt_embeds_contract_text() {
        let prompt = analysis_prompt("CLAUSE 7: penalties");
        assert!(prompt.contains("CLAUSE 7: penalties"));
        assert!(prompt.contains("\"riskScore\""));
    }
}
