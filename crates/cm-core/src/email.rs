//! Transactional email. Delivery is best effort: callers hand a message to
//! [`EmailClient::send_in_background`] and failures only reach the logs.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::time::Duration;

use crate::config::optional_env;

const DEFAULT_FROM: &str = "ContraMind.ai <no-reply@contramind.ai>";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Clone)]
pub enum EmailClient {
    /// Logs the message instead of sending it.
    Disabled,
    Http {
        client: reqwest::Client,
        endpoint: String,
        api_key: Option<String>,
        from: String,
    },
}

impl EmailClient {
    pub fn from_env() -> Result<Self> {
        let Some(endpoint) = optional_env("EMAIL_API_URL") else {
            return Ok(EmailClient::Disabled);
        };
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(EmailClient::Http {
            client,
            endpoint,
            api_key: optional_env("EMAIL_API_KEY"),
            from: optional_env("EMAIL_FROM").unwrap_or_else(|| DEFAULT_FROM.to_string()),
        })
    }

    pub async fn send(&self, message: &EmailMessage) -> Result<()> {
        match self {
            EmailClient::Disabled => {
                tracing::info!(to = %message.to, subject = %message.subject, "email delivery disabled");
                Ok(())
            }
            EmailClient::Http {
                client,
                endpoint,
                api_key,
                from,
            } => {
                let mut request = client.post(endpoint).json(&json!({
                    "from": from,
                    "to": message.to,
                    "subject": message.subject,
                    "html": message.html,
                    "text": message.text,
                }));
                if let Some(api_key) = api_key {
                    request = request.bearer_auth(api_key);
                }
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(anyhow!("email provider returned {}", response.status()));
                }
                Ok(())
            }
        }
    }

    pub fn send_in_background(&self, message: EmailMessage) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.send(&message).await {
                tracing::warn!(to = %message.to, subject = %message.subject, error = %err, "email send failed");
            }
        });
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn display_name(name: Option<&str>) -> &str {
    name.map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("there")
}

pub fn welcome(to: &str, name: Option<&str>) -> EmailMessage {
    let name = display_name(name);
    EmailMessage {
        to: to.to_string(),
        subject: "Welcome to ContraMind.ai".to_string(),
        html: format!(
            "<h1>Welcome to ContraMind.ai, {}!</h1>\
             <p>Thank you for joining ContraMind.ai, the AI-powered contract analysis platform for Saudi Arabian businesses.</p>\
             <p>Get started by uploading your first contract.</p>\
             <p>Best regards,<br>The ContraMind.ai Team</p>",
            escape_html(name)
        ),
        text: format!(
            "Welcome to ContraMind.ai, {name}! Thank you for joining our platform. Get started by uploading your first contract."
        ),
    }
}

pub fn analysis_complete(
    to: &str,
    name: Option<&str>,
    contract_name: &str,
    risk_score: &str,
) -> EmailMessage {
    let name = display_name(name);
    EmailMessage {
        to: to.to_string(),
        subject: format!("Contract Analysis Complete: {contract_name}"),
        html: format!(
            "<h1>Your Contract Analysis is Ready</h1>\
             <p>Hi {},</p>\
             <p>We've completed the analysis of your contract: <strong>{}</strong></p>\
             <p>Risk Score: <strong>{}</strong></p>\
             <p>Log in to ContraMind.ai to view the full analysis and chat with the AI assistant about your contract.</p>",
            escape_html(name),
            escape_html(contract_name),
            risk_score.to_uppercase()
        ),
        text: format!(
            "Hi {name}, your contract analysis for \"{contract_name}\" is complete. Risk Score: {risk_score}. Log in to view the full analysis."
        ),
    }
}

pub fn ticket_reply(to: &str, name: Option<&str>, ticket_number: &str, reply: &str) -> EmailMessage {
    let name = display_name(name);
    EmailMessage {
        to: to.to_string(),
        subject: format!("New Reply on Support Ticket #{ticket_number}"),
        html: format!(
            "<h1>New Reply on Your Support Ticket</h1>\
             <p>Hi {},</p>\
             <p>You have a new reply on your support ticket <strong>#{}</strong>:</p>\
             <blockquote>{}</blockquote>\
             <p>Log in to ContraMind.ai to view the full conversation and reply.</p>",
            escape_html(name),
            escape_html(ticket_number),
            escape_html(reply)
        ),
        text: format!(
            "Hi {name}, you have a new reply on support ticket #{ticket_number}. Log in to view and respond."
        ),
    }
}

pub fn subscription_confirmed(
    to: &str,
    name: Option<&str>,
    tier: &str,
    amount_halalas: i64,
) -> EmailMessage {
    let name = display_name(name);
    let amount = format!("{}.{:02}", amount_halalas / 100, amount_halalas % 100);
    EmailMessage {
        to: to.to_string(),
        subject: "Subscription Confirmed - ContraMind.ai".to_string(),
        html: format!(
            "<h1>Subscription Confirmed</h1>\
             <p>Hi {},</p>\
             <p><strong>Plan:</strong> {}</p>\
             <p><strong>Amount:</strong> {amount} SAR</p>\
             <p>Your subscription is now active.</p>",
            escape_html(name),
            escape_html(tier)
        ),
        text: format!("Hi {name}, your {tier} subscription ({amount} SAR) is now active."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[test]
    fn ticket_reply_escapes_user_text() {
        let message = ticket_reply("a@example.com", None, "TKT-1-ABCDEF", "<script>x</script>");
        assert!(message.html.contains("&lt;script&gt;x&lt;/script&gt;"));
        assert!(!message.html.contains("<script>"));
        assert!(message.html.contains("Hi there"));
        assert_eq!(message.subject, "New Reply on Support Ticket #TKT-1-ABCDEF");
    }

    #[test]
    fn subscription_amount_renders_in_riyals() {
        let message = subscription_confirmed("a@example.com", Some("Sara"), "starter", 29_900);
        assert!(message.text.contains("(299.00 SAR)"));
        assert!(message.text.starts_with("Hi Sara,"));
    }

    #[tokio::test]
    async fn http_client_posts_message_with_bearer_key() {
        let received: Arc<Mutex<Option<(Option<String>, Value)>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&received);
        let app = Router::new().route(
            "/send",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *captured.lock().expect("lock") = Some((auth, body));
                    StatusCode::ACCEPTED
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind email mock");
        let addr = listener.local_addr().expect("email mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve email mock");
        });

        let client = EmailClient::Http {
            client: reqwest::Client::new(),
            endpoint: format!("http://{addr}/send"),
            api_key: Some("key".into()),
            from: DEFAULT_FROM.into(),
        };
        client
            .send(&welcome("new@example.com", Some("Omar")))
            .await
            .expect("send");

        let (auth, body) = received.lock().expect("lock").clone().expect("request captured");
        assert_eq!(auth.as_deref(), Some("Bearer key"));
        assert_eq!(body["to"], "new@example.com");
        assert_eq!(body["subject"], "Welcome to ContraMind.ai");
    }

    #[tokio::test]
    async fn disabled_client_accepts_messages() {
        EmailClient::Disabled
            .send(&welcome("new@example.com", None))
            .await
            .expect("disabled send");
    }
}
