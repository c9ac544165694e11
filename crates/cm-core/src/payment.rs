//! Tap payment gateway client. Charges are created with a redirect flow and
//! later re-fetched by id; the fetched status is the only one trusted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::optional_env;
use crate::model::{BillingCycle, PaidTier};

pub const DEFAULT_TAP_API_URL: &str = "https://api.tap.company/v2";
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment gateway is not configured")]
    NotConfigured,
    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default)]
pub struct TapConfig {
    pub secret_key: Option<String>,
    pub public_key: Option<String>,
    pub api_url: String,
}

impl TapConfig {
    pub fn from_env() -> Self {
        Self {
            secret_key: optional_env("TAP_SECRET_KEY"),
            public_key: optional_env("TAP_PUBLIC_KEY"),
            api_url: optional_env("TAP_API_URL").unwrap_or_else(|| DEFAULT_TAP_API_URL.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: i64,
    pub user_id: i64,
    pub amount_halalas: i64,
    pub currency: String,
    pub tier: PaidTier,
    pub billing_cycle: BillingCycle,
    pub customer_email: String,
    pub customer_name: String,
    pub redirect_url: String,
    pub webhook_url: Option<String>,
}

impl ChargeRequest {
    fn to_body(&self) -> Value {
        let mut body = json!({
            "amount": self.amount_halalas as f64 / 100.0,
            "currency": self.currency,
            "customer": {
                "first_name": self.customer_name,
                "email": self.customer_email,
            },
            "source": { "id": "src_all" },
            "redirect": { "url": self.redirect_url },
            "reference": { "transaction": format!("payment-{}", self.payment_id) },
            "metadata": {
                "paymentId": self.payment_id,
                "userId": self.user_id,
                "tier": self.tier.as_str(),
                "billingCycle": self.billing_cycle.as_str(),
            },
        });
        if let Some(webhook_url) = &self.webhook_url {
            body["post"] = json!({ "url": webhook_url });
        }
        body
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChargeCard {
    pub brand: Option<String>,
    pub last_four: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChargeTransaction {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChargeResponseDetail {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Charge {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub transaction: Option<ChargeTransaction>,
    #[serde(default)]
    pub card: Option<ChargeCard>,
    #[serde(default)]
    pub response: Option<ChargeResponseDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeVerdict {
    Captured,
    Pending,
    Failed(String),
}

impl Charge {
    pub fn verdict(&self) -> ChargeVerdict {
        match self.status.to_ascii_uppercase().as_str() {
            "CAPTURED" => ChargeVerdict::Captured,
            "INITIATED" | "IN_PROGRESS" => ChargeVerdict::Pending,
            other => ChargeVerdict::Failed(
                self.response
                    .as_ref()
                    .and_then(|detail| detail.message.clone())
                    .unwrap_or_else(|| format!("charge {}", other.to_ascii_lowercase())),
            ),
        }
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .and_then(|transaction| transaction.url.as_deref())
    }
}

#[derive(Clone)]
pub struct PaymentGateway {
    http: reqwest::Client,
    config: TapConfig,
}

impl PaymentGateway {
    pub fn new(config: TapConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder().timeout(GATEWAY_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.secret_key.is_some()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.config.public_key.as_deref()
    }

    fn secret_key(&self) -> Result<&str, PaymentError> {
        self.config
            .secret_key
            .as_deref()
            .ok_or(PaymentError::NotConfigured)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    pub async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge, PaymentError> {
        let secret = self.secret_key()?;
        let response = self
            .http
            .post(self.endpoint("charges"))
            .bearer_auth(secret)
            .json(&request.to_body())
            .send()
            .await?;
        read_charge(response).await
    }

    pub async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge, PaymentError> {
        let secret = self.secret_key()?;
        let response = self
            .http
            .get(self.endpoint(&format!("charges/{charge_id}")))
            .bearer_auth(secret)
            .send()
            .await?;
        read_charge(response).await
    }
}

async fn read_charge(response: reqwest::Response) -> Result<Charge, PaymentError> {
    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| {
                body.pointer("/errors/0/description")
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("gateway returned {status}"));
        tracing::warn!(status = %status, message = %message, "payment gateway request failed");
        return Err(PaymentError::Rejected(message));
    }
    Ok(response.json::<Charge>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    async fn spawn_gateway() -> String {
        let app = Router::new()
            .route(
                "/charges",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok())
                        != Some("Bearer sk_test")
                    {
                        return (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({ "message": "invalid api key" })),
                        );
                    }
                    assert_eq!(body["amount"], 299.0);
                    assert_eq!(body["metadata"]["paymentId"], 7);
                    (
                        StatusCode::OK,
                        Json(json!({
                            "id": "chg_1",
                            "status": "INITIATED",
                            "amount": 299.0,
                            "currency": "SAR",
                            "transaction": { "url": "https://checkout.test/chg_1" }
                        })),
                    )
                }),
            )
            .route(
                "/charges/:id",
                get(|Path(id): Path<String>| async move {
                    let status = if id == "chg_paid" { "CAPTURED" } else { "DECLINED" };
                    Json(json!({
                        "id": id,
                        "status": status,
                        "card": { "brand": "VISA", "last_four": "4242" },
                        "response": { "code": "507", "message": "Declined, card issuer" }
                    }))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind gateway mock");
        let addr = listener.local_addr().expect("gateway mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve gateway mock");
        });
        format!("http://{addr}")
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            payment_id: 7,
            user_id: 3,
            amount_halalas: 29_900,
            currency: "SAR".into(),
            tier: PaidTier::Starter,
            billing_cycle: BillingCycle::Monthly,
            customer_email: "owner@example.com".into(),
            customer_name: "Owner".into(),
            redirect_url: "https://app.test/subscription".into(),
            webhook_url: None,
        }
    }

    fn gateway(api_url: String, secret: Option<&str>) -> PaymentGateway {
        PaymentGateway::new(TapConfig {
            secret_key: secret.map(str::to_string),
            public_key: Some("pk_test".into()),
            api_url,
        })
        .expect("gateway")
    }

    #[tokio::test]
    async fn create_charge_returns_redirect_url() {
        let base = spawn_gateway().await;
        let charge = gateway(base, Some("sk_test"))
            .create_charge(&charge_request())
            .await
            .expect("charge");
        assert_eq!(charge.id, "chg_1");
        assert_eq!(charge.verdict(), ChargeVerdict::Pending);
        assert_eq!(charge.redirect_url(), Some("https://checkout.test/chg_1"));
    }

    #[tokio::test]
    async fn rejected_key_surfaces_gateway_message() {
        let base = spawn_gateway().await;
        let err = gateway(base, Some("sk_wrong"))
            .create_charge(&charge_request())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Rejected(message) if message == "invalid api key"));
    }

    #[tokio::test]
    async fn retrieve_charge_maps_status_to_verdict() {
        let base = spawn_gateway().await;
        let gateway = gateway(base, Some("sk_test"));
        let paid = gateway.retrieve_charge("chg_paid").await.expect("paid");
        assert_eq!(paid.verdict(), ChargeVerdict::Captured);
        assert_eq!(paid.card.and_then(|card| card.last_four).as_deref(), Some("4242"));

        let declined = gateway.retrieve_charge("chg_other").await.expect("declined");
        assert_eq!(
            declined.verdict(),
            ChargeVerdict::Failed("Declined, card issuer".into())
        );
    }

    #[tokio::test]
    async fn missing_secret_is_not_configured() {
        let gateway = gateway("http://127.0.0.1:9".into(), None);
        assert!(!gateway.is_configured());
        let err = gateway.retrieve_charge("chg_1").await.unwrap_err();
        assert!(matches!(err, PaymentError::NotConfigured));
    }
}
