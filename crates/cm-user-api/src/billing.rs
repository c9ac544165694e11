use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Months, Utc};
use cm_core::model::{
    AccountStatus, BillingCycle, NewPayment, Page, PaidTier, Payment, PaymentSettlement, PaymentStatus,
    Subscription, SubscriptionTier,
};
use cm_core::payment::{Charge, ChargeRequest, ChargeVerdict};
use cm_core::rate_limit::RateRule;
use cm_core::{email, metrics};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

use crate::auth::{client_ip, current_rate_limit, enforce_rate_limit, require_auth};
use crate::contracts::PageQuery;
use crate::{ApiError, ApiResult, AppState};

const CURRENCY: &str = "SAR";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOverview {
    pub tier: SubscriptionTier,
    pub status: AccountStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription: Option<Subscription>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub tier: PaidTier,
    pub name: &'static str,
    pub currency: &'static str,
    pub monthly_price_halalas: i64,
    pub annual_price_halalas: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub tier: PaidTier,
    pub billing_cycle: BillingCycle,
    pub redirect_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub payment_id: i64,
    pub charge_id: String,
    pub redirect_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfigResponse {
    pub configured: bool,
    pub public_key: Option<String>,
    pub currency: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub received: bool,
    pub payment_id: i64,
    pub status: PaymentStatus,
}

fn plan_name(tier: PaidTier) -> &'static str {
    match tier {
        PaidTier::Starter => "Starter",
        PaidTier::Professional => "Professional",
        PaidTier::Business => "Business",
    }
}

pub async fn current_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SubscriptionOverview>> {
    let auth = require_auth(&state, &headers).await?;
    let subscription = state.store.find_subscription(auth.user_id()).await?;
    Ok(Json(SubscriptionOverview {
        tier: auth.user.subscription_tier,
        status: auth.user.subscription_status,
        trial_ends_at: auth.user.trial_ends_at,
        subscription,
    }))
}

pub async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Payment>>> {
    let auth = require_auth(&state, &headers).await?;
    let page = Page::new(query.limit, query.offset)?;
    let payments = state.store.list_payments(auth.user_id(), page).await?;
    Ok(Json(payments))
}

pub async fn list_plans() -> Json<Vec<Plan>> {
    Json(
        PaidTier::ALL
            .iter()
            .map(|tier| Plan {
                tier: *tier,
                name: plan_name(*tier),
                currency: CURRENCY,
                monthly_price_halalas: tier.price_halalas(BillingCycle::Monthly),
                annual_price_halalas: tier.price_halalas(BillingCycle::Annual),
            })
            .collect(),
    )
}

pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let auth = require_auth(&state, &headers).await?;
    if !state.payments.is_configured() {
        return Err(not_configured());
    }

    let redirect_url = payload
        .redirect_url
        .or_else(|| {
            state
                .public_base_url
                .as_deref()
                .map(|base| format!("{}/subscription/callback", base.trim_end_matches('/')))
        })
        .ok_or_else(|| ApiError::bad_request("INVALID_REQUEST", "redirectUrl is required"))?;
    let redirect_ok = reqwest::Url::parse(&redirect_url)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !redirect_ok {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "redirectUrl must be an http(s) url",
        ));
    }

    let amount_halalas = payload.tier.price_halalas(payload.billing_cycle);
    let payment = state
        .store
        .create_payment(NewPayment {
            user_id: auth.user_id(),
            amount_halalas,
            currency: CURRENCY.to_string(),
            tier: payload.tier,
            billing_cycle: payload.billing_cycle,
            payment_method: Some("tap".to_string()),
        })
        .await?;

    let request = ChargeRequest {
        payment_id: payment.id,
        user_id: auth.user_id(),
        amount_halalas,
        currency: CURRENCY.to_string(),
        tier: payload.tier,
        billing_cycle: payload.billing_cycle,
        customer_email: auth.user.email.clone(),
        customer_name: auth.user.name.clone().unwrap_or_else(|| "Customer".to_string()),
        redirect_url,
        webhook_url: state
            .public_base_url
            .as_deref()
            .map(|base| format!("{}/v1/payments/webhook", base.trim_end_matches('/'))),
    };
    let charge = match state.payments.create_charge(&request).await {
        Ok(charge) => charge,
        Err(err) => {
            tracing::warn!(payment_id = payment.id, error = %err, "charge creation failed");
            return Err(fail_payment(&state, payment.id, err.to_string()).await);
        }
    };
    if let Err(err) = state.store.attach_transaction(payment.id, &charge.id).await {
        tracing::warn!(
            payment_id = payment.id,
            charge_id = %charge.id,
            error = %err,
            "charge could not be recorded"
        );
        return Err(fail_payment(&state, payment.id, format!("charge could not be recorded: {err}")).await);
    }

    if let ChargeVerdict::Failed(reason) = charge.verdict() {
        return Err(fail_payment(&state, payment.id, reason).await);
    }
    let Some(redirect_url) = charge.redirect_url().map(str::to_string) else {
        return Err(fail_payment(&state, payment.id, "gateway returned no payment page".into()).await);
    };
    tracing::info!(payment_id = payment.id, charge_id = %charge.id, "checkout started");

    Ok(Json(CheckoutResponse {
        payment_id: payment.id,
        charge_id: charge.id,
        redirect_url,
    }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Subscription>> {
    let auth = require_auth(&state, &headers).await?;
    let subscription = state
        .store
        .cancel_subscription(auth.user_id())
        .await?
        .ok_or_else(|| ApiError::not_found("no active subscription"))?;
    tracing::info!(user_id = auth.user_id(), subscription_id = subscription.id, "subscription canceled");
    Ok(Json(subscription))
}

pub async fn payment_config(State(state): State<AppState>) -> Json<PaymentConfigResponse> {
    Json(PaymentConfigResponse {
        configured: state.payments.is_configured(),
        public_key: state.payments.public_key().map(str::to_string),
        currency: CURRENCY,
    })
}

/// Gateway callback. The body only identifies the charge; its status is
/// re-read from the gateway before anything is settled.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<WebhookResponse>> {
    let rate = current_rate_limit(&state).await;
    if rate.enabled {
        let key = format!("webhook:{}", client_ip(&headers, connect.as_ref()));
        enforce_rate_limit(
            &state,
            "webhook",
            &key,
            RateRule::per_quarter_hour(rate.webhook_per_15min),
        )
        .await?;
    }
    if !state.payments.is_configured() {
        return Err(not_configured());
    }

    let charge_id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("INVALID_PAYLOAD", "missing charge id"))?;
    let payment = state
        .store
        .find_payment_by_transaction(charge_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown charge"))?;
    if payment.status != PaymentStatus::Pending {
        return Ok(Json(WebhookResponse {
            received: true,
            payment_id: payment.id,
            status: payment.status,
        }));
    }

    let charge = state.payments.retrieve_charge(charge_id).await.map_err(|err| {
        tracing::warn!(payment_id = payment.id, error = %err, "charge lookup failed");
        ApiError::new(StatusCode::BAD_GATEWAY, "PAYMENT_FAILED", err.to_string())
    })?;

    let settlement = match settlement_verdict(&charge, &payment) {
        ChargeVerdict::Pending => {
            return Ok(Json(WebhookResponse {
                received: true,
                payment_id: payment.id,
                status: payment.status,
            }));
        }
        ChargeVerdict::Captured => {
            let card = charge.card.clone().unwrap_or_default();
            let period_start = Utc::now();
            PaymentSettlement::Captured {
                card_brand: card.brand,
                card_last4: card.last_four,
                period_start,
                period_end: period_end(period_start, payment.billing_cycle),
            }
        }
        ChargeVerdict::Failed(reason) => PaymentSettlement::Failed { reason },
    };
    let captured = matches!(settlement, PaymentSettlement::Captured { .. });

    let Some(settled) = state.store.settle_payment(payment.id, settlement).await? else {
        let current = state
            .store
            .find_payment_by_transaction(charge_id)
            .await?
            .ok_or_else(|| ApiError::not_found("unknown charge"))?;
        return Ok(Json(WebhookResponse {
            received: true,
            payment_id: current.id,
            status: current.status,
        }));
    };

    if captured {
        metrics::inc_payment(crate::SERVICE_NAME, metrics::RESULT_SUCCESS);
        tracing::info!(payment_id = settled.id, user_id = settled.user_id, "payment captured");
        match state.store.find_user(settled.user_id).await {
            Ok(Some(user)) => state.email.send_in_background(email::subscription_confirmed(
                &user.email,
                user.name.as_deref(),
                plan_name(settled.tier),
                settled.amount_halalas,
            )),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(user_id = settled.user_id, error = %err, "confirmation lookup failed");
            }
        }
    } else {
        metrics::inc_payment(crate::SERVICE_NAME, metrics::RESULT_ERROR);
        tracing::info!(
            payment_id = settled.id,
            reason = settled.failure_reason.as_deref().unwrap_or_default(),
            "payment failed"
        );
    }

    Ok(Json(WebhookResponse {
        received: true,
        payment_id: settled.id,
        status: settled.status,
    }))
}

/// A capture only settles the payment when it took the exact amount in the
/// payment's currency.
fn settlement_verdict(charge: &Charge, payment: &Payment) -> ChargeVerdict {
    match charge.verdict() {
        ChargeVerdict::Captured => {
            if !charge.currency.trim().eq_ignore_ascii_case(&payment.currency) {
                return ChargeVerdict::Failed(format!(
                    "charged currency {} does not match {}",
                    charge.currency, payment.currency
                ));
            }
            let charged_halalas = (charge.amount * 100.0).round() as i64;
            if charged_halalas != payment.amount_halalas {
                return ChargeVerdict::Failed(format!(
                    "charged amount {charged_halalas} does not match {}",
                    payment.amount_halalas
                ));
            }
            ChargeVerdict::Captured
        }
        verdict => verdict,
    }
}

fn period_end(start: DateTime<Utc>, cycle: BillingCycle) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(cycle.months()))
        .unwrap_or_else(|| start + chrono::Duration::days(30 * i64::from(cycle.months())))
}

fn not_configured() -> ApiError {
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "PAYMENT_NOT_CONFIGURED",
        "payment gateway is not configured",
    )
}

/// Marks the pending payment failed and builds the error returned to the caller.
async fn fail_payment(state: &AppState, payment_id: i64, reason: String) -> ApiError {
    metrics::inc_payment(crate::SERVICE_NAME, metrics::RESULT_ERROR);
    if let Err(err) = state
        .store
        .settle_payment(
            payment_id,
            PaymentSettlement::Failed {
                reason: reason.clone(),
            },
        )
        .await
    {
        tracing::warn!(payment_id, error = %err, "failed to record payment failure");
    }
    ApiError::new(StatusCode::BAD_GATEWAY, "PAYMENT_FAILED", reason)
}
