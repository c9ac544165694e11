use axum::extract::{ConnectInfo, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cm_core::metrics;
use cm_core::model::{NewRumMetric, VitalName, VitalRating};
use cm_core::rate_limit::RateRule;
use cm_core::store::TelemetryRepository;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::auth::{client_ip, current_rate_limit, enforce_rate_limit};
use crate::{ApiError, ApiResult, AppState};

const MAX_URL_CHARS: usize = 2_048;
const MAX_METRIC_ID_CHARS: usize = 100;
const MAX_USER_AGENT_CHARS: usize = 500;

/// A web-vitals report as posted by the browser.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RumReport {
    pub name: VitalName,
    pub value: f64,
    pub rating: VitalRating,
    pub delta: f64,
    pub id: String,
    pub navigation_type: Option<String>,
    pub url: String,
}

#[derive(Serialize)]
pub struct RumAccepted {
    pub id: i64,
}

#[allow(clippy::result_large_err)]
fn validate_report(report: &RumReport) -> ApiResult<()> {
    if !report.value.is_finite() || !report.delta.is_finite() {
        return Err(ApiError::bad_request(
            "INVALID_PAYLOAD",
            "value and delta must be finite numbers",
        ));
    }
    let id_chars = report.id.trim().chars().count();
    if id_chars == 0 || id_chars > MAX_METRIC_ID_CHARS {
        return Err(ApiError::bad_request("INVALID_PAYLOAD", "invalid metric id"));
    }
    let url_ok = report.url.chars().count() <= MAX_URL_CHARS
        && reqwest::Url::parse(&report.url)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false);
    if !url_ok {
        return Err(ApiError::bad_request(
            "INVALID_PAYLOAD",
            "url must be an absolute http(s) url",
        ));
    }
    Ok(())
}

pub async fn ingest_metric(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(report): Json<RumReport>,
) -> ApiResult<(StatusCode, Json<RumAccepted>)> {
    let ip = client_ip(&headers, connect.as_ref());
    let rate = current_rate_limit(&state).await;
    if rate.enabled {
        let key = format!("rum:{ip}");
        enforce_rate_limit(
            &state,
            "rum",
            &key,
            RateRule::per_quarter_hour(rate.rum_per_15min),
        )
        .await?;
    }
    validate_report(&report)?;

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.chars().take(MAX_USER_AGENT_CHARS).collect::<String>());
    let metric = state
        .store
        .insert_rum_metric(NewRumMetric {
            name: report.name,
            value: report.value.round() as i64,
            rating: report.rating,
            delta: report.delta.round() as i64,
            client_metric_id: report.id.trim().to_string(),
            navigation_type: report.navigation_type,
            url: report.url,
            user_agent,
            ip_address: (ip != "unknown").then_some(ip),
        })
        .await?;
    metrics::inc_rum_metric(crate::SERVICE_NAME, report.name.as_str());

    Ok((StatusCode::CREATED, Json(RumAccepted { id: metric.id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RumReport {
        RumReport {
            name: VitalName::Lcp,
            value: 1834.6,
            rating: VitalRating::Good,
            delta: 12.2,
            id: "v3-1700000000000-123".into(),
            navigation_type: Some("navigate".into()),
            url: "https://app.contramind.ai/dashboard".into(),
        }
    }

    #[test]
    fn accepts_well_formed_report() {
        assert!(validate_report(&report()).is_ok());
    }

    #[test]
    fn rejects_relative_url_and_nan() {
        let mut relative = report();
        relative.url = "/dashboard".into();
        assert!(validate_report(&relative).is_err());

        let mut nan = report();
        nan.value = f64::NAN;
        assert!(validate_report(&nan).is_err());

        let mut blank_id = report();
        blank_id.id = " ".into();
        assert!(validate_report(&blank_id).is_err());
    }
}
