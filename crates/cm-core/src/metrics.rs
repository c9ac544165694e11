use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_RETRY: &str = "retry";

struct Metrics {
    registry: Registry,
    cm_up: IntGaugeVec,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    auth_success_total: IntCounterVec,
    auth_failure_total: IntCounterVec,
    analysis_jobs_total: IntCounterVec,
    analysis_duration_seconds: HistogramVec,
    llm_requests_total: IntCounterVec,
    payments_total: IntCounterVec,
    rum_metrics_total: IntCounterVec,
    rate_limited_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("counter metric")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram metric")
}

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let cm_up = IntGaugeVec::new(Opts::new("cm_up", "Service health"), &["service"])
            .expect("cm_up metric");
        let http_requests_total = counter(
            "http_requests_total",
            "HTTP request count",
            &["service", "route", "method", "status"],
        );
        let http_request_duration_seconds = histogram(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            &["service", "route", "method", "status"],
        );
        let auth_success_total = counter(
            "auth_success_total",
            "Authentication success count",
            &["service"],
        );
        let auth_failure_total = counter(
            "auth_failure_total",
            "Authentication failure count",
            &["service"],
        );
        let analysis_jobs_total = counter(
            "analysis_jobs_total",
            "Contract analysis job outcomes",
            &["service", "result"],
        );
        let analysis_duration_seconds = histogram(
            "analysis_duration_seconds",
            "Contract analysis duration in seconds",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0],
            &["service", "result"],
        );
        let llm_requests_total = counter(
            "llm_requests_total",
            "Language model requests by operation and result",
            &["service", "operation", "result"],
        );
        let payments_total = counter(
            "payments_total",
            "Payment gateway outcomes",
            &["service", "result"],
        );
        let rum_metrics_total = counter(
            "rum_metrics_total",
            "Ingested real user monitoring samples",
            &["service", "name"],
        );
        let rate_limited_total = counter(
            "rate_limited_total",
            "Requests rejected by rate limiting",
            &["service", "bucket"],
        );

        registry
            .register(Box::new(cm_up.clone()))
            .expect("register cm_up");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(auth_success_total.clone()))
            .expect("register auth_success_total");
        registry
            .register(Box::new(auth_failure_total.clone()))
            .expect("register auth_failure_total");
        registry
            .register(Box::new(analysis_jobs_total.clone()))
            .expect("register analysis_jobs_total");
        registry
            .register(Box::new(analysis_duration_seconds.clone()))
            .expect("register analysis_duration_seconds");
        registry
            .register(Box::new(llm_requests_total.clone()))
            .expect("register llm_requests_total");
        registry
            .register(Box::new(payments_total.clone()))
            .expect("register payments_total");
        registry
            .register(Box::new(rum_metrics_total.clone()))
            .expect("register rum_metrics_total");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");

        Metrics {
            registry,
            cm_up,
            http_requests_total,
            http_request_duration_seconds,
            auth_success_total,
            auth_failure_total,
            analysis_jobs_total,
            analysis_duration_seconds,
            llm_requests_total,
            payments_total,
            rum_metrics_total,
            rate_limited_total,
        }
    })
}

pub fn init(service_name: &'static str) {
    metrics().cm_up.with_label_values(&[service_name]).set(1);
}

pub fn record_http_request(
    service_name: &'static str,
    method: &str,
    route: &str,
    status: u16,
    duration: Duration,
) {
    let status_str = status.to_string();
    let labels = &[service_name, route, method, status_str.as_str()];
    let metrics = metrics();
    metrics.http_requests_total.with_label_values(labels).inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(labels)
        .observe(duration.as_secs_f64());
}

pub fn inc_auth_success(service_name: &'static str) {
    metrics()
        .auth_success_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn inc_auth_failure(service_name: &'static str) {
    metrics()
        .auth_failure_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn record_analysis_job(service_name: &'static str, result: &str, duration: Duration) {
    let metrics = metrics();
    metrics
        .analysis_jobs_total
        .with_label_values(&[service_name, result])
        .inc();
    metrics
        .analysis_duration_seconds
        .with_label_values(&[service_name, result])
        .observe(duration.as_secs_f64());
}

pub fn inc_llm_request(service_name: &'static str, operation: &str, result: &str) {
    metrics()
        .llm_requests_total
        .with_label_values(&[service_name, operation, result])
        .inc();
}

pub fn inc_payment(service_name: &'static str, result: &str) {
    metrics()
        .payments_total
        .with_label_values(&[service_name, result])
        .inc();
}

pub fn inc_rum_metric(service_name: &'static str, name: &str) {
    metrics()
        .rum_metrics_total
        .with_label_values(&[service_name, name])
        .inc();
}

pub fn inc_rate_limited(service_name: &'static str, bucket: &str) {
    metrics()
        .rate_limited_total
        .with_label_values(&[service_name, bucket])
        .inc();
}

pub fn metrics_response(service_name: &'static str) -> impl IntoResponse {
    init(service_name);
    let metric_families = metrics().registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            "failed to encode metrics".to_string(),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (
        StatusCode::OK,
        headers,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[derive(Clone)]
pub struct MetricsLayer {
    service_name: &'static str,
}

impl MetricsLayer {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    service_name: &'static str,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service_name: self.service_name,
        }
    }
}

impl<S, ReqBody, ResBody> Service<axum::http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<axum::http::Request<ReqBody>, Response = axum::response::Response<ResBody>>
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = axum::response::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<ReqBody>) -> Self::Future {
        let service_name = self.service_name;
        let method = request.method().to_string();
        let route = route_label(request.uri().path());
        let start = Instant::now();
        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            let status = result
                .as_ref()
                .map(|response| response.status().as_u16())
                .unwrap_or(500);
            record_http_request(service_name, &method, &route, status, start.elapsed());
            result
        })
    }
}

/// Collapses numeric path segments so per-record routes share one label.
fn route_label(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_response_sets_content_type() {
        let response = metrics_response("cm-test").into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, "text/plain; version=0.0.4");
    }

    #[test]
    fn route_label_collapses_ids() {
        assert_eq!(route_label("/v1/contracts/42/messages"), "/v1/contracts/:id/messages");
        assert_eq!(route_label("/v1/contracts"), "/v1/contracts");
        assert_eq!(route_label("/"), "/");
    }

    #[tokio::test]
    async fn recorded_outcomes_show_up_in_exposition() {
        record_analysis_job("cm-test", RESULT_SUCCESS, Duration::from_millis(20));
        inc_llm_request("cm-test", "chat", RESULT_ERROR);

        let response = metrics_response("cm-test").into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("analysis_jobs_total{result=\"success\",service=\"cm-test\"}"));
        assert!(text.contains("llm_requests_total{operation=\"chat\",result=\"error\",service=\"cm-test\"}"));
    }
}
