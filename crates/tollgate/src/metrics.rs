//! Process-wide Prometheus collectors and the per-stream recording helper.

use std::sync::OnceLock;
use std::time::Instant;

use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";

pub struct Metrics {
    pub registry: Registry,
    /// Request-headers arrival to final response-body event, per backend/model/status.
    pub total_latency: HistogramVec,
    /// Tokens processed, per backend/model and type (prompt, completion, total).
    pub tokens_total: IntCounterVec,
    /// Requests processed, per backend/model and status (success, error).
    pub requests_total: IntCounterVec,
    /// Latency to the first streamed token, per backend/model.
    pub first_token_latency: HistogramVec,
    /// Latency between consecutive streamed tokens, per backend/model.
    pub inter_token_latency: HistogramVec,
    /// Configuration reloads that failed and kept the previous snapshot.
    pub config_reload_failures: IntCounter,
}

static INSTANCE: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();
        let total_latency = HistogramVec::new(
            histogram_opts!(
                "aigateway_total_latency_seconds",
                "Time spent processing request.",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]
            ),
            &["backend", "model", "status"],
        )
        .unwrap();
        let tokens_total = IntCounterVec::new(
            opts!(
                "aigateway_model_tokens_total",
                "Total number of tokens processed by model and type."
            ),
            &["backend", "model", "type"],
        )
        .unwrap();
        let requests_total = IntCounterVec::new(
            opts!(
                "aigateway_requests_total",
                "Total number of requests processed."
            ),
            &["backend", "model", "status"],
        )
        .unwrap();
        let first_token_latency = HistogramVec::new(
            histogram_opts!(
                "aigateway_first_token_latency_seconds",
                "Time to receive first token in streaming responses.",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["backend", "model"],
        )
        .unwrap();
        let inter_token_latency = HistogramVec::new(
            histogram_opts!(
                "aigateway_inter_token_latency_seconds",
                "Time between consecutive tokens in streaming responses.",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["backend", "model"],
        )
        .unwrap();
        let config_reload_failures = IntCounter::new(
            "aigateway_config_reload_failures_total",
            "Configuration reloads rejected while keeping the previous snapshot.",
        )
        .unwrap();

        registry.register(Box::new(total_latency.clone())).unwrap();
        registry.register(Box::new(tokens_total.clone())).unwrap();
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry
            .register(Box::new(first_token_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(inter_token_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(config_reload_failures.clone()))
            .unwrap();

        Self {
            registry,
            total_latency,
            tokens_total,
            requests_total,
            first_token_latency,
            inter_token_latency,
            config_reload_failures,
        }
    }

    pub fn get_or_create() -> &'static Metrics {
        INSTANCE.get_or_init(Metrics::new)
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

/// Per-stream metric recording; owns the request's timing state.
pub struct TokenMetrics {
    metrics: &'static Metrics,
    request_start: Instant,
    first_token_sent: bool,
    last_token_time: Instant,
}

impl TokenMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            metrics: Metrics::get_or_create(),
            request_start: now,
            first_token_sent: false,
            last_token_time: now,
        }
    }

    /// Reset timing at the moment the request is dispatched upstream.
    pub fn start_request(&mut self) {
        self.request_start = Instant::now();
        self.first_token_sent = false;
    }

    pub fn update_token_metrics(
        &self,
        backend: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    ) {
        self.metrics
            .tokens_total
            .with_label_values(&[backend, model, "prompt"])
            .inc_by(u64::from(input_tokens));
        self.metrics
            .tokens_total
            .with_label_values(&[backend, model, "completion"])
            .inc_by(u64::from(output_tokens));
        self.metrics
            .tokens_total
            .with_label_values(&[backend, model, "total"])
            .inc_by(u64::from(total_tokens));
    }

    /// Record streamed-chunk pacing: first chunk observes first-token
    /// latency, later chunks observe inter-token latency normalized by the
    /// number of tokens the chunk carried.
    pub fn update_latency_metrics(&mut self, backend: &str, model: &str, output_tokens: u32) {
        let now = Instant::now();
        if !self.first_token_sent {
            self.first_token_sent = true;
            self.metrics
                .first_token_latency
                .with_label_values(&[backend, model])
                .observe(now.duration_since(self.request_start).as_secs_f64());
        } else {
            let divisor = output_tokens.max(1);
            let itl = now.duration_since(self.last_token_time).as_secs_f64() / f64::from(divisor);
            self.metrics
                .inter_token_latency
                .with_label_values(&[backend, model])
                .observe(itl);
        }
        self.last_token_time = now;
    }

    pub fn record_request_completion(&self, backend: &str, model: &str, success: bool) {
        let status = if success { STATUS_SUCCESS } else { STATUS_ERROR };
        if success {
            self.metrics
                .total_latency
                .with_label_values(&[backend, model, status])
                .observe(self.request_start.elapsed().as_secs_f64());
        }
        self.metrics
            .requests_total
            .with_label_values(&[backend, model, status])
            .inc();
    }
}

impl Default for TokenMetrics {
    fn default() -> Self {
        Self::new()
    }
}
