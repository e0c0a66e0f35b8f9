use std::collections::VecDeque;
use std::sync::Mutex;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Samples kept for quantile reporting on /status.
const LATENCY_WINDOW: usize = 1024;

/// Broker-owned metrics registry. Counters and histograms go out through the
/// Prometheus text exposition; the latency window additionally backs the
/// P50/P90/P99 summary on the JSON status endpoint.
pub struct BrokerMetrics {
    registry: Registry,
    pub messages_in: IntCounter,
    pub messages_out: IntCounter,
    pub deliveries_failed: IntCounter,
    pub room_events: IntCounter,
    pub errors: IntCounterVec,
    pub connections: IntGauge,
    pub queue_depth: IntGauge,
    pub delivery_latency: Histogram,
    latency_window: Mutex<VecDeque<f64>>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_in =
            IntCounter::with_opts(Opts::new("bus_messages_in_total", "Messages accepted on ingress"))
                .unwrap();
        let messages_out = IntCounter::with_opts(Opts::new(
            "bus_messages_out_total",
            "Frames delivered to sessions",
        ))
        .unwrap();
        let deliveries_failed = IntCounter::with_opts(Opts::new(
            "bus_deliveries_failed_total",
            "Deliveries that exhausted their retry budget",
        ))
        .unwrap();
        let room_events = IntCounter::with_opts(Opts::new(
            "bus_room_events_total",
            "Room events fanned out",
        ))
        .unwrap();
        let errors = IntCounterVec::new(
            Opts::new("bus_errors_total", "Errors by taxonomy code"),
            &["code"],
        )
        .unwrap();
        let connections =
            IntGauge::with_opts(Opts::new("bus_connections", "Live socket connections")).unwrap();
        let queue_depth =
            IntGauge::with_opts(Opts::new("bus_queue_depth", "Messages waiting in the priority queue"))
                .unwrap();
        let delivery_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bus_delivery_latency_seconds",
                "Ingress-to-session delivery latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        registry.register(Box::new(messages_in.clone())).unwrap();
        registry.register(Box::new(messages_out.clone())).unwrap();
        registry.register(Box::new(deliveries_failed.clone())).unwrap();
        registry.register(Box::new(room_events.clone())).unwrap();
        registry.register(Box::new(errors.clone())).unwrap();
        registry.register(Box::new(connections.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(delivery_latency.clone())).unwrap();

        Self {
            registry,
            messages_in,
            messages_out,
            deliveries_failed,
            room_events,
            errors,
            connections,
            queue_depth,
            delivery_latency,
            latency_window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_error(&self, code: &str) {
        self.errors.with_label_values(&[code]).inc();
    }

    pub fn observe_latency(&self, seconds: f64) {
        self.delivery_latency.observe(seconds);
        let mut window = self.latency_window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(seconds);
    }

    /// (P50, P90, P99) over the sample window, in seconds. Zeros when empty.
    pub fn latency_quantiles(&self) -> (f64, f64, f64) {
        let window = self.latency_window.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let at = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        (at(0.50), at(0.90), at(0.99))
    }

    /// Prometheus text exposition of every registered series.
    pub fn expose(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("metrics encoding failed: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
