use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

/// Per-session protocol counters, registered on the global meter provider.
///
/// Nothing is exported unless the embedding process installs a provider.
pub struct LinkMetrics {
    frames_sent: Counter<u64>,
    results_accepted: Counter<u64>,
    results_late: Counter<u64>,
    results_unmatched: Counter<u64>,
    frames_expired: Counter<u64>,
    result_latency: Histogram<u64>,
    attributes: Vec<KeyValue>,
}

impl LinkMetrics {
    pub fn new(transport: &'static str) -> Self {
        let meter = global::meter("model_link");

        let frames_sent = meter
            .u64_counter("frames_sent_total")
            .with_description("Frames written to the ModelServer")
            .build();
        let results_accepted = meter
            .u64_counter("results_accepted_total")
            .with_description("Results delivered within their frame deadline")
            .build();
        let results_late = meter
            .u64_counter("results_late_total")
            .with_description("Results discarded because they arrived after the deadline")
            .build();
        let results_unmatched = meter
            .u64_counter("results_unmatched_total")
            .with_description("Results with no outstanding frame")
            .build();
        let frames_expired = meter
            .u64_counter("frames_expired_total")
            .with_description("Frames whose deadline passed without a result")
            .build();
        let result_latency = meter
            .u64_histogram("result_latency_ms")
            .with_boundaries(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0])
            .with_description("Time from sending a frame to accepting its result")
            .build();

        Self {
            frames_sent,
            results_accepted,
            results_late,
            results_unmatched,
            frames_expired,
            result_latency,
            attributes: vec![KeyValue::new("transport", transport)],
        }
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.add(1, &self.attributes);
    }

    pub fn record_accepted(&self, latency_ms: u64) {
        self.results_accepted.add(1, &self.attributes);
        self.result_latency.record(latency_ms, &self.attributes);
    }

    pub fn record_late(&self) {
        self.results_late.add(1, &self.attributes);
    }

    pub fn record_unmatched(&self) {
        self.results_unmatched.add(1, &self.attributes);
    }

    pub fn record_expired(&self, count: u64) {
        if count > 0 {
            self.frames_expired.add(count, &self.attributes);
        }
    }
}
