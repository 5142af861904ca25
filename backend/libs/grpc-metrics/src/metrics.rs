//! Prometheus metric families for the server and client roles
//!
//! Each role owns an independent [`Monitor`]; nothing is shared across
//! roles. Label keys are fixed when a monitor is built, so recording an
//! observation cannot fail at runtime.

use crate::error::Result;
use crate::labels::{
    label_names, ConnLabels, MessageLabels, RequestLabels, Role, RpcLabels, CONN_LABELS,
    DIALER_LABELS, MESSAGE_LABELS, REQUEST_LABELS, RPC_LABELS,
};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};
use tonic::Code;

/// Default metric namespace
pub const DEFAULT_NAMESPACE: &str = "grpc";

/// Default latency buckets: exponential from 5ms, factor 1.4, 20 buckets
pub fn default_duration_buckets() -> Vec<f64> {
    (0..20).map(|i| 0.005 * 1.4_f64.powi(i)).collect()
}

/// Construction-time settings for the metric families
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Attach the `peer` label to server request and message families
    pub track_peers: bool,
    pub namespace: String,
    /// Upper bounds (seconds) of the request duration histogram
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            track_peers: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

impl MetricsConfig {
    pub fn with_track_peers(mut self, track_peers: bool) -> Self {
        self.track_peers = track_peers;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_duration_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.duration_buckets = buckets;
        self
    }
}

/// Metric families of a single role
#[derive(Clone)]
pub struct Monitor {
    role: Role,
    track_peers: bool,
    connections: IntGaugeVec,
    in_flight_requests: IntGaugeVec,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    request_duration: HistogramVec,
    sent_messages: IntCounterVec,
    received_messages: IntCounterVec,
}

impl Monitor {
    /// Build the family set for `role`.
    ///
    /// Peer tracking only ever applies to the server role.
    pub fn new(role: Role, config: &MetricsConfig) -> Result<Self> {
        let track_peers = role == Role::Server && config.track_peers;
        let side = role.as_str();
        let opts = |name: &str, help: String| {
            Opts::new(name, help)
                .namespace(config.namespace.clone())
                .subsystem(side)
        };

        let connections = IntGaugeVec::new(
            opts(
                "connections",
                format!("Number of currently opened {} side connections.", side),
            ),
            CONN_LABELS,
        )?;

        let in_flight_requests = IntGaugeVec::new(
            opts(
                "in_flight_requests",
                format!("Number of currently processed {} side rpc requests.", side),
            ),
            RPC_LABELS,
        )?;

        let request_labels = label_names(REQUEST_LABELS, track_peers);
        let message_labels = label_names(MESSAGE_LABELS, track_peers);

        let requests_total = IntCounterVec::new(
            opts(
                "requests_total",
                format!("Total number of RPC requests handled on {} side.", side),
            ),
            &request_labels,
        )?;

        let errors_total = IntCounterVec::new(
            opts(
                "errors_total",
                format!(
                    "Total number of errors that happen during RPC calls on {} side.",
                    side
                ),
            ),
            &request_labels,
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                format!("The RPC request latencies in seconds on {} side.", side),
            )
            .namespace(config.namespace.clone())
            .subsystem(side)
            .buckets(config.duration_buckets.clone()),
            &request_labels,
        )?;

        let sent_messages = IntCounterVec::new(
            opts(
                "sent_messages_total",
                format!("Total number of RPC messages sent on {} side.", side),
            ),
            &message_labels,
        )?;

        let received_messages = IntCounterVec::new(
            opts(
                "received_messages_total",
                format!("Total number of RPC messages received on {} side.", side),
            ),
            &message_labels,
        )?;

        Ok(Self {
            role,
            track_peers,
            connections,
            in_flight_requests,
            requests_total,
            errors_total,
            request_duration,
            sent_messages,
            received_messages,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether request and message families carry the `peer` label
    pub fn tracks_peers(&self) -> bool {
        self.track_peers
    }

    /// Record a completed call: requests_total, errors_total (on failure)
    /// and request_duration_seconds all share one label value set
    pub fn record_request(&self, labels: &RequestLabels, duration_secs: f64) {
        let values = labels.values(self.track_peers);

        self.requests_total.with_label_values(&values).inc();
        if labels.code != Code::Ok {
            self.errors_total.with_label_values(&values).inc();
        }
        self.request_duration
            .with_label_values(&values)
            .observe(duration_secs);
    }

    pub fn inc_sent(&self, labels: &MessageLabels) {
        self.sent_messages
            .with_label_values(&labels.values(self.track_peers))
            .inc();
    }

    pub fn inc_received(&self, labels: &MessageLabels) {
        self.received_messages
            .with_label_values(&labels.values(self.track_peers))
            .inc();
    }

    pub fn inc_in_flight(&self, labels: &RpcLabels) {
        self.in_flight_requests
            .with_label_values(&labels.values())
            .inc();
    }

    pub fn dec_in_flight(&self, labels: &RpcLabels) {
        self.in_flight_requests
            .with_label_values(&labels.values())
            .dec();
    }

    pub fn inc_connections(&self, labels: &ConnLabels) {
        self.connections.with_label_values(&labels.values()).inc();
    }

    pub fn dec_connections(&self, labels: &ConnLabels) {
        self.connections.with_label_values(&labels.values()).dec();
    }

    /// Create the request-level series for `labels` at zero
    pub(crate) fn touch_request(&self, labels: &RequestLabels) -> Result<()> {
        let values = labels.values(self.track_peers);
        self.requests_total.get_metric_with_label_values(&values)?;
        self.errors_total.get_metric_with_label_values(&values)?;
        self.request_duration.get_metric_with_label_values(&values)?;
        Ok(())
    }

    /// Create the message-level series for `labels` at zero
    pub(crate) fn touch_messages(
        &self,
        labels: &MessageLabels,
        received: bool,
        sent: bool,
    ) -> Result<()> {
        let values = labels.values(self.track_peers);
        if received {
            self.received_messages.get_metric_with_label_values(&values)?;
        }
        if sent {
            self.sent_messages.get_metric_with_label_values(&values)?;
        }
        Ok(())
    }

    pub fn connections(&self) -> &IntGaugeVec {
        &self.connections
    }

    pub fn in_flight_requests(&self) -> &IntGaugeVec {
        &self.in_flight_requests
    }

    pub fn requests_total(&self) -> &IntCounterVec {
        &self.requests_total
    }

    pub fn errors_total(&self) -> &IntCounterVec {
        &self.errors_total
    }

    pub fn request_duration(&self) -> &HistogramVec {
        &self.request_duration
    }

    pub fn sent_messages(&self) -> &IntCounterVec {
        &self.sent_messages
    }

    pub fn received_messages(&self) -> &IntCounterVec {
        &self.received_messages
    }

    pub(crate) fn descs(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        // Gauges
        descs.extend(self.connections.desc());
        descs.extend(self.in_flight_requests.desc());
        // Histogram
        descs.extend(self.request_duration.desc());
        // Counters
        descs.extend(self.requests_total.desc());
        descs.extend(self.errors_total.desc());
        descs.extend(self.sent_messages.desc());
        descs.extend(self.received_messages.desc());
        descs
    }

    pub(crate) fn families(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.connections.collect());
        families.extend(self.in_flight_requests.collect());
        families.extend(self.request_duration.collect());
        families.extend(self.requests_total.collect());
        families.extend(self.errors_total.collect());
        families.extend(self.sent_messages.collect());
        families.extend(self.received_messages.collect());
        families
    }
}

/// Both role family sets plus the client dialer counter
#[derive(Clone)]
pub struct Monitoring {
    pub(crate) dialer: IntCounterVec,
    pub(crate) server: Monitor,
    pub(crate) client: Monitor,
}

impl Monitoring {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let dialer = IntCounterVec::new(
            Opts::new(
                "reconnects_total",
                "Total number of reconnects made by client.",
            )
            .namespace(config.namespace.clone())
            .subsystem(Role::Client.as_str()),
            DIALER_LABELS,
        )?;

        Ok(Self {
            dialer,
            server: Monitor::new(Role::Server, config)?,
            client: Monitor::new(Role::Client, config)?,
        })
    }

    pub fn monitor(&self, role: Role) -> &Monitor {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::CallInfo;

    #[test]
    fn test_default_buckets() {
        let buckets = default_duration_buckets();
        assert_eq!(buckets.len(), 20);
        assert!((buckets[0] - 0.005).abs() < f64::EPSILON);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_client_never_tracks_peers() {
        let config = MetricsConfig::default().with_track_peers(true);
        let server = Monitor::new(Role::Server, &config).unwrap();
        let client = Monitor::new(Role::Client, &config).unwrap();

        assert!(server.tracks_peers());
        assert!(!client.tracks_peers());
    }

    #[test]
    fn test_record_request_success_and_failure() {
        let monitor = Monitor::new(Role::Server, &MetricsConfig::default()).unwrap();
        let call = CallInfo::unary("/demo.Echo/Say");

        monitor.record_request(&RequestLabels::new(&call, Code::Ok), 0.01);
        monitor.record_request(&RequestLabels::new(&call, Code::Internal), 0.02);

        let ok = ["demo.Echo", "Say", "OK", "unary"];
        let internal = ["demo.Echo", "Say", "Internal", "unary"];
        assert_eq!(monitor.requests_total().with_label_values(&ok).get(), 1);
        assert_eq!(monitor.errors_total().with_label_values(&ok).get(), 0);
        assert_eq!(monitor.requests_total().with_label_values(&internal).get(), 1);
        assert_eq!(monitor.errors_total().with_label_values(&internal).get(), 1);
        assert_eq!(
            monitor
                .request_duration()
                .with_label_values(&internal)
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn test_gauges_move_both_ways() {
        let monitor = Monitor::new(Role::Client, &MetricsConfig::default()).unwrap();
        let labels = RpcLabels::new("/demo.Echo/Say", true);

        monitor.inc_in_flight(&labels);
        monitor.inc_in_flight(&labels);
        monitor.dec_in_flight(&labels);

        assert_eq!(
            monitor
                .in_flight_requests()
                .with_label_values(&["demo.Echo", "Say", "true"])
                .get(),
            1
        );
    }

    #[test]
    fn test_custom_namespace() {
        let config = MetricsConfig::default().with_namespace("rpc");
        let monitoring = Monitoring::new(&config).unwrap();
        let names: Vec<String> = monitoring
            .server
            .descs()
            .iter()
            .map(|d| d.fq_name.clone())
            .collect();

        assert!(names.contains(&"rpc_server_requests_total".to_string()));
        assert!(names.contains(&"rpc_server_in_flight_requests".to_string()));
        assert_eq!(
            monitoring.dialer.desc()[0].fq_name,
            "rpc_client_reconnects_total"
        );
    }
}
