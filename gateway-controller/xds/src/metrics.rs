use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Metrics for the aggregated discovery service.
///
/// Stream lifecycles are counted per status code; messages are counted per
/// resource type so that a client stuck on one type stands out.
#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Counter,
    active: Gauge,
    handled: Family<CodeLabels, Counter>,
    handling: Histogram,
    msg_received: Family<TypeLabels, Counter>,
    msg_sent: Family<TypeLabels, Counter>,
    rejected: Family<TypeLabels, Counter>,
}

/// Tracks a single ADS stream. Dropping an observer that was never
/// explicitly ended records the stream as completed with `OK`.
#[derive(Debug)]
pub(crate) struct StreamObserver {
    metrics: GrpcServerMetricsFamily,
    start: time::Instant,
    ended: bool,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    type_url: String,
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Counter::default();
        reg.register("started", "Total number of ADS streams started", started.clone());

        let active = Gauge::default();
        reg.register("active", "Number of ADS streams currently open", active.clone());

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of ADS streams completed, by gRPC status code",
            handled.clone(),
        );

        // Proxies hold ADS streams open for as long as they run.
        let handling = Histogram::new([0.1, 1.0, 60.0, 300.0, 3600.0, 86400.0]);
        reg.register_with_unit(
            "handling",
            "Histogram of ADS stream lifetimes",
            Unit::Seconds,
            handling.clone(),
        );

        let msg_received = Family::<TypeLabels, Counter>::default();
        reg.register(
            "msg_received",
            "Total number of discovery requests received, by resource type",
            msg_received.clone(),
        );

        let msg_sent = Family::<TypeLabels, Counter>::default();
        reg.register(
            "msg_sent",
            "Total number of discovery responses sent, by resource type",
            msg_sent.clone(),
        );

        let rejected = Family::<TypeLabels, Counter>::default();
        reg.register(
            "rejected",
            "Total number of responses rejected by clients, by resource type",
            rejected.clone(),
        );

        Self {
            started,
            active,
            handled,
            handling,
            msg_received,
            msg_sent,
            rejected,
        }
    }

    pub(crate) fn stream(&self) -> StreamObserver {
        self.started.inc();
        self.active.inc();
        // Pre-register OK so that the series exists before any stream ends.
        let _ = self.handled.get_or_create(&CodeLabels {
            grpc_code: code_str(tonic::Code::Ok),
        });
        StreamObserver {
            metrics: self.clone(),
            start: time::Instant::now(),
            ended: false,
        }
    }
}

// === impl StreamObserver ===

impl StreamObserver {
    pub(crate) fn received(&self, type_url: &str) {
        self.metrics.msg_received.get_or_create(&labels(type_url)).inc();
    }

    pub(crate) fn sent(&self, type_url: &str) {
        self.metrics.msg_sent.get_or_create(&labels(type_url)).inc();
    }

    pub(crate) fn rejected(&self, type_url: &str) {
        self.metrics.rejected.get_or_create(&labels(type_url)).inc();
    }

    pub(crate) fn end(mut self, code: tonic::Code) {
        self.finish(code);
    }

    fn finish(&mut self, code: tonic::Code) {
        if std::mem::replace(&mut self.ended, true) {
            return;
        }
        self.metrics.active.dec();
        self.metrics
            .handling
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics
            .handled
            .get_or_create(&CodeLabels {
                grpc_code: code_str(code),
            })
            .inc();
    }
}

impl Drop for StreamObserver {
    fn drop(&mut self) {
        self.finish(tonic::Code::Ok);
    }
}

fn labels(type_url: &str) -> TypeLabels {
    TypeLabels {
        type_url: type_url.to_string(),
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    const CDS: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    fn render(prom: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, prom).unwrap();
        out
    }

    #[test]
    fn counts_messages_per_type() {
        let mut prom = Registry::default();
        let metrics = GrpcServerMetricsFamily::register(&mut prom);

        let stream = metrics.stream();
        stream.received(CDS);
        stream.received(CDS);
        stream.sent(CDS);
        stream.rejected(CDS);
        assert!(render(&prom).contains("active 1"));
        stream.end(tonic::Code::Unavailable);

        let out = render(&prom);
        assert!(out.contains(&format!(r#"msg_received_total{{type_url="{CDS}"}} 2"#)), "{out}");
        assert!(out.contains(&format!(r#"rejected_total{{type_url="{CDS}"}} 1"#)), "{out}");
        assert!(out.contains(r#"handled_total{grpc_code="UNAVAILABLE"} 1"#), "{out}");
        assert!(out.contains(r#"handled_total{grpc_code="OK"} 0"#), "{out}");
        assert!(out.contains("active 0"), "{out}");
    }

    #[test]
    fn dropped_streams_end_ok() {
        let mut prom = Registry::default();
        let metrics = GrpcServerMetricsFamily::register(&mut prom);
        drop(metrics.stream());

        let out = render(&prom);
        assert!(out.contains(r#"handled_total{grpc_code="OK"} 1"#), "{out}");
        assert!(out.contains("started_total 1"), "{out}");
    }
}
