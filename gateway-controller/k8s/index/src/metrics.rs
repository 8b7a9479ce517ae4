use gateway_controller_core::{collection::Item, Collection};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

/// Counts the watch events applied to source collections.
#[derive(Clone, Debug, Default)]
pub struct IngestMetrics {
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    resets: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

/// Reports the size and failure count of every registered collection.
#[derive(Debug, Default)]
pub struct CollectionMetrics {
    collections: Vec<Arc<dyn Observed>>,
}

trait Observed: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    fn failures(&self) -> usize;
}

// === impl IngestMetrics ===

impl IngestMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "index_applies",
            "Count of applies to source collections",
            metrics.applies.clone(),
        );
        prom.register(
            "index_deletes",
            "Count of deletes from source collections",
            metrics.deletes.clone(),
        );
        prom.register(
            "index_resets",
            "Count of resets of source collections",
            metrics.resets.clone(),
        );
        metrics
    }

    pub(crate) fn apply(&self, kind: &str) {
        self.applies.get_or_create(&KindLabels::new(kind)).inc();
    }

    pub(crate) fn delete(&self, kind: &str) {
        self.deletes.get_or_create(&KindLabels::new(kind)).inc();
    }

    pub(crate) fn reset(&self, kind: &str) {
        self.resets.get_or_create(&KindLabels::new(kind)).inc();
    }
}

impl KindLabels {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}

// === impl CollectionMetrics ===

impl CollectionMetrics {
    pub fn push<T: Item>(&mut self, collection: &Collection<T>) -> &mut Self {
        self.collections.push(Arc::new(collection.clone()));
        self
    }

    pub fn register(self, prom: &mut Registry) {
        prom.register_collector(Box::new(self));
    }
}

impl<T: Item> Observed for Collection<T> {
    fn name(&self) -> &str {
        Collection::name(self)
    }

    fn len(&self) -> usize {
        Collection::len(self)
    }

    fn failures(&self) -> usize {
        Collection::failures(self).len()
    }
}

impl Collector for CollectionMetrics {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let mut size_encoder = encoder.encode_descriptor(
            "collection_size",
            "The number of entries in a collection",
            None,
            MetricType::Gauge,
        )?;
        for c in &self.collections {
            let labels = vec![("collection", c.name())];
            let size = ConstGauge::new(c.len() as i64);
            size.encode(size_encoder.encode_family(&labels)?)?;
        }

        let mut failure_encoder = encoder.encode_descriptor(
            "collection_failures",
            "The number of inputs whose derivation failed",
            None,
            MetricType::Gauge,
        )?;
        for c in &self.collections {
            let labels = vec![("collection", c.name())];
            let failures = ConstGauge::new(c.failures() as i64);
            failures.encode(failure_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}
