use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    shuffle_bytes_fetched: CounterVec,
    shuffle_fetches: CounterVec,
    shuffle_fetch_seconds: HistogramVec,
    shuffle_penalties: CounterVec,
    merge_bytes: CounterVec,
    merge_seconds: HistogramVec,
    memory_reserved_bytes: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// One finished fetch. `placement` is `memory` or `disk`; `outcome` is
    /// `copied`, `failed` or `obsolete`.
    pub fn record_fetch(&self, outcome: &str, placement: &str, bytes: u64, secs: f64) {
        self.inner
            .shuffle_fetches
            .with_label_values(&[outcome])
            .inc();
        if bytes > 0 {
            self.inner
                .shuffle_bytes_fetched
                .with_label_values(&[placement])
                .inc_by(bytes as f64);
        }
        self.inner
            .shuffle_fetch_seconds
            .with_label_values(&[outcome])
            .observe(secs.max(0.0));
    }

    pub fn inc_penalties(&self, host: &str) {
        self.inner
            .shuffle_penalties
            .with_label_values(&[host])
            .inc();
    }

    /// One merge pass. `kind` is `disk`, `memory`, `intermediate` or `final`.
    pub fn record_merge(&self, kind: &str, bytes: u64, secs: f64) {
        self.inner
            .merge_bytes
            .with_label_values(&[kind])
            .inc_by(bytes as f64);
        self.inner
            .merge_seconds
            .with_label_values(&[kind])
            .observe(secs.max(0.0));
    }

    pub fn set_memory_reserved(&self, bytes: u64) {
        self.inner.memory_reserved_bytes.set(bytes as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let shuffle_bytes_fetched = counter_vec(
            &registry,
            "rse_shuffle_bytes_fetched_total",
            "Producer output bytes fetched",
            &["placement"],
        );
        let shuffle_fetches = counter_vec(
            &registry,
            "rse_shuffle_fetches_total",
            "Finished fetches by outcome",
            &["outcome"],
        );
        let shuffle_fetch_seconds = histogram_vec(
            &registry,
            "rse_shuffle_fetch_seconds",
            "Time spent per fetch",
            &["outcome"],
        );
        let shuffle_penalties = counter_vec(
            &registry,
            "rse_shuffle_penalties_total",
            "Host penalties applied after failed fetches",
            &["host"],
        );

        let merge_bytes = counter_vec(
            &registry,
            "rse_merge_bytes_total",
            "Bytes written by merge passes",
            &["kind"],
        );
        let merge_seconds = histogram_vec(
            &registry,
            "rse_merge_seconds",
            "Merge pass time",
            &["kind"],
        );

        let memory_reserved_bytes = gauge(
            &registry,
            "rse_memory_reserved_bytes",
            "Shuffle memory currently reserved",
        );

        Self {
            registry,
            shuffle_bytes_fetched,
            shuffle_fetches,
            shuffle_fetch_seconds,
            shuffle_penalties,
            merge_bytes,
            merge_seconds,
            memory_reserved_bytes,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_fetch_metrics() {
        let m = MetricsRegistry::new();
        m.record_fetch("copied", "memory", 128, 0.01);
        let text = m.render_prometheus();
        assert!(text.contains("rse_shuffle_bytes_fetched_total"));
        assert!(text.contains("placement=\"memory\""));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_fetch("copied", "disk", 4096, 0.2);
        m.record_fetch("failed", "disk", 0, 0.1);
        m.inc_penalties("host-a");
        m.record_merge("disk", 8192, 0.05);
        m.record_merge("memory", 512, 0.01);
        m.set_memory_reserved(1024);
        let text = m.render_prometheus();

        assert!(text.contains("rse_shuffle_bytes_fetched_total"));
        assert!(text.contains("rse_shuffle_fetches_total"));
        assert!(text.contains("rse_shuffle_fetch_seconds"));
        assert!(text.contains("rse_shuffle_penalties_total"));
        assert!(text.contains("rse_merge_bytes_total"));
        assert!(text.contains("rse_merge_seconds"));
        assert!(text.contains("rse_memory_reserved_bytes 1024"));
    }
}
