//! Per-recording metrics store with percentile summaries.

/// One batch recording's worth of timing data.
#[derive(Clone, Debug, Default)]
pub struct TranscriptionRecord {
    pub audio_length_s: f64,
    pub raw_size_kb: f64,
    pub compressed_size_kb: f64,
    pub compression_pct: f64,
    pub encode_time_ms: f64,
    pub dns_time_ms: f64,
    pub tls_time_ms: f64,
    pub ttfb_ms: f64,
    pub total_time_ms: f64,
    pub memory_alloc_mb: f64,
    pub memory_peak_mb: f64,
}

/// min, p50, p90, p95, max.
pub type Quantiles = [f64; 5];

#[derive(Clone, Debug, Default)]
pub struct PercentileStats {
    pub total_ms: Quantiles,
    pub encode_ms: Quantiles,
    pub tls_ms: Quantiles,
    pub compression_pct: Quantiles,
}

#[derive(Default)]
pub struct MetricsStore {
    records: Vec<TranscriptionRecord>,
    stats: PercentileStats,
}

impl MetricsStore {
    pub fn push(&mut self, record: TranscriptionRecord) {
        self.records.push(record);
        self.recompute();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> &PercentileStats {
        &self.stats
    }

    fn recompute(&mut self) {
        if self.records.is_empty() {
            return;
        }
        let extract = |f: fn(&TranscriptionRecord) -> f64| -> Vec<f64> {
            let mut values: Vec<f64> = self.records.iter().map(f).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            values
        };
        self.stats.total_ms = quantiles(&extract(|r| r.total_time_ms));
        self.stats.encode_ms = quantiles(&extract(|r| r.encode_time_ms));
        self.stats.tls_ms = quantiles(&extract(|r| r.tls_time_ms));
        self.stats.compression_pct = quantiles(&extract(|r| r.compression_pct));
    }

    /// Plain-text rendering for the metrics endpoint.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("recordings: {}\n", self.records.len()));
        if self.records.is_empty() {
            return out;
        }
        let row = |name: &str, q: &Quantiles| {
            format!(
                "{name:<16} min={:.1} p50={:.1} p90={:.1} p95={:.1} max={:.1}\n",
                q[0], q[1], q[2], q[3], q[4]
            )
        };
        out.push_str(&row("total_ms", &self.stats.total_ms));
        out.push_str(&row("encode_ms", &self.stats.encode_ms));
        out.push_str(&row("tls_ms", &self.stats.tls_ms));
        out.push_str(&row("compression_pct", &self.stats.compression_pct));
        out
    }
}

fn quantiles(sorted: &[f64]) -> Quantiles {
    let percentile = |p: f64| sorted[((sorted.len() - 1) as f64 * p) as usize];
    [
        sorted[0],
        percentile(0.50),
        percentile(0.90),
        percentile(0.95),
        sorted[sorted.len() - 1],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_recompute_on_each_insert() {
        let mut store = MetricsStore::default();
        for total in [100.0, 300.0, 200.0, 500.0, 400.0] {
            store.push(TranscriptionRecord {
                total_time_ms: total,
                ..TranscriptionRecord::default()
            });
        }
        assert_eq!(store.len(), 5);
        let q = store.stats().total_ms;
        assert_eq!(q[0], 100.0);
        assert_eq!(q[1], 300.0);
        assert_eq!(q[4], 500.0);
    }

    #[test]
    fn single_record_collapses_all_quantiles() {
        let mut store = MetricsStore::default();
        store.push(TranscriptionRecord {
            total_time_ms: 250.0,
            ..TranscriptionRecord::default()
        });
        assert_eq!(store.stats().total_ms, [250.0; 5]);
    }
}
