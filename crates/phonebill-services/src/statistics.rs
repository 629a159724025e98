//! Latency statistics per transaction label

use parking_lot::Mutex;
use phonebill_core::TxLabel;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct LabelStats {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl LabelStats {
    fn new(latency: Duration) -> Self {
        Self {
            count: 1,
            total: latency,
            min: latency,
            max: latency,
        }
    }

    fn add(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
    }

    fn avg(&self) -> Duration {
        // count is never 0 once the entry exists
        self.total / self.count.max(1) as u32
    }
}

#[derive(Debug, Default)]
struct Inner {
    dedicated_time: Duration,
    labels: BTreeMap<TxLabel, LabelStats>,
}

/// Latencies of committed transactions
///
/// Shared by every generator and worker of one run.
#[derive(Debug, Default)]
pub struct TxStatistics {
    inner: Mutex<Inner>,
}

impl TxStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latency of one committed transaction
    pub fn add_latency(&self, label: TxLabel, latency: Duration) {
        let mut inner = self.inner.lock();
        inner
            .labels
            .entry(label)
            .and_modify(|s| s.add(latency))
            .or_insert_with(|| LabelStats::new(latency));
    }

    /// Wall time the recorded transactions ran in, used for throughput
    pub fn set_dedicated_time(&self, dedicated_time: Duration) {
        self.inner.lock().dedicated_time = dedicated_time;
    }

    pub fn count(&self, label: TxLabel) -> u64 {
        self.inner.lock().labels.get(&label).map_or(0, |s| s.count)
    }

    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }

    /// Markdown table, one row per label
    pub fn report(&self) -> String {
        let inner = self.inner.lock();
        let dedicated_ms = inner.dedicated_time.as_millis();
        let mut out = String::new();
        out.push_str("| title | dedicated time[ms] | numbers of txs | latency<br>avg[ms] | latency<br>min[ms] | latency<br>max[ms] | committed tx through put[task/s] |\n");
        out.push_str("|-------|-------------------:|---------------:|-------------------:|-------------------:|-------------------:|---------------------------------:|\n");
        for (label, stats) in &inner.labels {
            let throughput = if inner.dedicated_time.is_zero() {
                0.0
            } else {
                stats.count as f64 / inner.dedicated_time.as_secs_f64()
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {:.3} | {:.3} | {:.3} | {:.1} |",
                label,
                dedicated_ms,
                stats.count,
                millis(stats.avg()),
                millis(stats.min),
                millis(stats.max),
                throughput
            );
        }
        out
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max_avg() {
        let stats = TxStatistics::new();
        stats.add_latency(TxLabel::OnlineMasterUpdate, Duration::from_millis(10));
        stats.add_latency(TxLabel::OnlineMasterUpdate, Duration::from_millis(30));
        stats.set_dedicated_time(Duration::from_secs(2));

        assert_eq!(stats.count(TxLabel::OnlineMasterUpdate), 2);
        let report = stats.report();
        let row = report.lines().nth(2).unwrap();
        assert_eq!(row, "| ONLINE_MASTER_UPDATE | 2000 | 2 | 20.000 | 10.000 | 30.000 | 1.0 |");
    }

    #[test]
    fn test_clear() {
        let stats = TxStatistics::new();
        stats.add_latency(TxLabel::BatchMain, Duration::from_millis(1));
        stats.clear();
        assert_eq!(stats.count(TxLabel::BatchMain), 0);
        assert_eq!(stats.report().lines().count(), 2);
    }
}
