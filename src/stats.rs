use std::time::Duration;

use serde::Serialize;

use crate::report::duration_ms;

/// Latency distribution over all recorded response times, computed once at
/// recorder finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
    #[serde(with = "duration_ms")]
    pub mean: Duration,
    #[serde(with = "duration_ms")]
    pub p50: Duration,
    #[serde(with = "duration_ms")]
    pub p75: Duration,
    #[serde(with = "duration_ms")]
    pub p90: Duration,
    #[serde(with = "duration_ms")]
    pub p95: Duration,
    #[serde(with = "duration_ms")]
    pub p99: Duration,
    pub histogram: Vec<HistogramBin>,
}

/// One fixed-width histogram bin covering `[low, high)`; the last bin also
/// absorbs everything above it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    #[serde(with = "duration_ms")]
    pub low: Duration,
    #[serde(with = "duration_ms")]
    pub high: Duration,
    pub count: usize,
}

impl LatencySummary {
    /// Computes the distribution of `samples` with `bins` histogram bins.
    ///
    /// A zero `interval` sizes the bins to evenly cover the observed range;
    /// a non-zero `interval` fixes the bin width instead.
    pub fn compute(samples: &[Duration], bins: usize, interval: Duration) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let count = sorted.len();
        let min = sorted[0];
        let max = sorted[count - 1];
        let total: Duration = sorted.iter().sum();
        let mean = total / count as u32;

        Self {
            count,
            min,
            max,
            mean,
            p50: percentile(&sorted, 0.50),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            histogram: histogram(&sorted, bins, interval, min, max),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[Duration], q: f64) -> Duration {
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn histogram(
    sorted: &[Duration],
    bins: usize,
    interval: Duration,
    min: Duration,
    max: Duration,
) -> Vec<HistogramBin> {
    if bins == 0 {
        return Vec::new();
    }

    let width = if interval.is_zero() {
        let span = (max - min).as_nanos() as u64;
        Duration::from_nanos((span / bins as u64).max(1))
    } else {
        interval
    };

    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            low: min + width * i as u32,
            high: min + width * (i + 1) as u32,
            count: 0,
        })
        .collect();

    let width_nanos = width.as_nanos();
    for sample in sorted {
        let idx = ((*sample - min).as_nanos() / width_nanos) as usize;
        out[idx.min(bins - 1)].count += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn empty_samples_yield_default() {
        let summary = LatencySummary::compute(&[], 10, Duration::ZERO);
        assert_eq!(summary, LatencySummary::default());
    }

    #[test]
    fn percentiles_over_uniform_samples() {
        let samples: Vec<Duration> = (1..=100).map(ms).collect();
        let summary = LatencySummary::compute(&samples, 10, Duration::ZERO);

        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, ms(1));
        assert_eq!(summary.max, ms(100));
        assert_eq!(summary.mean, Duration::from_micros(50_500));
        assert_eq!(summary.p50, ms(50));
        assert_eq!(summary.p75, ms(75));
        assert_eq!(summary.p90, ms(90));
        assert_eq!(summary.p95, ms(95));
        assert_eq!(summary.p99, ms(99));
    }

    #[test]
    fn single_sample() {
        let summary = LatencySummary::compute(&[ms(42)], 5, Duration::ZERO);
        assert_eq!(summary.min, ms(42));
        assert_eq!(summary.max, ms(42));
        assert_eq!(summary.p50, ms(42));
        assert_eq!(summary.p99, ms(42));
    }

    #[test]
    fn histogram_counts_cover_all_samples() {
        let samples: Vec<Duration> = (0..100).map(ms).collect();
        let summary = LatencySummary::compute(&samples, 10, Duration::ZERO);

        assert_eq!(summary.histogram.len(), 10);
        let total: usize = summary.histogram.iter().map(|b| b.count).sum();
        assert_eq!(total, 100);
        // Uniform samples over evenly sized bins.
        for bin in &summary.histogram[..9] {
            assert_eq!(bin.count, 10);
        }
    }

    #[test]
    fn fixed_interval_histogram_clamps_overflow_into_last_bin() {
        let samples: Vec<Duration> = (0..100).map(ms).collect();
        let summary = LatencySummary::compute(&samples, 4, ms(10));

        assert_eq!(summary.histogram.len(), 4);
        assert_eq!(summary.histogram[0].count, 10);
        assert_eq!(summary.histogram[1].count, 10);
        assert_eq!(summary.histogram[2].count, 10);
        // Everything past the fixed range lands in the last bin.
        assert_eq!(summary.histogram[3].count, 70);
        assert_eq!(summary.histogram[1].low, ms(10));
        assert_eq!(summary.histogram[1].high, ms(20));
    }
}
