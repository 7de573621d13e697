use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::stats::LatencySummary;

/// Final result of one run, serializable to JSON for machine consumption.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dsn: String,
    pub files: Vec<PathBuf>,
    #[serde(with = "rfc3339")]
    pub started: SystemTime,
    #[serde(with = "rfc3339")]
    pub finished: SystemTime,
    /// Wall-clock seconds between start and finish.
    pub elapsed: f64,
    /// Total number of recorded queries.
    pub queries: usize,
    pub nagents: usize,
    pub rate: u32,
    /// Overall realized throughput, `queries / elapsed`.
    pub qps: f64,
    /// `nagents * rate`; zero when the rate is unbounded.
    pub expected_qps: u64,
    pub loop_count: u64,
    pub response: LatencySummary,
    pub max_qps: f64,
    pub min_qps: f64,
    pub median_qps: f64,
}

/// Serializes a `Duration` as fractional milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1e3)
    }
}

/// Serializes a `SystemTime` as an RFC 3339 timestamp.
pub mod rfc3339 {
    use std::time::SystemTime;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_rfc3339_millis(*value))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn report_serializes_to_json() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let report = RunReport {
            dsn: "mysql://localhost/test".into(),
            files: vec!["data.jsonl".into()],
            started: now,
            finished: now + Duration::from_secs(10),
            elapsed: 10.0,
            queries: 1000,
            nagents: 2,
            rate: 50,
            qps: 100.0,
            expected_qps: 100,
            loop_count: 3,
            response: LatencySummary::default(),
            max_qps: 120.0,
            min_qps: 80.0,
            median_qps: 100.0,
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();

        assert_eq!(json["queries"], 1000);
        assert_eq!(json["nagents"], 2);
        assert_eq!(json["expected_qps"], 100);
        assert_eq!(json["started"].as_str().unwrap(), "2023-11-14T22:13:20.000Z");
    }
}
