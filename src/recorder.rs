use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use crate::error::Error;
use crate::report::RunReport;
use crate::stats::LatencySummary;

/// One timestamped response-time sample. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPoint {
    pub time: SystemTime,
    pub response_time: Duration,
}

enum Ingest {
    Batch(Vec<DataPoint>),
    Count(oneshot::Sender<usize>),
    Close,
}

/// Concurrent sample aggregator.
///
/// A single owning task holds the sample collection and serves both batch
/// appends and size queries through one message channel; producers never
/// touch the collection directly. Statistics are derived once, at
/// [`Recorder::close`].
#[derive(TypedBuilder)]
pub struct Recorder {
    #[builder(setter(into))]
    pub dsn: String,
    pub files: Vec<PathBuf>,
    pub nagents: usize,
    #[builder(default)]
    pub rate: u32,
    #[builder(default = 10)]
    pub hbins: usize,
    #[builder(default)]
    pub hinterval: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub qps_interval: Duration,

    #[builder(default, setter(skip))]
    tx: Option<mpsc::Sender<Ingest>>,
    #[builder(default, setter(skip))]
    collector: Option<JoinHandle<Vec<DataPoint>>>,
    #[builder(default, setter(skip))]
    loops: Arc<AtomicU64>,
    #[builder(default = SystemTime::now(), setter(skip))]
    started: SystemTime,
    #[builder(default, setter(skip))]
    finished: Option<SystemTime>,
    #[builder(default, setter(skip))]
    points: Vec<DataPoint>,
    #[builder(default, setter(skip))]
    response: LatencySummary,
    #[builder(default, setter(skip))]
    qps_history: Vec<f64>,
}

/// Cheap clonable producer endpoint handed to agents.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Ingest>,
    loops: Arc<AtomicU64>,
}

impl Recorder {
    /// Spawns the ingestion task with a channel bounded at `capacity`
    /// batches and stamps the start time.
    pub fn start(&mut self, capacity: usize) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));

        self.collector = Some(tokio::spawn(async move {
            let mut points: Vec<DataPoint> = Vec::new();

            while let Some(msg) = rx.recv().await {
                match msg {
                    Ingest::Batch(batch) => points.extend(batch),
                    Ingest::Count(reply) => {
                        let _ = reply.send(points.len());
                    }
                    // Everything sent before the close marker has already
                    // been drained; outstanding handles get send errors.
                    Ingest::Close => break,
                }
            }

            points
        }));

        self.tx = Some(tx);
        self.started = SystemTime::now();
    }

    /// Returns a producer handle.
    pub fn handle(&self) -> Result<RecorderHandle, Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(Error::Lifecycle("recorder is not started"))?
            .clone();

        Ok(RecorderHandle {
            tx,
            loops: self.loops.clone(),
        })
    }

    /// Stops accepting batches, stamps the finish time, and derives the
    /// latency distribution and QPS series from the accumulated points.
    ///
    /// The ingestion task is told to stop explicitly, so close completes
    /// even while producer handles are still alive; their traffic is
    /// dropped from that point on.
    pub async fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ingest::Close).await;
        }

        if let Some(collector) = self.collector.take() {
            self.points = collector.await.unwrap_or_default();
        }

        self.finished = Some(SystemTime::now());

        let durations: Vec<Duration> = self.points.iter().map(|p| p.response_time).collect();
        self.response = LatencySummary::compute(&durations, self.hbins, self.hinterval);
        self.qps_history = qps_history(&mut self.points, self.qps_interval);
    }

    /// Number of accumulated points. Only meaningful after [`Recorder::close`];
    /// use [`RecorderHandle::count`] for a live value.
    pub fn count(&self) -> usize {
        self.points.len()
    }

    pub fn report(&self) -> RunReport {
        let finished = self.finished.unwrap_or_else(SystemTime::now);
        let elapsed = finished
            .duration_since(self.started)
            .unwrap_or_default()
            .as_secs_f64();
        let count = self.points.len();
        let qps = if elapsed > 0.0 {
            count as f64 / elapsed
        } else {
            0.0
        };
        let (max_qps, min_qps, median_qps) = qps_extremes(&self.qps_history);

        RunReport {
            dsn: self.dsn.clone(),
            files: self.files.clone(),
            started: self.started,
            finished,
            elapsed,
            queries: count,
            nagents: self.nagents,
            rate: self.rate,
            qps,
            expected_qps: self.nagents as u64 * self.rate as u64,
            loop_count: self.loops.load(Ordering::Relaxed),
            response: self.response.clone(),
            max_qps,
            min_qps,
            median_qps,
        }
    }
}

impl RecorderHandle {
    /// Transfers a batch of points into the recorder. Applies backpressure
    /// when ingestion falls behind; silently drops after close.
    pub async fn add(&self, points: Vec<DataPoint>) {
        if points.is_empty() {
            return;
        }

        let _ = self.tx.send(Ingest::Batch(points)).await;
    }

    /// Current collection size, for live progress estimates.
    pub async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();

        if self.tx.send(Ingest::Count(reply)).await.is_err() {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Records an agent's completed loop passes. The reported value is the
    /// maximum across agents, so the counter never decreases.
    pub fn record_loops(&self, loops: u64) {
        self.loops.fetch_max(loops, Ordering::Relaxed);
    }
}

/// Sorts the points by timestamp and buckets them into fixed-width windows,
/// returning queries-per-second per window. Gaps produce zero buckets.
fn qps_history(points: &mut [DataPoint], interval: Duration) -> Vec<f64> {
    if points.is_empty() || interval.is_zero() {
        return Vec::new();
    }

    points.sort_by_key(|p| p.time);

    let mut boundary = points[0].time + interval;
    let mut counts: Vec<u64> = vec![0];

    for point in points.iter() {
        while point.time >= boundary {
            boundary += interval;
            counts.push(0);
        }

        if let Some(last) = counts.last_mut() {
            *last += 1;
        }
    }

    let scale = 1.0 / interval.as_secs_f64();
    counts.into_iter().map(|c| c as f64 * scale).collect()
}

/// Max/min/median QPS across buckets, excluding the first bucket as an
/// unrepresentative warm-up window. Zero remaining buckets yield zeros.
fn qps_extremes(history: &[f64]) -> (f64, f64, f64) {
    let rest = if history.len() > 1 { &history[1..] } else { &[] };

    if rest.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let mut sorted = rest.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };

    (sorted[n - 1], sorted[0], median)
}
