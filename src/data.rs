use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::error::Error;

/// Cadence at which the throttle re-measures realized throughput.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(1);

/// Streams one query at a time from a newline-delimited JSON corpus.
///
/// Each line is an object whose `key` field holds the query text.
/// [`Data::open`] yields a [`Feeder`] that optionally loops at end-of-file,
/// starts at a uniformly random offset, stops after `max_count` queries,
/// wraps batches in `BEGIN`/`COMMIT`, and paces queries toward a target rate
/// with a self-correcting throttle.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Data {
    #[builder(setter(into))]
    pub path: PathBuf,
    #[builder(default = String::from("query"), setter(into))]
    pub key: String,
    /// Restart from the beginning at end-of-file.
    #[builder(default)]
    pub loop_input: bool,
    /// Log and skip per-query errors instead of stopping.
    #[builder(default)]
    pub force: bool,
    /// Start reading at a uniformly random byte offset.
    #[builder(default)]
    pub random: bool,
    /// Target queries/sec. Zero is unbounded.
    #[builder(default)]
    pub rate: u32,
    /// Maximum total queries across all loop passes. Zero is unbounded.
    #[builder(default)]
    pub max_count: u64,
    /// Insert `COMMIT` after every `commit_rate` corpus queries. Zero
    /// disables batching.
    #[builder(default)]
    pub commit_rate: u64,
    /// Seed for the randomized-start offset; `None` draws from the OS.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

/// One reading pass over a [`Data`] corpus, pulled a statement at a time.
///
/// The caller loop is:
///
/// ```text
/// while let Some(query) = feeder.next_query().await? { execute(query) }
/// ```
///
/// Each call accounts for the previously yielded statement (count cap, rate
/// pacing) and then produces the next one, so the throttle measures the full
/// interval between executions. [`Feeder::discard`] un-accounts a statement
/// whose execution was skipped.
pub struct Feeder<'d> {
    data: &'d Data,
    reader: BufReader<File>,
    line: String,

    base: Duration,
    limit: i64,
    prev: Instant,
    throttle_start: Instant,

    // Queries yielded since the last throttle measurement, and in total.
    tx: u32,
    total: u64,
    loop_count: u64,
    // Corpus records decoded in the current pass, and whether the pass
    // started at offset zero.
    records: u64,
    pass_from_start: bool,
    pending: bool,
    done: bool,

    // BEGIN and COMMIT occupy two extra slots of each batch cycle.
    cycle: u64,
}

impl Data {
    /// Opens the corpus and positions the read cursor, applying the
    /// randomized start when configured.
    pub async fn open(&self) -> Result<Feeder<'_>, Error> {
        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);

        if self.random {
            self.seek_to_random_line(&mut reader).await?;
        }

        let base = base_limit(self.rate);

        Ok(Feeder {
            data: self,
            reader,
            line: String::new(),
            base,
            limit: base.as_nanos() as i64,
            prev: Instant::now(),
            throttle_start: Instant::now(),
            tx: 0,
            total: 0,
            loop_count: 0,
            records: 0,
            pass_from_start: !self.random,
            pending: false,
            done: false,
            cycle: if self.commit_rate > 0 {
                self.commit_rate + 2
            } else {
                0
            },
        })
    }

    /// Seeks to a uniformly random byte offset, then discards the (likely
    /// partial) line containing it so the first read is a full record.
    async fn seek_to_random_line(&self, reader: &mut BufReader<File>) -> Result<(), Error> {
        let len = reader.get_ref().metadata().await?.len();
        if len == 0 {
            return Ok(());
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        reader.seek(SeekFrom::Start(rng.random_range(0..len))).await?;

        let mut partial = String::new();
        reader.read_line(&mut partial).await?;
        Ok(())
    }

    fn parse_query(&self, line: &str) -> Result<String, Error> {
        let record: serde_json::Value =
            serde_json::from_str(line).map_err(|err| Error::Format {
                key: self.key.clone(),
                line: line.to_owned(),
                reason: err.to_string(),
            })?;

        record
            .get(&self.key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::Format {
                key: self.key.clone(),
                line: line.to_owned(),
                reason: "missing query field".to_owned(),
            })
    }
}

impl Feeder<'_> {
    /// Yields the next statement, or `None` when the feeder is exhausted.
    ///
    /// Terminates when `max_count` is reached, the corpus ends with looping
    /// disabled, or a full pass from offset zero decodes no records (an
    /// empty or wholly unusable corpus must not loop forever). Malformed
    /// records are fatal unless force-mode is on, in which case they are
    /// logged and skipped.
    pub async fn next_query(&mut self) -> Result<Option<String>, Error> {
        if self.done {
            return Ok(None);
        }

        if self.pending {
            self.pending = false;
            self.tx += 1;
            self.total += 1;

            if self.data.max_count > 0 && self.total >= self.data.max_count {
                self.done = true;
                return Ok(None);
            }

            if self.data.rate > 0 {
                let elapsed = self.throttle_start.elapsed();
                if elapsed >= THROTTLE_INTERVAL {
                    self.limit = adjust_limit(self.limit, self.base, elapsed, self.tx);
                    self.throttle_start = Instant::now();
                    self.tx = 0;
                }

                let wait = Duration::from_nanos(self.limit.max(0) as u64)
                    .saturating_sub(self.prev.elapsed());
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                self.prev = Instant::now();
            }
        }

        loop {
            if self.cycle > 0 && self.total % self.cycle == 0 {
                self.pending = true;
                return Ok(Some("BEGIN".to_owned()));
            }
            if self.cycle > 0 && self.total % self.cycle == self.cycle - 1 {
                self.pending = true;
                return Ok(Some("COMMIT".to_owned()));
            }

            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                if !self.data.loop_input || (self.pass_from_start && self.records == 0) {
                    self.done = true;
                    return Ok(None);
                }

                self.reader.seek(SeekFrom::Start(0)).await?;
                self.loop_count += 1;
                self.pass_from_start = true;
                self.records = 0;
                continue;
            }

            match self.data.parse_query(self.line.trim_end_matches(['\r', '\n'])) {
                Ok(query) => {
                    self.records += 1;
                    self.pending = true;
                    return Ok(Some(query));
                }
                Err(err) if self.data.force => {
                    tracing::warn!(error = %err, "record skipped");
                    self.prev = Instant::now();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Un-accounts the previously yielded statement: it counts toward
    /// neither the cap nor the rate measurement, and the skipped elapsed
    /// time must not distort the controller.
    pub fn discard(&mut self) {
        self.pending = false;
        self.prev = Instant::now();
    }

    /// Completed loop passes so far.
    pub fn loops(&self) -> u64 {
        self.loop_count
    }
}

/// Base per-query delay for a target rate.
fn base_limit(rate: u32) -> Duration {
    if rate > 0 {
        Duration::from_secs(1) / (rate + 1)
    } else {
        Duration::ZERO
    }
}

/// One negative-feedback correction step, in nanoseconds.
///
/// Measures the realized per-query interval since the last step and nudges
/// the delay by the difference from the base delay, clamped at zero. A
/// static sleep would under- or over-shoot the target because query latency
/// varies.
fn adjust_limit(limit: i64, base: Duration, elapsed: Duration, tx: u32) -> i64 {
    if tx == 0 {
        return limit;
    }

    let actual = elapsed.as_nanos() as i64 / tx as i64;
    (limit + base.as_nanos() as i64 - actual).max(0)
}
