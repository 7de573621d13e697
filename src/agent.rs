use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::Instant;

use crate::data::Data;
use crate::db::{ConnInfo, Connection, Database};
use crate::error::Error;
use crate::logger::Logger;
use crate::recorder::{DataPoint, RecorderHandle};

/// Cadence at which a worker flushes its local buffer into the recorder.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// One worker replaying queries over its own exclusive connection.
pub struct Agent<D: Database> {
    pub id: usize,
    db: Arc<D>,
    conn_info: ConnInfo,
    conn: Option<D::Conn>,
    pub data: Data,
    logger: Logger,
}

impl<D: Database> Agent<D> {
    pub fn new(id: usize, db: Arc<D>, conn_info: ConnInfo, data: Data, logger: Logger) -> Self {
        Self {
            id,
            db,
            conn_info,
            conn: None,
            data,
            logger,
        }
    }

    /// Opens and pings the connection, then runs the session pre-queries.
    pub async fn prepare(&mut self, pre_queries: &[String]) -> Result<(), Error> {
        let mut conn = self
            .db
            .connect(&self.conn_info)
            .await
            .map_err(Error::Connection)?;

        for query in pre_queries {
            conn.execute(query).await.map_err(|cause| Error::Query {
                query: query.clone(),
                cause,
            })?;
        }

        self.conn = Some(conn);
        Ok(())
    }

    /// Pulls statements from the feeder until it is exhausted, executing and
    /// timing every query.
    ///
    /// The shared shutdown signal is checked between queries, never
    /// mid-query. Under force-mode a failed query is logged, discarded from
    /// the feeder's accounting, and the loop continues. Buffered points are
    /// flushed into the recorder once per [`FLUSH_INTERVAL`] and
    /// unconditionally on the way out.
    pub async fn run(
        &mut self,
        shutdown: watch::Receiver<bool>,
        recorder: RecorderHandle,
    ) -> Result<(), Error> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(Error::Lifecycle("agent is not prepared"))?;
        let mut feeder = self.data.open().await?;

        let mut buffer: Vec<DataPoint> = Vec::new();
        let mut last_flush = Instant::now();
        let mut result = Ok(());

        loop {
            let query = match feeder.next_query().await {
                Ok(Some(query)) => query,
                Ok(None) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };

            if *shutdown.borrow() {
                break;
            }

            if last_flush.elapsed() >= FLUSH_INTERVAL {
                recorder.add(std::mem::take(&mut buffer)).await;
                last_flush = Instant::now();
            }

            let start = Instant::now();
            if let Err(cause) = conn.execute(&query).await {
                if self.data.force {
                    tracing::warn!(agent = self.id, error = %cause, "query skipped");
                    feeder.discard();
                    continue;
                }

                result = Err(Error::Query { query, cause });
                break;
            }
            let response_time = start.elapsed();

            let time = SystemTime::now();
            self.logger.log(&query, response_time, time);
            buffer.push(DataPoint {
                time,
                response_time,
            });
        }

        recorder.add(std::mem::take(&mut buffer)).await;

        result?;
        recorder.record_loops(feeder.loops());
        Ok(())
    }

    /// Releases the connection and log sender. Called exactly once during
    /// teardown.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                tracing::warn!(agent = self.id, error = %err, "connection close failed");
            }
        }

        self.logger.detach();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::db::testing::FakeDb;
    use crate::recorder::Recorder;

    fn corpus(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn agent(db: FakeDb, data: Data) -> Agent<FakeDb> {
        let conn_info = ConnInfo::builder().dsn("fake://db").build();
        Agent::new(0, Arc::new(db), conn_info, data, Logger::null())
    }

    fn started_recorder() -> Recorder {
        let mut recorder = Recorder::builder()
            .dsn("fake://db")
            .files(vec![])
            .nagents(1)
            .build();
        recorder.start(4);
        recorder
    }

    #[tokio::test]
    async fn runs_every_query_and_records_points() {
        let file = corpus(&[
            r#"{"query":"SELECT 1"}"#,
            r#"{"query":"SELECT 2"}"#,
            r#"{"query":"SELECT 3"}"#,
        ]);
        let db = FakeDb::default();
        let executed = db.executed.clone();

        let mut agent = agent(db, Data::builder().path(file.path().to_path_buf()).build());
        agent.prepare(&[]).await.unwrap();

        let mut recorder = started_recorder();
        let (_tx, rx) = watch::channel(false);
        agent.run(rx, recorder.handle().unwrap()).await.unwrap();

        recorder.close().await;
        assert_eq!(executed.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test]
    async fn pre_queries_run_at_prepare_time() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#]);
        let db = FakeDb::default();
        let executed = db.executed.clone();

        let mut agent = agent(db, Data::builder().path(file.path().to_path_buf()).build());
        agent
            .prepare(&["SET autocommit=0".into()])
            .await
            .unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_failure_aborts_preparation() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#]);
        let db = FakeDb {
            refuse_connections: true,
            ..FakeDb::default()
        };

        let mut agent = agent(db, Data::builder().path(file.path().to_path_buf()).build());
        let err = agent.prepare(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn run_without_prepare_is_a_lifecycle_error() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#]);
        let mut agent = agent(
            FakeDb::default(),
            Data::builder().path(file.path().to_path_buf()).build(),
        );

        let mut recorder = started_recorder();
        let (_tx, rx) = watch::channel(false);
        let err = agent.run(rx, recorder.handle().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        recorder.close().await;
    }

    #[tokio::test]
    async fn query_failure_stops_the_worker_and_flushes() {
        let file = corpus(&[
            r#"{"query":"SELECT 1"}"#,
            r#"{"query":"DROP oops"}"#,
            r#"{"query":"SELECT 3"}"#,
        ]);
        let db = FakeDb {
            fail_on: Some("oops"),
            ..FakeDb::default()
        };

        let mut agent = agent(db, Data::builder().path(file.path().to_path_buf()).build());
        agent.prepare(&[]).await.unwrap();

        let mut recorder = started_recorder();
        let (_tx, rx) = watch::channel(false);
        let err = agent.run(rx, recorder.handle().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));

        // The point measured before the failure still reaches the recorder.
        recorder.close().await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn query_failure_is_survivable_under_force() {
        let file = corpus(&[
            r#"{"query":"SELECT 1"}"#,
            r#"{"query":"DROP oops"}"#,
            r#"{"query":"SELECT 3"}"#,
        ]);
        let db = FakeDb {
            fail_on: Some("oops"),
            ..FakeDb::default()
        };

        let data = Data::builder()
            .path(file.path().to_path_buf())
            .force(true)
            .build();
        let mut agent = agent(db, data);
        agent.prepare(&[]).await.unwrap();

        let mut recorder = started_recorder();
        let (_tx, rx) = watch::channel(false);
        agent.run(rx, recorder.handle().unwrap()).await.unwrap();

        recorder.close().await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop_between_queries() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#]);
        let data = Data::builder()
            .path(file.path().to_path_buf())
            .loop_input(true)
            .build();

        let db = FakeDb::default();
        let executed = db.executed.clone();
        let mut agent = agent(db, data);
        agent.prepare(&[]).await.unwrap();

        let mut recorder = started_recorder();
        let (tx, rx) = watch::channel(false);

        // Cancel immediately: the loop must notice at its next iteration
        // boundary and return cleanly.
        tx.send(true).unwrap();
        agent.run(rx, recorder.handle().unwrap()).await.unwrap();

        recorder.close().await;
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loop_passes_reach_the_recorder() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#, r#"{"query":"SELECT 2"}"#]);
        let data = Data::builder()
            .path(file.path().to_path_buf())
            .loop_input(true)
            .max_count(6)
            .build();

        let mut agent = agent(FakeDb::default(), data);
        agent.prepare(&[]).await.unwrap();

        let mut recorder = started_recorder();
        let (_tx, rx) = watch::channel(false);
        agent.run(rx, recorder.handle().unwrap()).await.unwrap();

        recorder.close().await;
        let report = recorder.report();
        assert_eq!(report.queries, 6);
        assert_eq!(report.loop_count, 2);
    }

    #[tokio::test]
    async fn close_releases_the_connection_once() {
        let file = corpus(&[r#"{"query":"SELECT 1"}"#]);
        let db = FakeDb::default();
        let closed = db.closed.clone();

        let mut agent = agent(db, Data::builder().path(file.path().to_path_buf()).build());
        agent.prepare(&[]).await.unwrap();

        agent.close().await;
        agent.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
