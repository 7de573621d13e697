use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use typed_builder::TypedBuilder;

use crate::agent::Agent;
use crate::data::Data;
use crate::db::{ConnInfo, Database};
use crate::error::Error;
use crate::logger::Logger;
use crate::recorder::Recorder;
use crate::report::RunReport;

/// Options shared by every agent of a task.
#[derive(Clone, TypedBuilder)]
pub struct TaskOptions {
    #[builder(setter(into))]
    pub dsn: String,
    pub nagents: usize,
    #[builder(default)]
    pub rate: u32,
    /// Corpus files, assigned to agents round-robin.
    pub files: Vec<PathBuf>,
    #[builder(default = String::from("query"), setter(into))]
    pub key: String,
    #[builder(default = true)]
    pub loop_input: bool,
    #[builder(default)]
    pub force: bool,
    #[builder(default)]
    pub max_count: u64,
    #[builder(default)]
    pub random: bool,
    #[builder(default)]
    pub commit_rate: u64,
    #[builder(default = 10)]
    pub hbins: usize,
    #[builder(default)]
    pub hinterval: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub qps_interval: Duration,
    /// Statements executed once per agent at prepare time.
    #[builder(default)]
    pub pre_queries: Vec<String>,
    #[builder(default = Logger::null())]
    pub logger: Logger,
}

/// Live progress snapshot handed to the report callback.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Total recorded queries so far.
    pub count: usize,
    /// Delta-based QPS estimate over the last report interval.
    pub qps: f64,
    /// Agents still running.
    pub running: usize,
    pub elapsed: Duration,
}

/// External-cancellation trigger for a running task.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Prepared,
    Running,
    Closed,
}

/// Orchestrates one run: builds the agents, prepares their connections,
/// runs them concurrently under a shared deadline/cancellation, and drives
/// periodic progress reporting. A task runs exactly once.
pub struct Task<D: Database> {
    agents: Vec<Agent<D>>,
    options: TaskOptions,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state: State,
}

impl<D> Task<D>
where
    D: Database + 'static,
{
    pub fn new(db: D, options: TaskOptions) -> Result<Self, Error> {
        if options.nagents == 0 {
            return Err(Error::Lifecycle("at least one agent is required"));
        }

        if options.files.is_empty() {
            return Err(Error::Lifecycle("at least one corpus file is required"));
        }

        let db = Arc::new(db);
        let conn_info = ConnInfo::builder()
            .dsn(options.dsn.clone())
            .max_idle_conns(options.nagents)
            .build();

        let agents = (0..options.nagents)
            .map(|id| {
                let data = Data::builder()
                    .path(options.files[id % options.files.len()].clone())
                    .key(options.key.clone())
                    .loop_input(options.loop_input)
                    .force(options.force)
                    .random(options.random)
                    .rate(options.rate)
                    .max_count(options.max_count)
                    .commit_rate(options.commit_rate)
                    .build();

                Agent::new(id, db.clone(), conn_info.clone(), data, options.logger.clone())
            })
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            agents,
            options,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            state: State::Created,
        })
    }

    /// Trigger usable from signal handlers or other tasks to end the run.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Prepares every agent's connection sequentially; the first failure
    /// aborts and is returned.
    pub async fn prepare(&mut self) -> Result<(), Error> {
        if self.state != State::Created {
            return Err(Error::Lifecycle("task is already prepared"));
        }

        for agent in &mut self.agents {
            agent.prepare(&self.options.pre_queries).await?;
        }

        self.state = State::Prepared;
        Ok(())
    }

    /// Runs all agents concurrently until the corpus is exhausted, the
    /// deadline elapses (zero is unbounded), an agent fails, or the task is
    /// externally cancelled.
    ///
    /// The group fails fast: the first agent error cancels its siblings and
    /// becomes the run's error. The recorder and every connection are torn
    /// down regardless of the outcome. `progress` is invoked once per
    /// `report_interval` (zero disables reporting) and must not block.
    pub async fn run<F>(
        &mut self,
        duration: Duration,
        report_interval: Duration,
        progress: F,
    ) -> Result<RunReport, Error>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        if self.state != State::Prepared {
            return Err(Error::Lifecycle("task is not prepared"));
        }
        self.state = State::Running;

        let mut recorder = Recorder::builder()
            .dsn(self.options.dsn.clone())
            .files(self.options.files.clone())
            .nagents(self.options.nagents)
            .rate(self.options.rate)
            .hbins(self.options.hbins)
            .hinterval(self.options.hinterval)
            .qps_interval(self.options.qps_interval)
            .build();
        recorder.start(self.options.nagents * 3);
        let recorder_handle = recorder.handle()?;

        let running = Arc::new(AtomicUsize::new(self.agents.len()));

        tracing::info!(nagents = self.agents.len(), "spawning agents");
        let mut group: JoinSet<(Agent<D>, Result<(), Error>)> = JoinSet::new();
        for mut agent in self.agents.drain(..) {
            let shutdown_rx = self.shutdown_rx.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let handle = recorder_handle.clone();
            let running = running.clone();

            group.spawn(async move {
                // A panicking driver must not take the agent down with it;
                // the agent is handed back for teardown either way.
                let result = match AssertUnwindSafe(agent.run(shutdown_rx, handle))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Lifecycle("agent worker panicked")),
                };
                running.fetch_sub(1, Ordering::SeqCst);

                // Fail fast: stop the siblings on the first agent error.
                if result.is_err() {
                    let _ = shutdown_tx.send(true);
                }

                (agent, result)
            });
        }

        let deadline = (duration > Duration::ZERO).then(|| {
            let shutdown_tx = self.shutdown_tx.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        tracing::info!("deadline reached");
                        let _ = shutdown_tx.send(true);
                    }
                    _ = shutdown_rx.wait_for(|stop| *stop) => {}
                }
            })
        });

        let reporter = (!report_interval.is_zero()).then(|| {
            let handle = recorder_handle.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            let running = running.clone();
            let start = Instant::now();
            let mut progress = progress;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(report_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;

                let mut prev = 0usize;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let count = handle.count().await;
                            let qps = count.saturating_sub(prev) as f64
                                / report_interval.as_secs_f64();
                            prev = count;

                            progress(Progress {
                                count,
                                qps,
                                running: running.load(Ordering::SeqCst),
                                elapsed: start.elapsed(),
                            });
                        }
                        // The watch ref must not ride across the other
                        // arm's awaits; drop it inside its own future.
                        _ = async {
                            let _ = shutdown_rx.wait_for(|stop| *stop).await;
                        } => break,
                    }
                }
            })
        });

        let mut first_err: Option<Error> = None;
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok((agent, result)) => {
                    if let Err(err) = result {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    self.agents.push(agent);
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Lifecycle("agent task panicked"));
                    }
                }
            }
        }

        // Stop the ticker and the deadline timer.
        let _ = self.shutdown_tx.send(true);
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }
        if let Some(deadline) = deadline {
            let _ = deadline.await;
        }

        // Guaranteed teardown, independent of the error path.
        recorder.close().await;
        for agent in &mut self.agents {
            agent.close().await;
        }
        self.state = State::Closed;

        match first_err {
            Some(err) => Err(err),
            None => Ok(recorder.report()),
        }
    }
}
