use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts};
use typed_builder::TypedBuilder;

/// Driver errors as they cross the trait seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Connection parameters shared by every agent of a task.
///
/// Opaque to the engine beyond open/ping/execute/close; `max_idle_conns`
/// caps the idle pool of each agent's connection handle.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ConnInfo {
    #[builder(setter(into))]
    pub dsn: String,
    #[builder(default = 1)]
    pub max_idle_conns: usize,
}

/// A database an agent can connect to.
///
/// The production implementation is [`MySql`]; tests substitute an in-memory
/// fake with scripted latencies and failures.
#[async_trait]
pub trait Database: Send + Sync {
    type Conn: Connection + 'static;

    /// Opens a connection handle and verifies liveness.
    async fn connect(&self, info: &ConnInfo) -> Result<Self::Conn, BoxError>;
}

/// One exclusive connection. Never shared between agents.
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, query: &str) -> Result<(), BoxError>;

    /// Releases the connection. Called exactly once during teardown.
    async fn close(&mut self) -> Result<(), BoxError>;
}

/// MySQL-protocol database via `mysql_async`.
pub struct MySql;

pub struct MySqlConn {
    pool: Pool,
    conn: Option<mysql_async::Conn>,
}

#[async_trait]
impl Database for MySql {
    type Conn = MySqlConn;

    async fn connect(&self, info: &ConnInfo) -> Result<MySqlConn, BoxError> {
        let opts = Opts::from_url(&info.dsn)?;
        let constraints = PoolConstraints::new(0, info.max_idle_conns.max(1))
            .ok_or("invalid connection pool constraints")?;
        let opts = OptsBuilder::from_opts(opts)
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let pool = Pool::new(opts);
        let mut conn = pool.get_conn().await?;
        conn.ping().await?;

        Ok(MySqlConn {
            pool,
            conn: Some(conn),
        })
    }
}

#[async_trait]
impl Connection for MySqlConn {
    async fn execute(&mut self, query: &str) -> Result<(), BoxError> {
        let conn = self.conn.as_mut().ok_or("connection already closed")?;
        conn.query_drop(query).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        // Return the connection to the pool before disconnecting it.
        drop(self.conn.take());
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

/// PostgreSQL database via `tokio-postgres`.
///
/// The wire driver runs on a task of its own; dropping the client at close
/// time ends it.
pub struct Postgres;

pub struct PostgresConn {
    client: Option<tokio_postgres::Client>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Database for Postgres {
    type Conn = PostgresConn;

    async fn connect(&self, info: &ConnInfo) -> Result<PostgresConn, BoxError> {
        let (client, connection) =
            tokio_postgres::connect(&info.dsn, tokio_postgres::NoTls).await?;

        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgres connection error");
            }
        });

        client.batch_execute("SELECT 1").await?;

        Ok(PostgresConn {
            client: Some(client),
            driver: Some(driver),
        })
    }
}

#[async_trait]
impl Connection for PostgresConn {
    async fn execute(&mut self, query: &str) -> Result<(), BoxError> {
        let client = self.client.as_ref().ok_or("connection already closed")?;
        client.batch_execute(query).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        drop(self.client.take());
        if let Some(driver) = self.driver.take() {
            driver.await?;
        }
        Ok(())
    }
}
