use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    FromRow, PgPool, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::{ConnectError, PersistenceError};

/// Keeps every multi-row statement under both Postgres' (65535) and SQLite's (32766)
/// bind-parameter limits.
pub const MAX_BIND_PARAMS: usize = 30_000;

/// `Disconnected -> Connecting -> Connected -> Closed`; `Connecting -> Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

/// A bound parameter. `None` binds SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Float(Option<f64>),
    Int(Option<i32>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(Some(v))
    }
}

impl From<Option<f64>> for SqlValue {
    fn from(v: Option<f64>) -> Self {
        SqlValue::Float(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(Some(v))
    }
}

/// A statement that can be rendered for any number of rows of fixed width. Shared across the
/// awaits of a batch write, so it must be `Sync`.
pub trait BatchStatement: Send + Sync {
    /// Table name used in error reports.
    fn table(&self) -> &'static str;
    /// Bind parameters per row.
    fn width(&self) -> usize;
    /// SQL text for a multi-row statement covering `rows` rows, placeholders `$1..$n`.
    fn sql_for(&self, rows: usize) -> String;
}

pub fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

#[derive(Clone, Debug)]
enum Pool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Shared connection/transaction service. Cheap to clone; passed by reference into the
/// upsert functions.
#[derive(Clone, Debug)]
pub struct Db {
    pool: Pool,
}

// Expands to the same transactional body for each backend; the concrete pool type decides
// which `Encode` impls are used for the binds.
macro_rules! execute_in_transaction {
    ($pool:expr, $stmt:expr, $rows:expr) => {{
        let mut tx = $pool.begin().await?;
        let mut affected: u64 = 0;
        for group in $rows.chunks(rows_per_statement($stmt.width())) {
            let sql = $stmt.sql_for(group.len());
            let mut query = sqlx::query(&sql);
            for row in group {
                for value in row.iter() {
                    query = match value {
                        SqlValue::Text(v) => query.bind(v.as_deref()),
                        SqlValue::Float(v) => query.bind(*v),
                        SqlValue::Int(v) => query.bind(*v),
                    };
                }
            }
            match query.execute(&mut *tx).await {
                Ok(done) => affected += done.rows_affected(),
                Err(err) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!(table = $stmt.table(), error = %rb, "rollback failed");
                    }
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(affected)
    }};
}

impl Db {
    pub fn backend(&self) -> Backend {
        match self.pool {
            Pool::Postgres(_) => Backend::Postgres,
            Pool::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// Run `stmt` over all `rows` inside one transaction. Any statement error rolls back the
    /// whole batch. Returns the number of rows actually inserted or updated.
    #[instrument(skip(self, stmt, rows), fields(table = stmt.table(), rows = rows.len()))]
    pub async fn execute_many(
        &self,
        stmt: &dyn BatchStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != stmt.width()) {
            return Err(PersistenceError::new(
                stmt.table(),
                sqlx::Error::Protocol(format!(
                    "row has {} values, statement expects {}",
                    bad.len(),
                    stmt.width()
                )),
            ));
        }
        let result = match &self.pool {
            Pool::Postgres(pool) => Self::execute_pg(pool, stmt, rows).await,
            Pool::Sqlite(pool) => Self::execute_sqlite(pool, stmt, rows).await,
        };
        result.map_err(|e| PersistenceError::new(stmt.table(), e))
    }

    async fn execute_pg(
        pool: &PgPool,
        stmt: &dyn BatchStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, sqlx::Error> {
        execute_in_transaction!(pool, stmt, rows)
    }

    async fn execute_sqlite(
        pool: &SqlitePool,
        stmt: &dyn BatchStatement,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64, sqlx::Error> {
        execute_in_transaction!(pool, stmt, rows)
    }

    /// Execute unparameterized SQL (DDL only).
    pub async fn execute_raw(&self, sql: &str) -> Result<(), sqlx::Error> {
        match &self.pool {
            Pool::Postgres(pool) => {
                sqlx::raw_sql(sql).execute(pool).await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::raw_sql(sql).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// First column of every row, as text.
    pub async fn fetch_column(&self, sql: &str) -> Result<Vec<String>, sqlx::Error> {
        match &self.pool {
            Pool::Postgres(pool) => sqlx::query_scalar::<_, String>(sql).fetch_all(pool).await,
            Pool::Sqlite(pool) => sqlx::query_scalar::<_, String>(sql).fetch_all(pool).await,
        }
    }

    /// First two columns of every row, as text.
    pub async fn fetch_pairs(&self, sql: &str) -> Result<Vec<(String, String)>, sqlx::Error> {
        match &self.pool {
            Pool::Postgres(pool) => sqlx::query_as::<_, (String, String)>(sql).fetch_all(pool).await,
            Pool::Sqlite(pool) => sqlx::query_as::<_, (String, String)>(sql).fetch_all(pool).await,
        }
    }

    /// Rows decoded as `T` (typically a tuple), binding `params` as text in placeholder order.
    pub async fn fetch_as<T>(&self, sql: &str, params: &[String]) -> Result<Vec<T>, sqlx::Error>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow> + for<'r> FromRow<'r, SqliteRow>,
    {
        match &self.pool {
            Pool::Postgres(pool) => {
                let mut query = sqlx::query_as::<_, T>(sql);
                for p in params {
                    query = query.bind(p.as_str());
                }
                query.fetch_all(pool).await
            }
            Pool::Sqlite(pool) => {
                let mut query = sqlx::query_as::<_, T>(sql);
                for p in params {
                    query = query.bind(p.as_str());
                }
                query.fetch_all(pool).await
            }
        }
    }

    async fn close(&self) {
        match &self.pool {
            Pool::Postgres(pool) => pool.close().await,
            Pool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Where to connect. URLs starting with `sqlite:` select the SQLite backend.
#[derive(Clone, Debug)]
pub struct DbTarget {
    pub url: String,
    /// Postgres `search_path` applied to every session.
    pub schema: Option<String>,
    pub max_connections: u32,
}

impl DbTarget {
    pub fn backend(&self) -> Backend {
        if self.url.starts_with("sqlite:") {
            Backend::Sqlite
        } else {
            Backend::Postgres
        }
    }
}

/// Owns the connection lifecycle: bounded connect retries against a database that may still
/// be starting, then hands out [`Db`] handles until `close`.
pub struct ConnectionManager {
    target: DbTarget,
    retries: u32,
    delay: Duration,
    acquire_timeout: Duration,
    state: ConnectionState,
    db: Option<Db>,
}

impl ConnectionManager {
    pub fn new(target: DbTarget, retries: u32, delay: Duration) -> Self {
        Self {
            target,
            retries: retries.max(1),
            delay,
            acquire_timeout: Duration::from_secs(10),
            state: ConnectionState::Disconnected,
            db: None,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn db(&self) -> Result<&Db, ConnectError> {
        match (&self.db, self.state) {
            (Some(db), ConnectionState::Connected) => Ok(db),
            (_, state) => Err(ConnectError::NotConnected(state)),
        }
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), ConnectError> {
        if !self.state.can_transition(to) {
            return Err(ConnectError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(self), fields(backend = ?self.target.backend(), retries = self.retries))]
    pub async fn connect(&mut self) -> Result<Db, ConnectError> {
        self.transition(ConnectionState::Connecting)?;

        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 1..=self.retries {
            if attempt > 1 {
                self.transition(ConnectionState::Connecting)?;
            }
            match self.open_pool().await {
                Ok(pool) => {
                    self.transition(ConnectionState::Connected)?;
                    info!(attempt, "connected to db");
                    let db = Db { pool };
                    self.db = Some(db.clone());
                    return Ok(db);
                }
                Err(ConnectError::InvalidOptions(e)) => {
                    self.state = ConnectionState::Failed;
                    return Err(ConnectError::InvalidOptions(e));
                }
                Err(ConnectError::Exhausted { source, .. }) => {
                    warn!(
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %source,
                        "database not ready yet"
                    );
                    last_err = Some(source);
                    if attempt < self.retries {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        self.transition(ConnectionState::Failed)?;
        Err(ConnectError::Exhausted {
            attempts: self.retries,
            source: last_err.unwrap_or(sqlx::Error::PoolClosed),
        })
    }

    async fn open_pool(&self) -> Result<Pool, ConnectError> {
        let attempt_err = |source| ConnectError::Exhausted {
            attempts: 1,
            source,
        };
        match self.target.backend() {
            Backend::Postgres => {
                let mut options = PgConnectOptions::from_str(&self.target.url)
                    .map_err(ConnectError::InvalidOptions)?
                    // Row counts vary per batch, so each statement text is mostly one-off.
                    .statement_cache_capacity(0);
                if let Some(schema) = &self.target.schema {
                    options = options.options([("search_path", schema.as_str())]);
                }
                let pool = PgPoolOptions::new()
                    .max_connections(self.target.max_connections.max(1))
                    .acquire_timeout(self.acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(attempt_err)?;
                Ok(Pool::Postgres(pool))
            }
            Backend::Sqlite => {
                let options = SqliteConnectOptions::from_str(&self.target.url)
                    .map_err(ConnectError::InvalidOptions)?
                    .create_if_missing(true);
                // In-memory databases live only as long as their single connection.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .acquire_timeout(self.acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(attempt_err)?;
                Ok(Pool::Sqlite(pool))
            }
        }
    }

    /// `Connected -> Closed`.
    pub async fn close(&mut self) -> Result<(), ConnectError> {
        self.transition(ConnectionState::Closed)?;
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        info!("database connection closed");
        Ok(())
    }
}

/// Connect to a private in-memory SQLite database.
pub async fn connect_sqlite_memory() -> Result<Db, ConnectError> {
    let target = DbTarget {
        url: "sqlite::memory:".to_string(),
        schema: None,
        max_connections: 1,
    };
    ConnectionManager::new(target, 1, Duration::ZERO)
        .connect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch;

    impl BatchStatement for Scratch {
        fn table(&self) -> &'static str {
            "scratch"
        }
        fn width(&self) -> usize {
            2
        }
        fn sql_for(&self, rows: usize) -> String {
            let groups: Vec<String> = (0..rows)
                .map(|r| format!("(${}, ${})", r * 2 + 1, r * 2 + 2))
                .collect();
            format!("INSERT INTO scratch (name, score) VALUES {}", groups.join(", "))
        }
    }

    #[test]
    fn state_machine_rejects_skipping_connecting() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connecting));
        assert!(Connecting.can_transition(Failed));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Failed.can_transition(Connecting));
        assert!(!Closed.can_transition(Connecting));
    }

    #[test]
    fn statement_group_size_respects_param_ceiling() {
        assert_eq!(rows_per_statement(4), 7_500);
        assert_eq!(rows_per_statement(0), MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(MAX_BIND_PARAMS * 2), 1);
    }

    #[tokio::test]
    async fn sqlite_memory_lifecycle() {
        let target = DbTarget {
            url: "sqlite::memory:".into(),
            schema: None,
            max_connections: 1,
        };
        let mut manager = ConnectionManager::new(target, 3, Duration::ZERO);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.db().is_err());

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.db().unwrap().backend(), Backend::Sqlite);

        manager.close().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            manager.connect().await,
            Err(ConnectError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_postgres_exhausts_retries() {
        let target = DbTarget {
            url: "postgres://user:pw@127.0.0.1:1/worldbank".into(),
            schema: Some("thi_miniproject".into()),
            max_connections: 1,
        };
        let mut manager = ConnectionManager::new(target, 2, Duration::from_millis(10))
            .with_acquire_timeout(Duration::from_millis(300));
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Exhausted { attempts: 2, .. }));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn execute_many_commits_and_rolls_back_whole_batches() {
        let db = connect_sqlite_memory().await.unwrap();
        db.execute_raw("CREATE TABLE scratch (name TEXT NOT NULL, score DOUBLE PRECISION)")
            .await
            .unwrap();

        let ok = vec![
            vec![SqlValue::from("cat 1"), SqlValue::from(1.5)],
            vec![SqlValue::from("cat 2"), SqlValue::Float(None)],
        ];
        assert_eq!(db.execute_many(&Scratch, &ok).await.unwrap(), 2);

        let bad = vec![
            vec![SqlValue::from("cat 3"), SqlValue::from(3.3)],
            vec![SqlValue::Text(None), SqlValue::from(4.4)],
        ];
        let err = db.execute_many(&Scratch, &bad).await.unwrap_err();
        assert_eq!(err.table, "scratch");

        let names = db
            .fetch_column("SELECT name FROM scratch ORDER BY name")
            .await
            .unwrap();
        assert_eq!(names, vec!["cat 1".to_string(), "cat 2".to_string()]);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn execute_many_future_can_cross_tasks() {
        let db = connect_sqlite_memory().await.unwrap();
        db.execute_raw("CREATE TABLE scratch (name TEXT NOT NULL, score DOUBLE PRECISION)")
            .await
            .unwrap();
        let rows = vec![vec![SqlValue::from("spawned"), SqlValue::from(2.0)]];
        let stmt: &'static dyn BatchStatement = &Scratch;
        let handle = tokio::spawn(async move {
            let fut = db.execute_many(stmt, &rows);
            assert_send(&fut);
            fut.await
        });
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn execute_many_rejects_ragged_rows() {
        let db = connect_sqlite_memory().await.unwrap();
        let rows = vec![vec![SqlValue::from("only one")]];
        let err = db.execute_many(&Scratch, &rows).await.unwrap_err();
        assert!(err.to_string().contains("expects 2"));
    }
}
