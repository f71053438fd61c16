mod pg;

pub use pg::PgConnector;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

/// Per-day 90th (or any) percentile of ticket resolution time, keyed by ISO
/// date. `None` when `percentile_cont` had no non-null input for the bucket.
pub type PercentileSeries = BTreeMap<String, Option<f64>>;

/// Per-day sample counts. Only logged, never returned to the caller.
type CountSeries = BTreeMap<String, i64>;

/// Retries allowed after the initial attempt when cursor acquisition hits a
/// connection-level fault. The backend drops idle connections, so each retry
/// reconnects first; blind retry would spin against a dead socket.
const RETRY_LIMIT: usize = 5;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database client is not connected")]
    NotConnected,

    #[error("transient connection failure: {0}")]
    Transient(#[source] BoxDynError),

    #[error("query failed: {0}")]
    Query(#[source] BoxDynError),

    #[error("query retry budget exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: BoxDynError,
    },

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("percentile {0} is outside [0, 1]")]
    InvalidPercentile(f64),
}

/// One bucket of the hang-time query: calendar day, interpolated percentile
/// of resolution seconds, and how many tickets landed in the bucket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HangTimeRow {
    pub day: DateTime<Utc>,
    pub resolution_time: Option<f64>,
    pub sample_count: i64,
}

/// Opens connections to the relational store. Seam for tests; the production
/// implementation is [`PgConnector`].
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Conn: StoreConn;

    async fn connect(&self, dsn: &str) -> Result<Self::Conn, StoreError>;
}

#[async_trait]
pub trait StoreConn: Send {
    async fn fetch_hang_time_rows(
        &mut self,
        start: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
        percentile: f64,
    ) -> Result<Vec<HangTimeRow>, StoreError>;

    /// Trivial round-trip for the health check.
    async fn select_one(&mut self) -> Result<i32, StoreError>;

    async fn close(self) -> Result<(), StoreError>;
}

/// Relational query adapter. Owns a single long-lived connection behind an
/// async mutex, so concurrent requests serialize on query execution.
pub struct TicketStore<C: StoreConnector = PgConnector> {
    dsn: String,
    connector: C,
    conn: Mutex<Option<C::Conn>>,
}

impl TicketStore<PgConnector> {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self::with_connector(dsn, PgConnector)
    }
}

impl<C: StoreConnector> TicketStore<C> {
    pub fn with_connector(dsn: impl Into<String>, connector: C) -> Self {
        Self {
            dsn: dsn.into(),
            connector,
            conn: Mutex::new(None),
        }
    }

    /// Establish the connection. Idempotent: an existing connection is closed
    /// first, so two calls in a row leave exactly one live connection.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let mut slot = self.conn.lock().await;
        self.reconnect(&mut slot).await?;
        debug!("connected to the database");
        Ok(())
    }

    /// Close the stale connection if any, then open a fresh one. Shared by
    /// `connect` and the cursor retry path.
    async fn reconnect(&self, slot: &mut Option<C::Conn>) -> Result<(), StoreError> {
        if let Some(old) = slot.take() {
            if let Err(err) = old.close().await {
                warn!(error = %err, "failed to close stale database connection");
            }
        }
        *slot = Some(self.connector.connect(&self.dsn).await?);
        Ok(())
    }

    /// Per-day continuous-interpolation percentile of ticket resolution time
    /// for tickets assigned within `[start, end]`. The end bound is extended
    /// by one day internally so the window includes the final day.
    ///
    /// Transient connection faults are retried with a fixed delay, up to
    /// [`RETRY_LIMIT`] retries, reconnecting before each retry. A window with
    /// no matching rows yields an empty series.
    pub async fn fetch_percentile_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        percentile: f64,
    ) -> Result<PercentileSeries, StoreError> {
        if !(0.0..=1.0).contains(&percentile) {
            return Err(StoreError::InvalidPercentile(percentile));
        }
        let end_exclusive = end + chrono::Duration::days(1);

        let mut slot = self.conn.lock().await;
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let conn = slot.as_mut().ok_or(StoreError::NotConnected)?;

            let outcome = timeout(
                QUERY_TIMEOUT,
                conn.fetch_hang_time_rows(start, end_exclusive, percentile),
            )
            .await;

            let fault = match outcome {
                Ok(Ok(rows)) => {
                    let (series, counts) = split_rows(rows);
                    debug!(percentiles = ?series, samples = ?counts, "hang time day buckets");
                    return Ok(series);
                }
                Ok(Err(StoreError::Transient(err))) => err,
                Ok(Err(err)) => {
                    error!(error = %err, "hang time query failed");
                    return Err(err);
                }
                Err(_) => {
                    error!(timeout = ?QUERY_TIMEOUT, "hang time query timed out");
                    return Err(StoreError::Timeout(QUERY_TIMEOUT));
                }
            };

            if attempt > RETRY_LIMIT {
                error!(attempts = attempt, "hang time query retry budget exhausted");
                return Err(StoreError::RetriesExhausted {
                    attempts: attempt,
                    last: fault,
                });
            }

            warn!(attempt, error = %fault, "transient connection failure, reconnecting");
            sleep(RETRY_DELAY).await;
            self.reconnect(&mut slot).await?;
        }
    }

    /// Liveness check for the health endpoint. Never raises: any fault,
    /// including a stalled backend, is logged and reported as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let mut slot = self.conn.lock().await;
        let Some(conn) = slot.as_mut() else {
            return false;
        };

        match timeout(HEALTH_TIMEOUT, conn.select_one()).await {
            Ok(Ok(value)) => value == 1,
            Ok(Err(err)) => {
                error!(error = %err, "database health check failed");
                false
            }
            Err(_) => {
                error!(timeout = ?HEALTH_TIMEOUT, "database health check timed out");
                false
            }
        }
    }

    /// Close the connection if one exists. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "failed to close database connection");
            }
        }
    }
}

fn split_rows(rows: Vec<HangTimeRow>) -> (PercentileSeries, CountSeries) {
    let mut series = PercentileSeries::new();
    let mut counts = CountSeries::new();
    for row in rows {
        let day = row.day.date_naive().to_string();
        series.insert(day.clone(), row.resolution_time);
        counts.insert(day, row.sample_count);
    }
    (series, counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use chrono::TimeZone;

    type FetchOutcome = Result<Vec<HangTimeRow>, StoreError>;

    #[derive(Default)]
    struct Script {
        outcomes: StdMutex<VecDeque<FetchOutcome>>,
        fetches: AtomicUsize,
        opened: AtomicUsize,
        closed: AtomicUsize,
        stall_health: AtomicBool,
        last_window: StdMutex<Option<(DateTime<Utc>, DateTime<Utc>, f64)>>,
    }

    struct MockConnector {
        script: Arc<Script>,
    }

    struct MockConn {
        script: Arc<Script>,
    }

    #[async_trait]
    impl StoreConnector for MockConnector {
        type Conn = MockConn;

        async fn connect(&self, _dsn: &str) -> Result<MockConn, StoreError> {
            self.script.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                script: self.script.clone(),
            })
        }
    }

    #[async_trait]
    impl StoreConn for MockConn {
        async fn fetch_hang_time_rows(
            &mut self,
            start: DateTime<Utc>,
            end_exclusive: DateTime<Utc>,
            percentile: f64,
        ) -> FetchOutcome {
            self.script.fetches.fetch_add(1, Ordering::SeqCst);
            *self.script.last_window.lock().unwrap() = Some((start, end_exclusive, percentile));
            self.script
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn select_one(&mut self) -> Result<i32, StoreError> {
            if self.script.stall_health.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(1)
        }

        async fn close(self) -> Result<(), StoreError> {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn store_with(outcomes: Vec<FetchOutcome>) -> (TicketStore<MockConnector>, Arc<Script>) {
        let script = Arc::new(Script::default());
        *script.outcomes.lock().unwrap() = outcomes.into_iter().collect();
        let store = TicketStore::with_connector(
            "postgres://mock",
            MockConnector {
                script: script.clone(),
            },
        );
        (store, script)
    }

    fn transient() -> StoreError {
        StoreError::Transient(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn fetch_before_connect_is_not_connected() {
        let (store, _) = store_with(vec![]);
        let err = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 2), 0.90)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotConnected));
    }

    #[tokio::test]
    async fn empty_window_yields_empty_series() {
        let (store, _) = store_with(vec![Ok(Vec::new())]);
        store.connect().await.unwrap();

        let series = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 7), 0.90)
            .await
            .unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn same_day_window_extends_end_by_one_day() {
        let (store, script) = store_with(vec![Ok(Vec::new())]);
        store.connect().await.unwrap();

        store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 1), 0.90)
            .await
            .unwrap();

        let (start, end_exclusive, percentile) = script.last_window.lock().unwrap().unwrap();
        assert_eq!(start, day(2024, 1, 1));
        assert_eq!(end_exclusive, day(2024, 1, 2));
        assert_eq!(percentile, 0.90);
    }

    #[tokio::test]
    async fn rows_reshape_to_iso_day_keys() {
        // 90th percentile of [60, 120, 600] as computed by percentile_cont.
        let rows = vec![HangTimeRow {
            day: day(2024, 1, 1),
            resolution_time: Some(480.0),
            sample_count: 3,
        }];
        let (store, _) = store_with(vec![Ok(rows)]);
        store.connect().await.unwrap();

        let series = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 1), 0.90)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.get("2024-01-01"), Some(&Some(480.0)));
    }

    #[tokio::test]
    async fn retry_budget_surfaces_fatal_error() {
        // Seven scripted faults; only six attempts may happen.
        let outcomes = (0..7).map(|_| Err(transient())).collect();
        let (store, script) = store_with(outcomes);
        store.connect().await.unwrap();

        let err = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 2), 0.90)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 6, .. }));

        assert_eq!(script.fetches.load(Ordering::SeqCst), 6);
        // Initial connect plus one reconnect per retry.
        assert_eq!(script.opened.load(Ordering::SeqCst), 6);
        assert_eq!(script.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovers_from_transient_fault() {
        let rows = vec![HangTimeRow {
            day: day(2024, 1, 1),
            resolution_time: Some(90.0),
            sample_count: 2,
        }];
        let (store, script) = store_with(vec![Err(transient()), Ok(rows)]);
        store.connect().await.unwrap();

        let series = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 2), 0.90)
            .await
            .unwrap();
        assert_eq!(series.get("2024-01-01"), Some(&Some(90.0)));
        assert_eq!(script.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_twice_leaves_one_connection() {
        let (store, script) = store_with(vec![]);
        store.connect().await.unwrap();
        store.connect().await.unwrap();

        assert_eq!(script.opened.load(Ordering::SeqCst), 2);
        assert_eq!(script.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn out_of_range_percentile_is_rejected() {
        let (store, script) = store_with(vec![]);
        store.connect().await.unwrap();

        let err = store
            .fetch_percentile_series(day(2024, 1, 1), day(2024, 1, 2), 1.5)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPercentile(_)));
        // Rejected before touching the connection.
        assert_eq!(script.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn health_check_bounds_a_stalled_backend() {
        let (store, script) = store_with(vec![]);
        store.connect().await.unwrap();
        script.stall_health.store(true, Ordering::SeqCst);

        // A connected but unresponsive backend must come back unhealthy
        // instead of hanging the health endpoint.
        assert!(!store.is_healthy().await);
    }

    #[tokio::test]
    async fn health_reflects_connection_state() {
        let (store, script) = store_with(vec![]);
        assert!(!store.is_healthy().await);

        store.connect().await.unwrap();
        assert!(store.is_healthy().await);

        store.disconnect().await;
        assert!(!store.is_healthy().await);
        // Second disconnect is a no-op.
        store.disconnect().await;
        assert_eq!(script.closed.load(Ordering::SeqCst), 1);
    }
}
