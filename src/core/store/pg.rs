use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection};

use super::{HangTimeRow, StoreConn, StoreConnector, StoreError};

/// Per-day `percentile_cont` of the gap between ticket creation and
/// assignment. Parameters: window start, exclusive window end (already
/// extended by the caller), percentile fraction.
const HANG_TIME_SQL: &str = r#"
WITH assigned_tickets AS (
    SELECT
        date_trunc('day', "assignedAt") AS day,
        EXTRACT(EPOCH FROM ("assignedAt" - "createdAt"))::double precision AS resolution_seconds
    FROM "Ticket"
    WHERE "assignedAt" >= $1 AND "assignedAt" < $2
)
SELECT day,
       percentile_cont($3) WITHIN GROUP (ORDER BY resolution_seconds) AS resolution_time,
       count(*) AS sample_count
FROM assigned_tickets
GROUP BY day
ORDER BY day
"#;

pub struct PgConnector;

#[async_trait]
impl StoreConnector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self, dsn: &str) -> Result<PgConnection, StoreError> {
        PgConnection::connect(dsn).await.map_err(classify)
    }
}

#[async_trait]
impl StoreConn for PgConnection {
    async fn fetch_hang_time_rows(
        &mut self,
        start: DateTime<Utc>,
        end_exclusive: DateTime<Utc>,
        percentile: f64,
    ) -> Result<Vec<HangTimeRow>, StoreError> {
        sqlx::query_as::<_, HangTimeRow>(HANG_TIME_SQL)
            .bind(start)
            .bind(end_exclusive)
            .bind(percentile)
            .fetch_all(&mut *self)
            .await
            .map_err(classify)
    }

    async fn select_one(&mut self) -> Result<i32, StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&mut *self)
            .await
            .map_err(classify)
    }

    async fn close(self) -> Result<(), StoreError> {
        Connection::close(self).await.map_err(classify)
    }
}

/// Socket-level faults are recoverable by reconnecting; everything else is a
/// plain query failure.
fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_) => StoreError::Transient(Box::new(err)),
        _ => StoreError::Query(Box::new(err)),
    }
}
