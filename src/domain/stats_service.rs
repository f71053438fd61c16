use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::error;

use crate::core::client::prometheus::{PromClient, UnresolvedTicketSeries};
use crate::core::store::{PercentileSeries, StoreConnector, TicketStore};
use crate::errors::AppError;

const HANG_TIME_PERCENTILE: f64 = 0.90;

/// The merged dashboard payload. Built per request, never cached.
#[derive(Debug, Serialize)]
pub struct AggregatedReport {
    pub unresolved_tickets: UnresolvedTicketSeries,
    pub hang_time: HangTimeReport,
}

#[derive(Debug, Serialize)]
pub struct HangTimeReport {
    pub p90: PercentileSeries,
}

#[async_trait]
pub trait HangTimeSource: Send + Sync {
    async fn percentile_hang_times(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        percentile: f64,
    ) -> Result<PercentileSeries, AppError>;
}

#[async_trait]
pub trait UnresolvedTicketSource: Send + Sync {
    async fn unresolved_tickets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<UnresolvedTicketSeries, AppError>;
}

#[async_trait]
impl<C: StoreConnector> HangTimeSource for TicketStore<C> {
    async fn percentile_hang_times(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        percentile: f64,
    ) -> Result<PercentileSeries, AppError> {
        Ok(self.fetch_percentile_series(start, end, percentile).await?)
    }
}

#[async_trait]
impl UnresolvedTicketSource for PromClient {
    async fn unresolved_tickets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<UnresolvedTicketSeries, AppError> {
        Ok(self.fetch_unresolved_tickets(start, end, step).await?)
    }
}

/// Fetch both sub-reports over the same window and merge them. The two
/// backends are independent; a failure on either side propagates with the
/// backend identified instead of producing a silently partial report.
pub async fn build_report(
    tickets: &impl HangTimeSource,
    metrics: &impl UnresolvedTicketSource,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    step: Duration,
) -> Result<AggregatedReport, AppError> {
    let end = end.unwrap_or_else(|| Utc::now().trunc_subsecs(0));
    if end < start {
        return Err(AppError::BadRequest(format!(
            "end {end} precedes start {start}"
        )));
    }

    let (unresolved, p90) = tokio::join!(
        metrics.unresolved_tickets(start, end, step),
        tickets.percentile_hang_times(start, end, HANG_TIME_PERCENTILE),
    );

    let unresolved =
        unresolved.inspect_err(|err| error!(error = %err, "unresolved ticket fetch failed"))?;
    let p90 = p90.inspect_err(|err| error!(error = %err, "hang time fetch failed"))?;

    Ok(AggregatedReport {
        unresolved_tickets: unresolved,
        hang_time: HangTimeReport { p90 },
    })
}
