use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

/// Per-day unresolved ticket counts, keyed by ISO date. Within a day the
/// last sample wins.
pub type UnresolvedTicketSeries = BTreeMap<String, i64>;

const RANGE_QUERY_PATH: &str = "/api/v1/query_range";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything still waiting on a handler: in-progress plus open tickets,
/// scoped to the watcher instance that exports the gauges.
const UNRESOLVED_TICKETS_EXPR: &str = concat!(
    "nephthys_in_progress_tickets{instance=\"support-watcher-flavortown:9000\"}",
    " + ",
    "nephthys_open_tickets{instance=\"support-watcher-flavortown:9000\"}",
);

#[derive(Debug, Error)]
pub enum PromError {
    #[error("request to metrics backend failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("metrics backend returned status {status:?}")]
    BadStatus { status: String },

    #[error("malformed sample in metrics response: {0}")]
    BadSample(String),
}

/// Top-level range-query envelope: `{status, data: {result: [...]}}`.
#[derive(Debug, Deserialize)]
pub struct RangeEnvelope {
    pub status: String,
    #[serde(default)]
    pub data: Option<RangeData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeData {
    #[serde(default)]
    pub result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<Sample>,
}

/// One `[timestamp, value]` pair. Prometheus emits the timestamp as a JSON
/// number and the value as a string; some proxies stringify both.
#[derive(Debug, Deserialize)]
pub struct Sample(pub Timestamp, pub String);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Seconds(f64),
    Text(String),
}

impl Timestamp {
    fn epoch_seconds(&self) -> Result<f64, PromError> {
        match self {
            Timestamp::Seconds(s) => Ok(*s),
            Timestamp::Text(t) => t
                .parse()
                .map_err(|_| PromError::BadSample(format!("timestamp {t:?}"))),
        }
    }
}

/// Metrics query adapter. Owns a pooled HTTP client for the life of the
/// process instead of opening a session per call.
pub struct PromClient {
    base_url: String,
    http: Client,
}

impl PromClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PromError> {
        let base_url: String = base_url.into();
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Range query against the metrics backend. The envelope must report
    /// `status == "success"`; anything else is logged with the query text and
    /// the full body, then surfaced as a failure. No retry at this layer.
    pub async fn range_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<RangeData, PromError> {
        let url = format!("{}{}", self.base_url, RANGE_QUERY_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", step.as_secs().to_string()),
            ])
            .send()
            .await?;

        let body = response.text().await?;
        let envelope: RangeEnvelope = serde_json::from_str(&body)?;
        unwrap_envelope(envelope).inspect_err(|_| {
            error!(query, body = %body, "metrics range query rejected");
        })
    }

    pub async fn fetch_unresolved_tickets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<UnresolvedTicketSeries, PromError> {
        let data = self
            .range_query(UNRESOLVED_TICKETS_EXPR, start, end, step)
            .await?;
        unresolved_series(&data)
    }
}

/// Envelope contract: the backend must report `status == "success"`; a
/// success envelope without a data payload counts as empty.
fn unwrap_envelope(envelope: RangeEnvelope) -> Result<RangeData, PromError> {
    if envelope.status != "success" {
        return Err(PromError::BadStatus {
            status: envelope.status,
        });
    }
    Ok(envelope.data.unwrap_or_default())
}

/// Reshape the first result series into a per-day count. The expression is
/// expected to produce a single series; extra series are ignored with a
/// warning rather than aggregated, since the metric's cardinality guarantee
/// is unconfirmed.
fn unresolved_series(data: &RangeData) -> Result<UnresolvedTicketSeries, PromError> {
    if data.result.len() > 1 {
        warn!(
            series = data.result.len(),
            "expected a single unresolved-ticket series, using the first"
        );
    }
    let Some(series) = data.result.first() else {
        return Ok(UnresolvedTicketSeries::new());
    };

    let mut out = UnresolvedTicketSeries::new();
    for Sample(timestamp, value) in &series.values {
        let seconds = timestamp.epoch_seconds()?;
        let day = DateTime::<Utc>::from_timestamp(seconds as i64, 0)
            .ok_or_else(|| PromError::BadSample(format!("timestamp {seconds} out of range")))?
            .date_naive()
            .to_string();
        let count = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| PromError::BadSample(format!("value {value:?}")))?
            as i64;
        out.insert(day, count);
    }
    Ok(out)
}
