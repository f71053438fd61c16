use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Query parameters for the stats report endpoint. `end` defaults to the
/// current instant (whole seconds) when absent.
#[derive(Debug, Deserialize, Validate)]
pub struct ReportQuery {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Range-query resolution in seconds.
    #[validate(range(min = 1))]
    pub step: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthDto {
    pub ok: bool,
    pub database: bool,
}
