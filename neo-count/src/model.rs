use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Number of near-Earth objects observed on one calendar day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCount {
    pub date: NaiveDate,
    pub count: u64,
}

/// Body of a write request.
///
/// A body without `neo_count` is an empty batch.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NeoCountPayload {
    #[serde(default)]
    pub neo_count: Vec<DateCount>,
}

/// Body of a successful read request.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalCount {
    pub total_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error_message: String,
}
