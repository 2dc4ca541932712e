//! Request records and their lifecycle

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Auto-assigned request identifier
pub type RequestId = i64;

/// Lifecycle status of a request.
///
/// Transitions only move forward: `pending -> processing -> (success | error)`.
/// `success` and `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Success | RequestStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Processing => 1,
            RequestStatus::Success | RequestStatus::Error => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    /// Re-asserting the current status is allowed.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "success" => Ok(RequestStatus::Success),
            "error" => Ok(RequestStatus::Error),
            other => Err(format!("Unknown request status '{}'", other)),
        }
    }
}

/// Geographic and height extent of a completed dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_height: f64,
    pub max_height: f64,
    /// 5th percentile of the height column
    pub low_height: f64,
    /// 95th percentile of the height column
    pub high_height: f64,
}

/// One submitted processing job and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    /// Function/API name, e.g. `atl06`
    pub api: Option<String>,
    /// Opaque request parameters
    pub parameters: serde_json::Value,
    pub status: RequestStatus,
    pub star: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status_details: Option<String>,
    /// Dataset file name in the blob store
    pub file: Option<String>,
    pub row_count: Option<u64>,
    pub num_bytes: Option<u64>,
    pub description: Option<String>,
    pub summary: Option<RequestSummary>,
}

impl RequestRecord {
    /// A fresh pending record
    pub fn pending(id: RequestId) -> Self {
        Self {
            id,
            api: None,
            parameters: serde_json::Value::Null,
            status: RequestStatus::Pending,
            star: false,
            start_time: None,
            end_time: None,
            status_details: None,
            file: None,
            row_count: None,
            num_bytes: None,
            description: None,
            summary: None,
        }
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Human readable elapsed time, e.g. `1 hr, 2 mins, 3 secs`
    pub fn elapsed_display(&self) -> String {
        self.elapsed()
            .map(format_elapsed)
            .unwrap_or_else(|| "0 secs".to_string())
    }

    /// Apply an update without validating it
    pub fn apply(&mut self, update: RequestUpdate) {
        let RequestUpdate {
            api,
            parameters,
            status,
            star,
            start_time,
            end_time,
            status_details,
            file,
            row_count,
            num_bytes,
            description,
            summary,
        } = update;

        if let Some(v) = api {
            self.api = Some(v);
        }
        if let Some(v) = parameters {
            self.parameters = v;
        }
        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = star {
            self.star = v;
        }
        if let Some(v) = start_time {
            self.start_time = Some(v);
        }
        if let Some(v) = end_time {
            self.end_time = Some(v);
        }
        if let Some(v) = status_details {
            self.status_details = Some(v);
        }
        if let Some(v) = file {
            self.file = Some(v);
        }
        if let Some(v) = row_count {
            self.row_count = Some(v);
        }
        if let Some(v) = num_bytes {
            self.num_bytes = Some(v);
        }
        if let Some(v) = description {
            self.description = Some(v);
        }
        if let Some(v) = summary {
            self.summary = Some(v);
        }
    }
}

/// Partial update of a request record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestUpdate {
    pub api: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub status: Option<RequestStatus>,
    pub star: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status_details: Option<String>,
    pub file: Option<String>,
    pub row_count: Option<u64>,
    pub num_bytes: Option<u64>,
    pub description: Option<String>,
    pub summary: Option<RequestSummary>,
}

impl RequestUpdate {
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.status_details = Some(details.into());
        self
    }
}

/// Deterministic dataset file name for a request
pub fn dataset_file_name(api: &str, id: RequestId) -> String {
    format!("{}_{}.arrow", api, id)
}

/// Format a duration as `N days, N hrs, N mins, N secs`, omitting zero parts
pub fn format_elapsed(delta: chrono::Duration) -> String {
    let total_secs = delta.num_seconds().max(0);
    let days = total_secs / 86_400;
    let hours = (total_secs / 3_600) % 24;
    let mins = (total_secs / 60) % 60;
    let secs = total_secs % 60;

    let mut parts = Vec::new();
    for (value, unit) in [(days, "day"), (hours, "hr"), (mins, "min"), (secs, "sec")] {
        if value > 0 {
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", value, unit, plural));
        }
    }

    if parts.is_empty() {
        "0 secs".to_string()
    } else {
        parts.join(", ")
    }
}
