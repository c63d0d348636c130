use porta_contracts::{SubscriptionCriteria, TransportPurpose, TransportStatus, Urgency};
use serde::Deserialize;

/// Client-facing query parameters on the stream and list endpoints. The
/// capability token also travels here because EventSource cannot set headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    pub field: &'static str,
    pub value: String,
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized {} filter value `{}`", self.field, self.value)
    }
}

impl std::error::Error for FilterError {}

/// Translates client filter strings into upstream subscription criteria via
/// the fixed enum tables. Unrecognized values are rejected, never silently
/// dropped: a client that asked for a subset must not receive the firehose.
pub fn translate(query: &StreamQuery) -> Result<SubscriptionCriteria, FilterError> {
    let status = match normalized(query.status.as_deref()) {
        None => None,
        Some(raw) => Some(TransportStatus::parse(raw).ok_or_else(|| FilterError {
            field: "status",
            value: raw.to_string(),
        })?),
    };

    let purpose = match normalized(query.purpose.as_deref()) {
        None => None,
        Some(raw) => Some(TransportPurpose::parse(raw).ok_or_else(|| FilterError {
            field: "purpose",
            value: raw.to_string(),
        })?),
    };

    let urgency = match normalized(query.urgency.as_deref()) {
        None => None,
        Some(raw) => Some(Urgency::parse(raw).ok_or_else(|| FilterError {
            field: "urgency",
            value: raw.to_string(),
        })?),
    };

    let requested_by = normalized(query.requested_by.as_deref()).map(|s| s.to_string());

    Ok(SubscriptionCriteria {
        status,
        purpose,
        urgency,
        requested_by,
    })
}

fn normalized(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
