use serde::{Deserialize, Serialize};

/// Sentinel emitted for wire enum codes this build does not recognize.
/// Unrecognized codes never abort a record or a stream.
pub const UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    #[default]
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportStatus {
    Waiting,
    InProgress,
    Completed,
    Cancelled,
}

impl TransportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportStatus::Waiting => "WAITING",
            TransportStatus::InProgress => "IN_PROGRESS",
            TransportStatus::Completed => "COMPLETED",
            TransportStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn wire_code(self) -> i32 {
        match self {
            TransportStatus::Waiting => 1,
            TransportStatus::InProgress => 2,
            TransportStatus::Completed => 3,
            TransportStatus::Cancelled => 4,
        }
    }

    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TransportStatus::Waiting),
            2 => Some(TransportStatus::InProgress),
            3 => Some(TransportStatus::Completed),
            4 => Some(TransportStatus::Cancelled),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(TransportStatus::Waiting),
            "IN_PROGRESS" => Some(TransportStatus::InProgress),
            "COMPLETED" => Some(TransportStatus::Completed),
            "CANCELLED" => Some(TransportStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportPurpose {
    Examination,
    Surgery,
    WardTransfer,
    Discharge,
    Dialysis,
}

impl TransportPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportPurpose::Examination => "EXAMINATION",
            TransportPurpose::Surgery => "SURGERY",
            TransportPurpose::WardTransfer => "WARD_TRANSFER",
            TransportPurpose::Discharge => "DISCHARGE",
            TransportPurpose::Dialysis => "DIALYSIS",
        }
    }

    pub fn wire_code(self) -> i32 {
        match self {
            TransportPurpose::Examination => 1,
            TransportPurpose::Surgery => 2,
            TransportPurpose::WardTransfer => 3,
            TransportPurpose::Discharge => 4,
            TransportPurpose::Dialysis => 5,
        }
    }

    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TransportPurpose::Examination),
            2 => Some(TransportPurpose::Surgery),
            3 => Some(TransportPurpose::WardTransfer),
            4 => Some(TransportPurpose::Discharge),
            5 => Some(TransportPurpose::Dialysis),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EXAMINATION" => Some(TransportPurpose::Examination),
            "SURGERY" => Some(TransportPurpose::Surgery),
            "WARD_TRANSFER" => Some(TransportPurpose::WardTransfer),
            "DISCHARGE" => Some(TransportPurpose::Discharge),
            "DIALYSIS" => Some(TransportPurpose::Dialysis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Routine,
    Urgent,
    Emergency,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Routine => "ROUTINE",
            Urgency::Urgent => "URGENT",
            Urgency::Emergency => "EMERGENCY",
        }
    }

    pub fn wire_code(self) -> i32 {
        match self {
            Urgency::Routine => 1,
            Urgency::Urgent => 2,
            Urgency::Emergency => 3,
        }
    }

    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Urgency::Routine),
            2 => Some(Urgency::Urgent),
            3 => Some(Urgency::Emergency),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ROUTINE" => Some(Urgency::Routine),
            "URGENT" => Some(Urgency::Urgent),
            "EMERGENCY" => Some(Urgency::Emergency),
            _ => None,
        }
    }
}

/// Criteria handed to the backend subscribe operation. Immutable once a
/// subscription has been opened; absent fields mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TransportStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<TransportPurpose>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl SubscriptionCriteria {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.purpose.is_none()
            && self.urgency.is_none()
            && self.requested_by.is_none()
    }
}

/// A transport request as the backend emits it: wire-native field names and
/// integer enum codes. Every field except the id is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub purpose: Option<i32>,
    #[serde(default)]
    pub urgency: Option<i32>,
    #[serde(default)]
    pub requested_by_id: Option<String>,
    #[serde(default)]
    pub assigned_porter_id: Option<String>,
    #[serde(default)]
    pub origin_ward: Option<String>,
    #[serde(default)]
    pub destination_ward: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub requested_at: Option<i64>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub cancelled_by_id: Option<String>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

/// One message on the backend subscribe stream. A missing `type` means
/// `UPDATED`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "type", default)]
    pub event_type: EventType,
    pub record: RawRecord,
}

/// Browser-facing projection of a transport request: human field names,
/// string enums, RFC3339 timestamps. `cancelledById` is null-preserving
/// because the frontend distinguishes "not cancelled" from "cancelled by an
/// unknown actor"; all other absent fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportView {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_porter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_ward: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ward: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub cancelled_by_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Payload of one SSE `data:` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: TransportView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_codes_round_trip() {
        for status in [
            TransportStatus::Waiting,
            TransportStatus::InProgress,
            TransportStatus::Completed,
            TransportStatus::Cancelled,
        ] {
            assert_eq!(
                TransportStatus::from_wire_code(status.wire_code()),
                Some(status)
            );
            assert_eq!(TransportStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransportStatus::from_wire_code(0), None);
        assert_eq!(TransportStatus::from_wire_code(99), None);
        assert_eq!(TransportStatus::parse("waiting"), None);
    }

    #[test]
    fn purpose_and_urgency_reject_unknown_values() {
        assert_eq!(TransportPurpose::from_wire_code(6), None);
        assert_eq!(Urgency::from_wire_code(-1), None);
        assert_eq!(TransportPurpose::parse(""), None);
        assert_eq!(Urgency::parse("STAT"), None);
    }

    #[test]
    fn criteria_serializes_only_present_filters() {
        let criteria = SubscriptionCriteria {
            status: Some(TransportStatus::Waiting),
            ..SubscriptionCriteria::default()
        };
        let json = serde_json::to_value(&criteria).expect("criteria serializes");
        assert_eq!(json, serde_json::json!({ "status": "WAITING" }));

        assert!(SubscriptionCriteria::default().is_empty());
        assert!(!criteria.is_empty());
    }

    #[test]
    fn upstream_event_type_defaults_to_updated() {
        let event: UpstreamEvent =
            serde_json::from_str(r#"{"record":{"id":"7"}}"#).expect("event parses");
        assert_eq!(event.event_type, EventType::Updated);
        assert_eq!(event.record.id, "7");
        assert_eq!(event.record.status, None);
    }

    #[test]
    fn view_preserves_null_cancelled_by_id_and_omits_absent_fields() {
        let view = TransportView {
            id: "42".to_string(),
            status: Some("IN_PROGRESS".to_string()),
            ..TransportView::default()
        };
        let json = serde_json::to_value(&view).expect("view serializes");
        assert_eq!(
            json,
            serde_json::json!({
                "id": "42",
                "status": "IN_PROGRESS",
                "cancelledById": null,
            })
        );
    }

    #[test]
    fn raw_record_accepts_explicit_null_fields() {
        let raw: RawRecord =
            serde_json::from_str(r#"{"id":"42","status":2,"cancelled_by_id":null}"#)
                .expect("raw record parses");
        assert_eq!(raw.status, Some(2));
        assert_eq!(raw.cancelled_by_id, None);
    }
}
