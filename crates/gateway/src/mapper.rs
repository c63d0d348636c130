use chrono::{DateTime, SecondsFormat};
use porta_contracts::{
    RawRecord, TransportPurpose, TransportStatus, TransportView, UNKNOWN, Urgency,
};

/// Projects one upstream wire record into the browser-facing shape. Total
/// over the known field set: absent optional fields stay absent, and
/// unrecognized enum codes become the `UNKNOWN` sentinel instead of failing
/// the record or the stream. `cancelledByName` is left for enrichment.
pub fn map_record(raw: &RawRecord) -> TransportView {
    TransportView {
        id: raw.id.clone(),
        status: raw.status.map(status_label),
        purpose: raw.purpose.map(purpose_label),
        urgency: raw.urgency.map(urgency_label),
        requested_by_id: raw.requested_by_id.clone(),
        assigned_porter_id: raw.assigned_porter_id.clone(),
        origin_ward: raw.origin_ward.clone(),
        destination_ward: raw.destination_ward.clone(),
        requested_at: raw.requested_at.and_then(epoch_ms_to_rfc3339),
        updated_at: raw.updated_at.and_then(epoch_ms_to_rfc3339),
        cancelled_by_id: raw.cancelled_by_id.clone(),
        cancelled_by_name: None,
        cancel_reason: raw.cancel_reason.clone(),
    }
}

fn status_label(code: i32) -> String {
    TransportStatus::from_wire_code(code)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn purpose_label(code: i32) -> String {
    TransportPurpose::from_wire_code(code)
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn urgency_label(code: i32) -> String {
    Urgency::from_wire_code(code)
        .map(|u| u.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn epoch_ms_to_rfc3339(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}
