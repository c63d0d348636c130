use std::collections::BTreeSet;

use porta_contracts::{TransportStatus, TransportView};
use porta_upstream::StaffDirectory;

/// Resolves `cancelledByName` for a batch of mapped records. The cancelled-by
/// id only carries meaning on cancelled records, so only those contribute to
/// the lookup set. One batched directory call regardless of batch size; if
/// the directory is unreachable the records are returned without the derived
/// field rather than failing the response.
pub async fn enrich(
    directory: &dyn StaffDirectory,
    mut records: Vec<TransportView>,
) -> Vec<TransportView> {
    let ids: BTreeSet<String> = records
        .iter()
        .filter(|r| r.status.as_deref() == Some(TransportStatus::Cancelled.as_str()))
        .filter_map(|r| r.cancelled_by_id.clone())
        .collect();

    if ids.is_empty() {
        return records;
    }

    let names = match directory.display_names(&ids).await {
        Ok(names) => names,
        Err(err) => {
            tracing::warn!(
                error = %err,
                ids = ids.len(),
                "staff directory unavailable; returning records without cancelledByName"
            );
            return records;
        }
    };

    for record in &mut records {
        if record.status.as_deref() != Some(TransportStatus::Cancelled.as_str()) {
            continue;
        }
        if let Some(id) = record.cancelled_by_id.as_ref() {
            record.cancelled_by_name = names.get(id).cloned();
        }
    }

    records
}
