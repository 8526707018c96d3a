//! JSON encoding of records in the configuration source and in snapshots

use crate::legacy::LegacyServiceRecord;
use crate::service::ServiceRecord;
use serde_json::Value;

/// Decode one record, falling back to the single-port format when the
/// current one carries no ports
fn decode_value(value: Value) -> serde_json::Result<ServiceRecord> {
    let record: ServiceRecord = serde_json::from_value(value.clone())?;
    if !record.ports.is_empty() {
        return Ok(record);
    }
    let legacy: LegacyServiceRecord = serde_json::from_value(value)?;
    Ok(legacy.into())
}

/// Decode one configuration-source entry, accepting the single-port format
pub fn decode_record(encoded: &str) -> serde_json::Result<ServiceRecord> {
    decode_value(serde_json::from_str(encoded)?)
}

/// Decode a snapshot body. Each record is decoded on its own, so a snapshot
/// may mix single-port and multi-port records.
pub fn decode_snapshot(encoded: &str) -> serde_json::Result<Vec<ServiceRecord>> {
    let values: Vec<Value> = serde_json::from_str(encoded)?;
    values.into_iter().map(decode_value).collect()
}

pub fn encode_record(record: &ServiceRecord) -> serde_json::Result<String> {
    serde_json::to_string(record)
}

pub fn encode_snapshot(records: &[ServiceRecord]) -> serde_json::Result<String> {
    serde_json::to_string(records)
}
