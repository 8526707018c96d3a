//! Loads service records from the configuration source

use std::collections::BTreeMap;
use tracing::{debug, warn};
use van_api::{decode_record, ServiceRecord};

use crate::{CoreError, Result};

/// Decode one configuration-source entry
pub fn decode_entry(key: &str, value: &str) -> Result<ServiceRecord> {
    let record =
        decode_record(value).map_err(|e| CoreError::Decode(format!("entry {}: {}", key, e)))?;
    if record.address.is_empty() {
        return Err(CoreError::Decode(format!("entry {} has no address", key)));
    }
    Ok(record)
}

/// Decode every configuration-source entry into a record indexed by address.
///
/// A malformed entry is logged and skipped; it never prevents the remaining
/// entries from loading.
pub fn load_definitions(entries: &BTreeMap<String, String>) -> BTreeMap<String, ServiceRecord> {
    let mut definitions = BTreeMap::new();
    for (key, value) in entries {
        match decode_entry(key, value) {
            Ok(record) => {
                if record.address != *key {
                    debug!(key = %key, address = %record.address, "Entry key differs from record address");
                }
                definitions.insert(record.address.clone(), record);
            }
            Err(e) => {
                warn!("Skipping malformed service definition: {}", e);
            }
        }
    }
    definitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_skips_malformed_entries() {
        let definitions = load_definitions(&entries(&[
            ("foo", r#"{"address":"foo","protocol":"tcp","ports":[8080]}"#),
            ("broken", "{not json"),
            ("bar", r#"{"address":"bar","protocol":"http","ports":[80],"origin":"site-2"}"#),
        ]));
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions["foo"].ports, vec![8080]);
        assert_eq!(definitions["bar"].origin, "site-2");
    }

    #[test]
    fn test_load_indexes_by_address() {
        let definitions = load_definitions(&entries(&[(
            "legacy-key",
            r#"{"address":"baz","protocol":"tcp","port":9090}"#,
        )]));
        assert!(definitions.contains_key("baz"));
        assert_eq!(definitions["baz"].ports, vec![9090]);
    }

    #[test]
    fn test_entry_without_address_rejected() {
        let err = decode_entry("anon", r#"{"protocol":"tcp","ports":[80]}"#).unwrap_err();
        assert!(matches!(err, CoreError::Decode(_)));
        assert!(load_definitions(&entries(&[("anon", r#"{"protocol":"tcp","ports":[80]}"#)])).is_empty());
    }

    #[test]
    fn test_load_empty_source() {
        assert!(load_definitions(&BTreeMap::new()).is_empty());
    }
}
