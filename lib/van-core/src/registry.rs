//! Registry of local and federated service records
//!
//! The registry keeps three views of the records in the configuration source:
//! - `local`: records authored by this site, ordered by address. This is the
//!   snapshot broadcast to peers.
//! - `by_origin`: the last snapshot accepted from each peer site.
//! - `by_name`: every record in the configuration source, by address.
//!
//! The registry performs no I/O. Callers persist the returned diffs into the
//! configuration source and serialize access to the registry.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use van_api::ServiceRecord;

/// Changes to the local records since the previous configuration-source load
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl LocalDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Result of merging a snapshot from one origin
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryDiff {
    pub origin: String,
    /// Incoming records that are new, or that changed under the same origin
    pub changed: Vec<ServiceRecord>,
    /// Addresses the origin advertised before and no longer does
    pub deleted: Vec<String>,
    /// Subset of `deleted` that may be removed from the configuration source;
    /// entries now authored locally or by another origin are kept
    pub removals: Vec<String>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SyncRegistry {
    local: BTreeMap<String, ServiceRecord>,
    by_origin: BTreeMap<String, BTreeMap<String, ServiceRecord>>,
    by_name: BTreeMap<String, ServiceRecord>,
    heard_from: HashMap<String, Instant>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fresh load of the configuration source into the registry and
    /// report how the local records changed.
    pub fn definitions_updated(
        &mut self,
        definitions: &BTreeMap<String, ServiceRecord>,
        now: Instant,
    ) -> LocalDiff {
        let mut latest = BTreeMap::new();
        let mut by_name = BTreeMap::new();

        for (name, original) in definitions {
            let record = original.advertised();
            if record.is_remote() {
                self.heard_from.entry(record.origin.clone()).or_insert(now);
                self.by_origin
                    .entry(record.origin.clone())
                    .or_default()
                    .insert(name.clone(), record.clone());
            } else if record.is_local() {
                self.pare_by_origin(&record.address);
                latest.insert(record.address.clone(), record.clone());
            }
            by_name.insert(record.address.clone(), record);
        }

        let mut diff = LocalDiff::default();
        for (address, previous) in &self.local {
            match latest.get(address) {
                None => diff.removed.push(address.clone()),
                Some(current) if current != previous => diff.modified.push(address.clone()),
                Some(_) => {}
            }
        }
        for address in latest.keys() {
            if !self.local.contains_key(address) {
                diff.added.push(address.clone());
            }
        }

        if !diff.added.is_empty() {
            info!("Service interface(s) added: {:?}", diff.added);
        }
        if !diff.removed.is_empty() {
            info!("Service interface(s) removed: {:?}", diff.removed);
        }
        if !diff.modified.is_empty() {
            info!("Service interface(s) modified: {:?}", diff.modified);
        }

        self.local = latest;
        self.by_name = by_name;
        diff
    }

    /// Merge a snapshot received from `origin`. The origin's previous
    /// snapshot is replaced wholesale; addresses it no longer mentions are
    /// reported as deleted.
    pub fn ensure_definitions(
        &mut self,
        origin: &str,
        incoming: BTreeMap<String, ServiceRecord>,
        now: Instant,
    ) -> RegistryDiff {
        let diff = self.plan_definitions(origin, &incoming);
        self.commit_definitions(origin, incoming, now);
        diff
    }

    /// The diff merging `incoming` would produce, without applying it
    pub fn plan_definitions(
        &self,
        origin: &str,
        incoming: &BTreeMap<String, ServiceRecord>,
    ) -> RegistryDiff {
        let changed: Vec<ServiceRecord> = incoming
            .values()
            .filter(|record| match self.by_name.get(&record.address) {
                None => true,
                Some(existing) => existing.origin == origin && !existing.is_equivalent(record),
            })
            .cloned()
            .collect();

        let deleted: Vec<String> = self
            .by_origin
            .get(origin)
            .map(|current| {
                current
                    .keys()
                    .filter(|name| !incoming.contains_key(*name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let removals = self.removable(origin, &deleted);
        debug!(
            origin = %origin,
            changed = changed.len(),
            deleted = deleted.len(),
            "Planned service sync update"
        );

        RegistryDiff {
            origin: origin.to_string(),
            changed,
            deleted,
            removals,
        }
    }

    /// Record `incoming` as the origin's current snapshot. Call once the
    /// planned diff has been persisted.
    pub fn commit_definitions(
        &mut self,
        origin: &str,
        incoming: BTreeMap<String, ServiceRecord>,
        now: Instant,
    ) {
        self.heard_from.insert(origin.to_string(), now);
        self.by_origin.insert(origin.to_string(), incoming);
    }

    /// Evict every origin not heard from within `ttl`
    pub fn age_out(&mut self, now: Instant, ttl: Duration) -> Vec<RegistryDiff> {
        let aged = self.plan_age_out(now, ttl);
        for diff in &aged {
            self.evict(&diff.origin);
        }
        aged
    }

    /// One diff per origin silent for at least `ttl`, removing all of its
    /// records. Origins never heard from start their clock at `now`.
    pub fn plan_age_out(&mut self, now: Instant, ttl: Duration) -> Vec<RegistryDiff> {
        let mut aged = Vec::new();
        for (origin, records) in &self.by_origin {
            let last_heard = *self.heard_from.entry(origin.clone()).or_insert(now);
            if now.saturating_duration_since(last_heard) < ttl {
                continue;
            }
            let deleted: Vec<String> = records.keys().cloned().collect();
            aged.push(RegistryDiff {
                origin: origin.clone(),
                changed: Vec::new(),
                removals: self.removable(origin, &deleted),
                deleted,
            });
        }
        aged
    }

    /// Forget an origin entirely
    pub fn evict(&mut self, origin: &str) {
        self.by_origin.remove(origin);
        self.heard_from.remove(origin);
        info!(origin = %origin, "Service sync aged out service definitions");
    }

    /// The ordered local records, as broadcast to peers
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.local.values().cloned().collect()
    }

    pub fn local(&self) -> &BTreeMap<String, ServiceRecord> {
        &self.local
    }

    pub fn federated(&self, origin: &str) -> Option<&BTreeMap<String, ServiceRecord>> {
        self.by_origin.get(origin)
    }

    pub fn origins(&self) -> impl Iterator<Item = &String> {
        self.by_origin.keys()
    }

    pub fn by_name(&self) -> &BTreeMap<String, ServiceRecord> {
        &self.by_name
    }

    /// A locally authored record takes the address over from any origin
    fn pare_by_origin(&mut self, address: &str) {
        for records in self.by_origin.values_mut() {
            if records.remove(address).is_some() {
                return;
            }
        }
    }

    fn removable(&self, origin: &str, deleted: &[String]) -> Vec<String> {
        deleted
            .iter()
            .filter(|name| {
                self.by_name
                    .get(*name)
                    .map_or(true, |existing| existing.origin == origin)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, origin: &str) -> ServiceRecord {
        let mut record = ServiceRecord::new(address, "tcp", vec![8080]);
        record.origin = origin.to_string();
        record
    }

    fn indexed(records: &[ServiceRecord]) -> BTreeMap<String, ServiceRecord> {
        records
            .iter()
            .map(|r| (r.address.clone(), r.clone()))
            .collect()
    }

    #[test]
    fn test_annotation_records_never_local() {
        let mut registry = SyncRegistry::new();
        registry.definitions_updated(
            &indexed(&[record("foo", ""), record("annotated", "annotation")]),
            Instant::now(),
        );
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "foo");
        assert!(registry.origins().next().is_none());
        assert!(registry.by_name().contains_key("annotated"));
    }

    #[test]
    fn test_snapshot_ordered_by_address() {
        let mut registry = SyncRegistry::new();
        registry.definitions_updated(
            &indexed(&[record("zeta", ""), record("alpha", ""), record("mid", "")]),
            Instant::now(),
        );
        let addresses: Vec<String> = registry.snapshot().into_iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_local_diff() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        let diff = registry.definitions_updated(&indexed(&[record("a", ""), record("b", "")]), now);
        assert_eq!(diff.added, vec!["a", "b"]);

        let mut b = record("b", "");
        b.ports = vec![9090];
        let diff = registry.definitions_updated(&indexed(&[b, record("c", "")]), now);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.modified, vec!["b"]);
        assert_eq!(diff.removed, vec!["a"]);
    }

    #[test]
    fn test_remote_definitions_tracked_by_origin() {
        let mut registry = SyncRegistry::new();
        registry.definitions_updated(&indexed(&[record("svc2", "site-2")]), Instant::now());
        assert!(registry.snapshot().is_empty());
        assert!(registry.federated("site-2").unwrap().contains_key("svc2"));
    }

    #[test]
    fn test_remote_add() {
        let mut registry = SyncRegistry::new();
        let diff = registry.ensure_definitions(
            "site-2",
            indexed(&[record("svc2", "site-2")]),
            Instant::now(),
        );
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].address, "svc2");
        assert!(diff.deleted.is_empty());
        assert_eq!(registry.federated("site-2").unwrap().len(), 1);
    }

    #[test]
    fn test_wholesale_replace() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.ensure_definitions(
            "site-2",
            indexed(&[record("x", "site-2"), record("y", "site-2")]),
            now,
        );
        let diff = registry.ensure_definitions("site-2", indexed(&[record("x", "site-2")]), now);
        assert_eq!(diff.deleted, vec!["y"]);
        assert_eq!(diff.removals, vec!["y"]);
        let federated = registry.federated("site-2").unwrap();
        assert_eq!(federated.keys().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn test_remote_retract_all() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.ensure_definitions("site-2", indexed(&[record("svc2", "site-2")]), now);
        let diff = registry.ensure_definitions("site-2", BTreeMap::new(), now);
        assert_eq!(diff.deleted, vec!["svc2"]);
        assert!(registry.federated("site-2").unwrap().is_empty());
    }

    #[test]
    fn test_update_detected_for_same_origin_only() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.definitions_updated(
            &indexed(&[record("svc2", "site-2"), record("mine", "")]),
            now,
        );

        let mut svc2 = record("svc2", "site-2");
        svc2.ports = vec![9999];
        let mut mine = record("mine", "site-2");
        mine.ports = vec![1];
        let diff = registry.ensure_definitions("site-2", indexed(&[svc2, mine]), now);
        let changed: Vec<&str> = diff.changed.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(changed, vec!["svc2"]);
    }

    #[test]
    fn test_unchanged_snapshot_is_empty_diff() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.definitions_updated(&indexed(&[record("svc2", "site-2")]), now);
        let diff = registry.ensure_definitions("site-2", indexed(&[record("svc2", "site-2")]), now);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_retraction_keeps_entries_owned_elsewhere() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.definitions_updated(&indexed(&[record("shared", "")]), now);
        registry.ensure_definitions("site-2", indexed(&[record("shared", "site-2")]), now);
        let diff = registry.ensure_definitions("site-2", BTreeMap::new(), now);
        assert_eq!(diff.deleted, vec!["shared"]);
        assert!(diff.removals.is_empty());
    }

    #[test]
    fn test_local_record_pares_origin() {
        let mut registry = SyncRegistry::new();
        let now = Instant::now();
        registry.definitions_updated(&indexed(&[record("svc", "site-2")]), now);
        assert!(registry.federated("site-2").unwrap().contains_key("svc"));
        registry.definitions_updated(&indexed(&[record("svc", "")]), now);
        assert!(!registry.federated("site-2").unwrap().contains_key("svc"));
    }

    #[test]
    fn test_age_out_silent_origin() {
        let mut registry = SyncRegistry::new();
        let start = Instant::now();
        registry.ensure_definitions("site-2", indexed(&[record("svc2", "site-2")]), start);
        registry.ensure_definitions(
            "site-3",
            indexed(&[record("svc3", "site-3")]),
            start + Duration::from_secs(50),
        );

        let aged = registry.age_out(start + Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].origin, "site-2");
        assert_eq!(aged[0].removals, vec!["svc2"]);
        assert!(registry.federated("site-2").is_none());
        assert!(registry.federated("site-3").is_some());
    }
}
