//! Delta-set reconciliation of a server index against the cache.

use offsync_core::{compare_timestamps, lookup_path, ID_KEY, LMT_PATH};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// An `{id -> last-modified time}` index.
pub type IdLmtIndex = HashMap<String, String>;

/// The difference between a server index and a local index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    /// Ids on the server but not in the cache.
    pub created: BTreeSet<String>,
    /// Ids in both whose server timestamp is strictly newer.
    pub updated: BTreeSet<String>,
    /// Ids in the cache but not on the server.
    pub deleted: BTreeSet<String>,
}

impl DeltaSet {
    /// Computes the delta between a server and a local index.
    pub fn compute(server: &IdLmtIndex, local: &IdLmtIndex) -> Self {
        let mut delta = DeltaSet::default();
        for (id, server_lmt) in server {
            match local.get(id) {
                None => {
                    delta.created.insert(id.clone());
                }
                Some(local_lmt) => {
                    if compare_timestamps(server_lmt, local_lmt) == Ordering::Greater {
                        delta.updated.insert(id.clone());
                    }
                }
            }
        }
        delta.deleted = local
            .keys()
            .filter(|id| !server.contains_key(*id))
            .cloned()
            .collect();
        delta
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns every id of the three sets, sorted.
    pub fn union(&self) -> Vec<String> {
        let mut ids: BTreeSet<&String> = self.created.iter().collect();
        ids.extend(&self.updated);
        ids.extend(&self.deleted);
        ids.into_iter().cloned().collect()
    }
}

/// Builds a server index from records fetched with the id and
/// last-modified-time fields only.
///
/// Records lacking either field are left out; a caller can detect them by
/// comparing the index size with the number of records.
pub fn index_records(records: &[Value]) -> IdLmtIndex {
    records
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|record| {
            let id = record.get(ID_KEY)?.as_str()?;
            let lmt = lookup_path(record, LMT_PATH)?.as_str()?;
            Some((id.to_string(), lmt.to_string()))
        })
        .collect()
}
