//! Partitions entries by data kind.

use crate::entries::{DataKind, Entry};
use std::collections::BTreeMap;

/// Group `entries` by kind, keeping their relative order within each kind.
pub fn group_by_kind(entries: Vec<Entry>) -> BTreeMap<DataKind, Vec<Entry>> {
    let mut groups: BTreeMap<DataKind, Vec<Entry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.kind()).or_default().push(entry);
    }
    groups
}
