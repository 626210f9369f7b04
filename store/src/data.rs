use std::collections::HashMap;

use crate::hash::AttrHash;
use crate::key::StoreKey;

/// Everything the Data Table tracks for one record: the authoritative
/// `data`, the `committed` snapshot taken when local edits began, the
/// per-attribute `changed` flags, the `rollback` snapshot taken when a
/// commit was dispatched, and `last_access` for external memory managers.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub data: AttrHash,
    pub committed: Option<AttrHash>,
    pub changed: Option<HashMap<String, bool>>,
    pub rollback: Option<AttrHash>,
    pub last_access: u64,
}

/// Maps store key → [`Entry`]. A store's own `DataTable` only holds
/// entries for keys it has materialized locally; for a nested store, the
/// absence of an entry here means "read through to the parent by identity"
/// — the copy-on-write check lives in [`crate::store::Store`], which
/// is the layer that knows about parent/child relationships.
#[derive(Default)]
pub struct DataTable {
    entries: HashMap<StoreKey, Entry>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_own(&self, sk: StoreKey) -> bool {
        self.entries.contains_key(&sk)
    }

    pub fn entry(&self, sk: StoreKey) -> Option<&Entry> {
        self.entries.get(&sk)
    }

    pub fn entry_mut(&mut self, sk: StoreKey) -> &mut Entry {
        self.entries.entry(sk).or_default()
    }

    /// Installs a fresh slot, overwriting any existing entry. Used both for
    /// genuinely new data (`createRecord`, `sourceDidFetchRecords`) and for
    /// the copy-on-write clone-in of a nested store's first write.
    pub fn install(&mut self, sk: StoreKey, data: AttrHash) {
        self.entries.insert(sk, Entry { data, ..Entry::default() });
    }

    pub fn forget(&mut self, sk: StoreKey) {
        self.entries.remove(&sk);
    }

    pub fn keys(&self) -> impl Iterator<Item = StoreKey> + '_ {
        self.entries.keys().copied()
    }
}
