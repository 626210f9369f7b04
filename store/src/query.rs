use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::hash::AttrHash;
use crate::key::{StoreKey, TypeName};

/// Opaque handle for a registered query, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// A local, in-memory filtered view over loaded records of one type.
pub trait LocalQuery {
    fn matches(&self, data: &AttrHash) -> bool;
    fn refresh(&mut self, matching: &[StoreKey]);
}

/// A server-backed query. The registry only holds its registration; it
/// refreshes itself in response to Source events, not in response to the
/// local record-set changes that drive `LocalQuery::refresh`.
pub trait RemoteQuery {
    fn describe(&self) -> String;
}

struct LocalEntry {
    type_name: TypeName,
    query: Box<dyn LocalQuery>,
}

/// Registers local and remote queries and schedules refresh on record-set
/// changes. Remote queries refresh themselves in response to Source
/// events; this registry only holds their registration — it never calls
/// into the Source itself (that happens one layer up, in
/// [`crate::store::Store`], which is the layer that owns a `Source`).
#[derive(Default)]
pub struct QueryRegistry {
    next_id: u64,
    local: HashMap<QueryId, LocalEntry>,
    remote: HashMap<QueryId, Box<dyn RemoteQuery>>,
    dirty_types: HashSet<TypeName>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register_local(&mut self, type_name: TypeName, query: Box<dyn LocalQuery>) -> QueryId {
        let id = self.allocate();
        self.local.insert(id, LocalEntry { type_name, query });
        self.dirty_types.insert(type_name);
        id
    }

    pub fn unregister_local(&mut self, id: QueryId) {
        self.local.remove(&id);
    }

    pub fn register_remote(&mut self, query: Box<dyn RemoteQuery>) -> QueryId {
        let id = self.allocate();
        self.remote.insert(id, query);
        id
    }

    pub fn unregister_remote(&mut self, id: QueryId) {
        self.remote.remove(&id);
    }

    pub fn remote_query(&self, id: QueryId) -> Option<&dyn RemoteQuery> {
        self.remote.get(&id).map(|q| q.as_ref())
    }

    /// Marks `type_name` as needing refresh; the deferred executor flushes
    /// this once per tick.
    pub fn mark_type_dirty(&mut self, type_name: TypeName) {
        self.dirty_types.insert(type_name);
    }

    pub fn take_dirty_types(&mut self) -> Vec<TypeName> {
        self.dirty_types.drain().collect()
    }

    /// Invokes `refresh()` on every local query registered for `type_name`,
    /// using `loaded` (store key, data) pairs supplied by the caller to
    /// evaluate `matches`.
    pub fn refresh_type(&mut self, type_name: TypeName, loaded: &[(StoreKey, &AttrHash)]) {
        for entry in self.local.values_mut() {
            if entry.type_name != type_name {
                continue;
            }
            let matching: Vec<StoreKey> = loaded
                .iter()
                .filter(|(_, data)| entry.query.matches(data))
                .map(|(sk, _)| *sk)
                .collect();
            entry.query.refresh(&matching);
        }
    }
}
