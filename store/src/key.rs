use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, StoreResult};

/// Stable identifier for a [`crate::record::TypeMeta::class_name`].
pub type TypeName = &'static str;

/// Opaque, stable identity for a record within one [`crate::store::Store`]
/// instance. A newly-created record has a store key before it has a server
/// id; the key never changes for the lifetime of the record and is never
/// reused, even after the record is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(u64);

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl StoreKey {
    #[cfg(test)]
    pub(crate) fn from_bits_for_test(n: u64) -> StoreKey {
        StoreKey(n)
    }
}

/// Allocates store keys and maintains the bijection between `(Type, id)` and
/// store key.
#[derive(Default)]
pub struct KeyRegistry {
    next: u64,
    by_id: HashMap<(TypeName, String), StoreKey>,
    id_by_key: HashMap<StoreKey, (TypeName, String)>,
    type_by_key: HashMap<StoreKey, TypeName>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing key for `(type_name, id)` if already mapped,
    /// else allocates a new one. `id` is `None` for a record created
    /// locally that has not yet been assigned a server id.
    pub fn get_store_key(&mut self, type_name: TypeName, id: Option<&str>) -> StoreKey {
        if let Some(id) = id {
            if let Some(sk) = self.by_id.get(&(type_name, id.to_string())) {
                return *sk;
            }
        }

        let sk = self.allocate();
        self.type_by_key.insert(sk, type_name);
        if let Some(id) = id {
            self.by_id.insert((type_name, id.to_string()), sk);
            self.id_by_key.insert(sk, (type_name, id.to_string()));
        }
        sk
    }

    /// Looks up an already-allocated key without allocating a new one.
    pub fn existing_store_key(&self, type_name: TypeName, id: &str) -> Option<StoreKey> {
        self.by_id.get(&(type_name, id.to_string())).copied()
    }

    /// Rewrites the id index for `sk`. Ids must be unique per type: mapping
    /// a second store key onto an id already claimed by a different live key
    /// of the same type is refused.
    pub fn set_id_for_store_key(&mut self, sk: StoreKey, id: &str) -> StoreResult<()> {
        let type_name = *self
            .type_by_key
            .get(&sk)
            .ok_or_else(|| Error::Internal(format!("{} has no registered type", sk)))?;

        if let Some(holder) = self.by_id.get(&(type_name, id.to_string())) {
            if *holder != sk {
                return Err(Error::DuplicateId(format!(
                    "{} already maps to {} for type {}",
                    id, holder, type_name
                )));
            }
        }

        if let Some((_, old_id)) = self.id_by_key.remove(&sk) {
            self.by_id.remove(&(type_name, old_id));
        }
        self.by_id.insert((type_name, id.to_string()), sk);
        self.id_by_key.insert(sk, (type_name, id.to_string()));
        Ok(())
    }

    pub fn id_for_store_key(&self, sk: StoreKey) -> Option<&str> {
        self.id_by_key.get(&sk).map(|(_, id)| id.as_str())
    }

    pub fn type_for_store_key(&self, sk: StoreKey) -> Option<TypeName> {
        self.type_by_key.get(&sk).copied()
    }

    /// All known ids for a type, used by the `fetchAllRecords` sweep
    /// to find locally-known ids absent from a full refresh.
    pub fn ids_for_type(&self, type_name: TypeName) -> Vec<String> {
        self.by_id
            .keys()
            .filter(|(t, _)| *t == type_name)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Fully removes all index entries for `sk`. Called by `unloadRecord`.
    pub fn forget(&mut self, sk: StoreKey) {
        if let Some((type_name, id)) = self.id_by_key.remove(&sk) {
            self.by_id.remove(&(type_name, id));
        }
        self.type_by_key.remove(&sk);
    }

    fn allocate(&mut self) -> StoreKey {
        let sk = StoreKey(self.next);
        self.next += 1;
        sk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: TypeName = "widget";

    #[test]
    fn allocates_fresh_key_without_id() {
        let mut reg = KeyRegistry::new();
        let a = reg.get_store_key(T, None);
        let b = reg.get_store_key(T, None);
        assert_ne!(a, b);
    }

    #[test]
    fn same_id_returns_same_key() {
        let mut reg = KeyRegistry::new();
        let a = reg.get_store_key(T, Some("1"));
        let b = reg.get_store_key(T, Some("1"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_types_same_id_are_distinct() {
        let mut reg = KeyRegistry::new();
        let a = reg.get_store_key("widget", Some("1"));
        let b = reg.get_store_key("gadget", Some("1"));
        assert_ne!(a, b);
    }

    #[test]
    fn set_id_rejects_duplicate() {
        let mut reg = KeyRegistry::new();
        let a = reg.get_store_key(T, None);
        let b = reg.get_store_key(T, None);
        reg.set_id_for_store_key(a, "id1").unwrap();
        let err = reg.set_id_for_store_key(b, "id1").unwrap_err();
        assert_eq!(err, Error::DuplicateId(format!("{} already maps to {} for type {}", "id1", a, T)));
    }

    #[test]
    fn forget_clears_all_indexes() {
        let mut reg = KeyRegistry::new();
        let a = reg.get_store_key(T, Some("1"));
        reg.forget(a);
        assert!(reg.existing_store_key(T, "1").is_none());
        assert!(reg.type_for_store_key(a).is_none());
    }
}
