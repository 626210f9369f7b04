use log::debug;

use crate::key::{StoreKey, TypeName};
use crate::status::Status;

/// Stable identity for a record type: a `className` plus the attribute
/// name that holds the server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeMeta {
    pub class_name: TypeName,
    pub primary_key: &'static str,
}

impl TypeMeta {
    pub const fn new(class_name: TypeName, primary_key: &'static str) -> Self {
        Self { class_name, primary_key }
    }
}

/// The minimal capability a materialized record exposes to the store:
/// property-change notification, status notification, and the two
/// predicates the store consults before unloading.
pub trait RecordObserver {
    fn property_did_change(&mut self, sk: StoreKey, key: &str);
    fn computed_property_did_change(&mut self, sk: StoreKey, key: &str) {
        let _ = (sk, key);
    }
    fn status_did_change(&mut self, sk: StoreKey, previous: Status, next: Status) {
        let _ = (sk, previous, next);
    }
    fn begin_property_changes(&mut self) {}
    fn end_property_changes(&mut self) {}
    fn has_observers(&self) -> bool;
    fn store_will_unload(&mut self, sk: StoreKey) {
        let _ = sk;
    }
}

/// Observer used when no materialized record is attached to a store key.
/// Never reports observers, so it never blocks `unloadRecord`.
#[derive(Default)]
pub struct NoopObserver;

impl RecordObserver for NoopObserver {
    fn property_did_change(&mut self, _sk: StoreKey, _key: &str) {}
    fn has_observers(&self) -> bool {
        false
    }
}

/// Observer that logs every notification it receives; used by the demo
/// binary and by tests that want to assert on observer traffic without
/// wiring up a full materialized-record type.
#[derive(Default)]
pub struct LoggingObserver {
    pub watching: bool,
    pub unloaded: bool,
}

impl LoggingObserver {
    pub fn watching() -> Self {
        Self { watching: true, unloaded: false }
    }
}

impl RecordObserver for LoggingObserver {
    fn property_did_change(&mut self, sk: StoreKey, key: &str) {
        debug!("{} property changed: {}", sk, key);
    }

    fn status_did_change(&mut self, sk: StoreKey, previous: Status, next: Status) {
        debug!("{} status changed: {} -> {}", sk, previous, next);
    }

    fn has_observers(&self) -> bool {
        self.watching
    }

    fn store_will_unload(&mut self, sk: StoreKey) {
        debug!("{} unloading", sk);
        self.unloaded = true;
    }
}
