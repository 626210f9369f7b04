use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::key::{StoreKey, TypeName};

/// Record status: a bitfield combining exactly one core state with any
/// subset of modifier flags. Core state lives in the low two bits;
/// modifiers occupy the high bits so the two halves never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

const CORE_MASK: u16 = 0b11;

const CORE_EMPTY: u16 = 0b00;
const CORE_READY: u16 = 0b01;
const CORE_DESTROYED: u16 = 0b10;
const CORE_NON_EXISTENT: u16 = 0b11;

pub const LOADING: u16 = 1 << 2;
pub const COMMITTING: u16 = 1 << 3;
pub const NEW: u16 = 1 << 4;
pub const DIRTY: u16 = 1 << 5;
pub const OBSOLETE: u16 = 1 << 6;

impl Status {
    pub const EMPTY: Status = Status(CORE_EMPTY);
    pub const READY: Status = Status(CORE_READY);
    pub const DESTROYED: Status = Status(CORE_DESTROYED);
    pub const NON_EXISTENT: Status = Status(CORE_NON_EXISTENT);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Status {
        Status(bits)
    }

    pub fn is_empty_core(self) -> bool {
        self.0 & CORE_MASK == CORE_EMPTY
    }

    pub fn is_ready(self) -> bool {
        self.0 & CORE_MASK == CORE_READY
    }

    pub fn is_destroyed(self) -> bool {
        self.0 & CORE_MASK == CORE_DESTROYED
    }

    pub fn is_non_existent(self) -> bool {
        self.0 & CORE_MASK == CORE_NON_EXISTENT
    }

    pub fn has(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn is_loading(self) -> bool {
        self.has(LOADING)
    }

    pub fn is_committing(self) -> bool {
        self.has(COMMITTING)
    }

    pub fn is_new(self) -> bool {
        self.has(NEW)
    }

    pub fn is_dirty(self) -> bool {
        self.has(DIRTY)
    }

    pub fn is_obsolete(self) -> bool {
        self.has(OBSOLETE)
    }

    /// True when the record has no modifier bits set at all, i.e. it is
    /// "at rest" in its core state. Used by `mayUnloadRecord`: a record
    /// with any modifier bit set — including `OBSOLETE` — can never be
    /// unloaded.
    pub fn has_no_modifiers(self) -> bool {
        self.0 & !CORE_MASK == 0
    }

    pub fn with_core(self, core: Status) -> Status {
        Status((self.0 & !CORE_MASK) | (core.0 & CORE_MASK))
    }

    pub fn with(self, flag: u16) -> Status {
        Status(self.0 | flag)
    }

    pub fn without(self, flag: u16) -> Status {
        Status(self.0 & !flag)
    }

    pub fn core_only(self) -> Status {
        Status(self.0 & CORE_MASK)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = match self.0 & CORE_MASK {
            CORE_EMPTY => "EMPTY",
            CORE_READY => "READY",
            CORE_DESTROYED => "DESTROYED",
            CORE_NON_EXISTENT => "NON_EXISTENT",
            _ => unreachable!("core state occupies exactly 2 bits"),
        };
        write!(f, "{}", core)?;
        for (flag, name) in [
            (LOADING, "LOADING"),
            (COMMITTING, "COMMITTING"),
            (NEW, "NEW"),
            (DIRTY, "DIRTY"),
            (OBSOLETE, "OBSOLETE"),
        ] {
            if self.has(flag) {
                write!(f, "|{}", name)?;
            }
        }
        Ok(())
    }
}

/// Callback invoked on every status change so a nested store can propagate
/// `parentDidChangeStatus`.
pub trait StatusObserver {
    fn parent_did_change_status(&mut self, sk: StoreKey, previous: Status, next: Status);
}

/// Maps store key to bitfield status, firing change notifications.
/// The status table is the single mutation point (`set`) that every
/// status transition in the store goes through.
#[derive(Default)]
pub struct StatusTable {
    statuses: HashMap<StoreKey, Status>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sk: StoreKey) -> Status {
        self.statuses.get(&sk).copied().unwrap_or(Status::EMPTY)
    }

    pub fn contains(&self, sk: StoreKey) -> bool {
        self.statuses.contains_key(&sk)
    }

    /// Writes `next` if it differs from the current status, logging the
    /// transition and notifying `nested` overlays. Returns the previous
    /// status so callers can act on the delta (e.g. the record's own
    /// `status` property-change notification, which is the caller's
    /// responsibility since it requires the materialized record).
    pub fn set(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        next: Status,
        nested: &mut [Box<dyn StatusObserver>],
    ) -> Status {
        let previous = self.get(sk);
        if previous == next {
            return previous;
        }

        debug!(
            "status {} ({}) {} -> {}",
            sk, type_name, previous, next
        );
        self.statuses.insert(sk, next);

        for observer in nested.iter_mut() {
            observer.parent_did_change_status(sk, previous, next);
        }

        previous
    }

    pub fn set_dirty(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).with(DIRTY);
        self.set(sk, type_name, next, nested);
    }

    pub fn clear_dirty(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).without(DIRTY);
        self.set(sk, type_name, next, nested);
    }

    pub fn set_loading(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).with(LOADING);
        self.set(sk, type_name, next, nested);
    }

    pub fn set_committing(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).with(COMMITTING);
        self.set(sk, type_name, next, nested);
    }

    pub fn clear_committing(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).without(COMMITTING);
        self.set(sk, type_name, next, nested);
    }

    pub fn set_obsolete(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        nested: &mut [Box<dyn StatusObserver>],
    ) {
        let next = self.get(sk).with(OBSOLETE);
        self.set(sk, type_name, next, nested);
    }

    pub fn forget(&mut self, sk: StoreKey) {
        self.statuses.remove(&sk);
    }
}
