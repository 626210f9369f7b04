use indexmap::IndexSet;

use crate::key::StoreKey;

/// Tracks `created`, `destroyed`, and `changed` store keys awaiting commit.
/// Each set is insertion-ordered so the commit build observes mutations in
/// the order they were made within a tick, using the same kind of
/// ordered-map/set crate the retrieved example pack reaches for when it
/// needs deterministic iteration order.
#[derive(Default)]
pub struct Journal {
    created: IndexSet<StoreKey>,
    destroyed: IndexSet<StoreKey>,
    changed: IndexSet<StoreKey>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_created(&mut self, sk: StoreKey) {
        self.created.insert(sk);
    }

    pub fn mark_destroyed(&mut self, sk: StoreKey) {
        self.destroyed.insert(sk);
    }

    pub fn mark_changed(&mut self, sk: StoreKey) {
        self.changed.insert(sk);
    }

    pub fn unmark_created(&mut self, sk: StoreKey) {
        self.created.shift_remove(&sk);
    }

    pub fn unmark_destroyed(&mut self, sk: StoreKey) {
        self.destroyed.shift_remove(&sk);
    }

    pub fn unmark_changed(&mut self, sk: StoreKey) {
        self.changed.shift_remove(&sk);
    }

    pub fn is_created(&self, sk: StoreKey) -> bool {
        self.created.contains(&sk)
    }

    pub fn is_destroyed(&self, sk: StoreKey) -> bool {
        self.destroyed.contains(&sk)
    }

    pub fn is_changed(&self, sk: StoreKey) -> bool {
        self.changed.contains(&sk)
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.destroyed.is_empty() && self.changed.is_empty()
    }

    /// Drains a set for the commit coordinator to build a changeset from.
    /// Iteration order is preserved within each drained set.
    pub fn take_created(&mut self) -> Vec<StoreKey> {
        self.created.drain(..).collect()
    }

    pub fn take_destroyed(&mut self) -> Vec<StoreKey> {
        self.destroyed.drain(..).collect()
    }

    pub fn take_changed(&mut self) -> Vec<StoreKey> {
        self.changed.drain(..).collect()
    }

    pub fn forget(&mut self, sk: StoreKey) {
        self.created.shift_remove(&sk);
        self.destroyed.shift_remove(&sk);
        self.changed.shift_remove(&sk);
    }

    pub fn clear(&mut self) {
        self.created.clear();
        self.destroyed.clear();
        self.changed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_preserves_insertion_order() {
        let mut j = Journal::new();
        for i in [3u64, 1, 2] {
            j.mark_changed(StoreKey::from_bits_for_test(i));
        }
        let order: Vec<u64> = j
            .take_changed()
            .into_iter()
            .map(|sk| format!("{}", sk).trim_start_matches('#').parse().unwrap())
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn empty_after_clear() {
        let mut j = Journal::new();
        j.mark_created(StoreKey::from_bits_for_test(1));
        j.clear();
        assert!(j.is_empty());
    }
}
