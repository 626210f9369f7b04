/// Per-[`crate::store::Store`]-instance configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// After any mutation, schedule a commit at end of tick.
    pub auto_commit: bool,
    /// On server update to a dirty record, attempt to reapply local edits
    /// on top.
    pub rebase_conflicts: bool,
    /// Enables copy-on-write overlay semantics against a parent store.
    pub is_nested: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            rebase_conflicts: true,
            is_nested: false,
        }
    }
}

impl StoreConfig {
    pub fn nested() -> Self {
        Self { is_nested: true, ..Self::default() }
    }
}
