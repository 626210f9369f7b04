use std::cell::RefCell;
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::hash::AttrHash;
use crate::key::{StoreKey, TypeName};
use crate::query::RemoteQuery;

/// One type's slice of a commit changeset: the creates, updates, and
/// destroys the commit coordinator built for that type this tick.
#[derive(Debug, Default, Clone)]
pub struct TypeChangeset {
    pub create_store_keys: Vec<StoreKey>,
    pub create_records: Vec<AttrHash>,

    pub update_store_keys: Vec<StoreKey>,
    pub update_records: Vec<AttrHash>,
    pub update_changed_keys: Vec<Vec<String>>,

    pub destroy_store_keys: Vec<StoreKey>,
    pub destroy_ids: Vec<String>,
}

impl TypeChangeset {
    pub fn is_empty(&self) -> bool {
        self.create_store_keys.is_empty()
            && self.update_store_keys.is_empty()
            && self.destroy_store_keys.is_empty()
    }
}

/// A full commit changeset: one [`TypeChangeset`] per type that has pending
/// work this tick.
pub type Changeset = HashMap<TypeName, TypeChangeset>;

/// How a single create fared once the Source replies.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Committed { id: String },
    Failed,
}

/// The Source's reply to a `commitChanges` call: per-store-key outcomes for
/// every create/update/destroy the changeset contained. The reconciliation
/// engine consumes this to drive `sourceDidCommitCreate`,
/// `sourceDidNotCreate`, and so on.
#[derive(Debug, Default, Clone)]
pub struct CommitAck {
    pub created: Vec<(StoreKey, CreateOutcome)>,
    /// `true` = committed, `false` = transient failure (`sourceDidNotUpdate`).
    pub updated: Vec<(StoreKey, bool)>,
    /// `true` = committed, `false` = transient failure (`sourceDidNotDestroy`).
    pub destroyed: Vec<(StoreKey, bool)>,
    /// Store keys that hit a permanent failure (`sourceDidError`), across
    /// any of the three categories above.
    pub errored: Vec<StoreKey>,
}

/// The remote collaborator. Not specified beyond these method
/// signatures; the store never assumes anything about how a `Source`
/// implements them. Single-threaded cooperative scheduling means the
/// store never has two of these calls in flight in a way that requires
/// `Send` futures, so the trait is `?Send`.
#[async_trait(?Send)]
pub trait Source {
    async fn fetch_record(&self, type_name: TypeName, id: &str) -> StoreResult<AttrHash>;
    async fn refresh_record(&self, type_name: TypeName, id: &str) -> StoreResult<AttrHash>;
    async fn fetch_records(&self, type_name: TypeName) -> StoreResult<Vec<AttrHash>>;
    async fn fetch_query(&self, query: &dyn RemoteQuery) -> StoreResult<()>;
    async fn commit_changes(&self, changeset: Changeset) -> StoreResult<CommitAck>;
}

/// In-memory `Source` used by tests and the demo binary. Queues
/// outgoing changesets for inspection and lets the driver script canned
/// replies so every branch of the reconciliation matrix can be exercised
/// deterministically.
#[derive(Default)]
pub struct MockSource {
    pub commit_log: RefCell<Vec<Changeset>>,
    pub fetch_log: RefCell<Vec<(TypeName, String)>>,
    next_ack: RefCell<Option<CommitAck>>,
    fetch_replies: RefCell<HashMap<(TypeName, String), AttrHash>>,
    records_replies: RefCell<HashMap<TypeName, Vec<AttrHash>>>,
    pub query_log: RefCell<Vec<String>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the `CommitAck` the next `commit_changes` call will return.
    pub fn queue_ack(&self, ack: CommitAck) {
        *self.next_ack.borrow_mut() = Some(ack);
    }

    pub fn queue_fetch_reply(&self, type_name: TypeName, id: &str, record: AttrHash) {
        self.fetch_replies
            .borrow_mut()
            .insert((type_name, id.to_string()), record);
    }

    pub fn queue_records_reply(&self, type_name: TypeName, records: Vec<AttrHash>) {
        self.records_replies.borrow_mut().insert(type_name, records);
    }

    pub fn last_commit(&self) -> Option<Changeset> {
        self.commit_log.borrow().last().cloned()
    }

    pub fn commit_call_count(&self) -> usize {
        self.commit_log.borrow().len()
    }
}

#[async_trait(?Send)]
impl Source for MockSource {
    async fn fetch_record(&self, type_name: TypeName, id: &str) -> StoreResult<AttrHash> {
        self.fetch_log
            .borrow_mut()
            .push((type_name, id.to_string()));
        Ok(self
            .fetch_replies
            .borrow()
            .get(&(type_name, id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn refresh_record(&self, type_name: TypeName, id: &str) -> StoreResult<AttrHash> {
        self.fetch_record(type_name, id).await
    }

    async fn fetch_records(&self, type_name: TypeName) -> StoreResult<Vec<AttrHash>> {
        Ok(self
            .records_replies
            .borrow()
            .get(type_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_query(&self, query: &dyn RemoteQuery) -> StoreResult<()> {
        self.query_log.borrow_mut().push(query.describe());
        Ok(())
    }

    async fn commit_changes(&self, changeset: Changeset) -> StoreResult<CommitAck> {
        self.commit_log.borrow_mut().push(changeset);
        Ok(self.next_ack.borrow_mut().take().unwrap_or_default())
    }
}
