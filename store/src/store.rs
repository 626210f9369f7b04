use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::StoreConfig;
use crate::data::DataTable;
use crate::error::{Error, StoreResult};
use crate::hash::{self, AttrHash};
use crate::journal::Journal;
use crate::key::{KeyRegistry, StoreKey, TypeName};
use crate::query::{LocalQuery, QueryId, QueryRegistry, RemoteQuery};
use crate::record::{RecordObserver, TypeMeta};
use crate::scheduler::TickScheduler;
use crate::source::{CommitAck, CreateOutcome, Source, TypeChangeset};
use crate::status::{self, Status, StatusObserver, StatusTable};

/// Bridges a parent [`StatusTable`]'s single mutation point to a nested
/// store's own notification path without requiring the nested store type
/// itself to implement `StatusObserver` (it can't: `StatusTable::set` needs
/// `Box<dyn StatusObserver>`, and a `Store` behind an `Rc<RefCell<_>>` can
/// only offer that through a thin adapter).
struct NestedLink(Rc<RefCell<Store>>);

impl StatusObserver for NestedLink {
    fn parent_did_change_status(&mut self, sk: StoreKey, previous: Status, next: Status) {
        self.0.borrow_mut().on_parent_status_change(sk, previous, next);
    }
}

/// The client-side record store. Holds every per-record table (key, status,
/// data, journal), the commit/query scheduling flags, and the tree of
/// nested overlay stores attached to it.
///
/// A plain `Store::new` instance is its own root: its `KeyRegistry` is
/// authoritative. A nested store created with `Store::new_nested` shares its
/// parent's identity space (a record's store key means the same thing in
/// every store in the tree) but keeps its own status and data tables, which
/// start out empty and read through to the parent until the nested store
/// writes to a given key, at which point it diverges (copy-on-write).
pub struct Store {
    config: StoreConfig,
    keys: KeyRegistry,
    status: StatusTable,
    data: DataTable,
    journal: Journal,
    scheduler: TickScheduler,
    queries: QueryRegistry,
    observers: HashMap<StoreKey, Box<dyn RecordObserver>>,
    type_metas: HashMap<TypeName, TypeMeta>,
    parent: Option<Rc<RefCell<Store>>>,
    nested: Vec<Rc<RefCell<Store>>>,
    clock: u64,
}

impl Store {
    pub fn new(config: StoreConfig) -> Rc<RefCell<Store>> {
        Rc::new(RefCell::new(Store {
            config,
            keys: KeyRegistry::new(),
            status: StatusTable::new(),
            data: DataTable::new(),
            journal: Journal::new(),
            scheduler: TickScheduler::new(),
            queries: QueryRegistry::new(),
            observers: HashMap::new(),
            type_metas: HashMap::new(),
            parent: None,
            nested: Vec::new(),
            clock: 0,
        }))
    }

    /// Creates a nested overlay store attached to `parent` and registers it
    /// so the parent's status/data mutations reach it.
    pub fn new_nested(parent: Rc<RefCell<Store>>) -> Rc<RefCell<Store>> {
        let child = Rc::new(RefCell::new(Store {
            config: StoreConfig::nested(),
            keys: KeyRegistry::new(),
            status: StatusTable::new(),
            data: DataTable::new(),
            journal: Journal::new(),
            scheduler: TickScheduler::new(),
            queries: QueryRegistry::new(),
            observers: HashMap::new(),
            type_metas: HashMap::new(),
            parent: Some(parent.clone()),
            nested: Vec::new(),
            clock: 0,
        }));
        parent.borrow_mut().nested.push(child.clone());
        child
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn register_type(&mut self, meta: TypeMeta) {
        self.type_metas.insert(meta.class_name, meta);
    }

    pub fn register_observer(&mut self, sk: StoreKey, observer: Box<dyn RecordObserver>) {
        self.observers.insert(sk, observer);
    }

    pub fn unregister_observer(&mut self, sk: StoreKey) {
        self.observers.remove(&sk);
    }

    /// Registers a local query and, per §4.6, triggers a `fetchRecords(Type)`
    /// on the Source so the filtered view has something to evaluate against.
    pub async fn register_local_query(
        &mut self,
        type_name: TypeName,
        query: Box<dyn LocalQuery>,
        source: &dyn Source,
    ) -> QueryId {
        let id = self.queries.register_local(type_name, query);
        if let Err(err) = self.load_records(type_name, source).await {
            log::warn!("register_local_query fetchRecords({}) failed: {}", type_name, err);
        }
        self.flush_query_refresh();
        id
    }

    pub fn unregister_local_query(&mut self, id: QueryId) {
        self.queries.unregister_local(id);
    }

    /// Registers a remote query and invokes `fetchQuery` on the Source, per
    /// §4.6. The store only holds the registration; the query refreshes
    /// itself in response to Source events.
    pub async fn register_remote_query(&mut self, query: Box<dyn RemoteQuery>, source: &dyn Source) -> QueryId {
        let id = self.queries.register_remote(query);
        if let Some(query) = self.queries.remote_query(id) {
            if let Err(err) = source.fetch_query(query).await {
                log::warn!("register_remote_query fetchQuery failed: {}", err);
            }
        }
        id
    }

    pub fn unregister_remote_query(&mut self, id: QueryId) {
        self.queries.unregister_remote(id);
    }

    // -- identity (delegates to the root's KeyRegistry so a store key means
    // the same record everywhere in the nesting tree) --------------------

    pub fn get_store_key(&mut self, type_name: TypeName, id: Option<&str>) -> StoreKey {
        if let Some(parent) = self.parent.clone() {
            return parent.borrow_mut().get_store_key(type_name, id);
        }
        self.keys.get_store_key(type_name, id)
    }

    pub fn existing_store_key(&self, type_name: TypeName, id: &str) -> Option<StoreKey> {
        if let Some(parent) = &self.parent {
            return parent.borrow().existing_store_key(type_name, id);
        }
        self.keys.existing_store_key(type_name, id)
    }

    pub fn type_for_store_key(&self, sk: StoreKey) -> Option<TypeName> {
        if let Some(parent) = &self.parent {
            return parent.borrow().type_for_store_key(sk);
        }
        self.keys.type_for_store_key(sk)
    }

    pub fn id_for_store_key(&self, sk: StoreKey) -> Option<String> {
        if let Some(parent) = &self.parent {
            return parent.borrow().id_for_store_key(sk);
        }
        self.keys.id_for_store_key(sk).map(|s| s.to_string())
    }

    /// Rewrites the id index, then patches `data` with the new primary-key
    /// attribute through the normal (non-dirty) write path so observers see
    /// it like any other attribute change.
    fn set_id_for_store_key(&mut self, sk: StoreKey, type_name: TypeName, id: &str) -> StoreResult<()> {
        if let Some(parent) = self.parent.clone() {
            parent.borrow_mut().set_id_for_store_key_raw(sk, id)?;
        } else {
            self.keys.set_id_for_store_key(sk, id)?;
        }
        let primary_key = self.primary_key_name(type_name);
        let mut patch = AttrHash::new();
        patch.insert(primary_key.to_string(), serde_json::Value::String(id.to_string()));
        self.update_hash(sk, type_name, patch, false)
    }

    fn set_id_for_store_key_raw(&mut self, sk: StoreKey, id: &str) -> StoreResult<()> {
        if let Some(parent) = self.parent.clone() {
            return parent.borrow_mut().set_id_for_store_key_raw(sk, id);
        }
        self.keys.set_id_for_store_key(sk, id)
    }

    fn ids_for_type(&self, type_name: TypeName) -> Vec<String> {
        if let Some(parent) = &self.parent {
            return parent.borrow().ids_for_type(type_name);
        }
        self.keys.ids_for_type(type_name)
    }

    // -- reads -------------------------------------------------------------

    /// Effective status for `sk`: this store's own entry if it has diverged,
    /// else the parent's (recursively), else `EMPTY`.
    pub fn status(&self, sk: StoreKey) -> Status {
        if self.status.contains(sk) {
            self.status.get(sk)
        } else if let Some(parent) = &self.parent {
            parent.borrow().status(sk)
        } else {
            Status::EMPTY
        }
    }

    /// Effective data for `sk`: this store's own entry if it has diverged
    /// (copy-on-write already triggered), else read through to the parent.
    pub fn data(&self, sk: StoreKey) -> AttrHash {
        if let Some(entry) = self.data.entry(sk) {
            return entry.data.clone();
        }
        if let Some(parent) = &self.parent {
            return parent.borrow().data(sk);
        }
        AttrHash::new()
    }

    fn primary_key_name(&self, type_name: TypeName) -> &'static str {
        self.type_metas.get(type_name).map(|m| m.primary_key).unwrap_or("id")
    }

    fn extract_id(&self, type_name: TypeName, record: &AttrHash) -> Option<String> {
        record
            .get(self.primary_key_name(type_name))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    // -- status/data mutation plumbing -------------------------------------

    fn set_status(&mut self, sk: StoreKey, type_name: TypeName, next: Status) -> Status {
        let mut links: Vec<Box<dyn StatusObserver>> = self
            .nested
            .iter()
            .map(|child| Box::new(NestedLink(child.clone())) as Box<dyn StatusObserver>)
            .collect();
        let previous = self.status.set(sk, type_name, next, &mut links);
        if previous != next {
            if let Some(obs) = self.observers.get_mut(&sk) {
                obs.status_did_change(sk, previous, next);
            }
        }
        previous
    }

    fn on_parent_status_change(&mut self, sk: StoreKey, previous: Status, next: Status) {
        if self.status.contains(sk) {
            return;
        }
        if let Some(obs) = self.observers.get_mut(&sk) {
            obs.status_did_change(sk, previous, next);
        }
        for child in self.nested.clone() {
            child.borrow_mut().on_parent_status_change(sk, previous, next);
        }
    }

    fn on_parent_data_change(&mut self, sk: StoreKey, changed_keys: &[String]) {
        if self.data.has_own(sk) {
            return;
        }
        self.notify_property_changes(sk, changed_keys);
        for child in self.nested.clone() {
            child.borrow_mut().on_parent_data_change(sk, changed_keys);
        }
        if let Some(type_name) = self.type_for_store_key(sk) {
            self.queries.mark_type_dirty(type_name);
        }
        self.scheduler.schedule_refresh();
    }

    fn notify_property_changes(&mut self, sk: StoreKey, changed_keys: &[String]) {
        if changed_keys.is_empty() {
            return;
        }
        if let Some(obs) = self.observers.get_mut(&sk) {
            obs.begin_property_changes();
            for key in changed_keys {
                obs.property_did_change(sk, key);
            }
            obs.end_property_changes();
        }
    }

    fn touch_last_access(&mut self, sk: StoreKey) {
        self.clock += 1;
        let tick = self.clock;
        self.data.entry_mut(sk).last_access = tick;
    }

    fn clear_dirty_bookkeeping(&mut self, sk: StoreKey) {
        let entry = self.data.entry_mut(sk);
        entry.committed = None;
        entry.changed = None;
        entry.rollback = None;
    }

    // -- the sole write path ------------------------------------------------

    pub fn update_hash(
        &mut self,
        sk: StoreKey,
        type_name: TypeName,
        patch: AttrHash,
        change_is_dirty: bool,
    ) -> StoreResult<()> {
        if self.config.is_nested && !self.data.has_own(sk) {
            let inherited = self.data(sk);
            self.data.install(sk, inherited);
        }

        let status = self.status(sk);
        let change_is_dirty = if status.is_ready() && status.is_new() {
            false
        } else {
            change_is_dirty
        };

        if change_is_dirty && !status.is_ready() {
            log::warn!(
                "write to unready record {} ({}), status {}: {:?}",
                sk,
                type_name,
                status,
                patch.keys().collect::<Vec<_>>()
            );
            return Err(Error::WriteToUnready(format!("{} ({})", sk, type_name)));
        }

        let mut changed_keys = Vec::new();

        if change_is_dirty {
            {
                let entry = self.data.entry_mut(sk);
                if entry.committed.is_none() {
                    entry.committed = Some(entry.data.clone());
                }
                if entry.changed.is_none() {
                    entry.changed = Some(HashMap::new());
                }
            }

            let committed = self.data.entry(sk).and_then(|e| e.committed.clone()).unwrap_or_default();
            {
                let entry = self.data.entry_mut(sk);
                for (key, value) in patch.iter() {
                    if entry.data.get(key) != Some(value) {
                        entry.data.insert(key.clone(), value.clone());
                        changed_keys.push(key.clone());
                        let differs_from_committed = Some(value) != committed.get(key);
                        entry.changed.as_mut().unwrap().insert(key.clone(), differs_from_committed);
                    }
                }
            }

            let seen_change = self
                .data
                .entry(sk)
                .and_then(|e| e.changed.as_ref())
                .map(|m| m.values().any(|v| *v))
                .unwrap_or(false);

            if seen_change {
                let next = self.status(sk).with(status::DIRTY);
                self.set_status(sk, type_name, next);
                if self.config.auto_commit {
                    self.journal.mark_changed(sk);
                    self.scheduler.schedule_commit();
                }
            } else {
                let next = self.status(sk).without(status::DIRTY);
                self.set_status(sk, type_name, next);
                let entry = self.data.entry_mut(sk);
                entry.committed = None;
                entry.changed = None;
                if self.config.is_nested {
                    self.data.forget(sk);
                }
            }
        } else {
            let entry = self.data.entry_mut(sk);
            for (key, value) in patch.iter() {
                if entry.data.get(key) != Some(value) {
                    entry.data.insert(key.clone(), value.clone());
                    changed_keys.push(key.clone());
                }
            }
        }

        self.notify_property_changes(sk, &changed_keys);
        for child in self.nested.clone() {
            child.borrow_mut().on_parent_data_change(sk, &changed_keys);
        }
        self.queries.mark_type_dirty(type_name);
        self.scheduler.schedule_refresh();

        Ok(())
    }

    pub fn revert_hash(&mut self, sk: StoreKey, type_name: TypeName) {
        if let Some(committed) = self.data.entry(sk).and_then(|e| e.committed.clone()) {
            let _ = self.update_hash(sk, type_name, committed, true);
        }
    }

    // -- creation / destruction ---------------------------------------------

    pub fn create_record(&mut self, type_name: TypeName, id: Option<&str>, data: AttrHash) -> StoreResult<StoreKey> {
        let sk = self.get_store_key(type_name, id);
        let status = self.status(sk);
        if !(status.is_empty_core() || status.is_destroyed()) {
            log::warn!("createRecord called on {} ({}) with status {}", sk, type_name, status);
            return Err(Error::AlreadyExists(format!("{} ({})", sk, type_name)));
        }

        self.data.install(sk, data);
        self.set_status(sk, type_name, Status::READY.with(status::NEW));
        self.journal.mark_created(sk);
        self.queries.mark_type_dirty(type_name);
        if self.config.auto_commit {
            self.scheduler.schedule_commit();
        }
        self.scheduler.schedule_refresh();
        Ok(sk)
    }

    pub fn destroy_record(&mut self, sk: StoreKey, type_name: TypeName) {
        let status = self.status(sk);

        if status.is_ready() && status.is_new() {
            self.journal.unmark_created(sk);
            self.set_status(sk, type_name, Status::DESTROYED);
            self.force_unload(sk);
            return;
        }

        if status.is_dirty() {
            self.revert_hash(sk, type_name);
        }
        self.clear_dirty_bookkeeping(sk);

        self.journal.mark_destroyed(sk);
        let preserved = status.bits() & (status::OBSOLETE | status::NEW);
        self.set_status(sk, type_name, Status::DESTROYED.with(preserved));
        self.queries.mark_type_dirty(type_name);
        if self.config.auto_commit {
            self.scheduler.schedule_commit();
        }
    }

    // -- unload / mayUnloadRecord --------------------------------------------

    pub fn may_unload_record(&self, sk: StoreKey) -> bool {
        let status = self.status(sk);
        if !status.has_no_modifiers() {
            return false;
        }
        if !(status.is_empty_core() || status.is_ready() || status.is_destroyed()) {
            return false;
        }
        if self.observers.get(&sk).map(|o| o.has_observers()).unwrap_or(false) {
            return false;
        }
        self.nested.iter().all(|child| child.borrow().may_unload_record(sk))
    }

    pub fn unload_record(&mut self, sk: StoreKey) -> StoreResult<()> {
        if !self.may_unload_record(sk) {
            return Err(Error::NotUnloadable(format!("{}", sk)));
        }
        self.force_unload(sk);
        Ok(())
    }

    fn force_unload(&mut self, sk: StoreKey) {
        if let Some(obs) = self.observers.get_mut(&sk) {
            obs.store_will_unload(sk);
        }
        self.observers.remove(&sk);
        self.data.forget(sk);
        self.status.forget(sk);
        self.journal.forget(sk);
        if self.parent.is_none() {
            self.keys.forget(sk);
        }
    }

    // -- commit coordinator ---------------------------------------------------

    pub async fn commit_changes(&mut self, source: &dyn Source) {
        let mut changeset: HashMap<TypeName, TypeChangeset> = HashMap::new();

        for sk in self.journal.take_created() {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            let record = self.data(sk);
            let tc = changeset.entry(type_name).or_default();
            tc.create_store_keys.push(sk);
            tc.create_records.push(record);
            let next = self.status(sk).with(status::COMMITTING);
            self.set_status(sk, type_name, next);
        }

        let mut deferred_changed = Vec::new();
        for sk in self.journal.take_changed() {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            let status = self.status(sk);
            if status.is_committing() {
                deferred_changed.push(sk);
                continue;
            }

            let committed = self.data.entry(sk).and_then(|e| e.committed.clone());
            self.data.entry_mut(sk).rollback = committed;
            self.data.entry_mut(sk).committed = None;

            let changed_attr_keys: Vec<String> = self
                .data
                .entry(sk)
                .and_then(|e| e.changed.as_ref())
                .map(|m| m.iter().filter(|(_, v)| **v).map(|(k, _)| k.clone()).collect())
                .unwrap_or_default();

            let record = self.data(sk);
            let tc = changeset.entry(type_name).or_default();
            tc.update_store_keys.push(sk);
            tc.update_records.push(record);
            tc.update_changed_keys.push(changed_attr_keys);

            let next = status.without(status::DIRTY).with(status::COMMITTING);
            self.set_status(sk, type_name, next);
        }
        for sk in deferred_changed {
            self.journal.mark_changed(sk);
        }

        let mut deferred_destroyed = Vec::new();
        for sk in self.journal.take_destroyed() {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            let status = self.status(sk);
            if status.is_new() {
                deferred_destroyed.push(sk);
                continue;
            }

            let id = self.id_for_store_key(sk).unwrap_or_default();
            let tc = changeset.entry(type_name).or_default();
            tc.destroy_store_keys.push(sk);
            tc.destroy_ids.push(id);

            self.set_status(sk, type_name, Status::DESTROYED.with(status::COMMITTING));
        }
        for sk in deferred_destroyed {
            self.journal.mark_destroyed(sk);
        }

        if !changeset.values().any(|tc| !tc.is_empty()) {
            return;
        }

        match source.commit_changes(changeset).await {
            Ok(ack) => self.apply_commit_ack(ack),
            Err(err) => log::error!("commit_changes transport error: {}", err),
        }
    }

    fn apply_commit_ack(&mut self, ack: CommitAck) {
        let mut created_ok = Vec::new();
        let mut created_failed = Vec::new();
        for (sk, outcome) in ack.created {
            match outcome {
                CreateOutcome::Committed { id } => created_ok.push((sk, id)),
                CreateOutcome::Failed => created_failed.push(sk),
            }
        }
        if !created_ok.is_empty() {
            self.source_did_commit_create(created_ok);
        }
        if !created_failed.is_empty() {
            self.source_did_not_create(created_failed);
        }

        let (updated_ok, updated_failed): (Vec<_>, Vec<_>) = ack.updated.into_iter().partition(|(_, ok)| *ok);
        let updated_ok: Vec<StoreKey> = updated_ok.into_iter().map(|(sk, _)| sk).collect();
        let updated_failed: Vec<StoreKey> = updated_failed.into_iter().map(|(sk, _)| sk).collect();
        if !updated_ok.is_empty() {
            self.source_did_commit_update(updated_ok);
        }
        if !updated_failed.is_empty() {
            self.source_did_not_update(updated_failed);
        }

        let (destroyed_ok, destroyed_failed): (Vec<_>, Vec<_>) = ack.destroyed.into_iter().partition(|(_, ok)| *ok);
        let destroyed_ok: Vec<StoreKey> = destroyed_ok.into_iter().map(|(sk, _)| sk).collect();
        let destroyed_failed: Vec<StoreKey> = destroyed_failed.into_iter().map(|(sk, _)| sk).collect();
        if !destroyed_ok.is_empty() {
            self.source_did_commit_destroy(destroyed_ok);
        }
        if !destroyed_failed.is_empty() {
            self.source_did_not_destroy(destroyed_failed);
        }

        if !ack.errored.is_empty() {
            self.source_did_error(ack.errored);
        }
    }

    pub fn discard_changes(&mut self) {
        for sk in self.journal.take_created() {
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            self.set_status(sk, type_name, Status::DESTROYED);
            self.force_unload(sk);
        }

        for sk in self.journal.take_changed() {
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            if let Some(committed) = self.data.entry(sk).and_then(|e| e.committed.clone()) {
                self.data.entry_mut(sk).data = committed;
            }
            self.clear_dirty_bookkeeping(sk);
            let prev = self.status(sk);
            let preserved = prev.bits() & (status::OBSOLETE | status::LOADING | status::COMMITTING);
            self.set_status(sk, type_name, Status::READY.with(preserved));
        }

        for sk in self.journal.take_destroyed() {
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            let prev = self.status(sk);
            let preserved = prev.bits() & status::OBSOLETE;
            self.set_status(sk, type_name, Status::READY.with(preserved));
        }
    }

    // -- reconciliation engine ------------------------------------------------

    pub fn source_did_fetch_records(&mut self, type_name: TypeName, records: Vec<AttrHash>, all: bool) {
        if all {
            let fetched_ids: Vec<String> = records.iter().filter_map(|r| self.extract_id(type_name, r)).collect();
            let known_ids = self.ids_for_type(type_name);
            let missing: Vec<String> = known_ids.into_iter().filter(|id| !fetched_ids.contains(id)).collect();
            if !missing.is_empty() {
                self.source_did_destroy_records(type_name, missing);
            }
        }

        for record in records {
            let id = match self.extract_id(type_name, &record) {
                Some(id) => id,
                None => continue,
            };
            let sk = self.get_store_key(type_name, Some(&id));
            let status = self.status(sk);

            if status.is_ready() {
                let _ = self.update_hash(sk, type_name, record, false);
            } else if !status.is_empty_core() {
                log::warn!("fetched {} ({}) but status {} is not EMPTY or READY", sk, type_name, status);
            } else {
                self.data.install(sk, record);
                self.touch_last_access(sk);
                self.set_status(sk, type_name, Status::READY);
            }
        }
    }

    pub fn source_has_updates_for_records(&mut self, type_name: TypeName, ids: Vec<String>) {
        for id in ids {
            if let Some(sk) = self.existing_store_key(type_name, &id) {
                let status = self.status(sk);
                if status.is_ready() {
                    self.set_status(sk, type_name, status.with(status::OBSOLETE));
                }
            }
        }
    }

    pub fn source_did_fetch_updates(&mut self, type_name: TypeName, updates: Vec<(String, AttrHash)>) {
        for (id, update) in updates {
            let sk = match self.existing_store_key(type_name, &id) {
                Some(sk) => sk,
                None => continue,
            };
            let status = self.status(sk);
            if !status.is_ready() {
                continue;
            }

            let mut effective_update = update;

            if status.is_committing() {
                if let Some(rollback) = self.data.entry(sk).and_then(|e| e.rollback.clone()) {
                    effective_update = hash::merge(&rollback, &effective_update);
                }
                self.data.entry_mut(sk).rollback = None;
                if !status.is_dirty() {
                    // The push represents the pre-commit server state; it
                    // is folded in only to settle `rollback` bookkeeping.
                    // `data` already holds the edit in flight to the
                    // Source, and `COMMITTING` is only settled by the ack
                    // (`sourceDidCommitUpdate` / `sourceDidNotUpdate`), so
                    // nothing else here changes local state yet.
                    continue;
                }
            }

            if status.is_dirty() {
                let committed = self.data.entry(sk).and_then(|e| e.committed.clone()).unwrap_or_default();
                let merged = hash::merge(&committed, &effective_update);

                let mut rebased_survived = false;
                if self.config.rebase_conflicts {
                    let current_data = self.data(sk);
                    let changed_map = self.data.entry(sk).and_then(|e| e.changed.clone()).unwrap_or_default();
                    let mut rebased = merged.clone();
                    let mut survivors: HashMap<String, bool> = HashMap::new();
                    for (key, was_changed) in &changed_map {
                        if !was_changed {
                            continue;
                        }
                        if let Some(local_value) = current_data.get(key) {
                            if Some(local_value) != merged.get(key) {
                                rebased.insert(key.clone(), local_value.clone());
                                survivors.insert(key.clone(), true);
                            }
                        }
                    }

                    if !survivors.is_empty() {
                        let entry = self.data.entry_mut(sk);
                        entry.committed = Some(merged.clone());
                        entry.data = rebased;
                        entry.changed = Some(survivors);
                        self.set_status(sk, type_name, Status::READY.with(status::DIRTY));
                        rebased_survived = true;
                    }
                }

                if rebased_survived {
                    continue;
                }

                self.clear_dirty_bookkeeping(sk);
                effective_update = merged;
            }

            let _ = self.update_hash(sk, type_name, effective_update, false);
            // A push that lands while a commit is still in flight does not
            // settle COMMITTING itself — that is the ack's job
            // (`sourceDidCommitUpdate`/`sourceDidNotUpdate`). Every other
            // modifier this callback is responsible for (DIRTY, OBSOLETE) is
            // cleared: the record now reflects the freshest known state.
            let preserved = status.bits() & status::COMMITTING;
            self.set_status(sk, type_name, Status::READY.with(preserved));
        }
    }

    pub fn source_could_not_find_records(&mut self, type_name: TypeName, ids: Vec<String>) {
        for id in ids {
            let sk = match self.existing_store_key(type_name, &id) {
                Some(sk) => sk,
                None => continue,
            };
            let status = self.status(sk);
            if status.is_empty_core() {
                self.set_status(sk, type_name, Status::NON_EXISTENT);
            } else {
                self.clear_dirty_bookkeeping(sk);
                self.set_status(sk, type_name, Status::DESTROYED);
                self.force_unload(sk);
            }
        }
    }

    pub fn source_did_destroy_records(&mut self, type_name: TypeName, ids: Vec<String>) {
        for id in ids {
            let sk = match self.existing_store_key(type_name, &id) {
                Some(sk) => sk,
                None => continue,
            };
            self.clear_dirty_bookkeeping(sk);
            self.set_status(sk, type_name, Status::DESTROYED);
            self.force_unload(sk);
        }
    }

    pub fn source_did_commit_create(&mut self, acks: Vec<(StoreKey, String)>) {
        for (sk, id) in acks {
            let status = self.status(sk);
            if !status.is_new() {
                log::error!("commit-create ack for {} but status {} lacks NEW", sk, status);
                continue;
            }
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            if let Err(err) = self.set_id_for_store_key(sk, type_name, &id) {
                log::error!("commit-create id assignment failed for {}: {}", sk, err);
                continue;
            }
            let next = status.without(status::NEW).without(status::COMMITTING);
            self.set_status(sk, type_name, next);
        }
    }

    pub fn source_did_not_create(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            let status = self.status(sk);
            if status.is_destroyed() {
                self.force_unload(sk);
                continue;
            }
            self.clear_dirty_bookkeeping(sk);
            self.set_status(sk, type_name, Status::READY.with(status::NEW));
            self.journal.mark_created(sk);
        }
    }

    pub fn source_did_commit_update(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            self.data.entry_mut(sk).rollback = None;
            let status = self.status(sk);
            if !status.is_ready() {
                continue;
            }
            if !status.is_committing() {
                self.set_status(sk, type_name, status.with(status::OBSOLETE));
            } else {
                self.set_status(sk, type_name, status.without(status::COMMITTING));
            }
        }
    }

    pub fn source_did_not_update(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let type_name = match self.type_for_store_key(sk) {
                Some(t) => t,
                None => continue,
            };
            let rollback = self.data.entry(sk).and_then(|e| e.rollback.clone());
            {
                let entry = self.data.entry_mut(sk);
                entry.committed = rollback.clone();
                entry.rollback = None;
            }

            let status = self.status(sk);
            if status.is_dirty() {
                let current = self.data(sk);
                let committed = rollback.unwrap_or_default();
                let mut changed = HashMap::new();
                for key in current.keys().chain(committed.keys()) {
                    changed.entry(key.clone()).or_insert_with(|| current.get(key) != committed.get(key));
                }
                self.data.entry_mut(sk).changed = Some(changed);
            }

            if !status.is_committing() {
                self.set_status(sk, type_name, status.with(status::OBSOLETE));
            } else {
                self.set_status(sk, type_name, status.without(status::COMMITTING).with(status::DIRTY));
                self.journal.mark_changed(sk);
            }
        }
    }

    pub fn source_did_commit_destroy(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let status = self.status(sk);
            if !status.is_destroyed() {
                log::error!("commit-destroy ack for {} but status {} lacks DESTROYED", sk, status);
                continue;
            }
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            self.set_status(sk, type_name, Status::DESTROYED);
            self.force_unload(sk);
        }
    }

    pub fn source_did_not_destroy(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let status = self.status(sk);
            if !status.is_destroyed() {
                log::error!("not-destroy ack for {} but status {} lacks DESTROYED", sk, status);
                continue;
            }
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            self.set_status(sk, type_name, Status::DESTROYED.with(status::DIRTY));
            self.journal.mark_destroyed(sk);
        }
    }

    pub fn source_did_error(&mut self, sks: Vec<StoreKey>) {
        for sk in sks {
            let status = self.status(sk);
            let type_name = self.type_for_store_key(sk).unwrap_or("unknown");
            if status.is_new() {
                self.force_unload(sk);
                continue;
            }
            let rollback = self.data.entry(sk).and_then(|e| e.rollback.clone());
            {
                let entry = self.data.entry_mut(sk);
                entry.data = rollback.unwrap_or_default();
                entry.committed = None;
                entry.changed = None;
                entry.rollback = None;
            }
            self.set_status(sk, type_name, Status::READY.with(status::OBSOLETE));
        }
    }

    // -- query refresh ---------------------------------------------------------

    pub fn flush_query_refresh(&mut self) {
        let dirty_types = self.queries.take_dirty_types();
        for type_name in dirty_types {
            let loaded: Vec<(StoreKey, AttrHash)> = self
                .data
                .keys()
                .filter(|sk| self.type_for_store_key(*sk) == Some(type_name))
                .map(|sk| (sk, self.data(sk)))
                .collect();
            let refs: Vec<(StoreKey, &AttrHash)> = loaded.iter().map(|(sk, d)| (*sk, d)).collect();
            self.queries.refresh_type(type_name, &refs);
        }
    }

    /// Drains whatever the deferred executor has pending: a coalesced
    /// commit, then a coalesced query refresh. Called once per tick by the
    /// host (a `tokio` interval in the demo binary, or synchronously in
    /// tests).
    pub async fn flush(&mut self, source: &dyn Source) {
        if self.scheduler.take_commit() {
            self.commit_changes(source).await;
        }
        if self.scheduler.take_refresh() {
            self.flush_query_refresh();
        }
    }

    // -- fetching through the Source -------------------------------------------

    pub async fn load_record(&mut self, type_name: TypeName, id: &str, source: &dyn Source) -> StoreResult<StoreKey> {
        let sk = self.get_store_key(type_name, Some(id));
        let status = self.status(sk);
        if status.is_ready() {
            return Ok(sk);
        }
        self.set_status(sk, type_name, status.with(status::LOADING));
        let record = source.fetch_record(type_name, id).await?;
        let cleared = self.status(sk).without(status::LOADING);
        self.set_status(sk, type_name, cleared);
        self.source_did_fetch_records(type_name, vec![record], false);
        Ok(sk)
    }

    pub async fn load_records(&mut self, type_name: TypeName, source: &dyn Source) -> StoreResult<()> {
        let records = source.fetch_records(type_name).await?;
        self.source_did_fetch_records(type_name, records, true);
        Ok(())
    }

    /// Re-fetches a single record through `Source::refresh_record`, the
    /// typical way a caller resolves an `OBSOLETE` record once it notices
    /// the flag (the core never calls this on its own initiative — per §4.5
    /// `OBSOLETE` only signals that newer data may exist upstream). Routed
    /// through `source_did_fetch_updates` since the reply represents a
    /// server-originated update to an already-known record, not a first
    /// load.
    pub async fn refresh_record(&mut self, type_name: TypeName, id: &str, source: &dyn Source) -> StoreResult<()> {
        let record = source.refresh_record(type_name, id).await?;
        self.source_did_fetch_updates(type_name, vec![(id.to_string(), record)]);
        Ok(())
    }
}
