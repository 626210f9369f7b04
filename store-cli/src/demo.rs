use serde_json::json;

use store::{AttrHash, LoggingObserver, MockSource, Source, Store, StoreConfig, TypeMeta};

const WIDGET: TypeMeta = TypeMeta::new("widget", "id");

fn attrs(pairs: &[(&str, serde_json::Value)]) -> AttrHash {
    let mut m = AttrHash::new();
    for (k, v) in pairs {
        m.insert((*k).to_string(), v.clone());
    }
    m
}

/// Drives a `Store` through create, commit, server push, and conflict
/// rebase against an in-memory `MockSource`, printing every status
/// transition along the way. This is a demonstration, not a test: the
/// scenario-level behavior it exercises is pinned down properly in
/// `store/tests/scenarios.rs`.
pub async fn run(config: StoreConfig) {
    let store = Store::new(config);
    store.borrow_mut().register_type(WIDGET);
    let source = MockSource::new();

    println!("-- creating widget \"gear\" --");
    let sk = store
        .borrow_mut()
        .create_record("widget", None, attrs(&[("name", json!("gear")), ("count", json!(1))]))
        .expect("create_record against an EMPTY store key cannot fail");
    store.borrow_mut().register_observer(sk, Box::new(LoggingObserver::watching()));
    println!("status after create: {}", store.borrow().status(sk));

    println!("-- flushing tick: commit dispatched to Source --");
    store.borrow_mut().flush(&source).await;
    println!("status mid-commit: {}", store.borrow().status(sk));

    println!("-- Source acknowledges the create with server id \"w-100\" --");
    store.borrow_mut().source_did_commit_create(vec![(sk, "w-100".to_string())]);
    println!("status after ack: {}", store.borrow().status(sk));
    println!("data after ack: {:?}", store.borrow().data(sk));

    println!("-- local edit: count 1 -> 2 --");
    store
        .borrow_mut()
        .update_hash(sk, "widget", attrs(&[("count", json!(2))]), true)
        .expect("record is READY");
    println!("status after edit: {}", store.borrow().status(sk));

    println!("-- flushing tick: update dispatched, commit in flight --");
    store.borrow_mut().flush(&source).await;
    println!("status mid-update-commit: {}", store.borrow().status(sk));

    println!("-- a concurrent server push arrives for an unrelated field before the ack --");
    store
        .borrow_mut()
        .source_did_fetch_updates("widget", vec![("w-100".to_string(), attrs(&[("color", json!("red"))]))]);
    println!("status after push: {}", store.borrow().status(sk));
    println!("data after push: {:?}", store.borrow().data(sk));

    println!("-- Source acknowledges the update --");
    store.borrow_mut().source_did_commit_update(vec![sk]);
    println!("final status: {}", store.borrow().status(sk));
    println!("final data: {:?}", store.borrow().data(sk));

    println!("-- commit_changes was called exactly {} time(s) --", source.commit_call_count());
}
