use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use store::{AttrHash, Store, StoreConfig, TypeMeta};

const WIDGET: TypeMeta = TypeMeta::new("widget", "id");

fn attrs(n: i64) -> AttrHash {
    let mut m = AttrHash::new();
    m.insert("n".to_string(), json!(n));
    m
}

fn bench_create_record(c: &mut Criterion) {
    c.bench_function("create_record", |b| {
        b.iter(|| {
            let store = Store::new(StoreConfig { auto_commit: false, ..StoreConfig::default() });
            store.borrow_mut().register_type(WIDGET);
            for i in 0..black_box(100i64) {
                store.borrow_mut().create_record("widget", None, attrs(i)).unwrap();
            }
        });
    });
}

fn bench_update_hash_dirty(c: &mut Criterion) {
    let store = Store::new(StoreConfig { auto_commit: false, ..StoreConfig::default() });
    store.borrow_mut().register_type(WIDGET);
    let sk = store.borrow_mut().get_store_key("widget", Some("bench"));
    store.borrow_mut().source_did_fetch_records(
        "widget",
        vec![{
            let mut m = attrs(0);
            m.insert("id".to_string(), json!("bench"));
            m
        }],
        false,
    );

    c.bench_function("update_hash_dirty", |b| {
        b.iter(|| {
            for i in 0..black_box(100i64) {
                store.borrow_mut().update_hash(sk, "widget", attrs(i), true).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_create_record, bench_update_hash_dirty);
criterion_main!(benches);
