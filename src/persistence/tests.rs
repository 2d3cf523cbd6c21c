use serde_json::json;
use tempfile::tempdir;

use super::MapStore;

#[test]
fn set_then_get_returns_value() {
    let dir = tempdir().unwrap();
    let store = MapStore::open(dir.path().to_str().unwrap()).unwrap();

    store.set("prices", "AAPL", json!({"bid": 10})).unwrap();
    assert_eq!(
        store.get("prices", "AAPL").unwrap(),
        Some(json!({"bid": 10}))
    );
}

#[test]
fn last_write_wins() {
    let store = MapStore::temporary().unwrap();
    store.set("m", "k", json!({"v": 1})).unwrap();
    store.set("m", "k", json!({"v": 2})).unwrap();
    assert_eq!(store.get("m", "k").unwrap(), Some(json!({"v": 2})));
}

#[test]
fn remove_is_idempotent() {
    let store = MapStore::temporary().unwrap();
    store.set("m", "k", json!({"v": 1})).unwrap();
    assert!(store.remove("m", "k").unwrap());
    assert!(!store.remove("m", "k").unwrap());
    assert_eq!(store.get("m", "k").unwrap(), None);
}

#[test]
fn maps_are_isolated() {
    let store = MapStore::temporary().unwrap();
    store.set("a", "k", json!({"v": "a"})).unwrap();
    assert_eq!(store.get("b", "k").unwrap(), None);
    assert_eq!(store.keys("a").unwrap(), vec!["k".to_string()]);
}

#[test]
fn values_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    {
        let store = MapStore::open(&path).unwrap();
        store.set("m", "k", json!({"v": 1})).unwrap();
        store.flush().unwrap();
    }
    let store = MapStore::open(&path).unwrap();
    assert_eq!(store.get("m", "k").unwrap(), Some(json!({"v": 1})));
}
