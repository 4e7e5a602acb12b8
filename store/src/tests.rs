use tempfile::TempDir;

use super::*;

fn store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::new(dir.path(), 16 * 1024 * 1024, 8, executor).unwrap();
    (dir, store)
}

#[tokio::test]
async fn set_and_get_round_trip() {
    let (_dir, store) = store();
    let dict: Dict<String> = store.open_dictionary("widgets").unwrap();

    store
        .transact(move |txn| txn.set(&dict, b"a", &"hello".to_string()))
        .await
        .unwrap();

    let dict: Dict<String> = store.open_dictionary("widgets").unwrap();
    let value = store
        .transact(move |txn| txn.try_get(&dict, b"a"))
        .await
        .unwrap();
    assert_eq!(value, Some("hello".to_string()));
}

#[tokio::test]
async fn missing_key_is_none() {
    let (_dir, store) = store();
    let dict: Dict<String> = store.open_dictionary("widgets").unwrap();
    let value = store
        .transact(move |txn| txn.try_get(&dict, b"missing"))
        .await
        .unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
async fn remove_returns_whether_a_row_existed() {
    let (_dir, store) = store();
    let dict: Dict<String> = store.open_dictionary("widgets").unwrap();
    let dict2 = dict.clone();
    store
        .transact(move |txn| txn.set(&dict2, b"a", &"x".to_string()))
        .await
        .unwrap();

    let dict2 = dict.clone();
    let removed_first = store.transact(move |txn| txn.try_remove(&dict2, b"a")).await.unwrap();
    let removed_second = store.transact(move |txn| txn.try_remove(&dict, b"a")).await.unwrap();
    assert!(removed_first);
    assert!(!removed_second);
}

#[tokio::test]
async fn add_or_update_applies_read_modify_write_atomically() {
    let (_dir, store) = store();
    let dict: Dict<u64> = store.open_dictionary("counters").unwrap();

    for _ in 0..5 {
        let dict = dict.clone();
        store
            .transact(move |txn| txn.add_or_update(&dict, b"count", 0, |n| n + 1))
            .await
            .unwrap();
    }

    let value = store.transact(move |txn| txn.try_get(&dict, b"count")).await.unwrap();
    assert_eq!(value, Some(5));
}

#[tokio::test]
async fn enumerate_returns_every_row() {
    let (_dir, store) = store();
    let dict: Dict<u64> = store.open_dictionary("rows").unwrap();

    for i in 0..3u64 {
        let dict = dict.clone();
        let key = format!("k{i}").into_bytes();
        store.transact(move |txn| txn.set(&dict, &key, &i)).await.unwrap();
    }

    let rows = store
        .transact(move |txn| txn.enumerate(&dict, EnumerateMode::Ordered))
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    let values: Vec<u64> = rows.into_iter().map(|(_, v)| v).collect();
    assert_eq!(values, vec![0, 1, 2]);
}

#[tokio::test]
async fn failed_transaction_leaves_store_unchanged() {
    let (_dir, store) = store();
    let dict: Dict<u64> = store.open_dictionary("rows").unwrap();

    let dict2 = dict.clone();
    let result: Result<(), String> = store
        .transact(move |txn| {
            txn.set(&dict2, b"a", &1)?;
            Err("boom".to_string())
        })
        .await;
    assert!(result.is_err());

    let value = store.transact(move |txn| txn.try_get(&dict, b"a")).await.unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
async fn open_dictionary_is_idempotent() {
    let (_dir, store) = store();
    let _a: Dict<u64> = store.open_dictionary("same").unwrap();
    let _b: Dict<u64> = store.open_dictionary("same").unwrap();
    assert_eq!(store.enumerate_dictionaries().await.unwrap(), vec!["same".to_string()]);
}

#[tokio::test]
async fn enumerate_dictionaries_survives_a_fresh_store_over_the_same_path() {
    let dir = TempDir::new().unwrap();
    {
        let executor = task_executor::Executor::new();
        let store = Store::new(dir.path(), 16 * 1024 * 1024, 8, executor).unwrap();
        let _dict: Dict<u64> = store.open_dictionary("from_a_prior_process").unwrap();
    }

    // A brand new `Store` (simulating a process restart) must see the dictionary a prior
    // `Store` created, since the listing is read from LMDB's own root database rather than
    // kept in this process's memory.
    let executor = task_executor::Executor::new();
    let store = Store::new(dir.path(), 16 * 1024 * 1024, 8, executor).unwrap();
    assert_eq!(
        store.enumerate_dictionaries().await.unwrap(),
        vec!["from_a_prior_process".to_string()]
    );
}

#[tokio::test]
async fn remove_dictionary_drops_its_rows() {
    let (_dir, store) = store();
    let dict: Dict<u64> = store.open_dictionary("temp").unwrap();
    store.transact(move |txn| txn.set(&dict, b"a", &1)).await.unwrap();

    store.remove_dictionary("temp").await.unwrap();
    assert!(store.enumerate_dictionaries().await.unwrap().is_empty());

    let dict: Dict<u64> = store.open_dictionary("temp").unwrap();
    let value = store.transact(move |txn| txn.try_get(&dict, b"a")).await.unwrap();
    assert_eq!(value, None);
}
