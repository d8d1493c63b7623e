use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::store::DeleteOptions;
use crate::store::EventKind;
use crate::store::KvApi;
use crate::store::MemoryStore;
use crate::store::SetOptions;

fn set_opts() -> SetOptions {
    SetOptions::default()
}

#[tokio::test]
async fn test_put_get_roundtrip() {
    let store = MemoryStore::new();
    store
        .put("/a/b/c", Some("hello".into()), set_opts())
        .await
        .expect("put");

    let res = store.get("/a/b/c", false).await.expect("get");
    assert_eq!(res.node.value.as_deref(), Some("hello"));
    assert!(!res.node.dir);

    // intermediate directories were created implicitly
    let res = store.get("/a", true).await.expect("get dir");
    assert!(res.node.dir);
    assert_eq!(res.node.nodes.len(), 1);
    assert_eq!(res.node.nodes[0].key, "/a/b");
    assert_eq!(res.node.nodes[0].nodes[0].key, "/a/b/c");
}

#[tokio::test]
async fn test_get_missing_key() {
    let store = MemoryStore::new();
    let err = store.get("/missing", false).await.unwrap_err();
    assert!(err.is_key_not_found());
}

#[tokio::test]
async fn test_index_is_monotonic() {
    let store = MemoryStore::new();
    let first = store
        .put("/x", Some("1".into()), set_opts())
        .await
        .unwrap();
    let second = store
        .put("/y", Some("2".into()), set_opts())
        .await
        .unwrap();
    assert!(second.node.modified_index > first.node.modified_index);
    assert_eq!(store.index(), second.node.modified_index);
}

#[tokio::test]
async fn test_create_guard() {
    let store = MemoryStore::new();
    let opts = SetOptions {
        create: Some(true),
        ..Default::default()
    };
    store
        .put("/k", Some("v".into()), opts.clone())
        .await
        .expect("first create");
    let err = store
        .put("/k", Some("v2".into()), opts)
        .await
        .unwrap_err();
    assert!(err.is_key_already_exists());

    let err = store
        .put(
            "/absent",
            Some("v".into()),
            SetOptions {
                create: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_key_not_found());
}

#[tokio::test]
async fn test_compare_and_swap() {
    let store = MemoryStore::new();
    let res = store
        .put("/k", Some("v1".into()), set_opts())
        .await
        .unwrap();

    let err = store
        .put(
            "/k",
            Some("v2".into()),
            SetOptions {
                prev_value: Some("other".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_precondition_failed());

    let swapped = store
        .put(
            "/k",
            Some("v2".into()),
            SetOptions {
                prev_index: Some(res.node.modified_index),
                ..Default::default()
            },
        )
        .await
        .expect("matching prev_index");
    assert_eq!(swapped.action, EventKind::CompareAndSwap);
    assert_eq!(swapped.node.value.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_value_blocks_directory_path() {
    let store = MemoryStore::new();
    store
        .put("/a", Some("leaf".into()), set_opts())
        .await
        .unwrap();
    let err = store
        .put("/a/b", Some("deeper".into()), set_opts())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Store(crate::StoreError::NotDirectory(_))
    ));
}

#[tokio::test]
async fn test_dir_create_conflicts() {
    let store = MemoryStore::new();
    let dir_opts = SetOptions {
        create: Some(true),
        dir: true,
        ..Default::default()
    };
    store.put("/d", None, dir_opts.clone()).await.expect("mkdir");
    let err = store.put("/d", None, dir_opts).await.unwrap_err();
    assert!(err.is_key_already_exists());
}

#[tokio::test]
async fn test_append_generates_ordered_keys() {
    let store = MemoryStore::new();
    let opts = SetOptions {
        append: true,
        ..Default::default()
    };
    let first = store
        .put("/queue", Some("one".into()), opts.clone())
        .await
        .unwrap();
    let second = store
        .put("/queue", Some("two".into()), opts)
        .await
        .unwrap();
    assert_ne!(first.node.key, second.node.key);
    assert!(first.node.key < second.node.key);

    let listing = store.get("/queue", true).await.unwrap();
    assert_eq!(listing.node.nodes.len(), 2);
}

#[tokio::test]
async fn test_delete_semantics() {
    let store = MemoryStore::new();
    store
        .put("/d/inner", Some("v".into()), set_opts())
        .await
        .unwrap();

    let err = store
        .delete("/d", DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Store(crate::StoreError::InvalidRequest(_))
    ));

    let err = store
        .delete(
            "/d/inner",
            DeleteOptions {
                prev_value: Some("other".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_precondition_failed());

    store
        .delete(
            "/d",
            DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .expect("recursive delete");
    assert!(store.get("/d", false).await.unwrap_err().is_key_not_found());

    let err = store
        .delete("/d", DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_key_not_found());
}

#[tokio::test]
async fn test_watch_replays_logged_events() {
    let store = MemoryStore::new();
    store
        .put("/w/a", Some("1".into()), set_opts())
        .await
        .unwrap();
    store
        .put("/w/b", Some("2".into()), set_opts())
        .await
        .unwrap();

    let event = store
        .watch_once("/w", 1, true)
        .await
        .expect("watch")
        .expect("event");
    assert_eq!(event.key, "/w/a");

    let event = store
        .watch_once("/w", event.modified_index + 1, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.key, "/w/b");
}

#[tokio::test]
async fn test_watch_wakes_on_future_write() {
    let store = Arc::new(MemoryStore::new());
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.watch_once("/w", 1, true).await })
    };

    // give the poll a chance to park before writing
    tokio::task::yield_now().await;
    store
        .put("/w/k", Some("v".into()), set_opts())
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("watch should wake")
        .expect("task")
        .expect("watch")
        .expect("event");
    assert_eq!(event.key, "/w/k");
    assert_eq!(event.value.as_deref(), Some("v"));
}

#[tokio::test]
async fn test_watch_filters_by_prefix() {
    let store = Arc::new(MemoryStore::new());
    store
        .put("/other/k", Some("v".into()), set_opts())
        .await
        .unwrap();

    let pending = {
        let store = store.clone();
        tokio::spawn(async move { store.watch_once("/w", 1, true).await })
    };
    tokio::task::yield_now().await;
    // an event outside the prefix must not satisfy the poll
    assert!(!pending.is_finished());
    pending.abort();
}
