use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::DeleteOptions;
use crate::store::EventKind;
use crate::store::KvApi;
use crate::store::KvNode;
use crate::store::KvResponse;
use crate::store::MemoryStore;
use crate::store::MockKvApi;
use crate::store::SetOptions;
use crate::store::WatchEvent;
use crate::test_utils::memory_connection;
use crate::test_utils::settings;
use crate::tree::MirrorNode;
use crate::tree::TreeOptions;
use crate::tree::TypeRegistry;
use crate::Connection;
use crate::Error;
use crate::Result;
use crate::StoreError;

fn dir_response(key: &str, index: u64) -> KvResponse {
    KvResponse {
        action: EventKind::Get,
        node: KvNode {
            key: key.to_string(),
            value: None,
            dir: true,
            modified_index: index,
            created_index: index,
            nodes: Vec::new(),
        },
        store_index: index,
    }
}

fn value_response(key: &str, value: &str, index: u64) -> KvResponse {
    KvResponse {
        action: EventKind::Get,
        node: KvNode {
            key: key.to_string(),
            value: Some(value.to_string()),
            dir: false,
            modified_index: index,
            created_index: index,
            nodes: Vec::new(),
        },
        store_index: index,
    }
}

fn registry() -> Arc<TypeRegistry> {
    Arc::new(TypeRegistry::new())
}

#[tokio::test]
async fn test_get_retries_transient_failures() {
    let mut store = MockKvApi::new();
    store
        .expect_get()
        .withf(|key, _| key == "/app")
        .returning(|_, _| Ok(dir_response("/app", 1)));
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        store
            .expect_get()
            .withf(|key, _| key == "/app/k")
            .returning(move |_, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::ConnectionFailed("flaky".into()).into())
                } else {
                    Ok(value_response("/app/k", "v", 2))
                }
            });
    }

    let conn = Connection::connect(Arc::new(store), settings("/app"))
        .await
        .expect("connect");
    let res = conn.get("/k").await.expect("get after retries");
    assert_eq!(res.node.value.as_deref(), Some("v"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_bound_is_exhausted() {
    let mut store = MockKvApi::new();
    store
        .expect_get()
        .withf(|key, _| key == "/app")
        .returning(|_, _| Ok(dir_response("/app", 1)));
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        store
            .expect_get()
            .withf(|key, _| key == "/app/k")
            .returning(move |_, _| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::ConnectionFailed("down".into()).into())
            });
    }

    let conn = Connection::connect(Arc::new(store), settings("/app"))
        .await
        .expect("connect");
    let err = conn.get("/k").await.unwrap_err();
    assert!(err.is_connection_failed());
    // the original attempt plus the configured five retries
    assert_eq!(attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_non_transient_errors_are_not_retried() {
    let mut store = MockKvApi::new();
    store
        .expect_get()
        .withf(|key, _| key == "/app")
        .returning(|_, _| Ok(dir_response("/app", 1)));
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        store
            .expect_get()
            .withf(|key, _| key == "/app/k")
            .returning(move |_, _| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::KeyNotFound("/app/k".into()).into())
            });
    }

    let conn = Connection::connect(Arc::new(store), settings("/app"))
        .await
        .expect("connect");
    let err = conn.get("/k").await.unwrap_err();
    assert!(err.is_key_not_found());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_creates_missing_root() {
    let (store, conn) = memory_connection("/app").await;
    let res = store.get("/app", false).await.expect("root exists");
    assert!(res.node.dir);
    assert!(conn.last_modified() >= res.node.modified_index);
    conn.close().expect("close");
}

#[tokio::test]
async fn test_malformed_keys_are_rejected_locally() {
    let (_store, conn) = memory_connection("/app").await;
    for key in ["no-slash", "/trailing/", "/a//b"] {
        let err = conn.get(key).await.unwrap_err();
        assert!(
            matches!(err, Error::Store(StoreError::InvalidRequest(_))),
            "{key:?} should be rejected"
        );
    }
    // the empty key and "/" both address the root itself
    assert!(conn.get("").await.expect("root").node.dir);
    assert!(conn.get("/").await.expect("root").node.dir);
}

#[tokio::test]
async fn test_conflicting_set_options_are_rejected_locally() {
    let (store, conn) = memory_connection("/app").await;
    let before = store.index();

    let err = conn
        .set(
            "/q",
            Some("v".into()),
            SetOptions {
                append: true,
                prev_value: Some("old".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::InvalidRequest(_))));

    let err = conn
        .set(
            "/k",
            Some("v".into()),
            SetOptions {
                create: Some(true),
                prev_index: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::InvalidRequest(_))));

    // rejected before reaching the store
    assert_eq!(store.index(), before);
}

#[tokio::test]
async fn test_crud_roundtrip_advances_last_modified() {
    let (_store, conn) = memory_connection("/app").await;
    let after_connect = conn.last_modified();

    let set = conn
        .set("/k", Some("v".into()), SetOptions::default())
        .await
        .expect("set");
    assert!(set.node.modified_index > after_connect);
    assert_eq!(conn.last_modified(), set.node.modified_index);

    let got = conn.get("/k").await.expect("get");
    assert_eq!(got.node.value.as_deref(), Some("v"));

    let deleted = conn
        .delete("/k", DeleteOptions::default())
        .await
        .expect("delete");
    assert_eq!(conn.last_modified(), deleted.node.modified_index);
    assert!(conn.get("/k").await.unwrap_err().is_key_not_found());
}

#[tokio::test]
async fn test_tree_creates_missing_directory() {
    let (store, conn) = memory_connection("/app").await;
    let tree = conn
        .tree("/cfg", registry(), TreeOptions::default())
        .await
        .expect("tree");
    assert!(store.get("/app/cfg", false).await.expect("created").node.dir);
    tree.close().await;
    conn.close().expect("close");
}

#[tokio::test]
async fn test_tree_create_guards() {
    let (_store, conn) = memory_connection("/app").await;
    let err = conn
        .tree(
            "/absent",
            registry(),
            TreeOptions {
                create: Some(false),
                static_tree: true,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_key_not_found());

    let tree = conn
        .tree(
            "/cfg",
            registry(),
            TreeOptions {
                create: Some(true),
                static_tree: true,
            },
        )
        .await
        .expect("fresh create");
    drop(tree);

    let err = conn
        .tree(
            "/cfg",
            registry(),
            TreeOptions {
                create: Some(true),
                static_tree: true,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_key_already_exists());
    conn.close().expect("close");
}

/// Delegates to a real store but reports the target key missing on the
/// first read, forcing the caller down the lost-create-race path.
struct NotFoundOnce {
    inner: Arc<MemoryStore>,
    key: String,
    armed: AtomicBool,
}

#[async_trait]
impl KvApi for NotFoundOnce {
    async fn get(&self, key: &str, recursive: bool) -> Result<KvResponse> {
        if key == self.key && self.armed.swap(false, Ordering::SeqCst) {
            return Err(StoreError::KeyNotFound(key.to_string()).into());
        }
        self.inner.get(key, recursive).await
    }

    async fn put(&self, key: &str, value: Option<String>, opts: SetOptions) -> Result<KvResponse> {
        self.inner.put(key, value, opts).await
    }

    async fn delete(&self, key: &str, opts: DeleteOptions) -> Result<KvResponse> {
        self.inner.delete(key, opts).await
    }

    async fn watch_once(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
    ) -> Result<Option<WatchEvent>> {
        self.inner.watch_once(key, wait_index, recursive).await
    }
}

#[tokio::test]
async fn test_tree_survives_losing_the_create_race() {
    let inner = Arc::new(MemoryStore::new());
    inner
        .put(
            "/app/cfg/port",
            Some("8080".into()),
            SetOptions::default(),
        )
        .await
        .expect("seed");
    let store = Arc::new(NotFoundOnce {
        inner,
        key: "/app/cfg".to_string(),
        armed: AtomicBool::new(true),
    });

    let conn = Connection::connect(store, settings("/app"))
        .await
        .expect("connect");
    // read sees "not found", create loses to the existing directory, the
    // final read attaches to it
    let tree = conn
        .tree(
            "/cfg",
            registry(),
            TreeOptions {
                static_tree: true,
                ..Default::default()
            },
        )
        .await
        .expect("tree despite lost race");
    assert!(tree.root().child("port").is_some());
    conn.close().expect("close");
}

#[tokio::test]
async fn test_close_refuses_while_trees_are_open() {
    let (_store, conn) = memory_connection("/app").await;
    let tree = conn
        .tree("/cfg", registry(), TreeOptions::default())
        .await
        .expect("tree");
    assert_eq!(conn.open_trees(), 1);
    assert!(matches!(conn.close().unwrap_err(), Error::OpenTrees(1)));

    tree.close().await;
    assert_eq!(conn.open_trees(), 0);
    conn.close().expect("close after trees are gone");
}

#[tokio::test]
async fn test_static_tree_is_not_registered() {
    let (_store, conn) = memory_connection("/app").await;
    let tree = conn
        .tree(
            "/cfg",
            registry(),
            TreeOptions {
                static_tree: true,
                ..Default::default()
            },
        )
        .await
        .expect("tree");
    assert!(tree.watcher().is_none());
    assert_eq!(conn.open_trees(), 0);
    conn.close().expect("close");
}
