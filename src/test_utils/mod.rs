//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::Connection;
use crate::ConnectionConfig;
use crate::MemoryStore;
use crate::Settings;

pub fn settings(root: &str) -> Settings {
    Settings {
        connection: ConnectionConfig {
            root: root.to_string(),
        },
        ..Default::default()
    }
}

/// An in-process store plus a connection rooted at `root`.
pub async fn memory_connection(root: &str) -> (Arc<MemoryStore>, Arc<Connection>) {
    let store = Arc::new(MemoryStore::new());
    let conn = Connection::connect(store.clone(), settings(root))
        .await
        .expect("connect");
    (store, conn)
}
