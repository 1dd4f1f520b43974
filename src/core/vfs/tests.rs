//! SQLite end-to-end tests through the registered VFS

use super::{register_vfs, unregister_vfs, MemoryVfsAdapter, Vfs, VfsAdapter};
use crate::config::VfsConfig;
use crate::core::block_store::{BlockStore, MemoryBlockStore};
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;

fn open_db(vfs_name: &str, path: &str) -> Connection {
    Connection::open_with_flags(
        format!("file:{}?vfs={}", path, vfs_name),
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap()
}

async fn mount(store: &Arc<MemoryBlockStore>, name: &str) -> VfsAdapter {
    let config = VfsConfig::default().with_name(name);
    let adapter = VfsAdapter::mount(store.clone(), config).await.unwrap();
    register_vfs(name, Arc::new(adapter.clone()), false).unwrap();
    adapter
}

#[tokio::test]
async fn test_vfs_create_table_and_query() {
    let store = Arc::new(MemoryBlockStore::new());
    let adapter = mount(&store, "blockvfs-test-query").await;

    let conn = open_db("blockvfs-test-query", "/app.db");
    conn.execute(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE
        )",
        [],
    )
    .unwrap();
    for (name, email) in [
        ("Alice", "alice@example.com"),
        ("Bob", "bob@example.com"),
        ("Charlie", "charlie@example.com"),
    ] {
        conn.execute(
            "INSERT INTO users (name, email) VALUES (?1, ?2)",
            params![name, email],
        )
        .unwrap();
    }

    conn.execute("DELETE FROM users WHERE name = ?1", params!["Bob"])
        .unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
    drop(conn);

    adapter.flush().await.unwrap();
    let files = store.list_files().await.unwrap();
    let content = store.read_file(files["/app.db"]).await.unwrap();
    assert_eq!(&content[0..16], b"SQLite format 3\0");
    // The rollback journal was deleted at commit and never reached the store
    assert!(!files.contains_key("/app.db-journal"));

    unregister_vfs("blockvfs-test-query").unwrap();
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_vfs_persistence_across_mounts() {
    let store = Arc::new(MemoryBlockStore::new());

    {
        let adapter = mount(&store, "blockvfs-test-persist-1").await;
        let conn = open_db("blockvfs-test-persist-1", "/persist.db");
        conn.execute(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price REAL)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO products (name, price) VALUES ('Widget', 19.99), ('Gadget', 29.99)",
            [],
        )
        .unwrap();
        conn.close().unwrap();

        adapter.flush().await.unwrap();
        unregister_vfs("blockvfs-test-persist-1").unwrap();
        adapter.shutdown().await.unwrap();
    }

    let adapter = mount(&store, "blockvfs-test-persist-2").await;
    let conn = open_db("blockvfs-test-persist-2", "/persist.db");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
    let total: f64 = conn
        .query_row("SELECT SUM(price) FROM products", [], |row| row.get(0))
        .unwrap();
    assert!((total - 49.98).abs() < 0.01);
    drop(conn);

    unregister_vfs("blockvfs-test-persist-2").unwrap();
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_vfs_transactions() {
    let store = Arc::new(MemoryBlockStore::new());
    let adapter = mount(&store, "blockvfs-test-txn").await;

    let mut conn = open_db("blockvfs-test-txn", "/txn.db");
    conn.execute(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance REAL)",
        [],
    )
    .unwrap();
    conn.execute("INSERT INTO accounts (balance) VALUES (100.0)", [])
        .unwrap();

    {
        let tx = conn.transaction().unwrap();
        tx.execute("UPDATE accounts SET balance = balance - 50.0 WHERE id = 1", [])
            .unwrap();
        tx.commit().unwrap();
    }
    {
        let tx = conn.transaction().unwrap();
        tx.execute("UPDATE accounts SET balance = balance - 100.0 WHERE id = 1", [])
            .unwrap();
        // Rolled back on drop
    }

    let balance: f64 = conn
        .query_row("SELECT balance FROM accounts WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(balance, 50.0);
    drop(conn);

    unregister_vfs("blockvfs-test-txn").unwrap();
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_vfs_two_connections_see_each_other() {
    let store = Arc::new(MemoryBlockStore::new());
    let adapter = mount(&store, "blockvfs-test-two-conns").await;

    let writer = open_db("blockvfs-test-two-conns", "/shared.db");
    let reader = open_db("blockvfs-test-two-conns", "/shared.db");

    writer
        .execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)", [])
        .unwrap();
    writer
        .execute("INSERT INTO kv VALUES ('a', '1')", [])
        .unwrap();

    let v: String = reader
        .query_row("SELECT v FROM kv WHERE k = 'a'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(v, "1");

    drop(reader);
    drop(writer);
    unregister_vfs("blockvfs-test-two-conns").unwrap();
    adapter.shutdown().await.unwrap();
}

#[test]
fn test_memory_vfs_with_sqlite() {
    let vfs = MemoryVfsAdapter::new();
    register_vfs("blockvfs-test-memory", Arc::new(vfs.clone()), false).unwrap();

    let conn = open_db("blockvfs-test-memory", "/scratch.db");
    conn.execute_batch(
        "CREATE TABLE t (x INTEGER);
         INSERT INTO t VALUES (1), (2), (3);",
    )
    .unwrap();
    let sum: i64 = conn
        .query_row("SELECT SUM(x) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(sum, 6);
    drop(conn);

    assert!(vfs.access("/scratch.db"));
    assert!(!vfs.access("/scratch.db-journal"));

    unregister_vfs("blockvfs-test-memory").unwrap();
}

#[test]
fn test_full_pathname_normalizes() {
    let vfs = MemoryVfsAdapter::new();
    assert_eq!(vfs.full_pathname("a/./b/../c.db").unwrap(), "/a/c.db");
    assert_eq!(vfs.full_pathname("//x.db").unwrap(), "/x.db");
}
