//! SQLite databases kept in a SqliteBlockStore on disk
//!
//! The engine talks to the registered VFS; the blocks end up in a second,
//! ordinary SQLite file managed by the store.

use blockvfs::{
    register_vfs, unregister_vfs, BlockStore, SqliteBlockStore, StoreConfig, VfsAdapter, VfsConfig,
};
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tempfile::TempDir;

fn open_db(vfs_name: &str, path: &str) -> Connection {
    Connection::open_with_flags(
        format!("file:{}?vfs={}", path, vfs_name),
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap()
}

async fn mount(dir: &TempDir, vfs_name: &str) -> VfsAdapter {
    let config = VfsConfig::default()
        .with_name(vfs_name)
        .with_store(StoreConfig::Sqlite {
            path: dir.path().join("blocks.sqlite"),
        });
    let adapter = VfsAdapter::from_config(config).await.unwrap();
    register_vfs(vfs_name, Arc::new(adapter.clone()), false).unwrap();
    adapter
}

async fn unmount(adapter: VfsAdapter, vfs_name: &str) {
    unregister_vfs(vfs_name).unwrap();
    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_database_survives_reopen_of_store() {
    let dir = TempDir::new().unwrap();

    {
        let adapter = mount(&dir, "blockvfs-it-reopen-1").await;
        let conn = open_db("blockvfs-it-reopen-1", "/orders.db");
        conn.execute(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT NOT NULL, qty INTEGER)",
            [],
        )
        .unwrap();
        for i in 0..200 {
            conn.execute(
                "INSERT INTO orders (item, qty) VALUES (?1, ?2)",
                params![format!("item-{}", i), i],
            )
            .unwrap();
        }
        drop(conn);
        unmount(adapter, "blockvfs-it-reopen-1").await;
    }

    let adapter = mount(&dir, "blockvfs-it-reopen-2").await;
    let conn = open_db("blockvfs-it-reopen-2", "/orders.db");
    let (count, total): (i64, i64) = conn
        .query_row("SELECT COUNT(*), SUM(qty) FROM orders", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(count, 200);
    assert_eq!(total, (0..200).sum::<i64>());
    drop(conn);
    unmount(adapter, "blockvfs-it-reopen-2").await;
}

#[tokio::test]
async fn test_store_holds_blocks_of_database() {
    let dir = TempDir::new().unwrap();
    let adapter = mount(&dir, "blockvfs-it-blocks").await;

    let conn = open_db("blockvfs-it-blocks", "/blob.db");
    conn.execute("CREATE TABLE blobs (data BLOB)", []).unwrap();
    conn.execute("INSERT INTO blobs VALUES (?1)", params![vec![7u8; 64 * 1024]])
        .unwrap();
    drop(conn);
    adapter.flush().await.unwrap();

    let length = adapter
        .list()
        .into_iter()
        .find(|(name, _)| name == "/blob.db")
        .map(|(_, length)| length)
        .unwrap();
    assert!(length > 64 * 1024);
    unmount(adapter, "blockvfs-it-blocks").await;

    // Inspect the store directly, bypassing the VFS
    let store = SqliteBlockStore::open(dir.path().join("blocks.sqlite")).unwrap();
    let files = store.list_files().await.unwrap();
    let id = files["/blob.db"];
    assert_eq!(store.file_length(id).await.unwrap(), length);
    let content = store.read_file(id).await.unwrap();
    assert_eq!(&content[0..16], b"SQLite format 3\0");
}

#[tokio::test]
async fn test_drop_table_shrinks_after_vacuum() {
    let dir = TempDir::new().unwrap();
    let adapter = mount(&dir, "blockvfs-it-vacuum").await;

    let conn = open_db("blockvfs-it-vacuum", "/shrink.db");
    conn.execute("CREATE TABLE big (data BLOB)", []).unwrap();
    for _ in 0..16 {
        conn.execute("INSERT INTO big VALUES (?1)", params![vec![1u8; 16 * 1024]])
            .unwrap();
    }
    drop(conn);
    adapter.flush().await.unwrap();
    let before = adapter.list()[0].1;

    let conn = open_db("blockvfs-it-vacuum", "/shrink.db");
    conn.execute_batch("DROP TABLE big; VACUUM;").unwrap();
    drop(conn);
    adapter.flush().await.unwrap();
    let after = adapter.list()[0].1;
    assert!(after < before, "{} should be smaller than {}", after, before);

    let files = adapter.store().list_files().await.unwrap();
    let durable = adapter.store().file_length(files["/shrink.db"]).await.unwrap();
    assert_eq!(durable, after);

    unmount(adapter, "blockvfs-it-vacuum").await;
}
