#![no_main]
use blockvfs::{BlockStore, MemoryBlockStore, OpenFlags, VfsAdapter, VfsConfig, VfsFile};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { offset: u16, data: Vec<u8> },
    Truncate { length: u16 },
    Sync,
    Reopen,
}

// Whatever the op sequence, the store ends up with exactly what was written
fuzz_target!(|ops: Vec<FileOp>| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    rt.block_on(async {
        let store = Arc::new(MemoryBlockStore::new());
        let adapter = VfsAdapter::mount(store.clone(), VfsConfig::default())
            .await
            .unwrap();
        let mut file = adapter.open("/fuzz.db", OpenFlags::create()).unwrap();
        let mut model: Vec<u8> = Vec::new();

        for op in ops.into_iter().take(32) {
            match op {
                FileOp::Write { offset, data } => {
                    let end = offset as usize + data.len();
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[offset as usize..end].copy_from_slice(&data);
                    file.write(&data, offset as u64).unwrap();
                }
                FileOp::Truncate { length } => {
                    model.resize(length as usize, 0);
                    file.truncate(length as u64).unwrap();
                }
                FileOp::Sync => file.sync().unwrap().wait().await.unwrap(),
                FileOp::Reopen => {
                    file.close().unwrap();
                    file = adapter.open("/fuzz.db", OpenFlags::existing()).unwrap();
                }
            }
        }

        file.close().unwrap().wait().await.unwrap();
        adapter.flush().await.unwrap();
        let files = store.list_files().await.unwrap();
        assert_eq!(store.read_file(files["/fuzz.db"]).await.unwrap(), model);
    });
});
