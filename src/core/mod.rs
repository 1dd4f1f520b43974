//! Core building blocks of the adapter

pub mod block_store;
pub mod dirty;
pub mod file_table;
pub mod lock;
pub mod queue;
pub mod vfs;
