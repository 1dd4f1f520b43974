//! Per-handle staging of writes
//!
//! Writes land in whole in-memory pages keyed by block index. Unwritten
//! parts of a page are filled from the handle's base image, never from
//! storage, so a write never waits. Reads overlay dirty pages on the base
//! image, clipped to the buffer's length.

use crate::core::block_store::{DirtyRange, WriteBatch, BLOCK_SIZE};
use std::collections::{BTreeMap, BTreeSet};

type Page = Box<[u8; BLOCK_SIZE]>;

/// Dirty pages of one open file plus its high-water length
#[derive(Debug, Default)]
pub struct DirtyPageBuffer {
    pages: BTreeMap<u64, Page>,
    /// Pages touched since the last drain
    undrained: BTreeSet<u64>,
    length: u64,
}

impl DirtyPageBuffer {
    pub fn new(length: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            undrained: BTreeSet::new(),
            length,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_clean(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    /// Forget staged pages and adopt `length` (used when the handle has
    /// nothing of its own to keep)
    pub fn reset(&mut self, length: u64) {
        self.pages.clear();
        self.undrained.clear();
        self.length = length;
    }

    /// Stage `data` at `offset`
    pub fn write(&mut self, base: &[u8], offset: u64, data: &[u8]) {
        let mut cursor = 0usize;
        while cursor < data.len() {
            let position = offset + cursor as u64;
            let index = position / BLOCK_SIZE as u64;
            let in_page = (position % BLOCK_SIZE as u64) as usize;
            let take = (BLOCK_SIZE - in_page).min(data.len() - cursor);

            let length = self.length;
            let page = self
                .pages
                .entry(index)
                .or_insert_with(|| load_page(base, index, length));
            page[in_page..in_page + take].copy_from_slice(&data[cursor..cursor + take]);
            self.undrained.insert(index);

            cursor += take;
        }
        self.length = self.length.max(offset + data.len() as u64);
    }

    /// Fill `buf` from `offset`; returns the number of bytes that lie
    /// before end of file. The rest of `buf` is zeroed.
    pub fn read(&self, base: &[u8], offset: u64, buf: &mut [u8]) -> usize {
        let available = if offset >= self.length {
            0
        } else {
            ((self.length - offset) as usize).min(buf.len())
        };

        let mut cursor = 0usize;
        while cursor < available {
            let position = offset + cursor as u64;
            let index = position / BLOCK_SIZE as u64;
            let in_page = (position % BLOCK_SIZE as u64) as usize;
            let take = (BLOCK_SIZE - in_page).min(available - cursor);
            let out = &mut buf[cursor..cursor + take];

            match self.pages.get(&index) {
                Some(page) => out.copy_from_slice(&page[in_page..in_page + take]),
                None => copy_from_base(base, position, out),
            }
            cursor += take;
        }

        buf[available..].fill(0);
        available
    }

    /// Shrink or grow to `length`; bytes past it read as zero afterwards
    pub fn truncate(&mut self, length: u64) {
        let keep = length.div_ceil(BLOCK_SIZE as u64);
        self.pages.retain(|&index, _| index < keep);
        self.undrained.retain(|&index| index < keep);

        let tail = (length % BLOCK_SIZE as u64) as usize;
        if tail != 0 && length < self.length {
            if let Some(page) = self.pages.get_mut(&(length / BLOCK_SIZE as u64)) {
                page[tail..].fill(0);
            }
        }
        self.length = length;
    }

    /// Take the pages touched since the last call as a write batch
    pub fn drain_as_write_ranges(&mut self) -> Option<WriteBatch> {
        if self.undrained.is_empty() {
            return None;
        }
        let ranges = std::mem::take(&mut self.undrained)
            .into_iter()
            .filter_map(|index| {
                self.pages.get(&index).map(|page| DirtyRange {
                    offset: index * BLOCK_SIZE as u64,
                    bytes: page.to_vec(),
                })
            })
            .collect();
        Some(WriteBatch {
            ranges,
            new_length: self.length,
        })
    }

    /// Fold staged pages into `image` and discard them
    pub fn fold_into(&mut self, image: &mut Vec<u8>) {
        let length = self.length as usize;
        image.resize(length, 0);
        for (index, page) in std::mem::take(&mut self.pages) {
            let start = index as usize * BLOCK_SIZE;
            if start >= length {
                continue;
            }
            let end = (start + BLOCK_SIZE).min(length);
            image[start..end].copy_from_slice(&page[..end - start]);
        }
        self.undrained.clear();
    }
}

fn load_page(base: &[u8], index: u64, length: u64) -> Page {
    let mut page = Box::new([0u8; BLOCK_SIZE]);
    let start = index * BLOCK_SIZE as u64;
    let limit = (base.len() as u64).min(length);
    if start < limit {
        let end = (start + BLOCK_SIZE as u64).min(limit);
        page[..(end - start) as usize].copy_from_slice(&base[start as usize..end as usize]);
    }
    page
}

fn copy_from_base(base: &[u8], position: u64, out: &mut [u8]) {
    let start = position as usize;
    if start >= base.len() {
        out.fill(0);
        return;
    }
    let end = (start + out.len()).min(base.len());
    out[..end - start].copy_from_slice(&base[start..end]);
    out[end - start..].fill(0);
}
