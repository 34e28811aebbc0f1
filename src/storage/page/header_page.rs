//! Root-record page.
//!
//! Page 0 of the database file stores one record per index: a fixed
//! 32-byte name and the index's current root page id. The tree reads its
//! root from here on open and persists every root change through it.

use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use std::borrow::{Borrow, BorrowMut};

pub const HEADER_PAGE_ID: PageId = PageId(0);

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

pub const HEADER_PAGE_CAPACITY: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

pub struct HeaderPage<B> {
    data: B,
}

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}

fn padded_name(name: &str) -> Option<[u8; NAME_SIZE]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_SIZE {
        return None;
    }
    let mut padded = [0u8; NAME_SIZE];
    padded[..bytes.len()].copy_from_slice(bytes);
    Some(padded)
}

impl<B: Borrow<[u8; PAGE_SIZE]>> HeaderPage<B> {
    pub fn from_data(data: B) -> Self {
        Self { data }
    }

    fn raw(&self) -> &[u8; PAGE_SIZE] {
        self.data.borrow()
    }

    pub fn record_count(&self) -> usize {
        let raw = self.raw();
        u32::from_le_bytes([
            raw[RECORD_COUNT_OFFSET],
            raw[RECORD_COUNT_OFFSET + 1],
            raw[RECORD_COUNT_OFFSET + 2],
            raw[RECORD_COUNT_OFFSET + 3],
        ]) as usize
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        let padded = padded_name(name)?;
        (0..self.record_count()).find(|&i| {
            let offset = record_offset(i);
            self.raw()[offset..offset + NAME_SIZE] == padded
        })
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        self.find_record(name).map(|i| {
            let offset = record_offset(i) + NAME_SIZE;
            let raw = self.raw();
            PageId(i32::from_le_bytes([
                raw[offset],
                raw[offset + 1],
                raw[offset + 2],
                raw[offset + 3],
            ]))
        })
    }
}

impl<B: BorrowMut<[u8; PAGE_SIZE]>> HeaderPage<B> {
    fn raw_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.data.borrow_mut()
    }

    fn set_record_count(&mut self, count: usize) {
        self.raw_mut()[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn write_root_id(&mut self, index: usize, root_id: PageId) {
        let offset = record_offset(index) + NAME_SIZE;
        self.raw_mut()[offset..offset + 4].copy_from_slice(&root_id.0.to_le_bytes());
    }

    /// Add a record. Fails if the name is invalid, already present, or the
    /// page is full.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> bool {
        let Some(padded) = padded_name(name) else {
            return false;
        };
        if self.find_record(name).is_some() {
            return false;
        }

        let count = self.record_count();
        if count >= HEADER_PAGE_CAPACITY {
            return false;
        }

        let offset = record_offset(count);
        self.raw_mut()[offset..offset + NAME_SIZE].copy_from_slice(&padded);
        self.write_root_id(count, root_id);
        self.set_record_count(count + 1);
        true
    }

    /// Rewrite an existing record's root id. Fails if absent.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> bool {
        match self.find_record(name) {
            Some(index) => {
                self.write_root_id(index, root_id);
                true
            }
            None => false,
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find_record(name) else {
            return false;
        };

        let count = self.record_count();
        self.raw_mut()
            .copy_within(record_offset(index + 1)..record_offset(count), record_offset(index));
        self.set_record_count(count - 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::INVALID_PAGE_ID;

    #[test]
    fn test_insert_and_get() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::from_data(&mut data);

        assert_eq!(page.record_count(), 0);
        assert!(page.insert_record("orders_pk", PageId(3)));
        assert!(page.insert_record("users_pk", PageId(7)));
        assert_eq!(page.record_count(), 2);

        assert_eq!(page.get_root_id("orders_pk"), Some(PageId(3)));
        assert_eq!(page.get_root_id("users_pk"), Some(PageId(7)));
        assert_eq!(page.get_root_id("missing"), None);
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::from_data(&mut data);

        assert!(page.insert_record("idx", PageId(1)));
        assert!(!page.insert_record("idx", PageId(2)));
        assert_eq!(page.get_root_id("idx"), Some(PageId(1)));
    }

    #[test]
    fn test_update_record() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::from_data(&mut data);

        assert!(!page.update_record("idx", PageId(5)));
        assert!(page.insert_record("idx", PageId(5)));
        assert!(page.update_record("idx", INVALID_PAGE_ID));
        assert_eq!(page.get_root_id("idx"), Some(INVALID_PAGE_ID));
    }

    #[test]
    fn test_delete_record() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::from_data(&mut data);

        page.insert_record("a", PageId(1));
        page.insert_record("b", PageId(2));
        page.insert_record("c", PageId(3));

        assert!(page.delete_record("b"));
        assert!(!page.delete_record("b"));
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_root_id("a"), Some(PageId(1)));
        assert_eq!(page.get_root_id("c"), Some(PageId(3)));
    }

    #[test]
    fn test_invalid_names() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::from_data(&mut data);

        assert!(!page.insert_record("", PageId(1)));
        let long = "x".repeat(NAME_SIZE + 1);
        assert!(!page.insert_record(&long, PageId(1)));
    }
}
