use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::types::{get_u16, put_u16, Pgno};

// Compile-time fixed page size, selected via Cargo features.
// A smaller explicit size wins over the default `page-8k`.
#[cfg(feature = "page-4k")]
pub const PAGE_SIZE: usize = 4096;
#[cfg(all(feature = "page-16k", not(feature = "page-4k")))]
pub const PAGE_SIZE: usize = 16 * 1024;
#[cfg(all(
    feature = "page-8k",
    not(any(feature = "page-4k", feature = "page-16k"))
))]
pub const PAGE_SIZE: usize = 8192;

#[cfg(not(any(feature = "page-4k", feature = "page-8k", feature = "page-16k")))]
compile_error!(
    "One of `page-4k`, `page-8k`, or `page-16k` features must be enabled to select a page size."
);

/// A cached copy of one page of the data file.
///
/// The bytes sit behind their own latch. Taking the write side through [`Page::write`] marks
/// the page dirty, so the page cache flushes it when the last handle is released.
#[derive(Debug)]
pub struct Page {
    pgno: Pgno,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(pgno: Pgno, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), PAGE_SIZE, "page {pgno} has the wrong size");
        Self {
            pgno,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap()
    }

    /// Latch the page for writing and mark it dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        let guard = self.data.write().unwrap();
        self.dirty.store(true, Ordering::Release);
        guard
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// Page 1: holds the validity check used to detect an unclean shutdown.
///
/// Every open writes fresh random bytes at [`VC_OFFSET`]; a clean close copies them to the
/// following 8 bytes. Mismatching halves on open mean the previous session crashed.
pub mod meta {
    use rand::RngCore;

    use super::{Page, PAGE_SIZE};

    pub const VC_OFFSET: usize = 100;
    pub const VC_LEN: usize = 8;

    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        set_vc_open_raw(&mut raw);
        raw
    }

    fn set_vc_open_raw(raw: &mut [u8]) {
        rand::thread_rng().fill_bytes(&mut raw[VC_OFFSET..VC_OFFSET + VC_LEN]);
    }

    fn set_vc_close_raw(raw: &mut [u8]) {
        raw.copy_within(VC_OFFSET..VC_OFFSET + VC_LEN, VC_OFFSET + VC_LEN);
    }

    fn check_vc_raw(raw: &[u8]) -> bool {
        raw[VC_OFFSET..VC_OFFSET + VC_LEN] == raw[VC_OFFSET + VC_LEN..VC_OFFSET + 2 * VC_LEN]
    }

    pub fn set_vc_open(page: &Page) {
        set_vc_open_raw(&mut page.write());
    }

    pub fn set_vc_close(page: &Page) {
        set_vc_close_raw(&mut page.write());
    }

    pub fn check_vc(page: &Page) -> bool {
        check_vc_raw(&page.read())
    }
}

/// Ordinary pages: `[free space offset: u16][data...]`.
///
/// Data items are appended at the free space offset and never moved.
pub mod heap {
    use super::{get_u16, put_u16, Page, PAGE_SIZE};

    const FSO_OFFSET: usize = 0;
    pub const DATA_OFFSET: usize = 2;

    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        put_u16(&mut raw, FSO_OFFSET, DATA_OFFSET as u16);
        raw
    }

    pub const fn max_free_space() -> usize {
        PAGE_SIZE - DATA_OFFSET
    }

    pub fn fso_raw(raw: &[u8]) -> u16 {
        get_u16(raw, FSO_OFFSET)
    }

    pub fn fso(page: &Page) -> u16 {
        fso_raw(&page.read())
    }

    pub fn free_space(page: &Page) -> usize {
        PAGE_SIZE - fso(page) as usize
    }

    /// Append `raw` at the free space offset and return where it landed.
    pub fn insert(page: &Page, raw: &[u8]) -> u16 {
        let mut data = page.write();
        let offset = fso_raw(&data);
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
        put_u16(&mut data, FSO_OFFSET, offset + raw.len() as u16);
        offset
    }

    /// Replay an insert at a known offset, widening the free space offset if needed.
    pub fn recover_insert(page: &Page, offset: u16, raw: &[u8]) {
        let mut data = page.write();
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if end > fso_raw(&data) {
            put_u16(&mut data, FSO_OFFSET, end);
        }
    }

    /// Overwrite bytes in place.
    pub fn recover_update(page: &Page, offset: u16, raw: &[u8]) {
        let mut data = page.write();
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
    }
}
