use std::{
    ops::Range,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use crate::{
    cache::{CacheHandle, CacheSource},
    dm::log_record,
    error::{Error, Result},
    page::PAGE_SIZE,
    page_cache::{PageCache, PageHandle},
    types::{get_u16, put_u16, Address, Xid},
    wal::Wal,
};

//  [valid: u8][size: u16][payload: size]
const VALID_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
pub const HEADER_LEN: usize = 3;

const VALID: u8 = 0;
const INVALID: u8 = 1;

/// Wrap a payload in a valid data item header.
pub fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; HEADER_LEN + payload.len()];
    raw[VALID_OFFSET] = VALID;
    put_u16(&mut raw, SIZE_OFFSET, payload.len() as u16);
    raw[HEADER_LEN..].copy_from_slice(payload);
    raw
}

/// Flag a wrapped item as logically deleted.
pub fn invalidate(raw: &mut [u8]) {
    raw[VALID_OFFSET] = INVALID;
}

/// A resident data item. Holds a pin on the page it lives in.
///
/// All reads take the item's latch shared; [`DataItem::before`] takes it exclusively for the
/// duration of a mutation.
pub struct DataItem {
    address: Address,
    page: PageHandle,
    //  raw bytes within the page, header included
    range: Range<usize>,
    latch: RwLock<()>,
    wal: Arc<Wal>,
}

impl DataItem {
    fn parse(page: PageHandle, address: Address, wal: Arc<Wal>) -> Result<Self> {
        let start = address.offset() as usize;
        if start + HEADER_LEN > PAGE_SIZE {
            return Err(Error::Corrupt(format!("data item at {address} overruns its page")));
        }
        let size = get_u16(&page.read(), start + SIZE_OFFSET) as usize;
        let end = start + HEADER_LEN + size;
        if end > PAGE_SIZE {
            return Err(Error::Corrupt(format!(
                "data item at {address} claims {size} bytes"
            )));
        }
        Ok(Self {
            address,
            page,
            range: start..end,
            latch: RwLock::new(()),
            wal,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.range.len() - HEADER_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid(&self) -> bool {
        let _latch = self.latch.read().unwrap();
        self.page.read()[self.range.start + VALID_OFFSET] == VALID
    }

    fn payload_range(&self) -> Range<usize> {
        self.range.start + HEADER_LEN..self.range.end
    }

    /// Run `f` over the payload with the item latched for reading.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _latch = self.latch.read().unwrap();
        let page = self.page.read();
        f(&page[self.payload_range()])
    }

    pub fn data(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }

    /// Start a mutation: latch the item exclusively, mark its page dirty and snapshot the
    /// current bytes.
    ///
    /// The returned guard must be finished with [`BeforeGuard::after`], which logs the change,
    /// or [`BeforeGuard::cancel_before`], which restores the snapshot. Dropping it unfinished
    /// also restores the snapshot.
    pub fn before(&self) -> BeforeGuard<'_> {
        let latch = self.latch.write().unwrap();
        let old_raw = self.page.write()[self.range.clone()].to_vec();
        BeforeGuard {
            item: self,
            _latch: latch,
            old_raw,
            finished: false,
        }
    }
}

pub struct BeforeGuard<'a> {
    item: &'a DataItem,
    _latch: RwLockWriteGuard<'a, ()>,
    old_raw: Vec<u8>,
    finished: bool,
}

impl BeforeGuard<'_> {
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let page = self.item.page.read();
        f(&page[self.item.payload_range()])
    }

    /// Mutate the payload in place.
    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut page = self.item.page.write();
        f(&mut page[self.item.payload_range()])
    }

    fn restore(&mut self) {
        let mut page = self.item.page.write();
        page[self.item.range.clone()].copy_from_slice(&self.old_raw);
        self.finished = true;
    }

    /// Log the mutation on behalf of `xid` and release the item.
    ///
    /// If the log append fails the snapshot is restored before the error is returned.
    pub fn after(mut self, xid: Xid) -> Result<()> {
        let new_raw = self.item.page.read()[self.item.range.clone()].to_vec();
        let record = log_record::encode_update(xid, self.item.address, &self.old_raw, &new_raw);
        match self.item.wal.log(&record) {
            Ok(()) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                self.restore();
                Err(e)
            }
        }
    }

    /// Undo the mutation without logging it.
    pub fn cancel_before(mut self) {
        self.restore();
    }
}

impl Drop for BeforeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}

/// Loads data items from the pages they live in.
pub struct DataItemSource {
    pages: Arc<PageCache>,
    wal: Arc<Wal>,
}

impl DataItemSource {
    pub fn new(pages: Arc<PageCache>, wal: Arc<Wal>) -> Self {
        Self { pages, wal }
    }
}

impl CacheSource for DataItemSource {
    type Item = DataItem;

    fn load(&self, key: u64) -> Result<Option<DataItem>> {
        let address = Address::from_u64(key);
        let pgno = address.pgno();
        if pgno == 0 || pgno > self.pages.page_count() {
            return Ok(None);
        }
        let page = self.pages.get_page(pgno)?;
        DataItem::parse(page, address, Arc::clone(&self.wal)).map(Some)
    }

    //  the item's page pin goes away when the item itself is dropped
    fn evict(&self, _item: &DataItem) {}
}

pub type DataItemHandle = CacheHandle<DataItemSource>;

#[cfg(test)]
mod data_item_tests {
    use super::*;
    use crate::{
        cache::ReferenceCache,
        dm::log_record::LogRecord,
        file::MemFile,
        page::heap,
    };

    struct Fixture {
        wal: Arc<Wal>,
        pages: Arc<PageCache>,
        items: Arc<ReferenceCache<DataItemSource>>,
    }

    fn fixture() -> Fixture {
        let wal = Arc::new(Wal::create(Arc::new(MemFile::new())).unwrap());
        let pages = Arc::new(PageCache::new(Arc::new(MemFile::new()), 10).unwrap());
        let items = Arc::new(ReferenceCache::new(
            DataItemSource::new(Arc::clone(&pages), Arc::clone(&wal)),
            0,
        ));
        Fixture { wal, pages, items }
    }

    fn place(fixture: &Fixture, payload: &[u8]) -> Address {
        let pgno = fixture.pages.new_page(&heap::init_raw()).unwrap();
        let page = fixture.pages.get_page(pgno).unwrap();
        let offset = heap::insert(&page, &wrap(payload));
        Address::new(pgno, offset)
    }

    fn logged(wal: &Wal) -> Vec<LogRecord> {
        wal.iter()
            .map(|payload| LogRecord::try_from(payload.unwrap().as_slice()).unwrap())
            .collect()
    }

    #[test]
    fn test_wrap() {
        let raw = wrap(b"abc");
        assert_eq!(raw, vec![VALID, 0, 3, b'a', b'b', b'c']);
        let mut raw = raw;
        invalidate(&mut raw);
        assert_eq!(raw[0], INVALID);
    }

    #[test]
    fn test_load_item() {
        let fixture = fixture();
        let address = place(&fixture, b"payload");
        let item = fixture.items.get(address.as_u64()).unwrap().unwrap();
        assert_eq!(item.address(), address);
        assert_eq!(item.len(), 7);
        assert!(item.is_valid());
        assert_eq!(item.data(), b"payload");

        //  addresses on pages that do not exist load nothing
        assert!(fixture
            .items
            .get(Address::new(99, 2).as_u64())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_after_logs_update() {
        let fixture = fixture();
        let address = place(&fixture, b"hello");
        let item = fixture.items.get(address.as_u64()).unwrap().unwrap();

        let mut guard = item.before();
        guard.with_data_mut(|data| data.copy_from_slice(b"HELLO"));
        guard.after(4).unwrap();
        assert_eq!(item.data(), b"HELLO");

        let records = logged(&fixture.wal);
        assert_eq!(
            records,
            vec![LogRecord::Update {
                xid: 4,
                address,
                old_raw: wrap(b"hello"),
                new_raw: wrap(b"HELLO"),
            }]
        );
    }

    #[test]
    fn test_cancel_before_restores() {
        let fixture = fixture();
        let address = place(&fixture, b"keep");
        let item = fixture.items.get(address.as_u64()).unwrap().unwrap();

        let mut guard = item.before();
        guard.with_data_mut(|data| data.fill(0));
        assert_eq!(guard.with_data(|data| data.to_vec()), vec![0; 4]);
        guard.cancel_before();
        assert_eq!(item.data(), b"keep");

        //  an abandoned guard also restores
        {
            let mut guard = item.before();
            guard.with_data_mut(|data| data[0] = b'X');
        }
        assert_eq!(item.data(), b"keep");
        assert!(fixture.wal.is_empty());
    }

    #[test]
    fn test_item_pins_page() {
        let fixture = fixture();
        let address = place(&fixture, b"pin");
        let item = fixture.items.get(address.as_u64()).unwrap().unwrap();
        let (_, misses_before) = fixture.pages.stats();
        let page = fixture.pages.get_page(address.pgno()).unwrap();
        let (_, misses_after) = fixture.pages.stats();
        assert_eq!(misses_before, misses_after);
        drop(page);
        drop(item);
    }

    #[test]
    fn test_corrupt_size() {
        let fixture = fixture();
        let pgno = fixture.pages.new_page(&heap::init_raw()).unwrap();
        {
            let page = fixture.pages.get_page(pgno).unwrap();
            let mut data = page.write();
            let at = PAGE_SIZE - 4;
            put_u16(&mut data, at + SIZE_OFFSET, 100);
        }
        let address = Address::new(pgno, (PAGE_SIZE - 4) as u16);
        assert!(matches!(
            fixture.items.get(address.as_u64()),
            Err(Error::Corrupt(_))
        ));
    }
}
