//! Data manager: turns the page file into addressable, logged data items.
//!
//! Callers insert opaque byte payloads under a transaction id and get back an [`Address`].
//! Reads go through a reference-counted cache of [`DataItem`]s, each pinning its page.
//! Mutating an item follows the before/after protocol in [`DataItem::before`], which writes an
//! update record to the log before the change can reach disk. Recovery after an unclean
//! shutdown lives in [`recovery`].

pub mod data_item;
pub mod log_record;
pub mod recovery;

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

pub use data_item::{BeforeGuard, DataItem, DataItemHandle};
pub use recovery::{recover, RecoveryReport};

use crate::{
    cache::ReferenceCache,
    error::{Error, Result},
    file::StorageFile,
    free_space::FreeSpaceIndex,
    page::{heap, meta},
    page_cache::{PageCache, PageHandle},
    tm::TransactionTable,
    types::{Address, Pgno, Xid},
    wal::Wal,
};

use data_item::DataItemSource;

/// Attempts to find or allocate a page with room before giving up with [`Error::Busy`].
const MAX_SELECT_ATTEMPTS: usize = 5;

/// Largest payload a single data item can hold.
pub const fn max_payload() -> usize {
    heap::max_free_space() - data_item::HEADER_LEN
}

pub struct DataManager {
    pages: Arc<PageCache>,
    wal: Arc<Wal>,
    free_space: FreeSpaceIndex,
    items: Arc<ReferenceCache<DataItemSource>>,
    //  pinned for the whole session; released on close
    page_one: Mutex<Option<PageHandle>>,
    recovery: Option<RecoveryReport>,
}

impl DataManager {
    fn new(
        pages: PageCache,
        wal: Wal,
        page_one: PageHandle,
        recovery: Option<RecoveryReport>,
    ) -> Self {
        let pages = Arc::new(pages);
        let wal = Arc::new(wal);
        let items = Arc::new(ReferenceCache::new(
            DataItemSource::new(Arc::clone(&pages), Arc::clone(&wal)),
            0,
        ));
        Self {
            pages,
            wal,
            free_space: FreeSpaceIndex::new(),
            items,
            page_one: Mutex::new(Some(page_one)),
            recovery,
        }
    }

    /// Start a fresh data file and log. Anything already in them is discarded.
    pub fn create(
        data: Arc<dyn StorageFile>,
        log: Arc<dyn StorageFile>,
        cache_pages: usize,
    ) -> Result<Self> {
        data.set_len(0)?;
        let pages = PageCache::new(data, cache_pages)?;
        let wal = Wal::create(log)?;

        let pgno = pages.new_page(&meta::init_raw())?;
        assert_eq!(pgno, 1, "fresh data file must start at page 1");
        let page_one = pages.get_page(pgno)?;
        pages.flush_page(&page_one)?;
        info!(cache_pages, "created data manager");
        Ok(Self::new(pages, wal, page_one, None))
    }

    /// Open an existing data file and log, recovering first if the last session crashed.
    pub fn open(
        data: Arc<dyn StorageFile>,
        log: Arc<dyn StorageFile>,
        cache_pages: usize,
        tm: &TransactionTable,
    ) -> Result<Self> {
        let pages = PageCache::new(data, cache_pages)?;
        let wal = Wal::open(log)?;
        if pages.page_count() == 0 {
            return Err(Error::CorruptFile("data file has no first page".to_string()));
        }

        let page_one = pages.get_page(1)?;
        let recovery = if meta::check_vc(&page_one) {
            None
        } else {
            info!("last shutdown was unclean");
            Some(recover(tm, &wal, &pages)?)
        };

        let dm = Self::new(pages, wal, page_one, recovery);
        dm.fill_free_space()?;

        let page_one = dm.page_one.lock().unwrap();
        if let Some(page) = page_one.as_ref() {
            meta::set_vc_open(page);
            dm.pages.flush_page(page)?;
        }
        drop(page_one);
        info!(pages = dm.pages.page_count(), "opened data manager");
        Ok(dm)
    }

    fn fill_free_space(&self) -> Result<()> {
        for pgno in 2..=self.pages.page_count() {
            let page = self.pages.get_page(pgno)?;
            self.free_space.add(pgno, heap::free_space(&page));
        }
        Ok(())
    }

    /// Store `payload` as a new data item on behalf of `xid`.
    pub fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Address> {
        let raw = data_item::wrap(payload);
        if raw.len() > heap::max_free_space() {
            return Err(Error::DataTooLarge {
                size: payload.len(),
                max: max_payload(),
            });
        }

        let mut checkout = None;
        for _ in 0..MAX_SELECT_ATTEMPTS {
            if let Some(selected) = self.free_space.select(raw.len()) {
                checkout = Some(selected);
                break;
            }
            //  another thread may take the new page before we select again
            let pgno = self.pages.new_page(&heap::init_raw())?;
            self.free_space.add(pgno, heap::max_free_space());
        }
        let mut checkout = checkout.ok_or(Error::Busy)?;
        let pgno = checkout.pgno();

        let page = self.pages.get_page(pgno)?;
        let free = heap::free_space(&page);
        if free < raw.len() {
            checkout.set_free(free);
            return Err(Error::Corrupt(format!(
                "page {pgno} has {free} free bytes, selected for {}",
                raw.len()
            )));
        }
        let offset = heap::fso(&page);
        self.wal
            .log(&log_record::encode_insert(xid, pgno, offset, &raw))?;
        let inserted = heap::insert(&page, &raw);
        debug_assert_eq!(inserted, offset);
        checkout.set_free(heap::free_space(&page));
        Ok(Address::new(pgno, inserted))
    }

    /// The data item at `address`, or `None` if nothing valid lives there.
    pub fn read(&self, address: Address) -> Result<Option<DataItemHandle>> {
        let Some(item) = self.items.get(address.as_u64())? else {
            return Ok(None);
        };
        if !item.is_valid() {
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Report of the recovery run during open, if one was needed.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn page_count(&self) -> Pgno {
        self.pages.page_count()
    }

    /// Page cache `(hits, misses)`.
    pub fn page_stats(&self) -> (usize, usize) {
        self.pages.stats()
    }

    /// Flush everything and mark the shutdown clean. Outstanding handles must be dropped first.
    pub fn close(&self) -> Result<()> {
        self.items.close();
        self.wal.close()?;
        if let Some(page_one) = self.page_one.lock().unwrap().take() {
            meta::set_vc_close(&page_one);
        }
        self.pages.close()?;
        debug!("closed data manager");
        Ok(())
    }
}
