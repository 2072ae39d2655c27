use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tracing::{debug, error};

use crate::{
    cache::{CacheHandle, CacheSource, ReferenceCache},
    config::MIN_CACHE_PAGES,
    error::{Error, Result},
    file::StorageFile,
    page::{Page, PAGE_SIZE},
    types::Pgno,
};

/// A pinned page. The page stays resident until every handle is dropped.
pub type PageHandle = CacheHandle<PageSource>;

fn page_offset(pgno: Pgno) -> u64 {
    (pgno as u64 - 1) * PAGE_SIZE as u64
}

/// Reads pages from, and flushes dirty pages back to, the data file.
pub struct PageSource {
    file: Arc<dyn StorageFile>,
    page_count: Arc<AtomicU32>,
}

impl PageSource {
    fn flush(&self, page: &Page) -> Result<()> {
        let data = page.read();
        page.clear_dirty();
        self.file.write_at(page_offset(page.pgno()), &data)?;
        self.file.sync()?;
        Ok(())
    }
}

impl CacheSource for PageSource {
    type Item = Page;

    fn load(&self, pgno: u64) -> Result<Option<Page>> {
        if pgno == 0 || pgno > self.page_count.load(Ordering::Acquire) as u64 {
            return Ok(None);
        }
        let pgno = pgno as Pgno;
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.read_at(page_offset(pgno), &mut buf)?;
        Ok(Some(Page::new(pgno, buf)))
    }

    fn evict(&self, page: &Page) {
        if !page.is_dirty() {
            return;
        }
        if let Err(e) = self.flush(page) {
            //  a page that cannot reach disk leaves the data file in an unknown state
            error!(pgno = page.pgno(), error = %e, "failed to flush evicted page");
            panic!("failed to flush page {}: {e}", page.pgno());
        }
    }
}

/// Bounded cache over the data file's pages.
///
/// Pages are numbered from 1 and only ever appended; [`PageCache::truncate_to`] and
/// [`PageCache::page_count`] exist for recovery, which runs single-threaded.
pub struct PageCache {
    cache: Arc<ReferenceCache<PageSource>>,
    page_count: Arc<AtomicU32>,
}

impl PageCache {
    /// `capacity` is the number of pages that may be resident at once.
    pub fn new(file: Arc<dyn StorageFile>, capacity: usize) -> Result<Self> {
        if (capacity as u64) < MIN_CACHE_PAGES {
            return Err(Error::MemoryTooSmall {
                memory: (capacity * PAGE_SIZE) as u64,
                minimum: MIN_CACHE_PAGES * PAGE_SIZE as u64,
            });
        }
        let pages = file.len()? / PAGE_SIZE as u64;
        let page_count = Arc::new(AtomicU32::new(pages as u32));
        let source = PageSource {
            file,
            page_count: Arc::clone(&page_count),
        };
        Ok(Self {
            cache: Arc::new(ReferenceCache::new(source, capacity)),
            page_count,
        })
    }

    /// Append a page holding `init` and write it through. Returns its page number.
    pub fn new_page(&self, init: &[u8]) -> Result<Pgno> {
        let pgno = self.page_count.fetch_add(1, Ordering::AcqRel) + 1;
        let page = Page::new(pgno, init.to_vec());
        self.cache.source().flush(&page)?;
        debug!(pgno, "allocated page");
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: Pgno) -> Result<PageHandle> {
        self.cache
            .get(pgno as u64)?
            .ok_or_else(|| Error::Corrupt(format!("page {pgno} does not exist")))
    }

    /// Write one page through to disk right away.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.cache.source().flush(page)
    }

    /// Resize the data file to exactly `max_pgno` pages.
    pub fn truncate_to(&self, max_pgno: Pgno) -> Result<()> {
        self.cache
            .source()
            .file
            .set_len(page_offset(max_pgno + 1))?;
        self.page_count.store(max_pgno, Ordering::Release);
        Ok(())
    }

    pub fn page_count(&self) -> Pgno {
        self.page_count.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> (usize, usize) {
        self.cache.stats().get()
    }

    /// Flush every dirty page and drop them from memory.
    pub fn close(&self) -> Result<()> {
        self.cache.close();
        self.cache.source().file.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod page_cache_tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{file::MemFile, page::heap};

    fn setup(capacity: usize) -> (MemFile, PageCache) {
        let file = MemFile::new();
        let cache = PageCache::new(Arc::new(file.clone()), capacity).unwrap();
        (file, cache)
    }

    #[test]
    fn test_rejects_tiny_cache() {
        let file = Arc::new(MemFile::new());
        assert!(matches!(
            PageCache::new(file, 9),
            Err(Error::MemoryTooSmall { .. })
        ));
    }

    #[test]
    fn test_new_page_is_written_through() {
        let (file, cache) = setup(10);
        let mut init = vec![0u8; PAGE_SIZE];
        init[0] = 0xAB;
        assert_eq!(cache.new_page(&init).unwrap(), 1);
        assert_eq!(cache.new_page(&init).unwrap(), 2);
        assert_eq!(cache.page_count(), 2);
        assert_eq!(file.len().unwrap(), 2 * PAGE_SIZE as u64);
        assert_eq!(file.snapshot()[PAGE_SIZE], 0xAB);
    }

    #[test]
    fn test_dirty_page_flushed_on_release() {
        let (file, cache) = setup(10);
        let pgno = cache.new_page(&heap::init_raw()).unwrap();
        {
            let page = cache.get_page(pgno).unwrap();
            heap::insert(&page, b"persist me");
        }
        let on_disk = file.snapshot();
        assert_eq!(&on_disk[2..12], b"persist me");

        let page = cache.get_page(pgno).unwrap();
        assert!(!page.is_dirty());
        assert_eq!(heap::fso(&page), 12);
    }

    #[test]
    fn test_clean_page_not_flushed() {
        let (file, cache) = setup(10);
        let pgno = cache.new_page(&heap::init_raw()).unwrap();
        let page = cache.get_page(pgno).unwrap();
        //  scribble behind the cache's back; a clean eviction must not overwrite it
        file.write_at(0, &[9, 9]).unwrap();
        drop(page);
        assert_eq!(&file.snapshot()[0..2], &[9, 9]);
    }

    #[test]
    fn test_missing_page() {
        let (_file, cache) = setup(10);
        assert!(matches!(cache.get_page(1), Err(Error::Corrupt(_))));
        assert!(matches!(cache.get_page(0), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_cache_full() {
        let (_file, cache) = setup(10);
        for _ in 0..11 {
            cache.new_page(&heap::init_raw()).unwrap();
        }
        let pinned: Vec<_> = (1..=10).map(|p| cache.get_page(p).unwrap()).collect();
        assert!(matches!(cache.get_page(11), Err(Error::CacheFull)));
        drop(pinned);
        assert!(cache.get_page(11).is_ok());
    }

    #[test]
    fn test_truncate_to() {
        let (file, cache) = setup(10);
        for _ in 0..5 {
            cache.new_page(&heap::init_raw()).unwrap();
        }
        cache.truncate_to(3).unwrap();
        assert_eq!(cache.page_count(), 3);
        assert_eq!(file.len().unwrap(), 3 * PAGE_SIZE as u64);
        assert!(cache.get_page(4).is_err());

        //  growing is allowed too
        cache.truncate_to(6).unwrap();
        assert_eq!(file.len().unwrap(), 6 * PAGE_SIZE as u64);
        assert!(cache.get_page(6).is_ok());
    }

    #[test]
    fn test_reopen_counts_pages() {
        let (file, cache) = setup(10);
        let pgno = cache.new_page(&heap::init_raw()).unwrap();
        heap::insert(&cache.get_page(pgno).unwrap(), b"abc");
        cache.close().unwrap();

        let cache = PageCache::new(Arc::new(file), 10).unwrap();
        assert_eq!(cache.page_count(), 1);
        assert_eq!(heap::fso(&cache.get_page(1).unwrap()), 5);
    }

    #[test]
    fn test_concurrent_new_page() {
        let (_file, cache) = setup(10);
        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                (0..25)
                    .map(|_| cache.new_page(&heap::init_raw()).unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<Pgno> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
    }
}
