use std::{collections::VecDeque, sync::Mutex};

use crate::{page::PAGE_SIZE, types::Pgno};

const INTERVALS: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

/// In-memory index of free bytes per page, bucketed in `PAGE_SIZE / 40` steps.
///
/// A page lives in at most one bucket. [`FreeSpaceIndex::select`] removes it and hands back a
/// [`Checkout`]; the page returns to the index, with whatever free space it has left, when
/// the checkout is dropped.
#[derive(Debug)]
pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<(Pgno, usize)>>>,
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![VecDeque::new(); INTERVALS + 1]),
        }
    }

    fn bucket(free: usize) -> usize {
        (free / THRESHOLD).min(INTERVALS)
    }

    pub fn add(&self, pgno: Pgno, free: usize) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets[Self::bucket(free)].push_back((pgno, free));
    }

    /// Check out a page with at least `size` free bytes.
    ///
    /// Only buckets strictly above the one `size` falls in are searched. The top bucket
    /// also holds pages smaller than some requests, so candidates are checked against
    /// their recorded free space and the ones that do not fit stay queued.
    pub fn select(&self, size: usize) -> Option<Checkout<'_>> {
        let mut number = size / THRESHOLD;
        if number < INTERVALS {
            number += 1;
        }
        let mut buckets = self.buckets.lock().unwrap();
        while number <= INTERVALS {
            let bucket = &mut buckets[number];
            let position = bucket.iter().position(|&(_, free)| free >= size);
            if let Some((pgno, free)) = position.and_then(|position| bucket.remove(position)) {
                return Some(Checkout {
                    index: self,
                    pgno,
                    free,
                });
            }
            number += 1;
        }
        None
    }

    /// Number of pages currently in the index.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A page taken out of the [`FreeSpaceIndex`]. Dropping it puts the page back.
#[derive(Debug)]
pub struct Checkout<'a> {
    index: &'a FreeSpaceIndex,
    pgno: Pgno,
    free: usize,
}

impl Checkout<'_> {
    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn free(&self) -> usize {
        self.free
    }

    /// Record the free space the page has left, to be used when it returns to the index.
    pub fn set_free(&mut self, free: usize) {
        self.free = free;
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        self.index.add(self.pgno, self.free);
    }
}

#[cfg(test)]
mod free_space_tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_select_fits() {
        let index = FreeSpaceIndex::new();
        index.add(2, THRESHOLD * 3);
        index.add(3, THRESHOLD * 10);

        let checkout = index.select(THRESHOLD * 5).unwrap();
        assert_eq!(checkout.pgno(), 3);
        assert!(checkout.free() >= THRESHOLD * 5);
        assert_eq!(index.len(), 1);
        drop(checkout);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_select_skips_own_bucket() {
        let index = FreeSpaceIndex::new();
        //  same bucket as the request; may or may not fit, so it is never chosen
        index.add(2, THRESHOLD + 1);
        assert!(index.select(THRESHOLD).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_top_bucket_checks_free_space() {
        let index = FreeSpaceIndex::new();
        //  both land in the top bucket, only the second holds the request
        index.add(2, PAGE_SIZE - 5);
        index.add(3, PAGE_SIZE - 2);

        let checkout = index.select(PAGE_SIZE - 4).unwrap();
        assert_eq!(checkout.pgno(), 3);
        assert!(index.select(PAGE_SIZE - 4).is_none());
        drop(checkout);

        assert_eq!(index.len(), 2);
        assert_eq!(index.select(PAGE_SIZE - 5).unwrap().pgno(), 2);
    }

    #[test]
    fn test_checkout_returns_reduced_space() {
        let index = FreeSpaceIndex::new();
        index.add(5, PAGE_SIZE - 2);
        {
            let mut checkout = index.select(100).unwrap();
            checkout.set_free(THRESHOLD / 2);
        }
        //  page now sits in bucket 0 and cannot satisfy anything
        assert!(index.select(1).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_page_checked_out_once() {
        let index = Arc::new(FreeSpaceIndex::new());
        for pgno in 2..12 {
            index.add(pgno, PAGE_SIZE - 2);
        }
        let taken = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                let taken = Arc::clone(&taken);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if let Some(checkout) = index.select(10) {
                            //  nobody else may hold this page right now
                            assert!(taken.lock().unwrap().insert(checkout.pgno()));
                            taken.lock().unwrap().remove(&checkout.pgno());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), 10);
    }
}
