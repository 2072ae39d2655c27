use std::sync::Arc;

use crate::{
    cache::{CacheHandle, CacheSource},
    dm::{DataItemHandle, DataManager},
    error::{Error, Result},
    types::{get_u64, put_u64, Address, Xid, XID_LEN},
};

//  [xmin: u64][xmax: u64][payload]
const XMIN_OFFSET: usize = 0;
const XMAX_OFFSET: usize = XMIN_OFFSET + XID_LEN;
const DATA_OFFSET: usize = XMAX_OFFSET + XID_LEN;

pub fn wrap(xmin: Xid, payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; DATA_OFFSET + payload.len()];
    put_u64(&mut raw, XMIN_OFFSET, xmin);
    raw[DATA_OFFSET..].copy_from_slice(payload);
    raw
}

/// One row version: the transaction that created it, the one that deleted it (0 if none)
/// and the payload.
pub struct Entry {
    item: DataItemHandle,
}

impl Entry {
    fn new(item: DataItemHandle) -> Result<Self> {
        if item.len() < DATA_OFFSET {
            return Err(Error::Corrupt(format!(
                "entry at {} is only {} bytes",
                item.address(),
                item.len()
            )));
        }
        Ok(Self { item })
    }

    pub fn address(&self) -> Address {
        self.item.address()
    }

    /// `(xmin, xmax)` read under one latch.
    pub fn versions(&self) -> (Xid, Xid) {
        self.item
            .with_data(|data| (get_u64(data, XMIN_OFFSET), get_u64(data, XMAX_OFFSET)))
    }

    pub fn xmin(&self) -> Xid {
        self.versions().0
    }

    pub fn xmax(&self) -> Xid {
        self.versions().1
    }

    pub fn data(&self) -> Vec<u8> {
        self.item.with_data(|data| data[DATA_OFFSET..].to_vec())
    }

    /// Record `xid` as the deleter, logged under `xid`.
    pub fn set_xmax(&self, xid: Xid) -> Result<()> {
        let mut guard = self.item.before();
        guard.with_data_mut(|data| put_u64(data, XMAX_OFFSET, xid));
        guard.after(xid)
    }
}

/// Loads entries through the data manager. Invalid or missing items load nothing.
pub struct EntrySource {
    dm: Arc<DataManager>,
}

impl EntrySource {
    pub fn new(dm: Arc<DataManager>) -> Self {
        Self { dm }
    }
}

impl CacheSource for EntrySource {
    type Item = Entry;

    fn load(&self, key: u64) -> Result<Option<Entry>> {
        match self.dm.read(Address::from_u64(key))? {
            Some(item) => Entry::new(item).map(Some),
            None => Ok(None),
        }
    }

    fn evict(&self, _entry: &Entry) {}
}

pub type EntryHandle = CacheHandle<EntrySource>;
