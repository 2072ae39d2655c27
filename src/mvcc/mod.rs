//! Multi-version concurrency control over the data manager.
//!
//! Every row is an [`Entry`]: a data item prefixed with the id of the transaction that created
//! it (`xmin`) and the one that deleted it (`xmax`). Deleting never removes bytes, it stamps
//! `xmax` under an exclusive lock from the [`LockTable`] held until the deleter ends. Whether a
//! transaction sees a version is decided by [`visibility`] from the transaction table and, under
//! repeatable read, the set of transactions active when it began.

pub mod entry;
pub mod lock_table;
pub mod transaction;
pub mod visibility;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

pub use entry::{Entry, EntryHandle};
pub use lock_table::LockTable;
pub use transaction::{IsolationLevel, Transaction};

use crate::{
    cache::ReferenceCache,
    dm::DataManager,
    error::{Error, Result},
    tm::TransactionTable,
    types::{Address, Xid},
};

use entry::EntrySource;

pub struct MvccManager {
    tm: Arc<TransactionTable>,
    dm: Arc<DataManager>,
    entries: Arc<ReferenceCache<EntrySource>>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
    lock_table: LockTable,
}

impl MvccManager {
    pub fn new(tm: Arc<TransactionTable>, dm: Arc<DataManager>) -> Self {
        let entries = Arc::new(ReferenceCache::new(EntrySource::new(Arc::clone(&dm)), 0));
        Self {
            tm,
            dm,
            entries,
            active: Mutex::new(HashMap::new()),
            lock_table: LockTable::new(),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock().unwrap();
        let xid = self.tm.begin()?;
        let tx = Transaction::new(xid, level, active.keys().copied());
        active.insert(xid, Arc::new(tx));
        debug!(xid, %level, "began");
        Ok(xid)
    }

    /// The running transaction `xid`.
    pub fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .unwrap()
            .get(&xid)
            .cloned()
            .ok_or(Error::UnknownTransaction(xid))
    }

    /// Payload of the row at `address` as `xid` sees it.
    pub fn read(&self, xid: Xid, address: Address) -> Result<Option<Vec<u8>>> {
        let tx = self.transaction(xid)?;
        tx.check()?;
        let Some(entry) = self.entries.get(address.as_u64())? else {
            return Ok(None);
        };
        let (xmin, xmax) = entry.versions();
        if !visibility::is_visible(&self.tm, &tx, xmin, xmax)? {
            return Ok(None);
        }
        Ok(Some(entry.data()))
    }

    pub fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Address> {
        let tx = self.transaction(xid)?;
        tx.check()?;
        self.dm.insert(xid, &entry::wrap(xid, payload))
    }

    /// Delete the row at `address`. `false` if there is no row `xid` can see there.
    ///
    /// Blocks while another transaction holds the row. Losing a deadlock check or finding the
    /// row deleted by a transaction `xid` cannot see fails the transaction.
    pub fn delete(&self, xid: Xid, address: Address) -> Result<bool> {
        let tx = self.transaction(xid)?;
        tx.check()?;

        match self.lock_table.add(xid, address) {
            Ok(None) => {}
            Ok(Some(rx)) => {
                if lock_table::wait(xid, rx).is_err() {
                    return Err(tx.fail());
                }
            }
            Err(_) => return Err(tx.fail()),
        }

        let Some(entry) = self.entries.get(address.as_u64())? else {
            return Ok(false);
        };
        let (xmin, xmax) = entry.versions();
        if xmax == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, &tx, xmax)? {
            debug!(xid, %address, xmax, "version skip");
            return Err(tx.fail());
        }
        if !visibility::is_visible(&self.tm, &tx, xmin, xmax)? {
            return Ok(false);
        }
        entry.set_xmax(xid)?;
        Ok(true)
    }

    /// Commit `xid`. A failed transaction cannot commit and stays open for [`Self::abort`].
    pub fn commit(&self, xid: Xid) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        let tx = active.get(&xid).ok_or(Error::UnknownTransaction(xid))?;
        tx.check()?;
        active.remove(&xid);
        drop(active);

        //  status first, so waiters woken below see the outcome
        self.tm.commit(xid)?;
        self.lock_table.remove(xid);
        debug!(xid, "committed");
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        if self.active.lock().unwrap().remove(&xid).is_none() {
            return Err(Error::UnknownTransaction(xid));
        }
        self.tm.abort(xid)?;
        self.lock_table.remove(xid);
        debug!(xid, "aborted");
        Ok(())
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub fn tm(&self) -> &Arc<TransactionTable> {
        &self.tm
    }

    pub fn dm(&self) -> &Arc<DataManager> {
        &self.dm
    }

    /// Number of transactions begun here and not yet ended.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn close(&self) -> Result<()> {
        self.entries.close();
        self.dm.close()?;
        self.tm.close()?;
        info!("closed mvcc manager");
        Ok(())
    }
}
