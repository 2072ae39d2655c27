//! An embedded multi-version storage engine.
//!
//! Data lives in three files sharing a path prefix: fixed-size pages (`.db`), a write-ahead
//! log (`.log`) and a transaction status table (`.xid`). On top of the page file the
//! [`dm::DataManager`] stores logged, addressable items and recovers them after a crash; the
//! [`mvcc::MvccManager`] layers versioned rows and row locks over it; [`btree::BTree`] indexes
//! addresses by `u64` key. [`Database`] ties them together.

pub mod btree;
pub mod cache;
pub mod config;
pub mod dm;
pub mod error;
pub mod file;
pub mod free_space;
pub mod mvcc;
pub mod page;
pub mod page_cache;
pub mod tm;
pub mod types;
pub mod wal;

#[cfg(test)]
mod test_utils;

use std::{path::Path, sync::Arc};

use tracing::info;

pub use btree::BTree;
pub use config::Config;
pub use dm::{DataManager, RecoveryReport};
pub use error::{Error, Result};
pub use file::{DbFiles, DiskFile, MemFile, StorageFile};
pub use mvcc::{IsolationLevel, MvccManager};
pub use tm::{TransactionTable, TxStatus};
pub use types::{Address, Xid, SUPER_XID};

pub struct Database {
    config: Config,
    mvcc: MvccManager,
}

impl Database {
    /// Create a database at `prefix`, replacing any files already there.
    pub fn create<P: AsRef<Path>>(prefix: P, config: Config) -> Result<Self> {
        config.validate()?;
        let db = Self::create_with(DbFiles::create(&prefix)?, config)?;
        info!(prefix = %prefix.as_ref().display(), "created database");
        Ok(db)
    }

    /// Open the database at `prefix`, recovering it if it was not closed cleanly.
    pub fn open<P: AsRef<Path>>(prefix: P, config: Config) -> Result<Self> {
        config.validate()?;
        let db = Self::open_with(DbFiles::open(&prefix)?, config)?;
        info!(prefix = %prefix.as_ref().display(), "opened database");
        Ok(db)
    }

    /// A database that lives only in memory.
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::create_with(DbFiles::in_memory(), config)
    }

    /// Initialise a fresh database in `files`.
    pub fn create_with(files: DbFiles, config: Config) -> Result<Self> {
        config.validate()?;
        let tm = TransactionTable::create(files.xid)?;
        let dm = DataManager::create(files.data, files.log, config.cache_pages())?;
        Ok(Self::new(config, tm, dm))
    }

    /// Open the database stored in `files`.
    pub fn open_with(files: DbFiles, config: Config) -> Result<Self> {
        config.validate()?;
        let tm = TransactionTable::open(files.xid)?;
        let dm = DataManager::open(files.data, files.log, config.cache_pages(), &tm)?;
        if let Some(report) = dm.recovery() {
            info!(
                redone = report.redone,
                undone = report.undone,
                aborted = report.aborted.len(),
                "recovered database"
            );
        }
        Ok(Self::new(config, tm, dm))
    }

    fn new(config: Config, tm: TransactionTable, dm: DataManager) -> Self {
        Self {
            config,
            mvcc: MvccManager::new(Arc::new(tm), Arc::new(dm)),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        self.mvcc.begin(level)
    }

    /// Begin at the configured default isolation level.
    pub fn begin_default(&self) -> Result<Xid> {
        self.mvcc.begin(self.config.default_isolation)
    }

    pub fn read(&self, xid: Xid, address: Address) -> Result<Option<Vec<u8>>> {
        self.mvcc.read(xid, address)
    }

    pub fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Address> {
        self.mvcc.insert(xid, payload)
    }

    pub fn delete(&self, xid: Xid, address: Address) -> Result<bool> {
        self.mvcc.delete(xid, address)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.mvcc.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.mvcc.abort(xid)
    }

    /// Create an empty index and return the address to load it from.
    pub fn create_index(&self) -> Result<Address> {
        BTree::create(self.mvcc.dm())
    }

    pub fn load_index(&self, boot: Address) -> Result<BTree> {
        BTree::load(boot, Arc::clone(self.mvcc.dm()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    /// What recovery did at open, if the last shutdown was unclean.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.mvcc.dm().recovery()
    }

    pub fn page_count(&self) -> u32 {
        self.mvcc.dm().page_count()
    }

    /// Number of transaction ids handed out so far.
    pub fn xid_counter(&self) -> u64 {
        self.mvcc.tm().counter()
    }

    /// Flush and close. Indexes and other handles must be dropped first.
    pub fn close(self) -> Result<()> {
        self.mvcc.close()?;
        info!("closed database");
        Ok(())
    }
}
