//! Transaction status table.
//!
//! The xid file is `[counter: u64][status: u8]*`: the number of transaction ids handed out
//! so far, then one status byte per id starting at 1.

use std::{fmt::Display, sync::Arc, sync::Mutex};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    file::StorageFile,
    types::{get_u64, Xid, SUPER_XID, XID_LEN},
};

const HEADER_LEN: u64 = XID_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TryFrom<u8> for TxStatus {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TxStatus::Active),
            1 => Ok(TxStatus::Committed),
            2 => Ok(TxStatus::Aborted),
            other => Err(Error::Corrupt(format!("invalid transaction status {other}"))),
        }
    }
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxStatus::Active => "active",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

fn status_position(xid: Xid) -> u64 {
    HEADER_LEN + (xid - 1)
}

#[derive(Debug)]
pub struct TransactionTable {
    file: Arc<dyn StorageFile>,
    //  ids handed out so far; guards allocation
    counter: Mutex<u64>,
}

impl TransactionTable {
    pub fn create(file: Arc<dyn StorageFile>) -> Result<Self> {
        file.set_len(0)?;
        file.write_at(0, &0u64.to_be_bytes())?;
        file.sync()?;
        Ok(Self {
            file,
            counter: Mutex::new(0),
        })
    }

    /// Open an existing table. The file length must agree with its counter.
    pub fn open(file: Arc<dyn StorageFile>) -> Result<Self> {
        let len = file.len()?;
        if len < HEADER_LEN {
            return Err(Error::CorruptFile(format!(
                "xid file is {len} bytes, shorter than its header"
            )));
        }
        let mut header = [0u8; XID_LEN];
        file.read_at(0, &mut header)?;
        let counter = get_u64(&header, 0);
        if len == HEADER_LEN + counter + 1 {
            //  begin wrote the status byte but never reached the counter
            warn!(counter, "dropping status byte of unfinished begin");
            file.set_len(HEADER_LEN + counter)?;
            file.sync()?;
        } else if len != HEADER_LEN + counter {
            return Err(Error::CorruptFile(format!(
                "xid file is {len} bytes but records {counter} transactions"
            )));
        }
        info!(counter, "opened transaction table");
        Ok(Self {
            file,
            counter: Mutex::new(counter),
        })
    }

    fn write_status(&self, xid: Xid, status: TxStatus) -> Result<()> {
        self.file.write_at(status_position(xid), &[status as u8])?;
        self.file.sync()?;
        Ok(())
    }

    /// Allocate the next transaction id and record it as active.
    pub fn begin(&self) -> Result<Xid> {
        let mut counter = self.counter.lock().unwrap();
        let xid = *counter + 1;
        self.write_status(xid, TxStatus::Active)?;
        self.file.write_at(0, &xid.to_be_bytes())?;
        self.file.sync()?;
        *counter = xid;
        debug!(xid, "began transaction");
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.check_known(xid)?;
        if xid == SUPER_XID {
            return Ok(());
        }
        self.write_status(xid, TxStatus::Committed)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.check_known(xid)?;
        if xid == SUPER_XID {
            return Ok(());
        }
        self.write_status(xid, TxStatus::Aborted)
    }

    fn check_known(&self, xid: Xid) -> Result<()> {
        if xid > self.counter() {
            return Err(Error::UnknownTransaction(xid));
        }
        Ok(())
    }

    /// Status of `xid`. The super transaction is always committed.
    pub fn status(&self, xid: Xid) -> Result<TxStatus> {
        if xid == SUPER_XID {
            return Ok(TxStatus::Committed);
        }
        self.check_known(xid)?;
        let mut byte = [0u8; 1];
        self.file.read_at(status_position(xid), &mut byte)?;
        TxStatus::try_from(byte[0])
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == TxStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == TxStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == TxStatus::Aborted)
    }

    /// Number of transaction ids allocated so far.
    pub fn counter(&self) -> u64 {
        *self.counter.lock().unwrap()
    }

    pub fn close(&self) -> Result<()> {
        self.file.sync()?;
        Ok(())
    }
}
