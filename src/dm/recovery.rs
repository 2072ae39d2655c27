//! Crash recovery.
//!
//! Runs at open time, single-threaded, when page 1 shows the previous session did not close
//! cleanly. Three passes over the log:
//!
//! 1. find the largest page number referenced and resize the data file to it;
//! 2. redo, in log order, every record of a transaction that is not active;
//! 3. undo, newest first, every record of each still-active transaction, then mark it aborted.
//!
//! Each undo step is itself logged as an update record under the same xid before the page is
//! touched. A later recovery then redoes the undo along with everything else, so recovering
//! twice leaves the same bytes as recovering once, and an undo interrupted by another crash is
//! finished on the next attempt.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::{
    dm::{
        data_item,
        log_record::{self, LogRecord},
    },
    error::Result,
    page::heap,
    page_cache::PageCache,
    tm::TransactionTable,
    types::{Address, Pgno, Xid},
    wal::Wal,
};

/// What a recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Page count the data file was resized to.
    pub max_pgno: Pgno,
    /// Records replayed forwards.
    pub redone: usize,
    /// Records rolled back.
    pub undone: usize,
    /// Transactions that were active at the crash, now aborted.
    pub aborted: Vec<Xid>,
}

fn records(wal: &Wal) -> impl Iterator<Item = Result<LogRecord>> + '_ {
    wal.iter()
        .map(|payload| payload.and_then(|bytes| LogRecord::try_from(bytes.as_slice())))
}

pub fn recover(tm: &TransactionTable, wal: &Wal, pages: &PageCache) -> Result<RecoveryReport> {
    info!("recovering");
    let mut report = RecoveryReport::default();

    let mut max_pgno: Pgno = 0;
    for record in records(wal) {
        max_pgno = max_pgno.max(record?.pgno());
    }
    //  page 1 is always on disk, even with an empty log
    report.max_pgno = max_pgno.max(1);
    pages.truncate_to(report.max_pgno)?;
    info!(max_pgno = report.max_pgno, "resized data file");

    for record in records(wal) {
        let record = record?;
        if !tm.is_active(record.xid())? {
            redo(pages, &record)?;
            report.redone += 1;
        }
    }
    info!(redone = report.redone, "redo pass finished");

    let mut in_flight: BTreeMap<Xid, Vec<LogRecord>> = BTreeMap::new();
    for record in records(wal) {
        let record = record?;
        if tm.is_active(record.xid())? {
            in_flight.entry(record.xid()).or_default().push(record);
        }
    }
    for (xid, records) in in_flight {
        for record in records.iter().rev() {
            undo(wal, pages, record)?;
            report.undone += 1;
        }
        tm.abort(xid)?;
        debug!(xid, undone = records.len(), "rolled back transaction");
        report.aborted.push(xid);
    }
    info!(
        undone = report.undone,
        aborted = report.aborted.len(),
        "undo pass finished"
    );
    Ok(report)
}

fn redo(pages: &PageCache, record: &LogRecord) -> Result<()> {
    match record {
        LogRecord::Insert {
            pgno, offset, raw, ..
        } => {
            let page = pages.get_page(*pgno)?;
            heap::recover_insert(&page, *offset, raw);
        }
        LogRecord::Update {
            address, new_raw, ..
        } => {
            let page = pages.get_page(address.pgno())?;
            heap::recover_update(&page, address.offset(), new_raw);
        }
    }
    Ok(())
}

fn undo(wal: &Wal, pages: &PageCache, record: &LogRecord) -> Result<()> {
    match record {
        LogRecord::Insert {
            xid,
            pgno,
            offset,
            raw,
        } => {
            //  rewrite the item so the slot is well formed, but flagged invalid
            let mut invalid = raw.clone();
            data_item::invalidate(&mut invalid);
            wal.log(&log_record::encode_update(
                *xid,
                Address::new(*pgno, *offset),
                raw,
                &invalid,
            ))?;
            let page = pages.get_page(*pgno)?;
            heap::recover_insert(&page, *offset, &invalid);
        }
        LogRecord::Update {
            xid,
            address,
            old_raw,
            new_raw,
        } => {
            wal.log(&log_record::encode_update(*xid, *address, new_raw, old_raw))?;
            let page = pages.get_page(address.pgno())?;
            heap::recover_update(&page, address.offset(), old_raw);
        }
    }
    Ok(())
}
