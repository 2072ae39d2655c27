//! Version visibility rules.
//!
//! Read committed:
//!
//! ```text
//! (xmin == me && xmax == 0)
//!     || (committed(xmin) && (xmax == 0 || (xmax != me && !committed(xmax))))
//! ```
//!
//! Repeatable read additionally requires the creator to have committed before `me` began,
//! and treats a deleter as invisible if it began after `me` or was still running then:
//!
//! ```text
//! (xmin == me && xmax == 0)
//!     || (committed(xmin) && xmin < me && !snapshot(xmin)
//!         && (xmax == 0
//!             || (xmax != me && (!committed(xmax) || xmax > me || snapshot(xmax)))))
//! ```

use crate::{
    error::Result,
    mvcc::transaction::{IsolationLevel, Transaction},
    tm::TransactionTable,
    types::Xid,
};

pub fn is_visible(tm: &TransactionTable, tx: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    match tx.level() {
        IsolationLevel::ReadCommitted => read_committed(tm, tx, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, tx, xmin, xmax),
    }
}

fn read_committed(tm: &TransactionTable, tx: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    let xid = tx.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !tm.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(
    tm: &TransactionTable,
    tx: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    let xid = tx.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? && xmin < xid && !tx.in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid
            && (!tm.is_committed(xmax)? || xmax > xid || tx.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether deleting a version with deleter `xmax` would skip over a delete `tx` cannot see.
///
/// Only a committed deleter counts; under read committed there is never a skip.
pub fn is_version_skip(tm: &TransactionTable, tx: &Transaction, xmax: Xid) -> Result<bool> {
    match tx.level() {
        IsolationLevel::ReadCommitted => Ok(false),
        IsolationLevel::RepeatableRead => {
            if xmax == 0 || xmax == tx.xid() || !tm.is_committed(xmax)? {
                return Ok(false);
            }
            Ok(xmax > tx.xid() || tx.in_snapshot(xmax))
        }
    }
}

#[cfg(test)]
mod visibility_tests {
    use std::sync::Arc;

    use super::*;
    use crate::{file::MemFile, types::SUPER_XID};

    /// Transactions 1..=6: 1 and 3 committed, 2 aborted, 4, 5 and 6 active.
    fn table() -> TransactionTable {
        let tm = TransactionTable::create(Arc::new(MemFile::new())).unwrap();
        for _ in 0..6 {
            tm.begin().unwrap();
        }
        tm.commit(1).unwrap();
        tm.abort(2).unwrap();
        tm.commit(3).unwrap();
        tm
    }

    #[test]
    fn test_read_committed() {
        let tm = table();
        let me = Transaction::new(5, IsolationLevel::ReadCommitted, []);

        //  own insert
        assert!(is_visible(&tm, &me, 5, 0).unwrap());
        //  own insert, then own delete
        assert!(!is_visible(&tm, &me, 5, 5).unwrap());
        //  committed insert
        assert!(is_visible(&tm, &me, 1, 0).unwrap());
        assert!(is_visible(&tm, &me, SUPER_XID, 0).unwrap());
        //  uncommitted and aborted inserts
        assert!(!is_visible(&tm, &me, 4, 0).unwrap());
        assert!(!is_visible(&tm, &me, 2, 0).unwrap());
        //  deleted by a committed transaction
        assert!(!is_visible(&tm, &me, 1, 3).unwrap());
        //  delete still in flight or rolled back
        assert!(is_visible(&tm, &me, 1, 4).unwrap());
        assert!(is_visible(&tm, &me, 1, 2).unwrap());
        //  deleted by me
        assert!(!is_visible(&tm, &me, 1, 5).unwrap());
    }

    #[test]
    fn test_repeatable_read() {
        let tm = table();
        //  3 was still running when 5 began
        let me = Transaction::new(5, IsolationLevel::RepeatableRead, [3, 4]);

        assert!(is_visible(&tm, &me, 5, 0).unwrap());
        assert!(is_visible(&tm, &me, 1, 0).unwrap());
        //  committed, but after I began
        assert!(!is_visible(&tm, &me, 3, 0).unwrap());
        //  created by a later transaction
        assert!(!is_visible(&tm, &me, 6, 0).unwrap());

        //  deleter committed after I began: still visible to me
        assert!(is_visible(&tm, &me, 1, 3).unwrap());
        //  deleter active or later than me
        assert!(is_visible(&tm, &me, 1, 4).unwrap());
        assert!(is_visible(&tm, &me, 1, 6).unwrap());
        //  deleted by me
        assert!(!is_visible(&tm, &me, 1, 5).unwrap());
    }

    #[test]
    fn test_repeatable_read_sees_deletes_committed_before_begin() {
        let tm = table();
        let me = Transaction::new(5, IsolationLevel::RepeatableRead, [4]);
        assert!(!is_visible(&tm, &me, 1, 3).unwrap());
    }

    #[test]
    fn test_version_skip() {
        let tm = table();
        let rc = Transaction::new(5, IsolationLevel::ReadCommitted, []);
        assert!(!is_version_skip(&tm, &rc, 3).unwrap());

        let rr = Transaction::new(5, IsolationLevel::RepeatableRead, [3, 4]);
        assert!(!is_version_skip(&tm, &rr, 0).unwrap());
        //  committed deleter I cannot see
        assert!(is_version_skip(&tm, &rr, 3).unwrap());
        //  rolled back or still running deleters do not count
        assert!(!is_version_skip(&tm, &rr, 2).unwrap());
        assert!(!is_version_skip(&tm, &rr, 4).unwrap());

        let late = Transaction::new(2, IsolationLevel::RepeatableRead, []);
        assert!(is_version_skip(&tm, &late, 3).unwrap());
    }
}
