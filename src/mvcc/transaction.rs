use std::{
    collections::HashSet,
    fmt::Display,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::{Error, Result},
    types::{Xid, SUPER_XID},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "read-committed"),
            IsolationLevel::RepeatableRead => write!(f, "repeatable-read"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "read-committed" | "rc" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" | "rr" => Ok(IsolationLevel::RepeatableRead),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

/// Per-transaction state held by the MVCC manager while the transaction runs.
#[derive(Debug)]
pub struct Transaction {
    xid: Xid,
    level: IsolationLevel,
    //  transactions active when this one began; empty under read-committed
    snapshot: HashSet<Xid>,
    //  once set, the only legal way out is abort
    failed: AtomicBool,
}

impl Transaction {
    pub fn new(xid: Xid, level: IsolationLevel, active: impl IntoIterator<Item = Xid>) -> Self {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => HashSet::new(),
            IsolationLevel::RepeatableRead => active.into_iter().collect(),
        };
        Self {
            xid,
            level,
            snapshot,
            failed: AtomicBool::new(false),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Whether `xid` was still running when this transaction began.
    pub fn in_snapshot(&self, xid: Xid) -> bool {
        xid != SUPER_XID && self.snapshot.contains(&xid)
    }

    /// Mark the transaction as unable to commit and return the error to report.
    pub fn fail(&self) -> Error {
        self.failed.store(true, Ordering::Release);
        Error::SerializationFailure { xid: self.xid }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// `Err` if the transaction has failed.
    pub fn check(&self) -> Result<()> {
        if self.has_failed() {
            return Err(Error::SerializationFailure { xid: self.xid });
        }
        Ok(())
    }
}
