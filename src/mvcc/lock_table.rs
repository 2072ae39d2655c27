use std::{
    collections::{HashMap, VecDeque},
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Mutex,
    },
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    types::{Address, Xid},
};

/// The wait-for graph. Every map is kept in step with the others under one mutex.
#[derive(Debug, Default)]
struct Graph {
    holder: HashMap<Address, Xid>,
    held: HashMap<Xid, Vec<Address>>,
    //  queued requests per address, oldest first
    waiters: HashMap<Address, VecDeque<Xid>>,
    waiting_on: HashMap<Xid, Address>,
    //  one-shot grant notification for each waiting transaction
    wake: HashMap<Xid, SyncSender<()>>,
}

impl Graph {
    fn grant(&mut self, xid: Xid, address: Address) {
        self.holder.insert(address, xid);
        self.held.entry(xid).or_default().push(address);
    }

    /// Whether any chain of "waits on, held by" edges loops back on itself.
    ///
    /// A transaction waits on at most one address, so every chain is a simple path and one
    /// stamp per walk is enough: meeting the current stamp again means a cycle, meeting an
    /// older one means the rest of the chain was already walked without finding one.
    fn has_deadlock(&self) -> bool {
        fn walk(graph: &Graph, mut xid: Xid, stamp: usize, stamps: &mut HashMap<Xid, usize>) -> bool {
            loop {
                match stamps.get(&xid) {
                    Some(&seen) if seen == stamp => return true,
                    Some(_) => return false,
                    None => {}
                }
                stamps.insert(xid, stamp);

                let Some(address) = graph.waiting_on.get(&xid) else {
                    return false;
                };
                let Some(&holder) = graph.holder.get(address) else {
                    return false;
                };
                xid = holder;
            }
        }

        let mut stamps = HashMap::new();
        let mut stamp = 0;
        for &xid in self.held.keys() {
            if stamps.contains_key(&xid) {
                continue;
            }
            stamp += 1;
            if walk(self, xid, stamp, &mut stamps) {
                return true;
            }
        }
        false
    }

    /// Hand `address` to the oldest waiter still interested in it, or free it.
    fn pass_on(&mut self, address: Address) {
        self.holder.remove(&address);
        let Some(queue) = self.waiters.get_mut(&address) else {
            return;
        };
        let mut next = None;
        while let Some(xid) = queue.pop_front() {
            //  waiters that gave up have no channel left
            if self.wake.contains_key(&xid) {
                next = Some(xid);
                break;
            }
        }
        if queue.is_empty() {
            self.waiters.remove(&address);
        }

        if let Some(xid) = next {
            self.grant(xid, address);
            self.waiting_on.remove(&xid);
            if let Some(wake) = self.wake.remove(&xid) {
                //  capacity 1 and a single send per channel, so this never blocks
                let _ = wake.try_send(());
            }
            debug!(xid, %address, "lock handed to waiter");
        }
    }
}

/// Exclusive locks on addresses, held until the owning transaction ends.
#[derive(Debug, Default)]
pub struct LockTable {
    graph: Mutex<Graph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the lock on `address` for `xid`.
    ///
    /// `Ok(None)` means the lock is held now. `Ok(Some(rx))` means `xid` is queued behind the
    /// current holder; `rx` receives once the lock has been handed over. Waiting would close a
    /// cycle in the wait-for graph, the request is withdrawn and
    /// [`Error::SerializationFailure`] returned.
    pub fn add(&self, xid: Xid, address: Address) -> Result<Option<Receiver<()>>> {
        let mut graph = self.graph.lock().unwrap();

        if graph.held.get(&xid).is_some_and(|held| held.contains(&address)) {
            return Ok(None);
        }
        if !graph.holder.contains_key(&address) {
            graph.grant(xid, address);
            return Ok(None);
        }

        graph.waiting_on.insert(xid, address);
        graph.waiters.entry(address).or_default().push_back(xid);
        if graph.has_deadlock() {
            graph.waiting_on.remove(&xid);
            if let Some(queue) = graph.waiters.get_mut(&address) {
                queue.retain(|&waiter| waiter != xid);
                if queue.is_empty() {
                    graph.waiters.remove(&address);
                }
            }
            warn!(xid, %address, "lock request rejected: deadlock");
            return Err(Error::SerializationFailure { xid });
        }

        let (tx, rx) = sync_channel(1);
        graph.wake.insert(xid, tx);
        debug!(xid, %address, "waiting for lock");
        Ok(Some(rx))
    }

    /// Release everything `xid` holds and withdraw any request it is waiting on.
    pub fn remove(&self, xid: Xid) {
        let mut graph = self.graph.lock().unwrap();
        if let Some(held) = graph.held.remove(&xid) {
            for address in held {
                graph.pass_on(address);
            }
        }
        graph.waiting_on.remove(&xid);
        //  dropping the sender disconnects a waiter that is still blocked
        graph.wake.remove(&xid);
    }

    /// Current holder of `address`, if any.
    pub fn holder(&self, address: Address) -> Option<Xid> {
        self.graph.lock().unwrap().holder.get(&address).copied()
    }

    /// Address `xid` is queued on, if it is waiting.
    pub fn waiting_on(&self, xid: Xid) -> Option<Address> {
        self.graph.lock().unwrap().waiting_on.get(&xid).copied()
    }
}

/// Block until a queued lock request is granted.
///
/// A disconnected channel means the request was withdrawn, so the transaction cannot go on.
pub fn wait(xid: Xid, rx: Receiver<()>) -> Result<()> {
    rx.recv()
        .map_err(|_| Error::SerializationFailure { xid })
}
