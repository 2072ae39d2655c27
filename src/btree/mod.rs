//! A concurrent B+ tree mapping `u64` keys to [`Address`]es, stored as data items.
//!
//! Nodes are never locked more than one at a time. A node that splits keeps a sibling pointer
//! to its new upper half, so a search or insert that lands on a node whose keys end below the
//! target simply walks right. The tree is reached through a fixed boot item that holds the
//! current root's address; replacing the root happens under the tree's boot lock.

pub mod node;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    dm::{DataItemHandle, DataManager},
    error::{Error, Result},
    types::{get_u64, put_u64, Address, ADDRESS_LEN, SUPER_XID},
};

use node::{Inserted, Next, Node, INF};

/// A split that still has to be recorded in the level above `height`.
#[derive(Debug, Clone, Copy)]
struct Split {
    son: Address,
    key: u64,
    //  height of the node that split; leaves are at 0
    height: usize,
}

pub struct BTree {
    boot: DataItemHandle,
    boot_lock: Mutex<()>,
    dm: Arc<DataManager>,
}

impl BTree {
    /// Create an empty tree and return the address of its boot item.
    pub fn create(dm: &DataManager) -> Result<Address> {
        let root = dm.insert(SUPER_XID, &node::empty_root_raw())?;
        let mut boot = [0u8; ADDRESS_LEN];
        put_u64(&mut boot, 0, root.as_u64());
        let address = dm.insert(SUPER_XID, &boot)?;
        debug!(%address, %root, "created tree");
        Ok(address)
    }

    pub fn load(boot: Address, dm: Arc<DataManager>) -> Result<Self> {
        let item = dm
            .read(boot)?
            .ok_or_else(|| Error::Corrupt(format!("no tree boot item at {boot}")))?;
        if item.len() != ADDRESS_LEN {
            return Err(Error::Corrupt(format!("item at {boot} is not a tree boot item")));
        }
        Ok(Self {
            boot: item,
            boot_lock: Mutex::new(()),
            dm,
        })
    }

    pub fn boot_address(&self) -> Address {
        self.boot.address()
    }

    /// Address of the current root. The caller holds the boot lock.
    fn root_locked(&self) -> Address {
        Address::from_u64(self.boot.with_data(|raw| get_u64(raw, 0)))
    }

    fn root(&self) -> Address {
        let _boot = self.boot_lock.lock().unwrap();
        self.root_locked()
    }

    fn load_node(&self, address: Address) -> Result<Node> {
        Node::load(&self.dm, address)
    }

    /// Starting at `address`, follow `pick` to a child, walking right through siblings.
    fn descend(
        &self,
        mut address: Address,
        key: u64,
        pick: fn(&Node, u64) -> Next,
    ) -> Result<Address> {
        loop {
            match pick(&self.load_node(address)?, key) {
                Next::Child(child) => return Ok(child),
                Next::Sibling(sibling) if sibling.is_nil() => {
                    return Err(Error::Corrupt(format!(
                        "no child for key {key} right of node {address}"
                    )))
                }
                Next::Sibling(sibling) => address = sibling,
            }
        }
    }

    fn child_for(&self, address: Address, key: u64) -> Result<Address> {
        self.descend(address, key, Node::search_next)
    }

    /// The left-most leaf under `address` that can hold `key`.
    fn search_leaf(&self, mut address: Address, key: u64) -> Result<Address> {
        while !self.load_node(address)?.is_leaf() {
            address = self.descend(address, key, Node::search_first)?;
        }
        Ok(address)
    }

    /// Number of levels below `address`.
    fn height(&self, mut address: Address) -> Result<usize> {
        let mut height = 0;
        while !self.load_node(address)?.is_leaf() {
            address = self.child_for(address, 0)?;
            height += 1;
        }
        Ok(height)
    }

    /// Addresses stored under `key`, in insertion order for duplicates.
    pub fn search(&self, key: u64) -> Result<Vec<Address>> {
        self.search_range(key, key)
    }

    /// Addresses stored under keys in `[low, high]`, ordered by key.
    pub fn search_range(&self, low: u64, high: u64) -> Result<Vec<Address>> {
        let mut leaf = self.search_leaf(self.root(), low)?;
        let mut found = Vec::new();
        loop {
            let (addresses, next) = self.load_node(leaf)?.leaf_search_range(low, high);
            found.extend(addresses);
            match next {
                Some(sibling) => leaf = sibling,
                None => break,
            }
        }
        Ok(found)
    }

    pub fn insert(&self, key: u64, address: Address) -> Result<()> {
        if key == INF {
            return Err(Error::InvalidKey(key));
        }
        let root = self.root();
        match self.insert_below(root, key, address)? {
            Some(split) => self.grow(split),
            None => Ok(()),
        }
    }

    /// Insert into the subtree at `address`, returning the split of `address`'s level, if any.
    fn insert_below(&self, address: Address, key: u64, son: Address) -> Result<Option<Split>> {
        if self.load_node(address)?.is_leaf() {
            return self.insert_and_split(address, key, son, 0);
        }
        let child = self.child_for(address, key)?;
        match self.insert_below(child, key, son)? {
            Some(split) => self.insert_and_split(address, split.key, split.son, split.height + 1),
            None => Ok(None),
        }
    }

    /// Insert `(key, son)` at the node at `address`, or the first sibling that owns `key`.
    fn insert_and_split(
        &self,
        mut address: Address,
        key: u64,
        son: Address,
        height: usize,
    ) -> Result<Option<Split>> {
        loop {
            match self.load_node(address)?.insert_and_split(&self.dm, key, son)? {
                Inserted::Sibling(sibling) => address = sibling,
                Inserted::Done => return Ok(None),
                Inserted::Split { son, key } => {
                    debug!(%address, %son, key, height, "split node");
                    return Ok(Some(Split { son, key, height }));
                }
            }
        }
    }

    /// Record a split that reached the top of the tree as this insert saw it.
    ///
    /// If the root is still at the split node's height it is replaced by a new root over both
    /// halves. Otherwise another insert has grown the tree meanwhile, and the split goes into
    /// the level above it like any other, which may split in turn.
    fn grow(&self, mut split: Split) -> Result<()> {
        let _boot = self.boot_lock.lock().unwrap();
        loop {
            let root = self.root_locked();
            let root_height = self.height(root)?;

            if root_height == split.height {
                let new_root = self
                    .dm
                    .insert(SUPER_XID, &node::root_raw(root, split.son, split.key))?;
                let mut guard = self.boot.before();
                guard.with_data_mut(|raw| put_u64(raw, 0, new_root.as_u64()));
                guard.after(SUPER_XID)?;
                debug!(%new_root, height = root_height + 1, "replaced root");
                return Ok(());
            }

            let mut parent = root;
            for _ in split.height + 1..root_height {
                parent = self.child_for(parent, split.key)?;
            }
            match self.insert_and_split(parent, split.key, split.son, split.height + 1)? {
                Some(next) => split = next,
                None => return Ok(()),
            }
        }
    }
}
