//! On-disk B+ tree node.
//!
//! ```text
//! [leaf: u8][nkeys: u16][sibling: u64]
//! [son 0: u64][key 0: u64] [son 1: u64][key 1: u64] ... up to 2B + 2 pairs
//! ```
//!
//! Internal nodes keep their right-most child as the son paired with [`INF`], so leaves and
//! internal nodes share one layout. In a leaf, son `i` is the address stored under key `i`;
//! in an internal node, son `i` covers keys in `[key i-1, key i)`.

use crate::{
    dm::{DataItemHandle, DataManager},
    error::{Error, Result},
    types::{get_u16, get_u64, put_u16, put_u64, Address, ADDRESS_LEN, SUPER_XID},
};

const LEAF_OFFSET: usize = 0;
const NKEYS_OFFSET: usize = LEAF_OFFSET + 1;
const SIBLING_OFFSET: usize = NKEYS_OFFSET + 2;
const HEADER_LEN: usize = SIBLING_OFFSET + ADDRESS_LEN;

const PAIR_LEN: usize = 2 * ADDRESS_LEN;

/// Balance number. Nodes split when they reach `2 * B` keys.
pub const B: usize = 32;
pub const NODE_SIZE: usize = HEADER_LEN + PAIR_LEN * (2 * B + 2);

/// Key reserved as the upper bound of every internal node.
pub const INF: u64 = u64::MAX;

fn is_leaf(raw: &[u8]) -> bool {
    raw[LEAF_OFFSET] == 1
}

fn set_leaf(raw: &mut [u8], leaf: bool) {
    raw[LEAF_OFFSET] = u8::from(leaf);
}

fn nkeys(raw: &[u8]) -> usize {
    get_u16(raw, NKEYS_OFFSET) as usize
}

fn set_nkeys(raw: &mut [u8], n: usize) {
    put_u16(raw, NKEYS_OFFSET, n as u16);
}

fn sibling(raw: &[u8]) -> Address {
    Address::from_u64(get_u64(raw, SIBLING_OFFSET))
}

fn set_sibling(raw: &mut [u8], sibling: Address) {
    put_u64(raw, SIBLING_OFFSET, sibling.as_u64());
}

fn pair_offset(kth: usize) -> usize {
    HEADER_LEN + kth * PAIR_LEN
}

fn son(raw: &[u8], kth: usize) -> Address {
    Address::from_u64(get_u64(raw, pair_offset(kth)))
}

fn set_son(raw: &mut [u8], kth: usize, son: Address) {
    put_u64(raw, pair_offset(kth), son.as_u64());
}

fn key(raw: &[u8], kth: usize) -> u64 {
    get_u64(raw, pair_offset(kth) + ADDRESS_LEN)
}

fn set_key(raw: &mut [u8], kth: usize, key: u64) {
    put_u64(raw, pair_offset(kth) + ADDRESS_LEN, key);
}

/// Open a gap at pair `kth` by moving every later pair one slot right. The last slot falls off.
fn shift_from(raw: &mut [u8], kth: usize) {
    let start = pair_offset(kth);
    raw.copy_within(start..NODE_SIZE - PAIR_LEN, start + PAIR_LEN);
}

/// An empty leaf, the root of a fresh tree.
pub fn empty_root_raw() -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    set_leaf(&mut raw, true);
    set_nkeys(&mut raw, 0);
    set_sibling(&mut raw, Address::NIL);
    raw
}

/// An internal root over `left` (keys below `key`) and `right`.
pub fn root_raw(left: Address, right: Address, key: u64) -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    set_leaf(&mut raw, false);
    set_nkeys(&mut raw, 2);
    set_sibling(&mut raw, Address::NIL);
    set_son(&mut raw, 0, left);
    set_key(&mut raw, 0, key);
    set_son(&mut raw, 1, right);
    set_key(&mut raw, 1, INF);
    raw
}

/// Where [`Node::search_next`] leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Child(Address),
    Sibling(Address),
}

/// Result of [`Node::insert_and_split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The key is beyond this node; retry at the sibling.
    Sibling(Address),
    Done,
    /// The node split; `son` took the upper half, starting at `key`.
    Split { son: Address, key: u64 },
}

/// Insert `(key, son)` into `raw`. `false` if the key belongs to the sibling.
fn insert(raw: &mut [u8], key: u64, son: Address) -> bool {
    let n = nkeys(raw);
    let kth = (0..n).find(|&i| self::key(raw, i) >= key).unwrap_or(n);
    if kth == n && !sibling(raw).is_nil() {
        return false;
    }

    if is_leaf(raw) {
        shift_from(raw, kth);
        set_key(raw, kth, key);
        set_son(raw, kth, son);
    } else {
        //  son kth now stops at `key`; the new son covers up to the old bound
        let bound = self::key(raw, kth);
        set_key(raw, kth, key);
        shift_from(raw, kth + 1);
        set_key(raw, kth + 1, bound);
        set_son(raw, kth + 1, son);
    }
    set_nkeys(raw, n + 1);
    true
}

/// The upper half of `raw` as a new node inheriting its sibling.
fn upper_half(raw: &[u8]) -> Vec<u8> {
    let mut upper = vec![0u8; NODE_SIZE];
    set_leaf(&mut upper, is_leaf(raw));
    set_nkeys(&mut upper, B);
    set_sibling(&mut upper, sibling(raw));
    let from = pair_offset(B);
    upper[HEADER_LEN..HEADER_LEN + NODE_SIZE - from].copy_from_slice(&raw[from..]);
    upper
}

/// A node loaded through the data manager.
pub struct Node {
    item: DataItemHandle,
}

impl Node {
    pub fn load(dm: &DataManager, address: Address) -> Result<Self> {
        let item = dm
            .read(address)?
            .ok_or_else(|| Error::Corrupt(format!("no tree node at {address}")))?;
        if item.len() != NODE_SIZE {
            return Err(Error::Corrupt(format!(
                "item at {address} is {} bytes, not a tree node",
                item.len()
            )));
        }
        Ok(Self { item })
    }

    pub fn address(&self) -> Address {
        self.item.address()
    }

    pub fn is_leaf(&self) -> bool {
        self.item.with_data(is_leaf)
    }

    pub fn nkeys(&self) -> usize {
        self.item.with_data(nkeys)
    }

    fn next_where(&self, mut bounds: impl FnMut(u64) -> bool) -> Next {
        self.item.with_data(|raw| {
            let n = nkeys(raw);
            match (0..n).find(|&i| bounds(key(raw, i))) {
                Some(kth) => Next::Child(son(raw, kth)),
                None => Next::Sibling(sibling(raw)),
            }
        })
    }

    /// The child covering `key`, or the sibling if every key here is at most `key`.
    pub fn search_next(&self, key: u64) -> Next {
        self.next_where(|bound| key < bound)
    }

    /// The left-most child that can hold `key`.
    ///
    /// A leaf split between duplicates leaves copies of the separator in the lower half, so
    /// range scans descend here and walk right.
    pub fn search_first(&self, key: u64) -> Next {
        self.next_where(|bound| key <= bound)
    }

    /// Addresses stored in this leaf under keys in `[low, high]`, plus the sibling to continue
    /// with if the range may extend past this node.
    pub fn leaf_search_range(&self, low: u64, high: u64) -> (Vec<Address>, Option<Address>) {
        self.item.with_data(|raw| {
            let n = nkeys(raw);
            let mut kth = (0..n).find(|&i| key(raw, i) >= low).unwrap_or(n);
            let mut found = Vec::new();
            while kth < n && key(raw, kth) <= high {
                found.push(son(raw, kth));
                kth += 1;
            }
            let next = sibling(raw);
            let next = (kth == n && !next.is_nil()).then_some(next);
            (found, next)
        })
    }

    /// Insert `(key, son)` under this node's latch, splitting it once it is full.
    ///
    /// The whole change is logged under the super transaction; on error the node is left as
    /// it was.
    pub fn insert_and_split(&self, dm: &DataManager, key: u64, son: Address) -> Result<Inserted> {
        let mut guard = self.item.before();
        if !guard.with_data_mut(|raw| insert(raw, key, son)) {
            let next = guard.with_data(sibling);
            guard.cancel_before();
            return Ok(Inserted::Sibling(next));
        }
        if guard.with_data(nkeys) < 2 * B {
            guard.after(SUPER_XID)?;
            return Ok(Inserted::Done);
        }

        let upper = guard.with_data(upper_half);
        //  an error here drops the guard, which restores the node
        let new_son = dm.insert(SUPER_XID, &upper)?;
        guard.with_data_mut(|raw| {
            set_nkeys(raw, B);
            set_sibling(raw, new_son);
        });
        guard.after(SUPER_XID)?;
        Ok(Inserted::Split {
            son: new_son,
            key: self::key(&upper, 0),
        })
    }
}

#[cfg(test)]
mod node_tests {
    use std::sync::Arc;

    use super::*;
    use crate::file::MemFile;

    fn dm() -> DataManager {
        DataManager::create(Arc::new(MemFile::new()), Arc::new(MemFile::new()), 16).unwrap()
    }

    fn a(n: u64) -> Address {
        Address::from_u64(1000 + n)
    }

    #[test]
    fn test_leaf_insert_keeps_order() {
        let mut raw = empty_root_raw();
        for k in [5, 1, 3, 4, 2] {
            assert!(insert(&mut raw, k, a(k)));
        }
        assert_eq!(nkeys(&raw), 5);
        for i in 0..5 {
            assert_eq!(key(&raw, i), i as u64 + 1);
            assert_eq!(son(&raw, i), a(i as u64 + 1));
        }
    }

    #[test]
    fn test_internal_insert_splits_range() {
        let left = Address::new(2, 2);
        let right = Address::new(3, 2);
        let mut raw = root_raw(left, right, 100);

        //  right split at 150 into right and mid
        let mid = Address::new(4, 2);
        assert!(insert(&mut raw, 150, mid));
        assert_eq!(nkeys(&raw), 3);
        assert_eq!((son(&raw, 0), key(&raw, 0)), (left, 100));
        assert_eq!((son(&raw, 1), key(&raw, 1)), (right, 150));
        assert_eq!((son(&raw, 2), key(&raw, 2)), (mid, INF));
    }

    #[test]
    fn test_insert_past_end_defers_to_sibling() {
        let mut raw = empty_root_raw();
        insert(&mut raw, 10, a(10));
        set_sibling(&mut raw, Address::new(9, 2));
        assert!(!insert(&mut raw, 11, a(11)));
        assert!(insert(&mut raw, 10, a(10)));
    }

    #[test]
    fn test_split_halves() {
        let dm = dm();
        let address = dm.insert(SUPER_XID, &empty_root_raw()).unwrap();
        let node = Node::load(&dm, address).unwrap();

        for k in 0..(2 * B as u64 - 1) {
            assert_eq!(node.insert_and_split(&dm, k, a(k)).unwrap(), Inserted::Done);
        }
        let Inserted::Split { son, key } = node
            .insert_and_split(&dm, 2 * B as u64 - 1, a(2 * B as u64 - 1))
            .unwrap()
        else {
            panic!("expected a split");
        };
        assert_eq!(key, B as u64);
        assert_eq!(node.nkeys(), B);

        let upper = Node::load(&dm, son).unwrap();
        assert!(upper.is_leaf());
        assert_eq!(upper.nkeys(), B);

        let (found, next) = node.leaf_search_range(0, INF - 1);
        assert_eq!(found.len(), B);
        assert_eq!(next, Some(son));
        let (found, next) = upper.leaf_search_range(0, INF - 1);
        assert_eq!(found, (B as u64..2 * B as u64).map(a).collect::<Vec<_>>());
        assert_eq!(next, None);
    }

    #[test]
    fn test_search_next() {
        let dm = dm();
        let left = Address::new(2, 2);
        let right = Address::new(3, 2);
        let address = dm.insert(SUPER_XID, &root_raw(left, right, 50)).unwrap();
        let node = Node::load(&dm, address).unwrap();
        assert!(!node.is_leaf());
        assert_eq!(node.search_next(0), Next::Child(left));
        assert_eq!(node.search_next(49), Next::Child(left));
        assert_eq!(node.search_next(50), Next::Child(right));
        assert_eq!(node.search_next(INF - 1), Next::Child(right));
        assert_eq!(node.search_first(49), Next::Child(left));
        assert_eq!(node.search_first(50), Next::Child(left));
        assert_eq!(node.search_first(51), Next::Child(right));
    }

    #[test]
    fn test_load_rejects_non_node() {
        let dm = dm();
        let address = dm.insert(SUPER_XID, b"not a node").unwrap();
        assert!(matches!(Node::load(&dm, address), Err(Error::Corrupt(_))));
    }
}
