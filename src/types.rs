//! Identifiers shared by every layer and the big-endian field codecs used by the on-disk
//! layouts.

use std::fmt::Display;

/// Transaction identifier. Ids start at 1; 0 is the always-committed super transaction.
pub type Xid = u64;

/// The super transaction used for internal, non-transactional writes.
pub const SUPER_XID: Xid = 0;

/// Page number. Pages are numbered from 1.
pub type Pgno = u32;

pub const XID_LEN: usize = 8;
pub const PGNO_LEN: usize = 4;
pub const OFFSET_LEN: usize = 2;
pub const ADDRESS_LEN: usize = 8;

/// Location of a data item: page number in the upper 32 bits, in-page byte offset in the
/// lower 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// The null address. Page 0 does not exist, so no data item can live here.
    pub const NIL: Address = Address(0);

    pub fn new(pgno: Pgno, offset: u16) -> Self {
        Self(((pgno as u64) << 32) | offset as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn pgno(self) -> Pgno {
        (self.0 >> 32) as Pgno
    }

    pub fn offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pgno(), self.offset())
    }
}

pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_be_bytes(bytes)
}

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod address_tests {
    use super::*;

    #[test]
    fn test_address_packing() {
        let address = Address::new(77, 4021);
        assert_eq!(address.pgno(), 77);
        assert_eq!(address.offset(), 4021);
        assert_eq!(address.as_u64(), (77u64 << 32) | 4021);
        assert_eq!(Address::from_u64(address.as_u64()), address);
        assert_eq!(address.to_string(), "77:4021");
    }

    #[test]
    fn test_nil_address() {
        assert!(Address::NIL.is_nil());
        assert!(!Address::new(1, 0).is_nil());
    }

    #[test]
    fn test_field_codecs() {
        let mut buf = vec![0u8; 16];
        put_u16(&mut buf, 0, 0xBEEF);
        put_u32(&mut buf, 2, 0xDEAD_BEEF);
        put_u64(&mut buf, 6, u64::MAX - 1);
        assert_eq!(get_u16(&buf, 0), 0xBEEF);
        assert_eq!(get_u32(&buf, 2), 0xDEAD_BEEF);
        assert_eq!(get_u64(&buf, 6), u64::MAX - 1);
        //  big-endian on disk
        assert_eq!(&buf[0..2], &[0xBE, 0xEF]);
    }
}
