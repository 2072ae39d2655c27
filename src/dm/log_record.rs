//! Log record formats written by the data manager.
//!
//! ```text
//! Insert: [0][xid: u64][pgno: u32][offset: u16][raw]
//! Update: [1][xid: u64][address: u64][old raw][new raw]
//! ```
//!
//! The two raws of an update always have the same length, so each is half of what follows
//! the address.

use std::fmt::Display;

use crate::{
    error::{Error, Result},
    types::{
        get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, Address, Pgno, Xid, ADDRESS_LEN,
        OFFSET_LEN, PGNO_LEN, XID_LEN,
    },
};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

const XID_OFFSET: usize = 1;
const INSERT_PGNO_OFFSET: usize = XID_OFFSET + XID_LEN;
const INSERT_OFFSET_OFFSET: usize = INSERT_PGNO_OFFSET + PGNO_LEN;
const INSERT_RAW_OFFSET: usize = INSERT_OFFSET_OFFSET + OFFSET_LEN;
const UPDATE_ADDRESS_OFFSET: usize = XID_OFFSET + XID_LEN;
const UPDATE_RAW_OFFSET: usize = UPDATE_ADDRESS_OFFSET + ADDRESS_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: Pgno,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        address: Address,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

pub fn encode_insert(xid: Xid, pgno: Pgno, offset: u16, raw: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; INSERT_RAW_OFFSET + raw.len()];
    bytes[0] = TYPE_INSERT;
    put_u64(&mut bytes, XID_OFFSET, xid);
    put_u32(&mut bytes, INSERT_PGNO_OFFSET, pgno);
    put_u16(&mut bytes, INSERT_OFFSET_OFFSET, offset);
    bytes[INSERT_RAW_OFFSET..].copy_from_slice(raw);
    bytes
}

pub fn encode_update(xid: Xid, address: Address, old_raw: &[u8], new_raw: &[u8]) -> Vec<u8> {
    assert_eq!(
        old_raw.len(),
        new_raw.len(),
        "in-place update must keep the item size"
    );
    let mut bytes = vec![0u8; UPDATE_RAW_OFFSET + old_raw.len() * 2];
    bytes[0] = TYPE_UPDATE;
    put_u64(&mut bytes, XID_OFFSET, xid);
    put_u64(&mut bytes, UPDATE_ADDRESS_OFFSET, address.as_u64());
    let split = UPDATE_RAW_OFFSET + old_raw.len();
    bytes[UPDATE_RAW_OFFSET..split].copy_from_slice(old_raw);
    bytes[split..].copy_from_slice(new_raw);
    bytes
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
        }
    }

    /// Page the record writes to.
    pub fn pgno(&self) -> Pgno {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { address, .. } => address.pgno(),
        }
    }

    #[cfg(test)]
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => encode_insert(*xid, *pgno, *offset, raw),
            LogRecord::Update {
                xid,
                address,
                old_raw,
                new_raw,
            } => encode_update(*xid, *address, old_raw, new_raw),
        }
    }
}

impl TryFrom<&[u8]> for LogRecord {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&TYPE_INSERT) => {
                if bytes.len() < INSERT_RAW_OFFSET {
                    return Err(Error::Corrupt(format!(
                        "insert log record of {} bytes",
                        bytes.len()
                    )));
                }
                Ok(LogRecord::Insert {
                    xid: get_u64(bytes, XID_OFFSET),
                    pgno: get_u32(bytes, INSERT_PGNO_OFFSET),
                    offset: get_u16(bytes, INSERT_OFFSET_OFFSET),
                    raw: bytes[INSERT_RAW_OFFSET..].to_vec(),
                })
            }
            Some(&TYPE_UPDATE) => {
                if bytes.len() < UPDATE_RAW_OFFSET || (bytes.len() - UPDATE_RAW_OFFSET) % 2 != 0 {
                    return Err(Error::Corrupt(format!(
                        "update log record of {} bytes",
                        bytes.len()
                    )));
                }
                let half = (bytes.len() - UPDATE_RAW_OFFSET) / 2;
                let split = UPDATE_RAW_OFFSET + half;
                Ok(LogRecord::Update {
                    xid: get_u64(bytes, XID_OFFSET),
                    address: Address::from_u64(get_u64(bytes, UPDATE_ADDRESS_OFFSET)),
                    old_raw: bytes[UPDATE_RAW_OFFSET..split].to_vec(),
                    new_raw: bytes[split..].to_vec(),
                })
            }
            Some(other) => Err(Error::Corrupt(format!("unknown log record type {other}"))),
            None => Err(Error::Corrupt("empty log record".to_string())),
        }
    }
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => write!(
                f,
                "INSERT xid={xid} at {} ({} bytes)",
                Address::new(*pgno, *offset),
                raw.len()
            ),
            LogRecord::Update {
                xid,
                address,
                new_raw,
                ..
            } => write!(f, "UPDATE xid={xid} at {address} ({} bytes)", new_raw.len()),
        }
    }
}

#[cfg(test)]
mod log_record_tests {
    use super::*;

    #[test]
    fn test_insert_layout() {
        let bytes = encode_insert(9, 4, 300, b"raw!");
        assert_eq!(bytes.len(), 1 + 8 + 4 + 2 + 4);
        assert_eq!(bytes[0], TYPE_INSERT);
        let record = LogRecord::try_from(bytes.as_slice()).unwrap();
        assert_eq!(
            record,
            LogRecord::Insert {
                xid: 9,
                pgno: 4,
                offset: 300,
                raw: b"raw!".to_vec()
            }
        );
        assert_eq!(record.pgno(), 4);
        assert_eq!(record.to_bytes(), bytes);
    }

    #[test]
    fn test_update_layout() {
        let address = Address::new(12, 40);
        let bytes = encode_update(3, address, b"old", b"new");
        assert_eq!(bytes.len(), 1 + 8 + 8 + 6);
        match LogRecord::try_from(bytes.as_slice()).unwrap() {
            LogRecord::Update {
                xid,
                address: parsed,
                old_raw,
                new_raw,
            } => {
                assert_eq!(xid, 3);
                assert_eq!(parsed, address);
                assert_eq!(old_raw, b"old");
                assert_eq!(new_raw, b"new");
            }
            other => panic!("expected update, got {other}"),
        }
    }

    #[test]
    fn test_malformed_records() {
        assert!(LogRecord::try_from(&[][..]).is_err());
        assert!(LogRecord::try_from(&[7u8, 0, 0][..]).is_err());
        assert!(LogRecord::try_from(&[TYPE_INSERT, 0, 0][..]).is_err());

        let mut odd = encode_update(1, Address::new(2, 2), b"ab", b"cd");
        odd.push(0);
        assert!(matches!(
            LogRecord::try_from(odd.as_slice()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_display() {
        let record = LogRecord::try_from(encode_insert(5, 2, 10, &[0; 7]).as_slice()).unwrap();
        assert_eq!(record.to_string(), "INSERT xid=5 at 2:10 (7 bytes)");
    }
}
