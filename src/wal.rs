//! Write-ahead log.
//!
//! File layout: `[running checksum: u32][record]*[torn tail]`, each record
//! `[size: u32][checksum: u32][payload: size]`. The per-record checksum covers the payload;
//! the running checksum covers every well-formed record, header included.
//!
//! Appending a record and updating the running checksum are two separate writes, so a crash
//! in between leaves a running checksum that disagrees with the records. Open tolerates that:
//! it re-validates records from the start, truncates at the first bad one and only warns about
//! a running-checksum mismatch.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    file::StorageFile,
    types::{get_u32, put_u32},
};

const CHECKSUM_OFFSET: usize = 0;
const RECORDS_START: u64 = 4;

const SIZE_OFFSET: usize = 0;
const RECORD_CHECKSUM_OFFSET: usize = 4;
const DATA_OFFSET: usize = 8;

fn running_checksum(previous: u32, record: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(previous);
    hasher.update(record);
    hasher.finalize()
}

fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut record = vec![0u8; DATA_OFFSET + payload.len()];
    put_u32(&mut record, SIZE_OFFSET, payload.len() as u32);
    put_u32(
        &mut record,
        RECORD_CHECKSUM_OFFSET,
        crc32fast::hash(payload),
    );
    record[DATA_OFFSET..].copy_from_slice(payload);
    record
}

#[derive(Debug)]
struct WalState {
    //  read cursor used by rewind/next
    pos: u64,
    //  end of the last well-formed record
    end: u64,
    checksum: u32,
}

#[derive(Debug)]
pub struct Wal {
    file: Arc<dyn StorageFile>,
    state: Mutex<WalState>,
}

impl Wal {
    /// Start an empty log in `file`, discarding anything already there.
    pub fn create(file: Arc<dyn StorageFile>) -> Result<Self> {
        file.set_len(0)?;
        file.write_at(0, &0u32.to_be_bytes())?;
        file.sync()?;
        Ok(Self {
            file,
            state: Mutex::new(WalState {
                pos: RECORDS_START,
                end: RECORDS_START,
                checksum: 0,
            }),
        })
    }

    /// Open an existing log, trimming any torn tail.
    pub fn open(file: Arc<dyn StorageFile>) -> Result<Self> {
        let (wal, stored) = Self::unchecked(file)?;
        let len = wal.len();
        let mut records = 0usize;
        {
            let mut state = wal.state.lock().unwrap();
            let mut computed = 0u32;
            while let Some(record) = wal.read_record(&mut state)? {
                computed = running_checksum(computed, &record);
                records += 1;
            }
            let valid_end = state.pos;
            if valid_end < len {
                warn!(
                    valid_end,
                    file_len = len,
                    "truncating torn tail of write-ahead log"
                );
                wal.file.set_len(valid_end)?;
            }
            if computed != stored {
                warn!(
                    stored,
                    computed, "write-ahead log running checksum mismatch, using recomputed value"
                );
                wal.file.write_at(0, &computed.to_be_bytes())?;
            }
            wal.file.sync()?;
            state.end = valid_end;
            state.checksum = computed;
            state.pos = RECORDS_START;
        }
        info!(records, "opened write-ahead log");
        Ok(wal)
    }

    /// Read every well-formed record of an existing log without modifying the file.
    pub fn inspect(file: Arc<dyn StorageFile>) -> Result<LogInspection> {
        let (wal, stored) = Self::unchecked(file)?;
        let file_len = wal.len();
        let mut state = wal.state.lock().unwrap();
        let mut inspection = LogInspection {
            payloads: Vec::new(),
            stored_checksum: stored,
            computed_checksum: 0,
            valid_len: RECORDS_START,
            file_len,
        };
        while let Some(mut record) = wal.read_record(&mut state)? {
            inspection.computed_checksum = running_checksum(inspection.computed_checksum, &record);
            inspection.payloads.push(record.split_off(DATA_OFFSET));
        }
        inspection.valid_len = state.pos;
        Ok(inspection)
    }

    /// The log as found on disk, with its stored running checksum. Nothing is validated
    /// past the header.
    fn unchecked(file: Arc<dyn StorageFile>) -> Result<(Self, u32)> {
        let len = file.len()?;
        if len < RECORDS_START {
            return Err(Error::CorruptFile(format!(
                "log file is {len} bytes, shorter than its header"
            )));
        }
        let mut header = [0u8; 4];
        file.read_at(0, &mut header)?;
        let stored = get_u32(&header, CHECKSUM_OFFSET);
        let wal = Self {
            file,
            state: Mutex::new(WalState {
                pos: RECORDS_START,
                end: len,
                checksum: stored,
            }),
        };
        Ok((wal, stored))
    }

    /// Read the record at the cursor, including its header, and advance past it.
    ///
    /// `Ok(None)` at the end of the log or at the first record that is cut short or fails
    /// its checksum.
    fn read_record(&self, state: &mut WalState) -> Result<Option<Vec<u8>>> {
        if state.pos + DATA_OFFSET as u64 > state.end {
            return Ok(None);
        }
        let mut header = [0u8; DATA_OFFSET];
        self.file.read_at(state.pos, &mut header)?;
        let size = get_u32(&header, SIZE_OFFSET) as u64;
        if state.pos + DATA_OFFSET as u64 + size > state.end {
            return Ok(None);
        }

        let mut record = vec![0u8; DATA_OFFSET + size as usize];
        self.file.read_at(state.pos, &mut record)?;
        let expected = get_u32(&record, RECORD_CHECKSUM_OFFSET);
        if crc32fast::hash(&record[DATA_OFFSET..]) != expected {
            return Ok(None);
        }
        state.pos += record.len() as u64;
        Ok(Some(record))
    }

    /// Append `payload` as one record and make it durable.
    pub fn log(&self, payload: &[u8]) -> Result<()> {
        let record = wrap(payload);
        let mut state = self.state.lock().unwrap();
        self.file.write_at(state.end, &record)?;
        let checksum = running_checksum(state.checksum, &record);
        self.file.write_at(0, &checksum.to_be_bytes())?;
        self.file.sync()?;
        state.end += record.len() as u64;
        state.checksum = checksum;
        debug!(size = payload.len(), "appended log record");
        Ok(())
    }

    /// Move the read cursor back to the first record.
    pub fn rewind(&self) {
        self.state.lock().unwrap().pos = RECORDS_START;
    }

    /// Payload of the record at the cursor, or `None` at the end of the log.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        Ok(self
            .read_record(&mut state)?
            .map(|mut record| record.split_off(DATA_OFFSET)))
    }

    /// Rewind, then iterate over every record payload.
    pub fn iter(&self) -> LogIterator<'_> {
        self.rewind();
        LogIterator { wal: self }
    }

    /// Running checksum over all records written so far.
    pub fn checksum(&self) -> u32 {
        self.state.lock().unwrap().checksum
    }

    /// Size of the log in bytes, header included.
    pub fn len(&self) -> u64 {
        self.state.lock().unwrap().end
    }

    pub fn is_empty(&self) -> bool {
        self.len() == RECORDS_START
    }

    pub fn close(&self) -> Result<()> {
        self.file.sync()?;
        Ok(())
    }
}

/// What [`Wal::inspect`] found in a log file.
#[derive(Debug)]
pub struct LogInspection {
    pub payloads: Vec<Vec<u8>>,
    pub stored_checksum: u32,
    pub computed_checksum: u32,
    /// End of the last well-formed record.
    pub valid_len: u64,
    pub file_len: u64,
}

impl LogInspection {
    /// Bytes past the last well-formed record that the next open would truncate.
    pub fn torn_bytes(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

/// Forward cursor over the log. Shares the log's single read position.
pub struct LogIterator<'a> {
    wal: &'a Wal,
}

impl Iterator for LogIterator<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.wal.next().transpose()
    }
}
