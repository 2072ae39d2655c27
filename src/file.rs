//! Storage backends for the three database files.
//!
//! Every layer that touches persistent state does so through [`StorageFile`], so the same
//! engine runs over real files ([`DiskFile`]) or shared in-memory buffers ([`MemFile`]).

use std::{
    ffi::OsString,
    fmt::Debug,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::debug;

/// Positional byte storage with explicit durability.
pub trait StorageFile: Send + Sync + Debug {
    /// Fill `buf` from `offset`. Bytes past the end of the file read as zero.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// A file on disk. Reads and writes are serialized by a mutex around the cursor.
#[derive(Debug)]
pub struct DiskFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl DiskFile {
    /// Create the file, truncating anything already there.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open an existing file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageFile for DiskFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.lock().unwrap().set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.lock().unwrap().sync_data()
    }
}

/// An in-memory file. Clones share the same contents, which lets tests drop an engine
/// without closing it and reopen the "same" files afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemFile {
    contents: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.contents.lock().unwrap().clone()
    }
}

impl StorageFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let contents = self.contents.lock().unwrap();
        let start = (offset as usize).min(contents.len());
        let end = (start + buf.len()).min(contents.len());
        let n = end - start;
        buf[..n].copy_from_slice(&contents[start..end]);
        buf[n..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut contents = self.contents.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.contents.lock().unwrap().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.contents.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// The file triad of one database: pages, write-ahead log and transaction status.
#[derive(Debug, Clone)]
pub struct DbFiles {
    pub data: Arc<dyn StorageFile>,
    pub log: Arc<dyn StorageFile>,
    pub xid: Arc<dyn StorageFile>,
}

pub const DATA_SUFFIX: &str = ".db";
pub const LOG_SUFFIX: &str = ".log";
pub const XID_SUFFIX: &str = ".xid";

/// `<prefix><suffix>`, keeping the prefix's own file name intact.
pub fn suffixed<P: AsRef<Path>>(prefix: P, suffix: &str) -> PathBuf {
    let mut name: OsString = prefix.as_ref().as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl DbFiles {
    /// Create (or truncate) `<prefix>.db`, `<prefix>.log` and `<prefix>.xid`.
    pub fn create<P: AsRef<Path>>(prefix: P) -> io::Result<Self> {
        let prefix = prefix.as_ref();
        debug!(prefix = %prefix.display(), "creating database files");
        Ok(Self {
            data: Arc::new(DiskFile::create(suffixed(prefix, DATA_SUFFIX))?),
            log: Arc::new(DiskFile::create(suffixed(prefix, LOG_SUFFIX))?),
            xid: Arc::new(DiskFile::create(suffixed(prefix, XID_SUFFIX))?),
        })
    }

    /// Open an existing triad. All three files must exist.
    pub fn open<P: AsRef<Path>>(prefix: P) -> io::Result<Self> {
        let prefix = prefix.as_ref();
        debug!(prefix = %prefix.display(), "opening database files");
        Ok(Self {
            data: Arc::new(DiskFile::open(suffixed(prefix, DATA_SUFFIX))?),
            log: Arc::new(DiskFile::open(suffixed(prefix, LOG_SUFFIX))?),
            xid: Arc::new(DiskFile::open(suffixed(prefix, XID_SUFFIX))?),
        })
    }

    /// Three empty in-memory files. Clone the result to keep access after the engine is gone.
    pub fn in_memory() -> Self {
        Self {
            data: Arc::new(MemFile::new()),
            log: Arc::new(MemFile::new()),
            xid: Arc::new(MemFile::new()),
        }
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use crate::test_utils::TestDb;

    fn exercise(file: &dyn StorageFile) {
        assert!(file.is_empty().unwrap());
        file.write_at(4, b"abcd").unwrap();
        assert_eq!(file.len().unwrap(), 8);

        let mut buf = [0xFFu8; 10];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0abcd\0\0");

        file.set_len(6).unwrap();
        assert_eq!(file.len().unwrap(), 6);
        let mut buf = [0u8; 4];
        file.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"ab\0\0");
        file.sync().unwrap();
    }

    #[test]
    fn test_mem_file() {
        let file = MemFile::new();
        exercise(&file);
    }

    #[test]
    fn test_disk_file() {
        let db = TestDb::new();
        let file = DiskFile::create(db.prefix().with_extension("raw")).unwrap();
        exercise(&file);
    }

    #[test]
    fn test_mem_file_clones_share_contents() {
        let file = MemFile::new();
        let other = file.clone();
        file.write_at(0, b"shared").unwrap();
        assert_eq!(other.snapshot(), b"shared");
    }

    #[test]
    fn test_db_files_create_and_open() {
        let db = TestDb::new();
        let files = DbFiles::create(db.prefix()).unwrap();
        files.data.write_at(0, &[1, 2, 3]).unwrap();
        drop(files);

        assert!(suffixed(db.prefix(), DATA_SUFFIX).exists());
        assert!(suffixed(db.prefix(), LOG_SUFFIX).exists());
        assert!(suffixed(db.prefix(), XID_SUFFIX).exists());

        let files = DbFiles::open(db.prefix()).unwrap();
        assert_eq!(files.data.len().unwrap(), 3);
    }

    #[test]
    fn test_open_missing_files_fails() {
        let db = TestDb::new();
        assert!(DbFiles::open(db.prefix()).is_err());
    }
}
