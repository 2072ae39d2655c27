use std::path::PathBuf;

use rand::{thread_rng, Rng};
use tempfile::TempDir;

/// A scratch directory for one test's database files, removed on drop.
pub struct TestDb {
    dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Path prefix for the database triad inside the directory.
    pub fn prefix(&self) -> PathBuf {
        self.dir.path().join("db")
    }
}

/// Random bytes with a length in `[min, max]`.
pub fn random_payload(min: usize, max: usize) -> Vec<u8> {
    let mut rng = thread_rng();
    let len = rng.gen_range(min..=max);
    (0..len).map(|_| rng.gen()).collect()
}
