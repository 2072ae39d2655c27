use crate::{
    error::{Error, Result},
    mvcc::IsolationLevel,
    page::PAGE_SIZE,
};

/// The page cache refuses to run with fewer resident pages than this.
pub const MIN_CACHE_PAGES: u64 = 10;

const DEFAULT_MEMORY: u64 = 64 * 1024 * 1024;

/// Engine configuration supplied at create/open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Memory budget for the page cache in bytes.
    pub memory: u64,
    /// Isolation level used by [`crate::Database::begin_default`].
    pub default_isolation: IsolationLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl Config {
    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let minimum = MIN_CACHE_PAGES * PAGE_SIZE as u64;
        if self.memory < minimum {
            return Err(Error::MemoryTooSmall {
                memory: self.memory,
                minimum,
            });
        }
        Ok(())
    }

    /// Number of page handles the page cache may keep resident.
    pub fn cache_pages(&self) -> usize {
        (self.memory / PAGE_SIZE as u64) as usize
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.cache_pages(), (64 * 1024 * 1024) / PAGE_SIZE);
    }

    #[test]
    fn test_memory_lower_bound() {
        let config = Config::default().with_memory(9 * PAGE_SIZE as u64);
        assert!(matches!(
            config.validate(),
            Err(Error::MemoryTooSmall { .. })
        ));

        let config = config.with_memory(10 * PAGE_SIZE as u64);
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_pages(), 10);
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_memory(1 << 20)
            .with_isolation(IsolationLevel::RepeatableRead);
        assert_eq!(config.memory, 1 << 20);
        assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
    }
}
