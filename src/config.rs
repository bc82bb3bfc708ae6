use crate::error::JournalError;
use crate::journal::entry::JOURNAL_ENTRY_BYTES;
use serde::{Deserialize, Serialize};

/// Tuning knobs for a journaling layer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Granularity at which already-applied journal regions are zeroed so
    /// the backing store can reclaim them. Must be a power of two and a
    /// multiple of the journal record size, so punched regions always cover
    /// whole records.
    pub block_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

impl JournalConfig {
    pub fn validate(&self) -> Result<(), JournalError> {
        if !self.block_size.is_power_of_two() {
            return Err(JournalError::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size % JOURNAL_ENTRY_BYTES as u64 != 0 {
            return Err(JournalError::InvalidConfig(format!(
                "block_size {} is not a multiple of the {}-byte journal record",
                self.block_size, JOURNAL_ENTRY_BYTES
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        JournalConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let config = JournalConfig { block_size: 4000 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_block_size_smaller_than_a_record() {
        let config = JournalConfig { block_size: 32 };
        assert!(config.validate().is_err());
    }
}
