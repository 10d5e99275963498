//! Journal 配置

use super::types::JBD_MIN_BLOCK_SIZE;
use crate::block::BlockNr;
use crate::cache::DEFAULT_HEAD_CACHE_SIZE;
use crate::error::{Error, ErrorKind, Result};
use bitflags::bitflags;
use std::time::Duration;

/// 日志区最少块数（含超级块）
pub const JBD_MIN_JOURNAL_BLOCKS: u32 = 16;

/// 默认 write-behind 批量大小
pub const JBD_DEFAULT_BATCH_SIZE: usize = 64;

/// 默认提交间隔
pub const JBD_DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

bitflags! {
    /// Journal 选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JournalFlags: u32 {
        /// commit 记录前后各做一次设备缓存刷新
        const BARRIER               = 0x1;
        /// ordered 数据写入失败时中止日志
        const ABORT_ON_SYNCDATA_ERR = 0x2;
        /// descriptor/revoke 块尾与 commit 块携带 CRC32
        const CHECKSUM              = 0x4;
    }
}

/// Journal 配置
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// 日志区起始块（超级块所在位置），日志块紧随其后
    pub journal_start: BlockNr,
    /// 日志区总块数（含超级块）
    pub journal_len: u32,
    /// 一批最多提交的写请求数（write-behind 数组大小）
    pub batch_size: usize,
    /// 单个事务最多持有的元数据块数，0 表示 `journal_len / 4`
    pub max_transaction_buffers: u32,
    /// 提交线程的定时提交间隔
    pub commit_interval: Duration,
    /// 日志 UUID（写入每个 descriptor 的第一个 tag 之后）
    pub uuid: [u8; 16],
    /// journal head 缓存容量（块数）
    pub head_cache_size: usize,
    /// 选项
    pub flags: JournalFlags,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            journal_start: 1,
            journal_len: 1024,
            batch_size: JBD_DEFAULT_BATCH_SIZE,
            max_transaction_buffers: 0,
            commit_interval: JBD_DEFAULT_COMMIT_INTERVAL,
            uuid: [0u8; 16],
            head_cache_size: DEFAULT_HEAD_CACHE_SIZE,
            flags: JournalFlags::BARRIER,
        }
    }
}

impl JournalConfig {
    /// 检查配置能否在给定块大小的设备上使用
    pub fn validate(&self, block_size: u32, total_blocks: u64) -> Result<()> {
        if block_size < JBD_MIN_BLOCK_SIZE || block_size % 4 != 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "unsupported journal block size"));
        }
        if self.journal_len < JBD_MIN_JOURNAL_BLOCKS {
            return Err(Error::new(ErrorKind::InvalidInput, "journal too short"));
        }
        if self.journal_start == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "journal cannot start at block 0"));
        }
        let end = u64::from(self.journal_start) + u64::from(self.journal_len);
        if end > total_blocks || end > u64::from(BlockNr::MAX) {
            return Err(Error::new(ErrorKind::InvalidInput, "journal extends beyond device"));
        }
        if self.batch_size < 2 {
            return Err(Error::new(ErrorKind::InvalidInput, "batch size must be at least 2"));
        }
        if self.max_transaction_buffers > self.journal_len {
            return Err(Error::new(ErrorKind::InvalidInput, "transaction limit exceeds journal size"));
        }
        Ok(())
    }

    /// 单个事务的元数据块上限
    pub fn transaction_limit(&self) -> u32 {
        if self.max_transaction_buffers == 0 {
            self.journal_len / 4
        } else {
            self.max_transaction_buffers
        }
    }

    /// 第一个日志块
    pub fn log_first(&self) -> BlockNr {
        self.journal_start + 1
    }

    /// 最后一个日志块之后的块号（不含）
    pub fn log_last(&self) -> BlockNr {
        self.journal_start + self.journal_len
    }

    /// 块号是否落在日志区内
    pub fn contains(&self, blocknr: BlockNr) -> bool {
        blocknr >= self.journal_start && blocknr < self.log_last()
    }

    /// 是否启用校验和
    pub fn checksum(&self) -> bool {
        self.flags.contains(JournalFlags::CHECKSUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JournalConfig::default();
        assert!(config.validate(1024, 4096).is_ok());
        assert_eq!(config.transaction_limit(), 256);
        assert_eq!(config.log_first(), 2);
        assert_eq!(config.log_last(), 1025);
        assert!(config.contains(1));
        assert!(!config.contains(1025));
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let config = JournalConfig::default();
        assert!(config.validate(40, 4096).is_err());
        assert!(config.validate(50, 4096).is_err());
        assert!(config.validate(1024, 1000).is_err());

        let short = JournalConfig { journal_len: 8, ..JournalConfig::default() };
        assert!(short.validate(1024, 4096).is_err());

        let tiny_batch = JournalConfig { batch_size: 1, ..JournalConfig::default() };
        assert!(tiny_batch.validate(1024, 4096).is_err());
    }
}
