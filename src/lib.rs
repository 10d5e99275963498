//! jbd_core: JBD 风格的日志事务提交引擎
//!
//! 这个库实现了块设备日志（JBD）中事务提交的完整流水线：
//! - **有序写入**：ordered 模式数据块在引用它们的元数据写入日志前落盘
//! - **原子提交**：commit 记录落盘之前，事务的任何修改在重放时都不可见
//! - **流水线**：一个事务提交期间，文件系统可以在新事务上继续工作
//! - **检查点**：已提交但尚未写回原位的块被跟踪，直到可以释放日志空间
//!
//! # 示例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jbd_core::{block::MemDevice, Journal, JournalConfig};
//!
//! let dev = Arc::new(MemDevice::new(1024, 4096));
//! let journal = Journal::create(dev.clone(), JournalConfig::default())?;
//!
//! let mut handle = journal.start(4)?;
//! let block = journal.get_block(2000)?;
//! handle.modify_metadata(&block, |data| data[0] = 0x42)?;
//! handle.stop()?;
//!
//! let tid = journal.commit_transaction()?;
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块 I/O 协作者接口与内存设备
//! - [`cache`] - journal head 缓存
//! - [`journal`] - 事务、提交、检查点与恢复

#![deny(unsafe_code)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块 I/O 抽象
pub mod block;

/// Journal head 缓存
pub mod cache;

/// Journal (JBD) 系统
pub mod journal;

/// CRC32 校验和计算
pub(crate) mod crc;

/// 锁辅助
pub(crate) mod sync;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块 I/O
pub use block::{BlockIo, BlockNr, IoMode, MemDevice, PendingIo};

// Cache
pub use cache::{CacheStats, HeadCache, DEFAULT_HEAD_CACHE_SIZE};

// Journal
pub use journal::{
    CommitWorker, Handle, Journal, JournalConfig, JournalError, JournalFlags, JournalHead,
    Tid, Transaction, TransactionState,
};
