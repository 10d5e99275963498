//! Journal (JBD) 实现
//!
//! 这个模块提供日志事务的完整生命周期：handle 把修改归入运行中的事务，
//! 提交器把事务写入日志，检查点把已提交的块写回原位，恢复在崩溃后重放日志。
//!
//! # 架构概述
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Filesystem Layer                         │
//! │     Journal::start() / Handle::dirty_metadata() / stop()  │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Journal Core                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │   Journal    │  │ Transaction  │  │ JournalHead  │   │
//! │  │  (Manager)   │  │  (queues)    │  │   (block)    │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘   │
//! │         │                  │                  │           │
//! │         └───────── classify (file/refile) ────┘           │
//! │                            │                              │
//! │   ┌────────────┐   ┌───────┴───────┐   ┌────────────┐    │
//! │   │CommitWorker│──►│   Committer   │──►│ Checkpoint │    │
//! │   └────────────┘   │descriptor/    │   │  Registry  │    │
//! │                    │revoke/commit  │   └────────────┘    │
//! │                    └───────┬───────┘                      │
//! └────────────────────────────┼──────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Block Layer                           │
//! │        BlockIo (submit / wait / flush_barrier)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # 核心组件
//!
//! - [`types`] - 日志磁盘格式定义
//! - [`Journal`] - 日志管理器，维护运行中与提交中的事务
//! - [`Transaction`] - 单个事务及其块队列
//! - [`JournalHead`] - 一个设备块在日志中的状态
//! - [`Handle`] - 文件系统一次操作的入口
//! - [`CommitWorker`] - 提交线程
//!
//! # 对应关系
//!
//! | JBD                          | 本模块                        |
//! |------------------------------|-------------------------------|
//! | `journal_t`                  | [`Journal`]                   |
//! | `transaction_t`              | [`Transaction`]               |
//! | `struct journal_head`        | [`JournalHead`]               |
//! | `handle_t`                   | [`Handle`]                    |
//! | `journal_commit_transaction` | `Journal::commit_transaction` |
//! | `__journal_file_buffer`      | [`file`]                      |
//! | `__journal_refile_buffer`    | [`refile`]                    |
//! | `log_do_checkpoint`          | [`Journal::checkpoint`]       |
//! | `journal_recover`            | [`recover`]                   |
//! | `kjournald`                  | [`CommitWorker`]              |

pub mod types;

mod checkpoint;
mod classify;
mod commit;
mod config;
mod descriptor;
mod handle;
mod jbd_buf;
mod jbd_journal;
mod jbd_trans;
mod log_space;
mod recovery;
mod revoke;
mod worker;

// Re-exports
pub use checkpoint::CheckpointRegistry;
pub use classify::{file, refile, unfile};
pub use commit::CommitRecordWriter;
pub use config::{
    JournalConfig, JournalFlags, JBD_DEFAULT_BATCH_SIZE, JBD_DEFAULT_COMMIT_INTERVAL, JBD_MIN_JOURNAL_BLOCKS,
};
pub use descriptor::{parse_tags, Descriptor, DescriptorWriter};
pub use handle::Handle;
pub use jbd_buf::{BufferFlags, BufferList, BufferState, JournalHead};
pub use jbd_journal::Journal;
pub use jbd_trans::{tid_geq, tid_gt, Tid, Transaction, TransactionState};
pub use log_space::{CircularLog, LogAllocator, JBD_LOG_RESERVED_BLOCKS};
pub use recovery::{read_superblock, recover, RecoveryInfo};
pub use revoke::{parse_revoke_block, RevokeTable, RevokeWriter};
pub use types::*;
pub use worker::CommitWorker;

/// Journal 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    /// 块设备读写失败
    IoError,
    /// 日志空间耗尽
    LogFull,
    /// 日志已中止
    JournalAborted,
    /// descriptor / revoke 块损坏
    CorruptDescriptor,
    /// 日志超级块无效
    InvalidSuperblock,
    /// handle 请求的 credit 超过事务上限
    TooManyCredits,
}

impl core::fmt::Display for JournalError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            JournalError::IoError => write!(f, "Journal I/O error"),
            JournalError::LogFull => write!(f, "Journal log is full"),
            JournalError::JournalAborted => write!(f, "Journal has been aborted"),
            JournalError::CorruptDescriptor => write!(f, "Corrupt journal descriptor block"),
            JournalError::InvalidSuperblock => write!(f, "Invalid journal superblock"),
            JournalError::TooManyCredits => write!(f, "Too many credits requested"),
        }
    }
}
