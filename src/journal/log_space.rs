//! 日志空间分配
//!
//! 日志区是一个环：提交从 `head` 依次取块，检查点完成后 `tail` 前移归还空间。
//!
//! ```text
//!  first                                           last
//!    │   free   │ tail ──── 已提交/提交中 ──── head │   free   │
//!    └──────────┴───────────────────────────────────┴──────────┘
//! ```

use super::JournalError;
use crate::block::BlockNr;
use crate::error::Result;

/// 为余量估算保留的块数
pub const JBD_LOG_RESERVED_BLOCKS: u32 = 2;

/// 日志空间分配器
pub trait LogAllocator: Send {
    /// 取下一个日志块，日志已满时返回 `LogFull`
    fn next_log_address(&mut self) -> Result<BlockNr>;

    /// 下一个待分配的块
    fn head(&self) -> BlockNr;

    /// 最旧的仍被占用的块
    fn tail(&self) -> BlockNr;

    /// 空闲块数
    fn free_blocks(&self) -> u32;

    /// 尾部前移到 `tail`，归还其间的块
    ///
    /// `tail` 必须是仍被占用的块；日志整体清空用 [`release_all`](Self::release_all)。
    fn release_to(&mut self, tail: BlockNr);

    /// 尾部追上头部，归还全部空间
    fn release_all(&mut self);

    /// 清空日志，从 `at` 开始重新分配
    fn reset(&mut self, at: BlockNr);

    /// 可供新 handle 预留的块数
    ///
    /// 扣除保留块后再留出 1/8 给 descriptor 与 commit 记录。
    fn space_left(&self) -> u32 {
        let left = self.free_blocks().saturating_sub(JBD_LOG_RESERVED_BLOCKS);
        left - (left >> 3)
    }
}

/// 环形日志分配器
#[derive(Debug, Clone)]
pub struct CircularLog {
    first: BlockNr,
    last: BlockNr,
    head: BlockNr,
    tail: BlockNr,
    free: u32,
}

impl CircularLog {
    /// 日志块区间 `[first, last)`
    pub fn new(first: BlockNr, last: BlockNr) -> Self {
        Self { first, last, head: first, tail: first, free: last - first }
    }

    /// 日志块总数
    pub fn total_blocks(&self) -> u32 {
        self.last - self.first
    }

    /// 环上从 `from` 前进到 `to` 的距离
    fn distance(&self, from: BlockNr, to: BlockNr) -> u32 {
        if to >= from {
            to - from
        } else {
            (self.last - from) + (to - self.first)
        }
    }
}

impl LogAllocator for CircularLog {
    fn next_log_address(&mut self) -> Result<BlockNr> {
        if self.free == 0 {
            return Err(JournalError::LogFull.into());
        }
        let blocknr = self.head;
        self.head += 1;
        if self.head == self.last {
            self.head = self.first;
        }
        self.free -= 1;
        Ok(blocknr)
    }

    fn head(&self) -> BlockNr {
        self.head
    }

    fn tail(&self) -> BlockNr {
        self.tail
    }

    fn free_blocks(&self) -> u32 {
        self.free
    }

    fn release_to(&mut self, tail: BlockNr) {
        if tail < self.first || tail >= self.last {
            log::warn!("[JBD] ignoring log tail {} outside [{}, {})", tail, self.first, self.last);
            return;
        }
        let freed = self.distance(self.tail, tail);
        self.free = (self.free + freed).min(self.total_blocks());
        self.tail = tail;
    }

    fn release_all(&mut self) {
        self.tail = self.head;
        self.free = self.total_blocks();
    }

    fn reset(&mut self, at: BlockNr) {
        self.head = at;
        self.tail = at;
        self.free = self.total_blocks();
    }
}
