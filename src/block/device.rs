//! 块 I/O 协作者接口
//!
//! 日志引擎只通过这里的异步提交/等待接口访问设备，
//! 实际的 I/O 调度由实现者负责。

use crate::error::Result;

/// 设备块号
pub type BlockNr = u32;

/// I/O 类别
///
/// 设备实现可以据此区分调度优先级，测试设备用它记录写入顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoMode {
    /// ordered 模式数据块，写往最终位置
    Data,
    /// 写入日志区的块（descriptor、revoke、元数据副本）
    Log,
    /// commit 记录
    Commit,
    /// 日志超级块
    Superblock,
    /// 检查点写回或恢复重放，写往最终位置
    Checkpoint,
}

/// 已提交但尚未等待的 I/O
///
/// 每个 `PendingIo` 必须恰好被 [`BlockIo::wait`] 一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "a submitted write must be waited on"]
pub struct PendingIo {
    id: u64,
    blocknr: BlockNr,
}

impl PendingIo {
    /// 创建 I/O 令牌（由设备实现调用）
    pub const fn new(id: u64, blocknr: BlockNr) -> Self {
        Self { id, blocknr }
    }

    /// 设备分配的 I/O 编号
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// 目标块号
    pub const fn blocknr(&self) -> BlockNr {
        self.blocknr
    }
}

/// 块 I/O 接口
///
/// 实现此 trait 以提供底层块设备访问。提交与等待分离，
/// 使提交过程可以批量发出写请求后再统一等待。
///
/// # 示例
///
/// ```rust,ignore
/// use jbd_core::{BlockIo, BlockNr, IoMode, PendingIo, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockIo for MyDevice {
///     fn block_size(&self) -> u32 {
///         4096
///     }
///
///     fn total_blocks(&self) -> u64 {
///         1 << 20
///     }
///
///     fn submit(&self, blocknr: BlockNr, data: Vec<u8>, mode: IoMode) -> Result<PendingIo> {
///         // 排队写请求
///         todo!()
///     }
///
///     fn wait(&self, pending: PendingIo) -> Result<()> {
///         // 等待写请求完成并报告结果
///         todo!()
///     }
///
///     fn read(&self, blocknr: BlockNr, buf: &mut [u8]) -> Result<()> {
///         // 同步读
///         todo!()
///     }
/// }
/// ```
pub trait BlockIo: Send + Sync {
    /// 块大小（字节）
    fn block_size(&self) -> u32;

    /// 总块数
    fn total_blocks(&self) -> u64;

    /// 提交一个整块写请求
    ///
    /// 返回的令牌在写入完成前不代表持久化。
    fn submit(&self, blocknr: BlockNr, data: Vec<u8>, mode: IoMode) -> Result<PendingIo>;

    /// 等待写请求完成，返回其 I/O 结果
    fn wait(&self, pending: PendingIo) -> Result<()>;

    /// 刷新设备写缓存（屏障）
    ///
    /// 返回后，之前已完成的写入都已落到持久介质。
    fn flush_barrier(&self) -> Result<()> {
        Ok(())
    }

    /// 同步读取一个块
    fn read(&self, blocknr: BlockNr, buf: &mut [u8]) -> Result<()>;

    /// 同步写入一个块
    fn write_sync(&self, blocknr: BlockNr, data: Vec<u8>, mode: IoMode) -> Result<()> {
        let pending = self.submit(blocknr, data, mode)?;
        self.wait(pending)
    }
}
