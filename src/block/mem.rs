//! 内存块设备
//!
//! 写请求在 [`BlockIo::wait`] 时才生效，未等待的写入不会出现在
//! [`MemDevice::snapshot`] 里，因此快照可以当作"此刻断电"后的磁盘内容。

use super::device::{BlockIo, BlockNr, IoMode, PendingIo};
use crate::error::{Error, ErrorKind, Result};
use crate::sync::{lock, wait, wait_timeout};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// I/O 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventKind {
    /// 请求已提交
    Submit,
    /// 请求成功完成
    Complete,
    /// 请求完成但失败
    Failed,
}

/// 一条 I/O 事件记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    /// 全局递增序号
    pub seq: u64,
    /// I/O 编号（与 [`PendingIo::id`] 对应）
    pub id: u64,
    /// 目标块号
    pub blocknr: BlockNr,
    /// I/O 类别
    pub mode: IoMode,
    /// 事件类型
    pub kind: IoEventKind,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    mode: Option<IoMode>,
    blocknr: Option<BlockNr>,
}

impl Fault {
    fn matches(&self, blocknr: BlockNr, mode: IoMode) -> bool {
        self.mode.map_or(true, |m| m == mode) && self.blocknr.map_or(true, |b| b == blocknr)
    }
}

struct InFlight {
    blocknr: BlockNr,
    mode: IoMode,
    data: Vec<u8>,
    fail: bool,
}

#[derive(Default)]
struct MemInner {
    blocks: HashMap<BlockNr, Vec<u8>>,
    inflight: HashMap<u64, InFlight>,
    events: Vec<IoEvent>,
    faults: Vec<Fault>,
    next_id: u64,
    next_seq: u64,
    held: bool,
    barriers: u64,
}

impl MemInner {
    fn record(&mut self, id: u64, blocknr: BlockNr, mode: IoMode, kind: IoEventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(IoEvent { seq, id, blocknr, mode, kind });
    }
}

/// 内存块设备
///
/// - `hold_writes` / `release_writes`：挂起所有 `wait`，模拟慢速设备
/// - `fail_next` / `fail_block`：让下一次匹配的写请求失败
/// - `events`：按发生顺序记录提交与完成事件
pub struct MemDevice {
    block_size: u32,
    total_blocks: u64,
    inner: Mutex<MemInner>,
    cond: Condvar,
}

impl MemDevice {
    /// 创建全零的内存设备
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            block_size,
            total_blocks,
            inner: Mutex::new(MemInner::default()),
            cond: Condvar::new(),
        }
    }

    /// 读出一个块的持久内容（未写过的块全零）
    pub fn read_block(&self, blocknr: BlockNr) -> Vec<u8> {
        let inner = lock(&self.inner);
        inner
            .blocks
            .get(&blocknr)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size as usize])
    }

    /// 直接写入持久内容，不经过 I/O 队列，也不记录事件
    pub fn write_block(&self, blocknr: BlockNr, data: &[u8]) {
        let mut block = vec![0u8; self.block_size as usize];
        let len = data.len().min(block.len());
        block[..len].copy_from_slice(&data[..len]);
        lock(&self.inner).blocks.insert(blocknr, block);
    }

    /// 挂起写入：之后所有 `wait` 阻塞到 `release_writes`
    pub fn hold_writes(&self) {
        lock(&self.inner).held = true;
    }

    /// 解除写入挂起
    pub fn release_writes(&self) {
        lock(&self.inner).held = false;
        self.cond.notify_all();
    }

    /// 让下一次该类别的写请求失败
    pub fn fail_next(&self, mode: IoMode) {
        lock(&self.inner).faults.push(Fault { mode: Some(mode), blocknr: None });
    }

    /// 让下一次写往该块的请求失败
    pub fn fail_block(&self, blocknr: BlockNr) {
        lock(&self.inner).faults.push(Fault { mode: None, blocknr: Some(blocknr) });
    }

    /// 已记录的 I/O 事件
    pub fn events(&self) -> Vec<IoEvent> {
        lock(&self.inner).events.clone()
    }

    /// 清空事件记录
    pub fn clear_events(&self) {
        lock(&self.inner).events.clear();
    }

    /// 已执行的屏障次数
    pub fn barrier_count(&self) -> u64 {
        lock(&self.inner).barriers
    }

    /// 当前未等待的写请求数量
    pub fn inflight_count(&self) -> usize {
        lock(&self.inner).inflight.len()
    }

    /// 等待直到该类别的提交事件达到 `count` 次
    ///
    /// 超时返回 `false`。
    pub fn wait_for_submits(&self, mode: IoMode, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            let seen = inner
                .events
                .iter()
                .filter(|e| e.mode == mode && e.kind == IoEventKind::Submit)
                .count();
            if seen >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = wait_timeout(&self.cond, inner, deadline - now);
        }
    }

    /// 断电快照：只包含已经完成的写入
    pub fn snapshot(&self) -> MemDevice {
        let inner = lock(&self.inner);
        let copy = MemDevice::new(self.block_size, self.total_blocks);
        lock(&copy.inner).blocks = inner.blocks.clone();
        copy
    }

    fn check_range(&self, blocknr: BlockNr) -> Result<()> {
        if u64::from(blocknr) >= self.total_blocks {
            return Err(Error::new(ErrorKind::InvalidInput, "block number beyond end of device"));
        }
        Ok(())
    }
}

impl BlockIo for MemDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn submit(&self, blocknr: BlockNr, data: Vec<u8>, mode: IoMode) -> Result<PendingIo> {
        self.check_range(blocknr)?;
        if data.len() != self.block_size as usize {
            return Err(Error::new(ErrorKind::InvalidInput, "write buffer is not one block"));
        }

        let mut inner = lock(&self.inner);
        let fail = match inner.faults.iter().position(|f| f.matches(blocknr, mode)) {
            Some(idx) => {
                inner.faults.remove(idx);
                true
            }
            None => false,
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.inflight.insert(id, InFlight { blocknr, mode, data, fail });
        inner.record(id, blocknr, mode, IoEventKind::Submit);
        drop(inner);
        self.cond.notify_all();

        Ok(PendingIo::new(id, blocknr))
    }

    fn wait(&self, pending: PendingIo) -> Result<()> {
        let mut inner = lock(&self.inner);
        while inner.held {
            inner = wait(&self.cond, inner);
        }

        let io = inner
            .inflight
            .remove(&pending.id())
            .ok_or(Error::new(ErrorKind::InvalidInput, "unknown pending I/O"))?;
        let mode = io.mode;

        if io.fail {
            inner.record(pending.id(), io.blocknr, mode, IoEventKind::Failed);
            log::debug!("[MEMDEV] write block={} mode={:?} FAILED", io.blocknr, mode);
            return Err(Error::new(ErrorKind::Io, "injected write failure"));
        }

        inner.blocks.insert(io.blocknr, io.data);
        inner.record(pending.id(), io.blocknr, mode, IoEventKind::Complete);
        Ok(())
    }

    fn flush_barrier(&self) -> Result<()> {
        lock(&self.inner).barriers += 1;
        Ok(())
    }

    fn read(&self, blocknr: BlockNr, buf: &mut [u8]) -> Result<()> {
        self.check_range(blocknr)?;
        let inner = lock(&self.inner);
        match inner.blocks.get(&blocknr) {
            Some(block) => {
                let len = buf.len().min(block.len());
                buf[..len].copy_from_slice(&block[..len]);
            }
            None => buf.fill(0),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_visible_after_wait() {
        let dev = MemDevice::new(64, 16);
        let p = dev.submit(3, vec![0xAB; 64], IoMode::Data).unwrap();

        assert_eq!(dev.read_block(3), vec![0u8; 64]);
        assert_eq!(dev.snapshot().read_block(3), vec![0u8; 64]);

        dev.wait(p).unwrap();
        assert_eq!(dev.read_block(3), vec![0xAB; 64]);

        let kinds: Vec<_> = dev.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![IoEventKind::Submit, IoEventKind::Complete]);
    }

    #[test]
    fn test_fault_injection() {
        let dev = MemDevice::new(64, 16);
        dev.fail_next(IoMode::Log);

        let ok = dev.submit(1, vec![1; 64], IoMode::Data).unwrap();
        let bad = dev.submit(2, vec![2; 64], IoMode::Log).unwrap();
        dev.wait(ok).unwrap();
        assert_eq!(dev.wait(bad).unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(dev.read_block(2), vec![0u8; 64]);

        dev.fail_block(5);
        let bad = dev.submit(5, vec![5; 64], IoMode::Checkpoint).unwrap();
        assert!(dev.wait(bad).is_err());
        let good = dev.submit(5, vec![5; 64], IoMode::Checkpoint).unwrap();
        assert!(dev.wait(good).is_ok());
    }

    #[test]
    fn test_hold_and_release() {
        let dev = Arc::new(MemDevice::new(64, 16));
        dev.hold_writes();
        let p = dev.submit(1, vec![7; 64], IoMode::Data).unwrap();

        let waiter = {
            let dev = dev.clone();
            std::thread::spawn(move || dev.wait(p))
        };
        assert!(dev.wait_for_submits(IoMode::Data, 1, Duration::from_secs(1)));
        assert_eq!(dev.inflight_count(), 1);

        dev.release_writes();
        waiter.join().unwrap().unwrap();
        assert_eq!(dev.read_block(1), vec![7; 64]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let dev = MemDevice::new(64, 16);
        assert!(dev.submit(16, vec![0; 64], IoMode::Data).is_err());
        assert!(dev.submit(1, vec![0; 32], IoMode::Data).is_err());
        assert!(dev.wait(PendingIo::new(99, 1)).is_err());
    }
}
