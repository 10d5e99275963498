//! Transaction 管理
//!
//! 一个事务收集一段时间内所有 handle 的修改，作为整体原子提交。
//!
//! # 状态机
//!
//! ```text
//! Running ──► Locked ──► Flush ──► Commit ──► CommitRecord ──► Finished
//!    │           │          │
//!    │           │          └─ 写 ordered 数据、revoke、descriptor 与元数据副本
//!    │           └─ 不再接受新 handle，等待已有 handle 结束
//!    └─ 接受新 handle
//! ```

use super::jbd_buf::{BufferList, JournalHead};
use crate::block::{BlockNr, PendingIo};
use crate::sync::{lock, wait};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// 事务号（按 2^32 回绕比较）
pub type Tid = u32;

/// `x` 是否比 `y` 新
#[inline]
pub fn tid_gt(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) > 0
}

/// `x` 是否不比 `y` 旧
#[inline]
pub fn tid_geq(x: Tid, y: Tid) -> bool {
    (x.wrapping_sub(y) as i32) >= 0
}

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionState {
    /// 接受新 handle
    Running,
    /// 等待已有 handle 结束
    Locked,
    /// 写 ordered 数据
    Flush,
    /// 写 revoke、descriptor 与元数据副本
    Commit,
    /// 写 commit 记录
    CommitRecord,
    /// 提交完成（成功或已中止）
    Finished,
}

/// 一个日志区写请求
#[derive(Debug)]
pub(crate) struct LogIo {
    /// 提交失败时为 `None`
    pub(crate) pending: Option<PendingIo>,
    pub(crate) blocknr: BlockNr,
    /// 该副本对应的 shadow 块（descriptor/revoke 为 `None`）
    pub(crate) shadow: Option<Arc<JournalHead>>,
}

/// 事务队列
///
/// 由事务队列锁保护；同一时刻只持有一个事务的队列锁。
#[derive(Debug, Default)]
pub(crate) struct TransactionLists {
    pub(crate) reserved: Vec<Arc<JournalHead>>,
    pub(crate) sync_data: Vec<Arc<JournalHead>>,
    pub(crate) locked: Vec<Arc<JournalHead>>,
    pub(crate) buffers: Vec<Arc<JournalHead>>,
    pub(crate) shadow: Vec<Arc<JournalHead>>,
    pub(crate) forget: Vec<Arc<JournalHead>>,
    /// 已提交、等待写回最终位置的块
    pub(crate) checkpoint: Vec<Arc<JournalHead>>,
    /// 检查点写回进行中的块
    pub(crate) checkpoint_io: Vec<Arc<JournalHead>>,
    /// 元数据副本写请求
    pub(crate) iobuf: Vec<LogIo>,
    /// descriptor / revoke 写请求
    pub(crate) log_ctl: Vec<LogIo>,
}

impl TransactionLists {
    fn list_mut(&mut self, list: BufferList) -> Option<&mut Vec<Arc<JournalHead>>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&mut self.reserved),
            BufferList::SyncData => Some(&mut self.sync_data),
            BufferList::Locked => Some(&mut self.locked),
            BufferList::Metadata => Some(&mut self.buffers),
            BufferList::Shadow => Some(&mut self.shadow),
            BufferList::Forget => Some(&mut self.forget),
        }
    }

    fn list(&self, list: BufferList) -> Option<&Vec<Arc<JournalHead>>> {
        match list {
            BufferList::None => None,
            BufferList::Reserved => Some(&self.reserved),
            BufferList::SyncData => Some(&self.sync_data),
            BufferList::Locked => Some(&self.locked),
            BufferList::Metadata => Some(&self.buffers),
            BufferList::Shadow => Some(&self.shadow),
            BufferList::Forget => Some(&self.forget),
        }
    }

    pub(crate) fn insert(&mut self, list: BufferList, head: Arc<JournalHead>) {
        if let Some(queue) = self.list_mut(list) {
            queue.push(head);
        }
    }

    pub(crate) fn remove(&mut self, list: BufferList, head: &JournalHead) -> bool {
        match self.list_mut(list) {
            Some(queue) => remove_head(queue, head),
            None => false,
        }
    }

    /// 从检查点队列（含写回中）移除
    pub(crate) fn remove_checkpoint(&mut self, head: &JournalHead) -> bool {
        remove_head(&mut self.checkpoint, head) || remove_head(&mut self.checkpoint_io, head)
    }

    pub(crate) fn first(&self, list: BufferList) -> Option<Arc<JournalHead>> {
        self.list(list).and_then(|queue| queue.first().cloned())
    }

    pub(crate) fn len(&self, list: BufferList) -> usize {
        self.list(list).map_or(0, Vec::len)
    }
}

/// 从队列中按身份移除一个 head
pub(crate) fn remove_head(queue: &mut Vec<Arc<JournalHead>>, head: &JournalHead) -> bool {
    match queue.iter().position(|h| std::ptr::eq(Arc::as_ptr(h), head)) {
        Some(idx) => {
            queue.remove(idx);
            true
        }
        None => false,
    }
}

/// 事务控制字段（由事务锁保护）
#[derive(Debug)]
pub(crate) struct TransactionInner {
    pub(crate) state: TransactionState,
    /// 仍在运行的 handle 数
    pub(crate) updates: u32,
    /// 已预留的日志块数
    pub(crate) outstanding_credits: u32,
    /// 累计 handle 数
    pub(crate) handle_count: u32,
    /// 事务在日志中的起始块
    pub(crate) log_start: Option<BlockNr>,
    /// 已写入日志的块数
    pub(crate) log_blocks: u32,
    /// 提交中尚未取用的日志块数
    pub(crate) log_reserved: u32,
}

/// 事务
///
/// 由 [`Journal`](super::Journal) 创建；文件系统通过 [`Handle`](super::Handle) 向其添加修改。
#[derive(Debug)]
pub struct Transaction {
    tid: Tid,
    inner: Mutex<TransactionInner>,
    /// `updates` 归零时通知
    updates_cond: Condvar,
    lists: Mutex<TransactionLists>,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn new(tid: Tid) -> Self {
        Self {
            tid,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Running,
                updates: 0,
                outstanding_credits: 0,
                handle_count: 0,
                log_start: None,
                log_blocks: 0,
                log_reserved: 0,
            }),
            updates_cond: Condvar::new(),
            lists: Mutex::new(TransactionLists::default()),
            start_time: Instant::now(),
        }
    }

    /// 事务号
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// 当前状态
    pub fn state(&self) -> TransactionState {
        self.lock_inner().state
    }

    /// 仍在运行的 handle 数
    pub fn updates(&self) -> u32 {
        self.lock_inner().updates
    }

    /// 已预留的日志块数
    pub fn outstanding_credits(&self) -> u32 {
        self.lock_inner().outstanding_credits
    }

    /// 累计 handle 数
    pub fn handle_count(&self) -> u32 {
        self.lock_inner().handle_count
    }

    /// 在日志中的起始块（进入 Flush 后才有）
    pub fn log_start(&self) -> Option<BlockNr> {
        self.lock_inner().log_start
    }

    /// 已写入日志的块数（含 descriptor、revoke 与 commit 记录）
    pub fn log_blocks(&self) -> u32 {
        self.lock_inner().log_blocks
    }

    /// 提交中还要占用的日志块数（进入 Flush 时估算，逐块递减）
    pub fn log_reserved(&self) -> u32 {
        self.lock_inner().log_reserved
    }

    /// 队列长度
    pub fn queue_len(&self, list: BufferList) -> usize {
        self.lists().len(list)
    }

    /// 检查点队列长度（含写回中的块）
    pub fn checkpoint_len(&self) -> usize {
        let lists = self.lists();
        lists.checkpoint.len() + lists.checkpoint_io.len()
    }

    /// 事务创建时刻
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, TransactionInner> {
        lock(&self.inner)
    }

    pub(crate) fn lists(&self) -> MutexGuard<'_, TransactionLists> {
        lock(&self.lists)
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        self.lock_inner().state = state;
    }

    /// 阻塞直到所有 handle 结束
    pub(crate) fn wait_for_updates(&self) {
        let mut inner = self.lock_inner();
        while inner.updates > 0 {
            inner = wait(&self.updates_cond, inner);
        }
    }

    /// handle 结束：归还未用 credit，`updates` 减一
    pub(crate) fn release_handle(&self, unused_credits: u32) {
        let mut inner = self.lock_inner();
        inner.outstanding_credits = inner.outstanding_credits.saturating_sub(unused_credits);
        inner.updates = inner.updates.saturating_sub(1);
        if inner.updates == 0 {
            self.updates_cond.notify_all();
        }
    }
}
