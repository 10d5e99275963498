//! Journal head（块的日志状态）
//!
//! 每个参与日志的设备块对应一个 [`JournalHead`]，记录块内容、
//! 所属事务、所在队列以及为提交准备的副本。
//!
//! # 并发
//!
//! 头部状态由自身的互斥锁保护（即"块锁"）。需要同时修改事务队列时，
//! 先取块锁，再取事务队列锁。

use super::jbd_trans::{Tid, Transaction};
use crate::block::{BlockNr, PendingIo};
use crate::sync::{lock, try_lock};
use bitflags::bitflags;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

bitflags! {
    /// 块标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u8 {
        /// 需要写回最终位置
        const DIRTY     = 0x1;
        /// 日志化元数据，提交后转入检查点
        const JBD_DIRTY = 0x2;
        /// 当前事务已为此块扣除 credit
        const MODIFIED  = 0x4;
    }
}

/// 块所在的事务队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferList {
    /// 不在任何事务队列上
    None,
    /// 已取得写权限，尚未修改
    Reserved,
    /// ordered 模式数据，提交前需写回
    SyncData,
    /// 数据写请求已发出，等待完成
    Locked,
    /// 已修改的元数据
    Metadata,
    /// 日志副本写入中
    Shadow,
    /// 日志副本已落盘，等待提交收尾
    Forget,
}

/// 块状态的对外视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// 无待写内容
    Clean,
    /// 有待写回或待提交的修改
    Dirty,
    /// 提交中的事务持有冻结副本
    Frozen,
    /// 有写请求未完成
    InFlight,
}

/// 对事务的弱引用
///
/// 事务结束后 head 上残留的引用不会阻止事务被释放。
#[derive(Debug, Clone)]
pub(crate) struct TxRef {
    tid: Tid,
    tx: Weak<Transaction>,
}

impl TxRef {
    pub(crate) fn new(tx: &Arc<Transaction>) -> Self {
        Self { tid: tx.tid(), tx: Arc::downgrade(tx) }
    }

    pub(crate) fn tid(&self) -> Tid {
        self.tid
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Transaction>> {
        self.tx.upgrade()
    }

    pub(crate) fn is(&self, tx: &Transaction) -> bool {
        self.tid == tx.tid()
    }
}

/// 块锁保护的状态
#[derive(Debug)]
pub(crate) struct HeadState {
    /// 块的当前内容
    pub(crate) data: Vec<u8>,
    pub(crate) flags: BufferFlags,
    /// 所在队列
    pub(crate) jlist: BufferList,
    /// 持有该块的事务
    pub(crate) transaction: Option<TxRef>,
    /// 当前事务提交完后接手的事务
    pub(crate) next_transaction: Option<TxRef>,
    /// 检查点所属事务
    pub(crate) cp_transaction: Option<TxRef>,
    /// 提交中事务需要写入日志的旧内容
    pub(crate) frozen: Option<Vec<u8>>,
    /// 最近一次提交的内容（undo 访问时保留）
    pub(crate) committed: Option<Vec<u8>>,
    /// 未完成的数据/检查点写请求
    pub(crate) inflight: Option<PendingIo>,
}

impl HeadState {
    /// 是否由该事务持有并位于指定队列
    pub(crate) fn is_on(&self, tx: &Transaction, list: BufferList) -> bool {
        self.jlist == list && self.transaction.as_ref().map_or(false, |t| t.is(tx))
    }

    pub(crate) fn owned_by(&self, tx: &Transaction) -> bool {
        self.transaction.as_ref().map_or(false, |t| t.is(tx))
    }

    pub(crate) fn next_is(&self, tx: &Transaction) -> bool {
        self.next_transaction.as_ref().map_or(false, |t| t.is(tx))
    }

    pub(crate) fn checkpointed_by(&self, tx: &Transaction) -> bool {
        self.cp_transaction.as_ref().map_or(false, |t| t.is(tx))
    }

    /// 不属于任何事务、无待写内容、无在途 I/O
    pub(crate) fn is_idle(&self) -> bool {
        self.transaction.is_none()
            && self.next_transaction.is_none()
            && self.inflight.is_none()
            && !self.flags.intersects(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY)
    }
}

/// Journal head
///
/// 一个设备块在日志中的状态。通过 [`Journal::get_block`](super::Journal::get_block)
/// 获取，同一块号同一时刻只有一个 head。
#[derive(Debug)]
pub struct JournalHead {
    blocknr: BlockNr,
    state: Mutex<HeadState>,
}

impl JournalHead {
    /// 创建 head，`data` 为块的当前内容
    pub(crate) fn new(blocknr: BlockNr, data: Vec<u8>) -> Self {
        Self {
            blocknr,
            state: Mutex::new(HeadState {
                data,
                flags: BufferFlags::empty(),
                jlist: BufferList::None,
                transaction: None,
                next_transaction: None,
                cp_transaction: None,
                frozen: None,
                committed: None,
                inflight: None,
            }),
        }
    }

    /// 设备块号
    pub fn blocknr(&self) -> BlockNr {
        self.blocknr
    }

    /// 只读访问块内容
    pub fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let st = self.lock();
        f(&st.data)
    }

    /// 可变访问块内容
    ///
    /// 调用前应已通过 handle 取得写权限，否则提交看不到这次修改。
    pub fn with_data_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut st = self.lock();
        f(&mut st.data)
    }

    /// 块内容副本
    pub fn data(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// 块标志
    pub fn flags(&self) -> BufferFlags {
        self.lock().flags
    }

    /// 所在队列
    pub fn list(&self) -> BufferList {
        self.lock().jlist
    }

    /// 持有该块的事务
    pub fn transaction_id(&self) -> Option<Tid> {
        self.lock().transaction.as_ref().map(TxRef::tid)
    }

    /// 接手该块的下一个事务
    pub fn next_transaction_id(&self) -> Option<Tid> {
        self.lock().next_transaction.as_ref().map(TxRef::tid)
    }

    /// 检查点所属事务
    pub fn checkpoint_transaction_id(&self) -> Option<Tid> {
        self.lock().cp_transaction.as_ref().map(TxRef::tid)
    }

    /// 最近一次提交的内容（仅 undo 访问后存在）
    pub fn committed_data(&self) -> Option<Vec<u8>> {
        self.lock().committed.clone()
    }

    /// 状态视图
    pub fn state(&self) -> BufferState {
        let st = self.lock();
        if st.inflight.is_some() || st.jlist == BufferList::Shadow || st.jlist == BufferList::Locked {
            BufferState::InFlight
        } else if st.frozen.is_some() {
            BufferState::Frozen
        } else if st.flags.intersects(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY) {
            BufferState::Dirty
        } else {
            BufferState::Clean
        }
    }

    /// 可以被缓存淘汰
    pub fn is_idle(&self) -> bool {
        try_lock(&self.state).map_or(false, |st| st.is_idle() && st.cp_transaction.is_none())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HeadState> {
        lock(&self.state)
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, HeadState>> {
        try_lock(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_head_is_clean() {
        let head = JournalHead::new(10, vec![0u8; 64]);
        assert_eq!(head.blocknr(), 10);
        assert_eq!(head.list(), BufferList::None);
        assert_eq!(head.state(), BufferState::Clean);
        assert!(head.is_idle());
        assert_eq!(head.transaction_id(), None);
    }

    #[test]
    fn test_state_view() {
        let head = JournalHead::new(10, vec![0u8; 64]);
        head.with_data_mut(|d| d[0] = 1);
        assert_eq!(head.with_data(|d| d[0]), 1);

        head.lock().flags.insert(BufferFlags::DIRTY);
        assert_eq!(head.state(), BufferState::Dirty);
        assert!(!head.is_idle());

        head.lock().frozen = Some(vec![0u8; 64]);
        assert_eq!(head.state(), BufferState::Frozen);

        head.lock().jlist = BufferList::Shadow;
        assert_eq!(head.state(), BufferState::InFlight);
    }

    #[test]
    fn test_idle_requires_uncontended_lock() {
        let head = JournalHead::new(3, vec![0u8; 64]);
        let guard = head.lock();
        assert!(!head.is_idle());
        drop(guard);
        assert!(head.is_idle());
    }
}
