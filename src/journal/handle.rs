//! 文件系统侧的 handle
//!
//! 一个 handle 代表一次文件系统操作，向运行中的事务预留若干日志块（credit），
//! 在操作中修改的块都归入该事务。典型用法：
//!
//! ```no_run
//! # use jbd_core::{Journal, JournalConfig, MemDevice};
//! # use std::sync::Arc;
//! # fn demo() -> jbd_core::Result<()> {
//! # let dev = Arc::new(MemDevice::new(1024, 4096));
//! # let journal = Journal::create(dev, JournalConfig::default())?;
//! let inode_table = journal.get_block(2048)?;
//!
//! let mut handle = journal.start(2)?;
//! handle.get_write_access(&inode_table)?;
//! inode_table.with_data_mut(|data| data[0] = 1);
//! handle.dirty_metadata(&inode_table)?;
//! handle.stop()?;
//! # Ok(())
//! # }
//! ```

use super::classify::{file_buffer, unfile_buffer};
use super::jbd_buf::{BufferFlags, BufferList, JournalHead, TxRef};
use super::jbd_journal::Journal;
use super::jbd_trans::{Tid, Transaction, TransactionState};
use super::JournalError;
use crate::block::BlockNr;
use crate::error::{Error, ErrorKind, Result};
use std::sync::Arc;

/// Handle
///
/// 由 [`Journal::start`] 创建。`stop` 前被丢弃时同样结束 handle，但不报告错误。
pub struct Handle {
    journal: Arc<Journal>,
    transaction: Arc<Transaction>,
    /// 尚未使用的 credit
    buffer_credits: u32,
    sync: bool,
    stopped: bool,
}

impl Handle {
    pub(crate) fn new(journal: Arc<Journal>, transaction: Arc<Transaction>, credits: u32) -> Self {
        log::trace!("[JBD] handle start tid={} credits={}", transaction.tid(), credits);
        Self { journal, transaction, buffer_credits: credits, sync: false, stopped: false }
    }

    /// 所属事务号
    pub fn tid(&self) -> Tid {
        self.transaction.tid()
    }

    /// 剩余 credit
    pub fn credits(&self) -> u32 {
        self.buffer_credits
    }

    /// 设为同步：`stop` 时等待事务提交完成
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    /// 是否同步
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// 取得元数据块的写权限
    ///
    /// 块仍被提交中的事务持有时，先保存一份冻结副本供其写入日志，
    /// 当前事务在其提交完成后接手该块。
    pub fn get_write_access(&self, head: &Arc<JournalHead>) -> Result<()> {
        self.do_get_write_access(head, false)
    }

    /// 取得新分配块的写权限（不需要旧内容）
    pub fn get_create_access(&self, head: &Arc<JournalHead>) -> Result<()> {
        self.journal.check_aborted()?;
        let tx = &self.transaction;
        {
            let mut st = head.lock();
            if !st.owned_by(tx) && !st.next_is(tx) {
                st.flags.remove(BufferFlags::MODIFIED);
                if st.transaction.is_none() {
                    st.flags.remove(BufferFlags::DIRTY);
                    file_buffer(head, &mut st, tx, BufferList::Reserved);
                } else {
                    st.next_transaction = Some(TxRef::new(tx));
                }
            }
        }
        self.journal.cancel_revoke(head.blocknr());
        Ok(())
    }

    /// 取得写权限并保留已提交的内容
    ///
    /// 用于位图一类需要参照最近一次提交内容的块，见
    /// [`JournalHead::committed_data`]。
    pub fn get_undo_access(&self, head: &Arc<JournalHead>) -> Result<()> {
        self.do_get_write_access(head, true)?;
        let mut st = head.lock();
        if st.committed.is_none() {
            st.committed = Some(st.data.clone());
        }
        Ok(())
    }

    fn do_get_write_access(&self, head: &Arc<JournalHead>, force_copy: bool) -> Result<()> {
        self.journal.check_aborted()?;
        let tx = &self.transaction;
        {
            let mut st = head.lock();
            if !st.owned_by(tx) && !st.next_is(tx) {
                st.flags.remove(BufferFlags::MODIFIED);
                if st.transaction.is_some() {
                    // 提交中的事务还要写出块的旧内容
                    let data_list = matches!(st.jlist, BufferList::SyncData | BufferList::Locked);
                    let copied = matches!(st.jlist, BufferList::Forget | BufferList::Shadow);
                    if st.frozen.is_none() && !data_list && (force_copy || !copied) {
                        st.frozen = Some(st.data.clone());
                        log::trace!("[JBD] froze block={} for tid={:?}", head.blocknr(), st.transaction.as_ref().map(TxRef::tid));
                    }
                    st.next_transaction = Some(TxRef::new(tx));
                } else {
                    if st.flags.contains(BufferFlags::DIRTY) {
                        st.flags.remove(BufferFlags::DIRTY);
                        st.flags.insert(BufferFlags::JBD_DIRTY);
                    }
                    file_buffer(head, &mut st, tx, BufferList::Reserved);
                }
            }
        }
        self.journal.cancel_revoke(head.blocknr());
        Ok(())
    }

    // =========================================================================
    // Dirtying
    // =========================================================================

    /// 标记元数据块已修改
    ///
    /// 每个块在一个 handle 中第一次标记时消耗一个 credit。
    pub fn dirty_metadata(&mut self, head: &Arc<JournalHead>) -> Result<()> {
        self.journal.check_aborted()?;
        let tx = self.transaction.clone();
        let mut st = head.lock();

        let owned = st.owned_by(&tx);
        if !owned && !st.next_is(&tx) {
            return Err(Error::new(ErrorKind::InvalidState, "write access not obtained"));
        }
        if !st.flags.contains(BufferFlags::MODIFIED) {
            if self.buffer_credits == 0 {
                return Err(Error::new(ErrorKind::NoSpace, "handle has no credits left"));
            }
            st.flags.insert(BufferFlags::MODIFIED);
            self.buffer_credits -= 1;
        }
        st.flags.insert(BufferFlags::JBD_DIRTY);

        // 属于提交中的事务时，等其提交完成后由转交放入 Metadata
        if owned && st.jlist != BufferList::Metadata {
            file_buffer(head, &mut st, &tx, BufferList::Metadata);
        }
        Ok(())
    }

    /// 标记数据块已修改（ordered 模式）
    ///
    /// 事务提交时先把这些块写回原位，再写元数据。
    pub fn dirty_data(&self, head: &Arc<JournalHead>) -> Result<()> {
        self.journal.check_aborted()?;
        let tx = &self.transaction;
        let mut st = head.lock();
        st.flags.insert(BufferFlags::DIRTY);

        let data_list = matches!(st.jlist, BufferList::SyncData | BufferList::Locked);
        match st.transaction.as_ref().map(|owner| owner.is(tx)) {
            None => file_buffer(head, &mut st, tx, BufferList::SyncData),
            Some(true) => {}
            Some(false) if data_list => st.next_transaction = Some(TxRef::new(tx)),
            // 仍作为元数据属于提交中的事务
            Some(false) => {}
        }
        Ok(())
    }

    /// 放弃块的修改（块已被释放）
    ///
    /// 本事务修改过的块不再写入日志，归还其 credit。
    pub fn forget(&mut self, head: &Arc<JournalHead>) -> Result<()> {
        self.journal.check_aborted()?;
        let tx = self.transaction.clone();
        let mut st = head.lock();
        let modified = st.flags.contains(BufferFlags::MODIFIED);

        if st.owned_by(&tx) {
            st.flags.remove(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY);
            if st.cp_transaction.is_some() {
                // 旧检查点记录要在本事务提交时丢弃
                file_buffer(head, &mut st, &tx, BufferList::Forget);
            } else {
                unfile_buffer(head, &mut st);
            }
        } else if st.next_is(&tx) {
            st.next_transaction = None;
        }

        if modified {
            st.flags.remove(BufferFlags::MODIFIED);
            self.buffer_credits += 1;
        }
        log::trace!("[JBD] forget block={} tid={}", head.blocknr(), tx.tid());
        Ok(())
    }

    /// 撤销块：恢复时不再重放本事务及之前事务中该块的日志内容
    pub fn revoke(&self, blocknr: BlockNr) -> Result<()> {
        self.journal.check_aborted()?;
        if self.journal.config().contains(blocknr) {
            return Err(Error::new(ErrorKind::InvalidInput, "cannot revoke a journal block"));
        }
        self.journal.revoke_block(blocknr, self.tid());
        Ok(())
    }

    /// 追加 credit
    pub fn extend(&mut self, credits: u32) -> Result<()> {
        self.journal.check_aborted()?;
        let limit = self.journal.config().transaction_limit();
        let available = self.journal.log_space_available();
        let mut inner = self.transaction.lock_inner();
        if inner.state != TransactionState::Running {
            return Err(Error::new(ErrorKind::InvalidState, "transaction is no longer running"));
        }
        let wanted = inner.outstanding_credits + credits;
        if wanted > limit || wanted > available {
            return Err(JournalError::TooManyCredits.into());
        }
        inner.outstanding_credits = wanted;
        drop(inner);
        self.buffer_credits += credits;
        Ok(())
    }

    /// 取写权限、修改、标记为脏
    pub fn modify_metadata<F, R>(&mut self, head: &Arc<JournalHead>, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.get_write_access(head)?;
        let result = head.with_data_mut(f);
        self.dirty_metadata(head)?;
        Ok(result)
    }

    // =========================================================================
    // Stop
    // =========================================================================

    fn release(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.transaction.release_handle(self.buffer_credits);
        }
    }

    /// 结束 handle
    ///
    /// 同步 handle 会等待事务提交完成。日志已中止时返回错误。
    pub fn stop(mut self) -> Result<()> {
        self.release();
        let tid = self.tid();
        log::trace!("[JBD] handle stop tid={}", tid);

        if self.sync {
            self.journal.request_commit(tid);
            self.journal.wait_for_commit(tid)?;
        }
        self.journal.check_aborted()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.stopped {
            log::debug!("[JBD] handle for tid={} dropped without stop", self.tid());
            self.release();
        }
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("tid", &self.tid())
            .field("credits", &self.buffer_credits)
            .field("sync", &self.sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::journal::JournalConfig;

    fn journal() -> Arc<Journal> {
        let dev = Arc::new(MemDevice::new(256, 512));
        let config = JournalConfig { journal_len: 64, ..JournalConfig::default() };
        Journal::create(dev, config).unwrap()
    }

    #[test]
    fn test_dirty_metadata_charges_one_credit() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(2).unwrap();

        handle.get_write_access(&head).unwrap();
        assert_eq!(head.list(), BufferList::Reserved);
        handle.dirty_metadata(&head).unwrap();
        handle.dirty_metadata(&head).unwrap();
        assert_eq!(handle.credits(), 1);
        assert_eq!(head.list(), BufferList::Metadata);
        assert!(head.flags().contains(BufferFlags::JBD_DIRTY | BufferFlags::MODIFIED));
        handle.stop().unwrap();
    }

    #[test]
    fn test_dirty_without_access_is_rejected() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(1).unwrap();
        let err = handle.dirty_metadata(&head).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(handle.credits(), 1);
    }

    #[test]
    fn test_out_of_credits() {
        let journal = journal();
        let a = journal.get_block(100).unwrap();
        let b = journal.get_block(101).unwrap();
        let mut handle = journal.start(1).unwrap();
        handle.modify_metadata(&a, |_| ()).unwrap();
        let err = handle.modify_metadata(&b, |_| ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);

        handle.extend(1).unwrap();
        handle.dirty_metadata(&b).unwrap();
        handle.stop().unwrap();
    }

    #[test]
    fn test_write_access_freezes_for_committing() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut h1 = journal.start(1).unwrap();
        h1.modify_metadata(&head, |d| d[0] = 1).unwrap();
        h1.stop().unwrap();

        // 模拟事务 1 正在提交
        let tx1 = journal.running_transaction().unwrap();
        {
            let mut st = journal.lock_state();
            tx1.set_state(TransactionState::Flush);
            st.running = None;
            st.committing = Some(tx1.clone());
        }

        let mut h2 = journal.start(1).unwrap();
        assert_eq!(h2.tid(), 2);
        h2.get_write_access(&head).unwrap();
        assert_eq!(head.transaction_id(), Some(1));
        assert_eq!(head.next_transaction_id(), Some(2));
        assert_eq!(head.state(), crate::journal::BufferState::Frozen);

        head.with_data_mut(|d| d[0] = 2);
        h2.dirty_metadata(&head).unwrap();
        assert_eq!(head.list(), BufferList::Metadata);
        assert_eq!(head.lock().frozen.as_deref().map(|d| d[0]), Some(1));
        h2.stop().unwrap();
    }

    #[test]
    fn test_extend_counts_committing_transaction() {
        let journal = journal();
        journal.start(1).unwrap().stop().unwrap();
        let tx1 = journal.running_transaction().unwrap();
        {
            let mut st = journal.lock_state();
            {
                let mut inner = tx1.lock_inner();
                inner.state = TransactionState::Flush;
                inner.log_reserved = journal.log_space_left() - 4;
            }
            st.running = None;
            st.committing = Some(tx1.clone());
        }
        assert_eq!(journal.log_space_available(), 4);

        let mut handle = journal.start(1).unwrap();
        handle.extend(3).unwrap();
        assert!(handle.extend(1).is_err());
        assert_eq!(handle.credits(), 4);
        handle.stop().unwrap();
    }

    #[test]
    fn test_forget_returns_credit() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(1).unwrap();
        handle.modify_metadata(&head, |d| d[0] = 1).unwrap();
        assert_eq!(handle.credits(), 0);

        handle.forget(&head).unwrap();
        assert_eq!(handle.credits(), 1);
        assert_eq!(head.list(), BufferList::None);
        assert!(!head.flags().intersects(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY));
        handle.stop().unwrap();
    }

    #[test]
    fn test_revoke_cancelled_by_write_access() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let handle = journal.start(1).unwrap();
        handle.revoke(100).unwrap();
        assert_eq!(journal.pending_revokes(), 1);
        assert!(handle.revoke(1).is_err());

        handle.get_write_access(&head).unwrap();
        assert_eq!(journal.pending_revokes(), 0);
        handle.stop().unwrap();
    }

    #[test]
    fn test_drop_releases_update() {
        let journal = journal();
        let handle = journal.start(3).unwrap();
        let tx = journal.running_transaction().unwrap();
        assert_eq!(tx.updates(), 1);
        drop(handle);
        assert_eq!(tx.updates(), 0);
        assert_eq!(tx.outstanding_credits(), 0);
    }

    #[test]
    fn test_sync_handle_commits() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(1).unwrap();
        handle.set_sync(true);
        handle.modify_metadata(&head, |d| d[0] = 5).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();
        assert_eq!(journal.commit_sequence(), tid);
    }

    #[test]
    fn test_operations_fail_after_abort() {
        let journal = journal();
        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(1).unwrap();
        journal.abort(Error::new(ErrorKind::Io, "test"));

        assert_eq!(handle.get_write_access(&head).unwrap_err().kind(), ErrorKind::Aborted);
        assert_eq!(handle.dirty_metadata(&head).unwrap_err().kind(), ErrorKind::Aborted);
        assert_eq!(handle.stop().unwrap_err().kind(), ErrorKind::Aborted);
    }
}
