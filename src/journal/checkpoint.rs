//! 检查点
//!
//! 已提交事务的元数据块在写回原位之前一直占用日志空间。
//! [`CheckpointRegistry`] 按提交顺序保存这些事务；[`Journal::checkpoint`]
//! 把脏块写回原位，然后推进日志尾部、归还空间。
//!
//! 锁顺序：登记表 → 块锁 → 事务队列锁。

use super::config::JournalFlags;
use super::jbd_buf::{BufferFlags, BufferList, HeadState, JournalHead};
use super::jbd_journal::{Journal, JournalStatus};
use super::jbd_trans::{remove_head, Tid, Transaction};
use crate::block::IoMode;
use crate::error::{Error, ErrorKind, Result};
use crate::sync::{lock, wait};
use std::collections::VecDeque;
use std::sync::Arc;

/// 等待写回的事务（最旧的在前）
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    queue: VecDeque<Arc<Transaction>>,
}

impl CheckpointRegistry {
    /// 创建空登记表
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个已提交的事务
    pub fn register(&mut self, tx: Arc<Transaction>) {
        log::trace!("[JBD] checkpoint register tid={} ({} blocks)", tx.tid(), tx.checkpoint_len());
        self.queue.push_back(tx);
    }

    /// 释放已写回的块，移除没有剩余块的事务
    ///
    /// 返回移除的事务数。
    pub fn prune(&mut self) -> usize {
        let before = self.queue.len();
        for tx in &self.queue {
            let heads = tx.lists().checkpoint.clone();
            for head in heads {
                let mut st = head.lock();
                if !st.checkpointed_by(tx) {
                    tx.lists().remove_checkpoint(&head);
                } else if checkpoint_done(&st) {
                    st.cp_transaction = None;
                    tx.lists().remove_checkpoint(&head);
                }
            }
        }
        self.queue.retain(|tx| tx.checkpoint_len() > 0);
        before - self.queue.len()
    }

    /// 事务数
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 最旧的事务
    pub fn oldest(&self) -> Option<&Arc<Transaction>> {
        self.queue.front()
    }

    /// 按提交顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Transaction>> + '_ {
        self.queue.iter()
    }
}

/// 块已在原位，不再需要日志中的副本
fn checkpoint_done(st: &HeadState) -> bool {
    st.jlist == BufferList::None
        && st.inflight.is_none()
        && !st.flags.intersects(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY)
}

impl Journal {
    /// 等待写回的事务数
    pub fn checkpoint_count(&self) -> usize {
        lock(&self.checkpoints).len()
    }

    pub(crate) fn register_checkpoint(&self, tx: Arc<Transaction>) {
        lock(&self.checkpoints).register(tx);
    }

    /// 清理已写回的检查点，返回移除的事务数
    pub fn prune_checkpoints(&self) -> usize {
        lock(&self.checkpoints).prune()
    }

    /// 把所有可写回的检查点块写回原位
    ///
    /// 仍被新事务持有的块留到该事务提交后处理。返回写回的块数。
    /// 写回失败会中止日志。
    pub fn checkpoint(&self) -> Result<usize> {
        if self.is_aborted() {
            return Err(super::JournalError::JournalAborted.into());
        }

        let txs: Vec<Arc<Transaction>> = lock(&self.checkpoints).iter().cloned().collect();
        let mut submitted: Vec<(Arc<Transaction>, Arc<JournalHead>)> = Vec::new();
        let mut error: Option<Error> = None;

        for tx in &txs {
            let heads = tx.lists().checkpoint.clone();
            for head in heads {
                let mut st = head.lock();
                if !st.checkpointed_by(tx)
                    || st.transaction.is_some()
                    || st.inflight.is_some()
                    || !st.flags.contains(BufferFlags::DIRTY)
                {
                    continue;
                }

                st.flags.remove(BufferFlags::DIRTY);
                match self.io.submit(head.blocknr(), st.data.clone(), IoMode::Checkpoint) {
                    Ok(pending) => {
                        st.inflight = Some(pending);
                        let mut lists = tx.lists();
                        remove_head(&mut lists.checkpoint, &head);
                        lists.checkpoint_io.push(head.clone());
                        drop(lists);
                        drop(st);
                        submitted.push((tx.clone(), head));
                    }
                    Err(e) => {
                        st.flags.insert(BufferFlags::DIRTY);
                        error.get_or_insert(e);
                    }
                }
            }
        }

        let mut written = 0;
        while let Some((tx, head)) = submitted.pop() {
            let pending = head.lock().inflight.take();
            let result = match pending {
                Some(pending) => self.io.wait(pending),
                None => Ok(()),
            };

            let mut st = head.lock();
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    st.flags.insert(BufferFlags::DIRTY);
                    error.get_or_insert(e);
                }
            }
            if st.checkpointed_by(&tx) {
                let mut lists = tx.lists();
                if remove_head(&mut lists.checkpoint_io, &head) {
                    lists.checkpoint.push(head.clone());
                }
            }
        }

        if let Some(err) = error {
            log::error!("[JBD] checkpoint write-back failed: {}", err);
            self.abort(err.clone());
            return Err(err);
        }

        let pruned = self.prune_checkpoints();
        log::debug!("[JBD] checkpoint wrote {} blocks, released {} transactions", written, pruned);
        self.cleanup_tail()?;
        Ok(written)
    }

    /// 推进日志尾部到最旧的仍需保留的事务
    ///
    /// 没有任何需要保留的事务时归还全部日志空间。
    pub(crate) fn cleanup_tail(&self) -> Result<()> {
        let _sb = lock(&self.sb_lock);
        let oldest = lock(&self.checkpoints).oldest().map(|tx| (tx.tid(), tx.log_start()));

        let (sequence, tail, changed, flushed) = {
            let mut st = self.lock_state();
            let (sequence, start) = match oldest {
                Some((tid, Some(start))) => (tid, Some(start)),
                _ => match &st.committing {
                    Some(tx) => (tx.tid(), tx.log_start()),
                    None => match &st.running {
                        Some(tx) => (tx.tid(), None),
                        None => (st.transaction_sequence, None),
                    },
                },
            };

            let mut log = lock(&self.log);
            let tail = match start {
                Some(start) => {
                    log.release_to(start);
                    start
                }
                None => {
                    log.release_all();
                    log.head()
                }
            };
            drop(log);

            let changed = st.tail_sequence != sequence || st.tail != tail;
            st.tail_sequence = sequence;
            st.tail = tail;
            (sequence, tail, changed, st.status.contains(JournalStatus::FLUSHED))
        };

        if !changed || flushed {
            return Ok(());
        }
        if self.config.flags.contains(JournalFlags::BARRIER) {
            self.io.flush_barrier()?;
        }
        log::debug!("[JBD] log tail advanced to {} (sequence {})", tail, sequence);
        self.write_superblock(sequence, tail)
    }

    /// 等待日志有 `needed` 块可用
    ///
    /// 依次尝试写回检查点、等待提交中的事务、回收日志尾部。
    /// 检查点块仍被运行中的事务持有时，先提交该事务。
    pub(crate) fn wait_for_space(&self, needed: u32) -> Result<()> {
        let mut stalled = false;
        let mut forced: Option<Tid> = None;
        loop {
            if self.log_space_available() >= needed {
                return Ok(());
            }
            if self.is_aborted() {
                return Err(super::JournalError::JournalAborted.into());
            }

            if self.checkpoint_count() > 0 {
                let before = (self.checkpoint_count(), self.log_free_blocks());
                self.checkpoint()?;
                if (self.checkpoint_count(), self.log_free_blocks()) != before {
                    continue;
                }
            }

            if let Some(tid) = self.committing_tid() {
                self.wait_commit_done(tid);
                continue;
            }

            self.cleanup_tail()?;
            if self.log_space_available() >= needed {
                return Ok(());
            }
            if let Some(tid) = self.running_tid().filter(|tid| forced != Some(*tid)) {
                log::debug!("[JBD] log full, committing running transaction {}", tid);
                forced = Some(tid);
                self.commit_tid(tid)?;
                continue;
            }
            if stalled {
                log::warn!("[JBD] no log space for {} blocks ({} free)", needed, self.log_free_blocks());
                return Err(super::JournalError::LogFull.into());
            }
            stalled = true;
        }
    }

    fn wait_commit_done(&self, tid: Tid) {
        let mut st = self.lock_state();
        while st.committing.as_ref().map_or(false, |tx| tx.tid() == tid) {
            st = wait(&self.state_cond, st);
        }
    }

    /// 文件系统已自行把块写回原位
    ///
    /// 块仍属于某个事务时不做任何事，返回 `false`。
    pub fn confirm_written(&self, head: &JournalHead) -> bool {
        let mut st = head.lock();
        if st.transaction.is_some() || st.inflight.is_some() {
            return false;
        }
        st.flags.remove(BufferFlags::DIRTY);
        true
    }

    /// 写回检查点直到登记表清空
    pub fn checkpoint_all(&self) -> Result<()> {
        while self.checkpoint_count() > 0 {
            let before = self.checkpoint_count();
            self.checkpoint()?;
            if self.checkpoint_count() >= before {
                return Err(Error::new(ErrorKind::InvalidState, "checkpoint made no progress"));
            }
        }
        self.cleanup_tail()
    }
}
