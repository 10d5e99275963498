//! Journal 管理器
//!
//! 一个日志设备对应一个 [`Journal`]，维护运行中与提交中的事务、
//! 日志空间、revoke 表、检查点队列以及 journal head 缓存。
//!
//! # 锁顺序
//!
//! ```text
//! commit_lock ─► journal state ─► transaction inner
//! checkpoint registry ─► journal head ─► transaction lists
//! superblock ─► checkpoint registry / journal state / log （逐个获取，不嵌套）
//! ```
//!
//! 任何时刻至多持有一个事务的队列锁；持有日志空间锁时不再获取其他锁。

use super::checkpoint::CheckpointRegistry;
use super::commit::TransactionCommitter;
use super::config::{JournalConfig, JournalFlags};
use super::handle::Handle;
use super::jbd_buf::JournalHead;
use super::jbd_trans::{tid_geq, tid_gt, Tid, Transaction, TransactionState};
use super::log_space::{CircularLog, LogAllocator};
use super::recovery::{self, RecoveryInfo};
use super::revoke::{RevokeTable, RevokeTables};
use super::types::*;
use super::JournalError;
use crate::block::{BlockIo, BlockNr, IoMode};
use crate::cache::{CacheStats, HeadCache};
use crate::error::{Error, ErrorKind, Result};
use crate::sync::{lock, wait};
use bitflags::bitflags;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// 中止时写入超级块的错误码（EIO）
const JBD_ABORT_ERRNO: i32 = -5;

bitflags! {
    /// Journal 运行状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct JournalStatus: u32 {
        /// 日志已中止，只能卸载
        const ABORT   = 0x1;
        /// 磁盘超级块标记日志为空
        const FLUSHED = 0x2;
        /// 正在卸载
        const UNMOUNT = 0x4;
        /// 提交线程在运行
        const WORKER  = 0x8;
    }
}

/// 由 journal 状态锁保护的字段
#[derive(Debug)]
pub(crate) struct JournalState {
    pub(crate) status: JournalStatus,
    /// 中止原因
    pub(crate) error: Option<Error>,
    pub(crate) running: Option<Arc<Transaction>>,
    pub(crate) committing: Option<Arc<Transaction>>,
    /// 下一个事务号
    pub(crate) transaction_sequence: Tid,
    /// 最近完成提交的事务号
    pub(crate) commit_sequence: Tid,
    /// 请求提交到的事务号
    pub(crate) commit_request: Tid,
    /// 从该事务号起的事务都未能提交
    pub(crate) failed_from: Option<Tid>,
    /// 超级块记录的尾部事务号
    pub(crate) tail_sequence: Tid,
    /// 超级块记录的尾部块
    pub(crate) tail: BlockNr,
    /// 平滑后的提交耗时
    pub(crate) average_commit_time: Option<Duration>,
}

/// Journal（日志管理器）
///
/// 通过 [`Journal::create`] 或 [`Journal::load`] 创建，以 `Arc` 共享给
/// 文件系统线程与提交线程。
pub struct Journal {
    pub(crate) config: JournalConfig,
    pub(crate) block_size: u32,
    pub(crate) io: Arc<dyn BlockIo>,
    pub(crate) state: Mutex<JournalState>,
    /// 事务状态变化、提交完成、提交请求都在这里通知
    pub(crate) state_cond: Condvar,
    /// 串行化提交
    pub(crate) commit_lock: Mutex<()>,
    /// 串行化超级块更新
    pub(crate) sb_lock: Mutex<()>,
    pub(crate) log: Mutex<Box<dyn LogAllocator>>,
    pub(crate) revoke: Mutex<RevokeTables>,
    pub(crate) checkpoints: Mutex<CheckpointRegistry>,
    pub(crate) heads: Mutex<HeadCache>,
}

impl core::fmt::Debug for Journal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.lock_state();
        f.debug_struct("Journal")
            .field("block_size", &self.block_size)
            .field("journal_start", &self.config.journal_start)
            .field("journal_len", &self.config.journal_len)
            .field("status", &st.status)
            .field("running", &st.running.as_ref().map(|tx| tx.tid()))
            .field("committing", &st.committing.as_ref().map(|tx| tx.tid()))
            .field("commit_sequence", &st.commit_sequence)
            .finish()
    }
}

impl Journal {
    /// 格式化日志区并创建 journal
    ///
    /// 写入一个空日志的超级块，第一个事务号为 1。
    pub fn create(io: Arc<dyn BlockIo>, config: JournalConfig) -> Result<Arc<Self>> {
        let journal = Self::new(io, config, 1)?;
        journal.mark_empty()?;
        log::info!(
            "[JBD] created journal at block {} ({} blocks, block size {})",
            journal.config.journal_start,
            journal.config.journal_len,
            journal.block_size
        );
        Ok(journal)
    }

    /// 加载已有日志
    ///
    /// 日志非空时先执行恢复，然后把日志重置为空，从恢复结束的事务号继续。
    pub fn load(io: Arc<dyn BlockIo>, config: JournalConfig) -> Result<(Arc<Self>, RecoveryInfo)> {
        config.validate(io.block_size(), io.total_blocks())?;
        let info = recovery::recover(io.as_ref(), &config)?;
        let journal = Self::new(io, config, info.end_transaction)?;
        journal.mark_empty()?;
        log::info!(
            "[JBD] loaded journal, recovered transactions {}..{} ({} blocks replayed, {} revoked)",
            info.start_transaction,
            info.end_transaction,
            info.replayed_blocks,
            info.revoked_blocks
        );
        Ok((journal, info))
    }

    fn new(io: Arc<dyn BlockIo>, config: JournalConfig, sequence: Tid) -> Result<Arc<Self>> {
        let block_size = io.block_size();
        config.validate(block_size, io.total_blocks())?;

        let log: Box<dyn LogAllocator> = Box::new(CircularLog::new(config.log_first(), config.log_last()));
        let heads = HeadCache::new(config.head_cache_size);
        let tail = config.log_first();

        Ok(Arc::new(Self {
            block_size,
            io,
            state: Mutex::new(JournalState {
                status: JournalStatus::empty(),
                error: None,
                running: None,
                committing: None,
                transaction_sequence: sequence,
                commit_sequence: sequence.wrapping_sub(1),
                commit_request: sequence.wrapping_sub(1),
                failed_from: None,
                tail_sequence: sequence,
                tail,
                average_commit_time: None,
            }),
            state_cond: Condvar::new(),
            commit_lock: Mutex::new(()),
            sb_lock: Mutex::new(()),
            log: Mutex::new(log),
            revoke: Mutex::new(RevokeTables::default()),
            checkpoints: Mutex::new(CheckpointRegistry::new()),
            heads: Mutex::new(heads),
            config,
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// 配置
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// 块大小
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// 是否已中止
    pub fn is_aborted(&self) -> bool {
        self.lock_state().status.contains(JournalStatus::ABORT)
    }

    /// 中止原因
    pub fn error(&self) -> Option<Error> {
        self.lock_state().error.clone()
    }

    /// 运行中的事务号
    pub fn running_tid(&self) -> Option<Tid> {
        self.lock_state().running.as_ref().map(|tx| tx.tid())
    }

    /// 运行中的事务
    pub fn running_transaction(&self) -> Option<Arc<Transaction>> {
        self.lock_state().running.clone()
    }

    /// 提交中的事务号
    pub fn committing_tid(&self) -> Option<Tid> {
        self.lock_state().committing.as_ref().map(|tx| tx.tid())
    }

    /// 提交中的事务
    pub fn committing_transaction(&self) -> Option<Arc<Transaction>> {
        self.lock_state().committing.clone()
    }

    /// 最近完成提交的事务号
    pub fn commit_sequence(&self) -> Tid {
        self.lock_state().commit_sequence
    }

    /// 平滑后的提交耗时（`avg = (avg * 3 + latest) / 4`）
    pub fn average_commit_time(&self) -> Option<Duration> {
        self.lock_state().average_commit_time
    }

    /// 指定事务的状态（仅运行中或提交中的事务可见）
    pub fn transaction_state(&self, tid: Tid) -> Option<TransactionState> {
        let st = self.lock_state();
        let state = [st.running.as_ref(), st.committing.as_ref()]
            .into_iter()
            .flatten()
            .find(|tx| tx.tid() == tid)
            .map(|tx| tx.state());
        state
    }

    /// 日志空闲块数
    pub fn log_free_blocks(&self) -> u32 {
        lock(&self.log).free_blocks()
    }

    /// 日志分配器报告的可预留块数（未扣除提交中的事务）
    pub fn log_space_left(&self) -> u32 {
        lock(&self.log).space_left()
    }

    /// 可供新 handle 预留的日志块数
    ///
    /// 提交中的事务还要写入的块先从 [`log_space_left`](Self::log_space_left) 中扣除。
    pub fn log_space_available(&self) -> u32 {
        let reserve = Self::committing_reserve(&self.lock_state());
        self.log_space_left().saturating_sub(reserve)
    }

    /// 提交中的事务尚未取用的日志块
    pub(crate) fn committing_reserve(st: &JournalState) -> u32 {
        st.committing.as_ref().map_or(0, |tx| tx.lock_inner().log_reserved)
    }

    /// journal head 缓存统计
    pub fn head_cache_stats(&self) -> CacheStats {
        lock(&self.heads).stats().clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, JournalState> {
        lock(&self.state)
    }

    /// 日志已中止时返回中止错误
    pub(crate) fn check_aborted(&self) -> Result<()> {
        let st = self.lock_state();
        if st.status.contains(JournalStatus::ABORT) {
            return Err(Self::aborted_error(&st));
        }
        Ok(())
    }

    fn aborted_error(st: &JournalState) -> Error {
        match &st.error {
            Some(err) if err.kind() == ErrorKind::Aborted => err.clone(),
            _ => JournalError::JournalAborted.into(),
        }
    }

    // =========================================================================
    // Blocks and handles
    // =========================================================================

    /// 获取设备块的 journal head
    ///
    /// 未缓存时从设备读入当前内容。日志区内的块不能作为文件系统块使用。
    pub fn get_block(&self, blocknr: BlockNr) -> Result<Arc<JournalHead>> {
        if self.config.contains(blocknr) {
            return Err(Error::new(ErrorKind::InvalidInput, "block lies inside the journal area"));
        }
        if u64::from(blocknr) >= self.io.total_blocks() {
            return Err(Error::new(ErrorKind::InvalidInput, "block number beyond end of device"));
        }

        let mut heads = lock(&self.heads);
        if let Some(head) = heads.get(blocknr) {
            return Ok(head);
        }
        let mut data = vec![0u8; self.block_size as usize];
        self.io.read(blocknr, &mut data)?;
        let head = Arc::new(JournalHead::new(blocknr, data));
        heads.insert(head.clone());
        Ok(head)
    }

    /// 开始一个 handle，预留 `credits` 个元数据块
    ///
    /// 运行中的事务处于 Locked 时阻塞到新事务可用；没有运行中的事务时创建一个。
    /// 同一线程不应在持有 handle 时再开始另一个 handle。
    pub fn start(self: &Arc<Self>, credits: u32) -> Result<Handle> {
        let limit = self.config.transaction_limit();
        if credits > limit {
            return Err(JournalError::TooManyCredits.into());
        }

        loop {
            let mut st = self.lock_state();
            if st.status.contains(JournalStatus::ABORT) {
                return Err(Self::aborted_error(&st));
            }
            if st.status.contains(JournalStatus::UNMOUNT) {
                return Err(Error::new(ErrorKind::InvalidState, "journal is shutting down"));
            }

            let reserve = Self::committing_reserve(&st);
            let tx = match &st.running {
                Some(tx) => tx.clone(),
                None => {
                    let tid = st.transaction_sequence;
                    st.transaction_sequence = tid.wrapping_add(1);
                    let tx = Arc::new(Transaction::new(tid));
                    st.running = Some(tx.clone());
                    log::debug!("[JBD] transaction {} started", tid);
                    tx
                }
            };

            let mut inner = tx.lock_inner();
            if inner.state != TransactionState::Running {
                drop(inner);
                let _st = wait(&self.state_cond, st);
                continue;
            }

            let needed = inner.outstanding_credits + credits;
            if needed > limit {
                drop(inner);
                let tid = tx.tid();
                let worker = st.status.contains(JournalStatus::WORKER);
                Self::request_commit_locked(&mut st, tid);
                drop(st);
                self.state_cond.notify_all();
                log::debug!("[JBD] transaction {} full ({} credits), forcing commit", tid, needed);
                if worker {
                    self.wait_running_changed(tid);
                } else {
                    self.commit_tid(tid)?;
                }
                continue;
            }

            if self.log_space_left().saturating_sub(reserve) < needed {
                drop(inner);
                drop(st);
                self.wait_for_space(needed)?;
                continue;
            }

            inner.outstanding_credits = needed;
            inner.updates += 1;
            inner.handle_count += 1;
            drop(inner);
            drop(st);
            return Ok(Handle::new(self.clone(), tx, credits));
        }
    }

    /// 等待直到运行中的事务不再是 `tid`
    fn wait_running_changed(&self, tid: Tid) {
        let mut st = self.lock_state();
        while st.running.as_ref().map_or(false, |tx| tx.tid() == tid)
            && !st.status.contains(JournalStatus::ABORT)
        {
            st = wait(&self.state_cond, st);
        }
    }

    // =========================================================================
    // Commit requests
    // =========================================================================

    fn request_commit_locked(st: &mut JournalState, tid: Tid) -> bool {
        if tid_gt(tid, st.commit_request) {
            st.commit_request = tid;
            true
        } else {
            false
        }
    }

    /// 请求提交到事务 `tid`（由提交线程执行）
    pub fn request_commit(&self, tid: Tid) -> bool {
        let requested = Self::request_commit_locked(&mut self.lock_state(), tid);
        if requested {
            self.state_cond.notify_all();
        }
        requested
    }

    /// 请求提交运行中的事务，返回其事务号
    pub fn force_commit(&self) -> Option<Tid> {
        let tid = self.running_tid()?;
        self.request_commit(tid);
        Some(tid)
    }

    /// 同步提交运行中的事务
    ///
    /// 没有运行中的事务时返回 `Ok(None)`。提交失败（日志中止）时返回错误，
    /// 事务仍会走到 Finished。
    pub fn commit_transaction(&self) -> Result<Option<Tid>> {
        let _serial = lock(&self.commit_lock);
        let tx = match self.lock_state().running.clone() {
            Some(tx) => tx,
            None => return Ok(None),
        };
        TransactionCommitter::new(self, tx).commit().map(Some)
    }

    /// 若 `tid` 仍在运行则同步提交它
    pub(crate) fn commit_tid(&self, tid: Tid) -> Result<()> {
        let _serial = lock(&self.commit_lock);
        let tx = match &self.lock_state().running {
            Some(tx) if tx.tid() == tid => tx.clone(),
            _ => return Ok(()),
        };
        TransactionCommitter::new(self, tx).commit().map(|_| ())
    }

    /// 等待事务 `tid` 提交完成
    ///
    /// 事务因日志中止而未能提交时返回错误。没有提交线程时由调用者自己提交。
    pub fn wait_for_commit(&self, tid: Tid) -> Result<()> {
        let mut st = self.lock_state();
        if tid_geq(tid, st.transaction_sequence) {
            return Err(Error::new(ErrorKind::InvalidInput, "transaction has not been started"));
        }
        loop {
            if let Some(failed) = st.failed_from {
                if tid_geq(tid, failed) {
                    return Err(Self::aborted_error(&st));
                }
            }
            if tid_geq(st.commit_sequence, tid) {
                return Ok(());
            }

            let running = st.running.as_ref().map_or(false, |tx| tx.tid() == tid);
            let committing = st.committing.as_ref().map_or(false, |tx| tx.tid() == tid);
            if st.status.contains(JournalStatus::ABORT) && !running && !committing {
                return Err(Self::aborted_error(&st));
            }

            if running && !st.status.contains(JournalStatus::WORKER) {
                drop(st);
                self.commit_tid(tid)?;
                st = self.lock_state();
                continue;
            }
            if running {
                Self::request_commit_locked(&mut st, tid);
                self.state_cond.notify_all();
            }
            st = wait(&self.state_cond, st);
        }
    }

    /// 提交线程等待下一个提交请求
    ///
    /// 有待提交的事务时返回 `true`；线程应退出时返回 `false`。
    /// `interval` 到期且运行中的事务已有 handle 时也返回 `true`。
    pub(crate) fn wait_commit_request(&self, interval: Duration) -> bool {
        let mut st = self.lock_state();
        loop {
            if !st.status.contains(JournalStatus::WORKER) {
                return false;
            }
            if let Some(tx) = &st.running {
                if tid_gt(st.commit_request, st.commit_sequence) && tid_geq(st.commit_request, tx.tid()) {
                    return true;
                }
                if tx.start_time().elapsed() >= interval && tx.handle_count() > 0 {
                    log::debug!("[JBD] transaction {} expired, committing", tx.tid());
                    return true;
                }
            }
            st = crate::sync::wait_timeout(&self.state_cond, st, interval);
        }
    }

    // =========================================================================
    // Abort
    // =========================================================================

    /// 中止日志
    ///
    /// 不可逆：之后所有 handle 操作与提交等待都返回错误，尚未完成提交的事务
    /// 都视为失败。中止原因写入超级块的 errno。
    pub fn abort(&self, err: Error) {
        {
            let mut st = self.lock_state();
            if st.status.contains(JournalStatus::ABORT) {
                return;
            }
            st.status.insert(JournalStatus::ABORT);
            st.error = Some(err.clone());
            if st.failed_from.is_none() {
                st.failed_from = Some(st.commit_sequence.wrapping_add(1));
            }
        }
        self.state_cond.notify_all();
        log::error!("[JBD] journal aborted: {}", err);

        let _sb = lock(&self.sb_lock);
        let (sequence, start) = {
            let st = self.lock_state();
            let start = if st.status.contains(JournalStatus::FLUSHED) { 0 } else { st.tail };
            (st.tail_sequence, start)
        };
        if let Err(e) = self.write_superblock(sequence, start) {
            log::warn!("[JBD] failed to record abort in journal superblock: {}", e);
        }
    }

    // =========================================================================
    // Superblock and log space
    // =========================================================================

    /// 写日志超级块
    pub(crate) fn write_superblock(&self, sequence: Tid, start: BlockNr) -> Result<()> {
        let errno = if self.is_aborted() { JBD_ABORT_ERRNO } else { 0 };
        let sb = JournalSuperblock {
            blocksize: self.block_size,
            maxlen: self.config.journal_len,
            first: self.config.log_first(),
            sequence,
            start,
            errno,
            feature_compat: if self.config.checksum() { JBD_FEATURE_COMPAT_CHECKSUM } else { 0 },
            feature_incompat: JBD_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
        };
        let mut buf = vec![0u8; self.block_size as usize];
        sb.encode(&mut buf);
        self.io.write_sync(self.config.journal_start, buf, IoMode::Superblock)?;
        if self.config.flags.contains(JournalFlags::BARRIER) {
            self.io.flush_barrier()?;
        }
        log::debug!("[JBD] superblock updated: sequence={} start={}", sequence, start);
        Ok(())
    }

    /// 标记日志为空（格式化、加载、卸载时）
    fn mark_empty(&self) -> Result<()> {
        let _sb = lock(&self.sb_lock);
        let sequence = {
            let mut log = lock(&self.log);
            let head = log.head();
            log.reset(head);
            drop(log);
            let mut st = self.lock_state();
            st.tail_sequence = st.transaction_sequence;
            st.tail = head;
            st.status.insert(JournalStatus::FLUSHED);
            st.tail_sequence
        };
        self.write_superblock(sequence, 0)
    }

    /// 第一次在空日志上提交前，把超级块指向本事务的起点
    pub(crate) fn mark_log_start_if_flushed(&self, tid: Tid) -> Result<()> {
        let _sb = lock(&self.sb_lock);
        let head = lock(&self.log).head();
        {
            let mut st = self.lock_state();
            if !st.status.contains(JournalStatus::FLUSHED) {
                return Ok(());
            }
            st.status.remove(JournalStatus::FLUSHED);
            st.tail_sequence = tid;
            st.tail = head;
        }
        self.write_superblock(tid, head)
    }

    /// 取下一个日志块
    pub(crate) fn next_log_block(&self) -> Result<BlockNr> {
        lock(&self.log).next_log_address()
    }

    /// 提交开始时交换 revoke 表
    pub(crate) fn revoke_swap(&self) -> RevokeTable {
        lock(&self.revoke).swap()
    }

    /// 提交结束时清空提交中的 revoke 表
    pub(crate) fn revoke_finish(&self) {
        lock(&self.revoke).finish_commit();
    }

    /// 在运行中的事务里撤销块
    pub(crate) fn revoke_block(&self, blocknr: BlockNr, tid: Tid) {
        if lock(&self.revoke).active.insert(blocknr, tid) {
            log::trace!("[JBD] revoke block={} tid={}", blocknr, tid);
        }
    }

    /// 块被重新日志化时取消其 revoke 记录
    pub(crate) fn cancel_revoke(&self, blocknr: BlockNr) {
        if lock(&self.revoke).active.remove(blocknr) {
            log::trace!("[JBD] cancel revoke block={}", blocknr);
        }
    }

    /// 运行中事务的 revoke 记录数
    pub fn pending_revokes(&self) -> usize {
        lock(&self.revoke).active.len()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// 卸载
    ///
    /// 提交运行中的事务，检查点全部写回，超级块标记为空。
    /// 日志已中止时只做清理并返回中止错误。
    pub fn destroy(&self) -> Result<()> {
        let result = self.commit_transaction().map(|_| ());
        {
            let mut st = self.lock_state();
            st.status.insert(JournalStatus::UNMOUNT);
            st.status.remove(JournalStatus::WORKER);
        }
        self.state_cond.notify_all();
        result?;

        if self.is_aborted() {
            return Err(Self::aborted_error(&self.lock_state()));
        }
        self.checkpoint_all()?;
        self.mark_empty()?;
        log::info!("[JBD] journal destroyed at sequence {}", self.commit_sequence());
        Ok(())
    }
}
