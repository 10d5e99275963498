//! 事务提交
//!
//! [`TransactionCommitter`] 把一个运行中的事务推进到 Finished：
//!
//! ```text
//! Running ─► Locked ─► Flush ─► Commit ─► CommitRecord ─► Finished
//!            等 handle   写数据   revoke     commit 块       forget 队列
//!            refile     交换     descriptor                 检查点登记
//!            reserved   revoke   元数据副本
//! ```
//!
//! 事务进入 Flush 后即不再是运行中的事务，新的 handle 可以立即在下一个事务上开始。
//! 日志中止后状态机仍然走完全部阶段，只是不再写任何块。

use super::classify::{file_buffer, refile_buffer};
use super::config::JournalFlags;
use super::descriptor::{Descriptor, DescriptorWriter};
use super::jbd_buf::{BufferFlags, BufferList, HeadState, JournalHead, TxRef};
use super::jbd_journal::{Journal, JournalStatus};
use super::jbd_trans::{LogIo, Tid, Transaction, TransactionState};
use super::revoke::{RevokeTable, RevokeWriter};
use super::types::*;
use crate::block::{BlockNr, IoMode};
use crate::crc::{crc32_append, JBD_CRC32_INIT};
use crate::error::{Error, Result};
use crate::sync::lock;
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// Commit Record
// =============================================================================

/// commit 块组装器
///
/// 布局：头部 12 字节，`chksum_type`、`chksum_size`、2 字节填充，
/// 然后是 4 字节 CRC32（仅启用校验和时写入）。
#[derive(Debug, Clone)]
pub struct CommitRecordWriter {
    block_size: usize,
    checksum: bool,
}

impl CommitRecordWriter {
    /// 创建组装器
    pub fn new(block_size: u32, checksum: bool) -> Self {
        Self { block_size: block_size as usize, checksum }
    }

    /// 组装事务 `tid` 的 commit 块，`crc` 为事务所有日志块的 CRC32
    pub fn build(&self, tid: Tid, crc: u32) -> Vec<u8> {
        let mut data = vec![0u8; self.block_size];
        BlockHeader::new(BlockType::Commit, tid).encode(&mut data);
        if self.checksum {
            data[JBD_HEADER_SIZE] = JBD_CRC32_CHKSUM;
            data[JBD_HEADER_SIZE + 1] = JBD_CRC32_CHKSUM_SIZE;
            BigEndian::write_u32(&mut data[JBD_HEADER_SIZE + 4..JBD_COMMIT_HEADER_SIZE], crc);
        }
        data
    }

    /// 解析 commit 块，返回事务号与其中的 CRC32（若有）
    pub fn parse(block: &[u8]) -> Option<(Tid, Option<u32>)> {
        if block.len() < JBD_COMMIT_HEADER_SIZE {
            return None;
        }
        let header = BlockHeader::decode(block);
        if !header.verify_magic() || header.block_type() != Some(BlockType::Commit) {
            return None;
        }
        let crc = (block[JBD_HEADER_SIZE] == JBD_CRC32_CHKSUM && block[JBD_HEADER_SIZE + 1] == JBD_CRC32_CHKSUM_SIZE)
            .then(|| BigEndian::read_u32(&block[JBD_HEADER_SIZE + 4..JBD_COMMIT_HEADER_SIZE]));
        Some((header.sequence, crc))
    }
}

// =============================================================================
// Committer
// =============================================================================

/// 等待随 descriptor 一起提交的元数据副本
struct PendingCopy {
    blocknr: BlockNr,
    data: Vec<u8>,
    shadow: Arc<JournalHead>,
}

/// 一次提交写出的块数
#[derive(Debug, Default, Clone, Copy)]
struct CommitStats {
    data: usize,
    metadata: usize,
    revoke: usize,
    descriptors: usize,
}

/// 事务提交器
///
/// 每次提交创建一个，由持有 `commit_lock` 的线程执行。
pub(crate) struct TransactionCommitter<'a> {
    journal: &'a Journal,
    tx: Arc<Transaction>,
    descriptors: DescriptorWriter,
    revokes: RevokeWriter,
    records: CommitRecordWriter,
    batch_size: usize,
    /// 待提交的数据块
    data_batch: Vec<(Arc<JournalHead>, Vec<u8>)>,
    /// 当前 descriptor 之后的元数据副本
    wbuf: Vec<PendingCopy>,
    desc: Option<Descriptor>,
    revoke_table: RevokeTable,
    /// 按日志顺序累积的 CRC32
    crc: u32,
    /// 第一个导致中止的错误
    error: Option<Error>,
    /// 日志写错误，等全部写请求结束后再中止
    log_error: Option<Error>,
    stats: CommitStats,
    started: Instant,
}

impl<'a> TransactionCommitter<'a> {
    pub(crate) fn new(journal: &'a Journal, tx: Arc<Transaction>) -> Self {
        let config = journal.config();
        let checksum = config.checksum();
        Self {
            journal,
            tx,
            descriptors: DescriptorWriter::new(journal.block_size(), config.uuid, checksum),
            revokes: RevokeWriter::new(journal.block_size(), checksum),
            records: CommitRecordWriter::new(journal.block_size(), checksum),
            batch_size: config.batch_size,
            data_batch: Vec::new(),
            wbuf: Vec::new(),
            desc: None,
            revoke_table: RevokeTable::new(),
            crc: JBD_CRC32_INIT,
            error: None,
            log_error: None,
            stats: CommitStats::default(),
            started: Instant::now(),
        }
    }

    /// 执行提交
    ///
    /// 返回已提交的事务号。日志在提交前或提交中中止时返回错误，
    /// 但事务总会到达 Finished，等待者都会被唤醒。
    pub(crate) fn commit(mut self) -> Result<Tid> {
        let tid = self.tx.tid();
        log::debug!("[JBD] commit {}: starting", tid);

        self.lock_phase();
        self.flush_phase();
        self.data_phase();
        self.revoke_phase();
        self.metadata_phase();
        self.wait_phase();
        self.commit_record_phase();
        self.forget_phase();
        self.finish()
    }

    fn tid(&self) -> Tid {
        self.tx.tid()
    }

    /// 记录错误并中止日志
    fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        self.journal.abort(err);
    }

    fn set_state(&self, state: TransactionState) {
        {
            let _st = self.journal.lock_state();
            self.tx.set_state(state);
        }
        self.journal.state_cond.notify_all();
        log::debug!("[JBD] commit {}: phase {:?}", self.tid(), state);
    }

    /// 取事务某队列的第一个块
    fn first(&self, list: BufferList) -> Option<Arc<JournalHead>> {
        self.tx.lists().first(list)
    }

    /// 块锁下确认块仍在本事务的队列上，否则清掉残留条目
    fn still_on(&self, head: &Arc<JournalHead>, st: &HeadState, list: BufferList) -> bool {
        if st.is_on(&self.tx, list) {
            return true;
        }
        self.tx.lists().remove(list, head);
        false
    }

    // =========================================================================
    // Running -> Locked
    // =========================================================================

    fn lock_phase(&mut self) {
        self.set_state(TransactionState::Locked);
        self.tx.wait_for_updates();

        if !self.journal.is_aborted() {
            if let Err(e) = self.journal.mark_log_start_if_flushed(self.tid()) {
                self.fail(e);
            }
        }

        // 预留但未修改的块直接放回
        loop {
            let next = self.first(BufferList::Reserved);
            let Some(head) = next else { break };
            let mut st = head.lock();
            if !self.still_on(&head, &st, BufferList::Reserved) {
                continue;
            }
            // 未修改的块不会进入日志，两份副本都不再需要
            st.committed = None;
            st.frozen = None;
            if let Some(handoff) = refile_buffer(&head, &mut st) {
                handoff.apply(&mut st);
            }
        }

        let pruned = self.journal.prune_checkpoints();
        if pruned > 0 {
            log::trace!("[JBD] commit {}: pruned {} checkpointed transactions", self.tid(), pruned);
        }
    }

    // =========================================================================
    // Locked -> Flush
    // =========================================================================

    fn flush_phase(&mut self) {
        self.revoke_table = self.journal.revoke_swap();
        let reserve = self.log_reserve();
        let log_start = lock(&self.journal.log).head();
        {
            let mut st = self.journal.lock_state();
            {
                let mut inner = self.tx.lock_inner();
                inner.state = TransactionState::Flush;
                inner.log_start = Some(log_start);
                inner.log_reserved = reserve;
            }
            if st.running.as_ref().map_or(false, |tx| Arc::ptr_eq(tx, &self.tx)) {
                st.running = None;
            }
            st.committing = Some(self.tx.clone());
        }
        self.journal.state_cond.notify_all();
        log::debug!(
            "[JBD] commit {}: phase Flush (log start {}, {} log blocks reserved)",
            self.tid(),
            log_start,
            reserve
        );
    }

    /// 本次提交最多写入的日志块数
    ///
    /// revoke 块、每个元数据块一份副本、descriptor 以及 commit 块。
    /// 事务锁定后元数据队列不再增长。
    fn log_reserve(&self) -> u32 {
        let metadata = self.tx.queue_len(BufferList::Metadata);
        let per_desc = self.descriptors.capacity().min(self.batch_size.saturating_sub(1)).max(1);
        let descriptors = (metadata + per_desc - 1) / per_desc;
        let revoke = self.revokes.blocks_needed(&self.revoke_table);
        (revoke + metadata + descriptors + 1) as u32
    }

    /// 取下一个日志块并扣减预留
    fn next_log_block(&self) -> Result<BlockNr> {
        let blocknr = self.journal.next_log_block()?;
        let mut inner = self.tx.lock_inner();
        inner.log_reserved = inner.log_reserved.saturating_sub(1);
        Ok(blocknr)
    }

    // =========================================================================
    // Flush: ordered data
    // =========================================================================

    fn data_phase(&mut self) {
        loop {
            let next = self.first(BufferList::SyncData);
            let Some(head) = next else { break };
            let aborted = self.journal.is_aborted();

            let mut st = match head.try_lock() {
                Some(st) => st,
                None => {
                    self.submit_data_batch();
                    head.lock()
                }
            };
            if !self.still_on(&head, &st, BufferList::SyncData) {
                continue;
            }

            if aborted || !st.flags.contains(BufferFlags::DIRTY) {
                if let Some(handoff) = refile_buffer(&head, &mut st) {
                    handoff.apply(&mut st);
                }
                continue;
            }

            st.flags.remove(BufferFlags::DIRTY);
            let data = st.data.clone();
            file_buffer(&head, &mut st, &self.tx, BufferList::Locked);
            drop(st);

            self.data_batch.push((head, data));
            if self.data_batch.len() >= self.batch_size {
                self.submit_data_batch();
            }
        }
        self.submit_data_batch();
        self.wait_data();
    }

    fn submit_data_batch(&mut self) {
        let batch = std::mem::take(&mut self.data_batch);
        for (head, data) in batch {
            match self.journal.io.submit(head.blocknr(), data, IoMode::Data) {
                Ok(pending) => {
                    head.lock().inflight = Some(pending);
                    self.stats.data += 1;
                }
                Err(e) => self.data_error(&head, e),
            }
        }
    }

    fn wait_data(&mut self) {
        loop {
            let next = self.first(BufferList::Locked);
            let Some(head) = next else { break };

            let pending = head.lock().inflight.take();
            if let Some(pending) = pending {
                if let Err(e) = self.journal.io.wait(pending) {
                    self.data_error(&head, e);
                }
            }

            let mut st = head.lock();
            if !self.still_on(&head, &st, BufferList::Locked) {
                continue;
            }
            if let Some(handoff) = refile_buffer(&head, &mut st) {
                handoff.apply(&mut st);
            }
        }
    }

    fn data_error(&mut self, head: &JournalHead, err: Error) {
        if self.journal.config().flags.contains(JournalFlags::ABORT_ON_SYNCDATA_ERR) {
            self.fail(err);
        } else {
            log::warn!("[JBD] commit {}: data write of block {} failed: {}", self.tid(), head.blocknr(), err);
        }
    }

    // =========================================================================
    // Flush -> Commit: revoke records
    // =========================================================================

    fn revoke_phase(&mut self) {
        self.set_state(TransactionState::Commit);
        if self.journal.is_aborted() || self.revoke_table.is_empty() {
            return;
        }

        let blocks = self.revokes.serialize(&self.revoke_table, self.tid());
        for data in blocks {
            let blocknr = match self.next_log_block() {
                Ok(blocknr) => blocknr,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            self.submit_log(blocknr, data, None);
            self.stats.revoke += 1;
        }
    }

    /// 提交一个日志块写请求
    fn submit_log(&mut self, blocknr: BlockNr, data: Vec<u8>, shadow: Option<Arc<JournalHead>>) {
        self.crc = crc32_append(self.crc, &data);
        let pending = match self.journal.io.submit(blocknr, data, IoMode::Log) {
            Ok(pending) => Some(pending),
            Err(e) => {
                self.log_error.get_or_insert(e);
                None
            }
        };
        self.tx.lock_inner().log_blocks += 1;

        let io = LogIo { pending, blocknr, shadow };
        let mut lists = self.tx.lists();
        if io.shadow.is_some() {
            lists.iobuf.push(io);
        } else {
            lists.log_ctl.push(io);
        }
    }

    // =========================================================================
    // Commit: metadata
    // =========================================================================

    fn metadata_phase(&mut self) {
        loop {
            let next = self.first(BufferList::Metadata);
            let Some(head) = next else { break };

            if self.journal.is_aborted() {
                self.abandon_batch();
                let mut st = head.lock();
                if !self.still_on(&head, &st, BufferList::Metadata) {
                    continue;
                }
                st.flags.remove(BufferFlags::JBD_DIRTY);
                if let Some(handoff) = refile_buffer(&head, &mut st) {
                    handoff.apply(&mut st);
                }
                continue;
            }

            if self.desc.is_none() {
                match self.next_log_block() {
                    Ok(blocknr) => self.desc = Some(self.descriptors.begin(self.tid(), blocknr)),
                    Err(e) => {
                        self.fail(e);
                        continue;
                    }
                }
            }

            let mut st = head.lock();
            if !self.still_on(&head, &st, BufferList::Metadata) {
                continue;
            }
            let blocknr = match self.next_log_block() {
                Ok(blocknr) => blocknr,
                Err(e) => {
                    drop(st);
                    log::error!("[JBD] commit {}: log full while writing metadata", self.tid());
                    self.fail(e);
                    continue;
                }
            };

            let (copy, escaped) = take_log_copy(&mut st);
            file_buffer(&head, &mut st, &self.tx, BufferList::Shadow);
            drop(st);
            {
                let mut inner = self.tx.lock_inner();
                inner.outstanding_credits = inner.outstanding_credits.saturating_sub(1);
            }

            let flags = if escaped { TagFlags::ESCAPE } else { TagFlags::empty() };
            let full = match self.desc.as_mut() {
                Some(desc) => {
                    self.descriptors.add_tag(desc, head.blocknr(), flags);
                    !self.descriptors.has_room(desc)
                }
                None => false,
            };
            self.wbuf.push(PendingCopy { blocknr, data: copy, shadow: head });

            let exhausted = self.tx.queue_len(BufferList::Metadata) == 0;
            if exhausted || full || self.wbuf.len() + 1 >= self.batch_size {
                self.submit_log_batch();
            }
        }
        self.submit_log_batch();
    }

    /// 写出当前 descriptor 及其后的元数据副本
    fn submit_log_batch(&mut self) {
        let Some(desc) = self.desc.take() else { return };
        let block = self.descriptors.finalize(desc);
        log::trace!(
            "[JBD] commit {}: descriptor at {} with {} tags",
            self.tid(),
            block.blocknr,
            self.wbuf.len()
        );
        self.submit_log(block.blocknr, block.data, None);
        self.stats.descriptors += 1;

        let batch = std::mem::take(&mut self.wbuf);
        for copy in batch {
            self.submit_log(copy.blocknr, copy.data, Some(copy.shadow));
            self.stats.metadata += 1;
        }
    }

    /// 中止时丢弃尚未写出的批次
    fn abandon_batch(&mut self) {
        self.desc = None;
        for copy in std::mem::take(&mut self.wbuf) {
            let mut st = copy.shadow.lock();
            if st.is_on(&self.tx, BufferList::Shadow) {
                file_buffer(&copy.shadow, &mut st, &self.tx, BufferList::Forget);
            }
        }
    }

    // =========================================================================
    // Commit -> CommitRecord: wait for log I/O
    // =========================================================================

    fn wait_phase(&mut self) {
        // 后提交的先等
        loop {
            let next = self.tx.lists().iobuf.pop();
            let Some(io) = next else { break };
            self.wait_log_io(io.pending, io.blocknr);
            if let Some(head) = io.shadow {
                let mut st = head.lock();
                if st.is_on(&self.tx, BufferList::Shadow) {
                    file_buffer(&head, &mut st, &self.tx, BufferList::Forget);
                }
            }
        }

        loop {
            let next = self.tx.lists().log_ctl.pop();
            let Some(io) = next else { break };
            self.wait_log_io(io.pending, io.blocknr);
        }

        if let Some(err) = self.log_error.take() {
            log::error!("[JBD] commit {}: log write failed: {}", self.tid(), err);
            self.fail(err);
        }
    }

    fn wait_log_io(&mut self, pending: Option<crate::block::PendingIo>, blocknr: BlockNr) {
        if let Some(pending) = pending {
            if let Err(e) = self.journal.io.wait(pending) {
                log::debug!("[JBD] commit {}: log block {} failed", self.tid(), blocknr);
                self.log_error.get_or_insert(e);
            }
        }
    }

    // =========================================================================
    // CommitRecord
    // =========================================================================

    fn commit_record_phase(&mut self) {
        self.set_state(TransactionState::CommitRecord);
        if self.journal.is_aborted() {
            return;
        }
        if let Err(e) = self.write_commit_record() {
            log::error!("[JBD] commit {}: commit record write failed: {}", self.tid(), e);
            self.fail(e);
        }
    }

    fn write_commit_record(&mut self) -> Result<()> {
        let blocknr = self.next_log_block()?;
        let data = self.records.build(self.tid(), self.crc);
        let barrier = self.journal.config().flags.contains(JournalFlags::BARRIER);

        if barrier {
            self.journal.io.flush_barrier()?;
        }
        self.journal.io.write_sync(blocknr, data, IoMode::Commit)?;
        if barrier {
            self.journal.io.flush_barrier()?;
        }
        self.tx.lock_inner().log_blocks += 1;
        Ok(())
    }

    // =========================================================================
    // CommitRecord -> Finished
    // =========================================================================

    fn forget_phase(&mut self) {
        let aborted = self.journal.is_aborted();
        loop {
            let next = self.first(BufferList::Forget);
            let Some(head) = next else { break };
            let mut st = head.lock();
            if !self.still_on(&head, &st, BufferList::Forget) {
                continue;
            }

            if st.committed.is_some() {
                if let Some(frozen) = st.frozen.take() {
                    st.committed = Some(frozen);
                }
            } else {
                st.frozen = None;
            }

            if let Some(old) = st.cp_transaction.take().and_then(|t| t.upgrade()) {
                old.lists().remove_checkpoint(&head);
            }

            if st.flags.contains(BufferFlags::JBD_DIRTY) {
                st.cp_transaction = Some(TxRef::new(&self.tx));
                self.tx.lists().checkpoint.push(head.clone());
                if aborted {
                    st.flags.remove(BufferFlags::JBD_DIRTY);
                }
            }

            if let Some(handoff) = refile_buffer(&head, &mut st) {
                handoff.apply(&mut st);
            }
        }
    }

    // =========================================================================
    // Finished
    // =========================================================================

    fn finish(self) -> Result<Tid> {
        let tid = self.tid();
        self.journal.revoke_finish();

        if self.tx.checkpoint_len() > 0 {
            self.journal.register_checkpoint(self.tx.clone());
        }

        let elapsed = self.started.elapsed();
        let aborted = {
            let mut st = self.journal.lock_state();
            {
                let mut inner = self.tx.lock_inner();
                inner.state = TransactionState::Finished;
                inner.log_reserved = 0;
            }
            st.commit_sequence = tid;
            if st.committing.as_ref().map_or(false, |tx| Arc::ptr_eq(tx, &self.tx)) {
                st.committing = None;
            }
            st.average_commit_time = Some(match st.average_commit_time {
                Some(avg) => (avg * 3 + elapsed) / 4,
                None => elapsed,
            });
            st.status.contains(JournalStatus::ABORT)
        };
        self.journal.state_cond.notify_all();

        let stats = self.stats;
        if aborted {
            log::info!("[JBD] commit {} finished on aborted journal in {:?}", tid, elapsed);
        } else {
            log::info!(
                "[JBD] commit {} done: {} data, {} metadata, {} revoke, {} descriptor blocks in {:?}",
                tid,
                stats.data,
                stats.metadata,
                stats.revoke,
                stats.descriptors,
                elapsed
            );
        }

        match self.error {
            Some(err) => Err(err),
            None if aborted => Err(super::JournalError::JournalAborted.into()),
            None => Ok(tid),
        }
    }
}

/// 取出要写入日志的副本
///
/// 有冻结副本时用冻结副本，否则复制当前内容。需要转义时返回转义后的副本。
/// 保留了 committed 副本的块同时更新为本次提交的内容。
fn take_log_copy(st: &mut HeadState) -> (Vec<u8>, bool) {
    let source = match st.frozen.take() {
        Some(frozen) => frozen,
        None => st.data.clone(),
    };
    let mut copy = if st.committed.is_some() {
        let copy = source.clone();
        st.committed = Some(source);
        copy
    } else {
        source
    };
    let escaped = needs_escape(&copy);
    if escaped {
        escape_block(&mut copy);
    }
    (copy, escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::error::ErrorKind;
    use crate::journal::JournalConfig;
    use std::time::Duration;

    fn journal(block_size: u32) -> (Arc<MemDevice>, Arc<Journal>) {
        let dev = Arc::new(MemDevice::new(block_size, 512));
        let config = JournalConfig { journal_len: 64, ..JournalConfig::default() };
        let journal = Journal::create(dev.clone(), config).unwrap();
        (dev, journal)
    }

    #[test]
    fn test_commit_record_layout() {
        let writer = CommitRecordWriter::new(64, true);
        let block = writer.build(9, 0xDEAD_BEEF);
        assert_eq!(BigEndian::read_u32(&block[0..4]), JBD_MAGIC_NUMBER);
        assert_eq!(BigEndian::read_u32(&block[4..8]), BlockType::Commit as u32);
        assert_eq!(BigEndian::read_u32(&block[8..12]), 9);
        assert_eq!(block[12], JBD_CRC32_CHKSUM);
        assert_eq!(block[13], JBD_CRC32_CHKSUM_SIZE);
        assert_eq!(CommitRecordWriter::parse(&block), Some((9, Some(0xDEAD_BEEF))));

        let plain = CommitRecordWriter::new(64, false).build(3, 0x1234);
        assert_eq!(CommitRecordWriter::parse(&plain), Some((3, None)));
        assert_eq!(CommitRecordWriter::parse(&[0u8; 64]), None);
    }

    #[test]
    fn test_take_log_copy_escapes() {
        let head = JournalHead::new(7, vec![0; 32]);
        let mut st = head.lock();
        BigEndian::write_u32(&mut st.data[0..4], JBD_MAGIC_NUMBER);
        st.data[4] = 0x55;

        let (copy, escaped) = take_log_copy(&mut st);
        assert!(escaped);
        assert_eq!(&copy[0..4], &[0, 0, 0, 0]);
        assert_eq!(copy[4], 0x55);
        assert!(needs_escape(&st.data));
    }

    #[test]
    fn test_take_log_copy_prefers_frozen() {
        let head = JournalHead::new(7, vec![2; 32]);
        let mut st = head.lock();
        st.frozen = Some(vec![1; 32]);
        st.committed = Some(vec![0; 32]);

        let (copy, escaped) = take_log_copy(&mut st);
        assert!(!escaped);
        assert_eq!(copy, vec![1; 32]);
        assert!(st.frozen.is_none());
        assert_eq!(st.committed, Some(vec![1; 32]));
    }

    #[test]
    fn test_commit_writes_descriptor_copy_and_record() {
        let (dev, journal) = journal(256);
        let head = journal.get_block(200).unwrap();

        let mut handle = journal.start(1).unwrap();
        handle.modify_metadata(&head, |data| data[0] = 0x42).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();

        let tx = journal.running_transaction().unwrap();
        assert_eq!(journal.commit_transaction().unwrap(), Some(tid));
        assert_eq!(tx.state(), TransactionState::Finished);
        assert_eq!(tx.log_start(), Some(2));
        assert_eq!(tx.log_blocks(), 3);

        // descriptor, 副本, commit 块
        let desc = dev.read_block(2);
        let tags = super::super::descriptor::parse_tags(&desc, false).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].blocknr, 200);
        assert!(tags[0].flags.contains(TagFlags::LAST_TAG));
        assert_eq!(dev.read_block(3)[0], 0x42);
        assert_eq!(CommitRecordWriter::parse(&dev.read_block(4)).map(|r| r.0), Some(tid));

        // 块尚未写回原位，进入检查点
        assert_eq!(dev.read_block(200)[0], 0);
        assert_eq!(head.checkpoint_transaction_id(), Some(tid));
        assert!(head.flags().contains(BufferFlags::DIRTY));
        assert_eq!(journal.checkpoint_count(), 1);
    }

    #[test]
    fn test_reserved_blocks_are_released() {
        let (_dev, journal) = journal(256);
        let head = journal.get_block(300).unwrap();

        let mut handle = journal.start(1).unwrap();
        handle.get_write_access(&head).unwrap();
        assert_eq!(head.list(), BufferList::Reserved);
        handle.stop().unwrap();

        journal.commit_transaction().unwrap();
        assert_eq!(head.list(), BufferList::None);
        assert_eq!(head.transaction_id(), None);
        assert_eq!(journal.checkpoint_count(), 0);
    }

    #[test]
    fn test_data_written_home_before_log() {
        let (dev, journal) = journal(256);
        let data = journal.get_block(100).unwrap();
        let meta = journal.get_block(101).unwrap();

        let mut handle = journal.start(1).unwrap();
        data.with_data_mut(|d| d.fill(0xDD));
        handle.dirty_data(&data).unwrap();
        handle.modify_metadata(&meta, |d| d[0] = 1).unwrap();
        handle.stop().unwrap();
        dev.clear_events();

        journal.commit_transaction().unwrap();
        assert_eq!(dev.read_block(100), vec![0xDD; 256]);
        assert_eq!(data.list(), BufferList::None);
        assert!(!data.flags().contains(BufferFlags::DIRTY));

        let events = dev.events();
        let data_done = events
            .iter()
            .position(|e| e.mode == IoMode::Data && e.kind == crate::block::IoEventKind::Complete)
            .unwrap();
        let first_log = events.iter().position(|e| e.mode == IoMode::Log).unwrap();
        assert!(data_done < first_log);
    }

    #[test]
    fn test_clean_data_block_is_dropped() {
        let (dev, journal) = journal(256);
        let data = journal.get_block(100).unwrap();

        let handle = journal.start(1).unwrap();
        handle.dirty_data(&data).unwrap();
        assert_eq!(data.list(), BufferList::SyncData);
        data.lock().flags.remove(BufferFlags::DIRTY);
        handle.stop().unwrap();
        dev.clear_events();

        journal.commit_transaction().unwrap();
        assert!(dev.events().iter().all(|e| e.mode != IoMode::Data));
        assert_eq!(data.list(), BufferList::None);
    }

    #[test]
    fn test_unmodified_undo_block_drops_copies() {
        let (_dev, journal) = journal(256);
        let head = journal.get_block(300).unwrap();

        let handle = journal.start(1).unwrap();
        handle.get_undo_access(&head).unwrap();
        assert!(head.committed_data().is_some());
        head.lock().frozen = Some(vec![9; 256]);
        handle.stop().unwrap();

        journal.commit_transaction().unwrap();
        assert_eq!(head.committed_data(), None);
        assert!(head.lock().frozen.is_none());
        assert_eq!(head.list(), BufferList::None);
    }

    #[test]
    fn test_log_reserve_tracks_remaining_blocks() {
        let (dev, journal) = journal(256);
        let data = journal.get_block(100).unwrap();
        let mut handle = journal.start(3).unwrap();
        data.with_data_mut(|d| d.fill(0xDD));
        handle.dirty_data(&data).unwrap();
        for blocknr in 101..104 {
            let head = journal.get_block(blocknr).unwrap();
            handle.modify_metadata(&head, |d| d[0] = 1).unwrap();
        }
        handle.revoke(200).unwrap();
        handle.stop().unwrap();
        let tx = journal.running_transaction().unwrap();

        dev.hold_writes();
        let committer = {
            let journal = journal.clone();
            std::thread::spawn(move || journal.commit_transaction())
        };
        assert!(dev.wait_for_submits(IoMode::Data, 1, Duration::from_secs(5)));

        // revoke 块、3 个副本、descriptor、commit 块
        assert_eq!(tx.log_reserved(), 6);
        assert_eq!(journal.log_space_available(), journal.log_space_left() - 6);

        dev.release_writes();
        assert!(committer.join().unwrap().is_ok());
        assert_eq!(tx.log_reserved(), 0);
        assert_eq!(tx.log_blocks(), 6);
        assert_eq!(journal.log_space_available(), journal.log_space_left());
    }

    #[test]
    fn test_log_full_during_metadata_aborts() {
        let (_dev, journal) = journal(256);
        let heads: Vec<_> = (100..103).map(|b| journal.get_block(b).unwrap()).collect();
        let mut handle = journal.start(3).unwrap();
        for head in &heads {
            handle.modify_metadata(head, |d| d[0] = 1).unwrap();
        }
        handle.stop().unwrap();
        let tx = journal.running_transaction().unwrap();

        // 只留下 descriptor 的位置
        {
            let mut log = lock(&journal.log);
            while log.free_blocks() > 1 {
                log.next_log_address().unwrap();
            }
        }

        let err = journal.commit_transaction().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogFull);
        assert!(journal.is_aborted());
        assert_eq!(tx.state(), TransactionState::Finished);
        for list in [BufferList::Metadata, BufferList::Shadow, BufferList::Forget] {
            assert_eq!(tx.queue_len(list), 0);
        }
        assert!(heads.iter().all(|h| h.transaction_id().is_none()));
        assert_eq!(journal.checkpoint_count(), 0);
    }
}
