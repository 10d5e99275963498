//! 日志恢复
//!
//! 从超级块记录的尾部开始扫描日志：
//!
//! 1. 按事务号连续扫描 descriptor / revoke / commit 块，遇到 magic 或事务号
//!    不符、没有 commit 块或校验和不符的事务即停止
//! 2. 汇总已提交事务的 revoke 记录（每个块取最大的事务号）
//! 3. 按顺序重放已提交事务的块，被同一或更新事务撤销的块跳过
//!
//! 恢复不修改日志超级块，由调用者（[`Journal::load`](super::Journal::load)）重置日志。

use super::commit::CommitRecordWriter;
use super::config::JournalConfig;
use super::descriptor::parse_tags;
use super::jbd_trans::Tid;
use super::revoke::{parse_revoke_block, RevokeTable};
use super::types::*;
use super::JournalError;
use crate::block::{BlockIo, BlockNr, IoMode};
use crate::crc::{crc32_append, JBD_CRC32_INIT};
use crate::error::Result;

/// 恢复结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// 日志中第一个事务号
    pub start_transaction: Tid,
    /// 最后一个已提交事务之后的事务号
    pub end_transaction: Tid,
    /// 重放的块数
    pub replayed_blocks: u32,
    /// 因 revoke 跳过的块数
    pub revoked_blocks: u32,
}

/// 已提交事务中记录的一个块
#[derive(Debug, Clone, Copy)]
struct LoggedBlock {
    /// 日志中的位置
    log_block: BlockNr,
    tag: BlockTag,
}

#[derive(Debug)]
struct ScannedTransaction {
    tid: Tid,
    blocks: Vec<LoggedBlock>,
}

/// 环形日志区 `[first, last)`
#[derive(Debug, Clone, Copy)]
struct LogRing {
    first: BlockNr,
    last: BlockNr,
}

impl LogRing {
    fn next(&self, blocknr: BlockNr) -> BlockNr {
        if blocknr + 1 >= self.last {
            self.first
        } else {
            blocknr + 1
        }
    }

    fn len(&self) -> u32 {
        self.last - self.first
    }

    fn contains(&self, blocknr: BlockNr) -> bool {
        blocknr >= self.first && blocknr < self.last
    }
}

/// 读取并校验日志超级块
pub fn read_superblock(io: &dyn BlockIo, config: &JournalConfig) -> Result<JournalSuperblock> {
    let mut buf = vec![0u8; io.block_size() as usize];
    io.read(config.journal_start, &mut buf)?;
    let sb = JournalSuperblock::decode(&buf).ok_or(JournalError::InvalidSuperblock)?;
    if sb.blocksize != io.block_size() || sb.first != config.log_first() || sb.maxlen != config.journal_len {
        log::error!(
            "[JBD] superblock geometry mismatch: blocksize={} first={} maxlen={}",
            sb.blocksize,
            sb.first,
            sb.maxlen
        );
        return Err(JournalError::InvalidSuperblock.into());
    }
    Ok(sb)
}

/// 恢复日志
pub fn recover(io: &dyn BlockIo, config: &JournalConfig) -> Result<RecoveryInfo> {
    let sb = read_superblock(io, config)?;
    let mut info = RecoveryInfo {
        start_transaction: sb.sequence,
        end_transaction: sb.sequence,
        ..RecoveryInfo::default()
    };
    if sb.start == 0 {
        log::debug!("[JBD] journal is clean, nothing to recover");
        return Ok(info);
    }

    let ring = LogRing { first: sb.first, last: sb.last() };
    if !ring.contains(sb.start) {
        return Err(JournalError::InvalidSuperblock.into());
    }
    if sb.errno != 0 {
        log::warn!("[JBD] journal was aborted with errno {}", sb.errno);
    }

    let (transactions, revokes) = scan(io, config, &sb, ring)?;
    if let Some(last) = transactions.last() {
        info.end_transaction = last.tid.wrapping_add(1);
    }

    let mut data = vec![0u8; io.block_size() as usize];
    for tx in &transactions {
        for logged in &tx.blocks {
            let target = logged.tag.blocknr;
            if revokes.is_revoked(target, tx.tid) {
                info.revoked_blocks += 1;
                continue;
            }
            io.read(logged.log_block, &mut data)?;
            if logged.tag.flags.contains(TagFlags::ESCAPE) {
                unescape_block(&mut data);
            }
            io.write_sync(target, data.clone(), IoMode::Checkpoint)?;
            info.replayed_blocks += 1;
        }
    }
    io.flush_barrier()?;

    log::info!(
        "[JBD] recovery complete: transactions {}..{}, {} blocks replayed, {} revoked",
        info.start_transaction,
        info.end_transaction,
        info.replayed_blocks,
        info.revoked_blocks
    );
    Ok(info)
}

/// 扫描日志，返回已提交的事务与它们的 revoke 记录
fn scan(
    io: &dyn BlockIo,
    config: &JournalConfig,
    sb: &JournalSuperblock,
    ring: LogRing,
) -> Result<(Vec<ScannedTransaction>, RevokeTable)> {
    let checksum = sb.has_checksum();
    let block_size = io.block_size() as usize;
    let mut buf = vec![0u8; block_size];
    let mut data = vec![0u8; block_size];

    let mut transactions = Vec::new();
    let mut revokes = RevokeTable::new();
    let mut next = sb.start;
    let mut sequence = sb.sequence;
    let mut scanned = 0u32;

    'scan: loop {
        let mut blocks = Vec::new();
        let mut revoked = Vec::new();
        let mut crc = JBD_CRC32_INIT;

        loop {
            if scanned >= ring.len() {
                break 'scan;
            }
            let at = next;
            io.read(at, &mut buf)?;
            next = ring.next(next);
            scanned += 1;

            let header = BlockHeader::decode(&buf);
            if !header.verify_magic() || header.sequence != sequence {
                break 'scan;
            }

            match header.block_type() {
                Some(BlockType::Descriptor) => {
                    crc = crc32_append(crc, &buf);
                    for tag in parse_tags(&buf, checksum)? {
                        if config.contains(tag.blocknr) || u64::from(tag.blocknr) >= io.total_blocks() {
                            log::error!("[JBD] descriptor at {} tags invalid block {}", at, tag.blocknr);
                            return Err(JournalError::CorruptDescriptor.into());
                        }
                        if scanned >= ring.len() {
                            break 'scan;
                        }
                        if checksum {
                            io.read(next, &mut data)?;
                            crc = crc32_append(crc, &data);
                        }
                        blocks.push(LoggedBlock { log_block: next, tag });
                        next = ring.next(next);
                        scanned += 1;
                    }
                }
                Some(BlockType::Revoke) => {
                    crc = crc32_append(crc, &buf);
                    revoked.extend(parse_revoke_block(&buf, checksum)?);
                }
                Some(BlockType::Commit) => {
                    if checksum {
                        match CommitRecordWriter::parse(&buf) {
                            Some((_, Some(stored))) if stored == crc => {}
                            _ => {
                                log::warn!("[JBD] transaction {} fails checksum, stopping scan", sequence);
                                break 'scan;
                            }
                        }
                    }
                    for blocknr in revoked {
                        revokes.insert(blocknr, sequence);
                    }
                    log::debug!("[JBD] found committed transaction {} ({} blocks)", sequence, blocks.len());
                    transactions.push(ScannedTransaction { tid: sequence, blocks });
                    sequence = sequence.wrapping_add(1);
                    continue 'scan;
                }
                _ => break 'scan,
            }
        }
    }

    Ok((transactions, revokes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::error::ErrorKind;
    use crate::journal::{Journal, JournalFlags};
    use byteorder::{BigEndian, ByteOrder};
    use std::sync::Arc;

    fn config(flags: JournalFlags) -> JournalConfig {
        JournalConfig { journal_len: 64, flags, ..JournalConfig::default() }
    }

    fn setup(flags: JournalFlags) -> (Arc<MemDevice>, Arc<Journal>) {
        let dev = Arc::new(MemDevice::new(256, 512));
        let journal = Journal::create(dev.clone(), config(flags)).unwrap();
        (dev, journal)
    }

    fn write_block(journal: &Arc<Journal>, blocknr: BlockNr, f: impl FnOnce(&mut [u8])) {
        let head = journal.get_block(blocknr).unwrap();
        let mut handle = journal.start(1).unwrap();
        handle.modify_metadata(&head, f).unwrap();
        handle.stop().unwrap();
    }

    #[test]
    fn test_ring_wraps() {
        let ring = LogRing { first: 2, last: 5 };
        assert_eq!(ring.next(2), 3);
        assert_eq!(ring.next(4), 2);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_clean_journal() {
        let (dev, _journal) = setup(JournalFlags::BARRIER);
        let info = recover(dev.as_ref(), &config(JournalFlags::BARRIER)).unwrap();
        assert_eq!(info.start_transaction, 1);
        assert_eq!(info.end_transaction, 1);
        assert_eq!(info.replayed_blocks, 0);
    }

    #[test]
    fn test_replay_committed() {
        let (dev, journal) = setup(JournalFlags::BARRIER);
        write_block(&journal, 200, |d| d.fill(0x77));
        journal.commit_transaction().unwrap();

        let crashed = dev.snapshot();
        assert_eq!(crashed.read_block(200), vec![0; 256]);
        let info = recover(&crashed, &config(JournalFlags::BARRIER)).unwrap();
        assert_eq!(info.replayed_blocks, 1);
        assert_eq!(info.end_transaction, 2);
        assert_eq!(crashed.read_block(200), vec![0x77; 256]);
    }

    #[test]
    fn test_escaped_block_restored() {
        let (dev, journal) = setup(JournalFlags::BARRIER);
        write_block(&journal, 200, |d| {
            BigEndian::write_u32(&mut d[0..4], JBD_MAGIC_NUMBER);
            d[4] = 0xEE;
        });
        journal.commit_transaction().unwrap();
        // 日志中的副本已转义
        assert_eq!(&dev.read_block(3)[0..4], &[0, 0, 0, 0]);

        let crashed = dev.snapshot();
        recover(&crashed, &config(JournalFlags::BARRIER)).unwrap();
        let block = crashed.read_block(200);
        assert_eq!(BigEndian::read_u32(&block[0..4]), JBD_MAGIC_NUMBER);
        assert_eq!(block[4], 0xEE);
    }

    #[test]
    fn test_revoked_block_skipped() {
        let (dev, journal) = setup(JournalFlags::BARRIER);
        write_block(&journal, 200, |d| d.fill(1));
        journal.commit_transaction().unwrap();

        let handle = journal.start(1).unwrap();
        handle.revoke(200).unwrap();
        handle.stop().unwrap();
        journal.commit_transaction().unwrap();

        let crashed = dev.snapshot();
        let info = recover(&crashed, &config(JournalFlags::BARRIER)).unwrap();
        assert_eq!(info.replayed_blocks, 0);
        assert_eq!(info.revoked_blocks, 1);
        assert_eq!(info.end_transaction, 3);
        assert_eq!(crashed.read_block(200), vec![0; 256]);
    }

    #[test]
    fn test_checksum_mismatch_stops_scan() {
        let flags = JournalFlags::BARRIER | JournalFlags::CHECKSUM;
        let (dev, journal) = setup(flags);
        write_block(&journal, 200, |d| d.fill(3));
        journal.commit_transaction().unwrap();

        let crashed = dev.snapshot();
        let intact = recover(&dev.snapshot(), &config(flags)).unwrap();
        assert_eq!(intact.replayed_blocks, 1);

        // 损坏日志中的数据副本
        crashed.write_block(3, &[9u8; 256]);
        let info = recover(&crashed, &config(flags)).unwrap();
        assert_eq!(info.replayed_blocks, 0);
        assert_eq!(info.end_transaction, 1);
        assert_eq!(crashed.read_block(200), vec![0; 256]);
    }

    #[test]
    fn test_corrupt_descriptor() {
        let flags = JournalFlags::BARRIER | JournalFlags::CHECKSUM;
        let (dev, journal) = setup(flags);
        write_block(&journal, 200, |d| d.fill(3));
        journal.commit_transaction().unwrap();

        let crashed = dev.snapshot();
        let mut desc = crashed.read_block(2);
        desc[100] ^= 0xFF;
        crashed.write_block(2, &desc);
        let err = recover(&crashed, &config(flags)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_geometry_mismatch() {
        let (dev, _journal) = setup(JournalFlags::BARRIER);
        let other = JournalConfig { journal_len: 128, ..config(JournalFlags::BARRIER) };
        let err = recover(dev.as_ref(), &other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }
}
