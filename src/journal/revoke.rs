//! Revoke 表
//!
//! 事务释放一个曾被日志化的块时写入 revoke 记录，恢复时跳过
//! 该块在更早（或同一）事务中的日志副本。
//!
//! 日志持有两张表：运行中事务写入 `active`，提交开始时两张表交换，
//! 提交过程只读取 `committing`，因此新事务的 revoke 不会混入正在提交的事务。

use super::jbd_trans::{tid_gt, Tid};
use super::types::*;
use super::JournalError;
use crate::block::BlockNr;
use crate::error::Result;
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;

/// 一张 revoke 表：块号 → 撤销它的最新事务
#[derive(Debug, Clone, Default)]
pub struct RevokeTable {
    records: BTreeMap<BlockNr, Tid>,
}

impl RevokeTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录撤销，同一块保留最新的事务号
    ///
    /// 返回是否为新记录。
    pub fn insert(&mut self, blocknr: BlockNr, tid: Tid) -> bool {
        match self.records.get_mut(&blocknr) {
            Some(existing) => {
                if tid_gt(tid, *existing) {
                    *existing = tid;
                }
                false
            }
            None => {
                self.records.insert(blocknr, tid);
                true
            }
        }
    }

    /// 取消撤销（块被重新日志化）
    pub fn remove(&mut self, blocknr: BlockNr) -> bool {
        self.records.remove(&blocknr).is_some()
    }

    /// 块是否已被撤销
    pub fn contains(&self, blocknr: BlockNr) -> bool {
        self.records.contains_key(&blocknr)
    }

    /// 撤销该块的事务号
    pub fn get(&self, blocknr: BlockNr) -> Option<Tid> {
        self.records.get(&blocknr).copied()
    }

    /// 块 `blocknr` 在事务 `tid` 中的副本是否已被撤销
    ///
    /// 撤销事务号不早于 `tid` 时成立。
    pub fn is_revoked(&self, blocknr: BlockNr, tid: Tid) -> bool {
        self.get(blocknr).map_or(false, |revoker| !tid_gt(tid, revoker))
    }

    /// 记录数
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 按块号升序遍历
    pub fn blocks(&self) -> impl Iterator<Item = BlockNr> + '_ {
        self.records.keys().copied()
    }
}

/// 双表
#[derive(Debug, Default)]
pub(crate) struct RevokeTables {
    /// 运行中事务写入的表
    pub(crate) active: RevokeTable,
    /// 正在提交的事务的表
    pub(crate) committing: RevokeTable,
}

impl RevokeTables {
    /// 提交开始时交换，返回交给提交过程的表
    pub(crate) fn swap(&mut self) -> RevokeTable {
        std::mem::swap(&mut self.active, &mut self.committing);
        self.active = RevokeTable::new();
        self.committing.clone()
    }

    /// 提交结束后清空
    pub(crate) fn finish_commit(&mut self) {
        self.committing = RevokeTable::new();
    }
}

/// revoke 块组装器
#[derive(Debug, Clone)]
pub struct RevokeWriter {
    block_size: usize,
    checksum: bool,
}

impl RevokeWriter {
    /// 创建组装器
    pub fn new(block_size: u32, checksum: bool) -> Self {
        Self { block_size: block_size as usize, checksum }
    }

    fn limit(&self) -> usize {
        if self.checksum {
            self.block_size - JBD_TAIL_SIZE
        } else {
            self.block_size
        }
    }

    /// 每块容纳的记录数
    pub fn records_per_block(&self) -> usize {
        (self.limit() - JBD_REVOKE_HEADER_SIZE) / JBD_REVOKE_RECORD_SIZE
    }

    /// 表需要的 revoke 块数
    pub fn blocks_needed(&self, table: &RevokeTable) -> usize {
        let per = self.records_per_block();
        (table.len() + per - 1) / per
    }

    /// 把表序列化为若干 revoke 块的内容
    pub fn serialize(&self, table: &RevokeTable, tid: Tid) -> Vec<Vec<u8>> {
        let records: Vec<BlockNr> = table.blocks().collect();
        records
            .chunks(self.records_per_block().max(1))
            .map(|chunk| {
                let mut data = vec![0u8; self.block_size];
                BlockHeader::new(BlockType::Revoke, tid).encode(&mut data);
                let mut offset = JBD_REVOKE_HEADER_SIZE;
                for blocknr in chunk {
                    BigEndian::write_u32(&mut data[offset..offset + JBD_REVOKE_RECORD_SIZE], *blocknr);
                    offset += JBD_REVOKE_RECORD_SIZE;
                }
                BigEndian::write_u32(&mut data[JBD_HEADER_SIZE..JBD_REVOKE_HEADER_SIZE], offset as u32);
                if self.checksum {
                    set_tail_checksum(&mut data);
                }
                data
            })
            .collect()
    }
}

/// 解析 revoke 块
pub fn parse_revoke_block(block: &[u8], checksum: bool) -> Result<Vec<BlockNr>> {
    let header = BlockHeader::decode(block);
    if !header.verify_magic() || header.block_type() != Some(BlockType::Revoke) {
        return Err(JournalError::CorruptDescriptor.into());
    }
    if checksum && !verify_tail_checksum(block) {
        return Err(JournalError::CorruptDescriptor.into());
    }
    let limit = if checksum { block.len() - JBD_TAIL_SIZE } else { block.len() };
    let count = BigEndian::read_u32(&block[JBD_HEADER_SIZE..JBD_REVOKE_HEADER_SIZE]) as usize;
    if count < JBD_REVOKE_HEADER_SIZE || count > limit {
        return Err(JournalError::CorruptDescriptor.into());
    }

    Ok(block[JBD_REVOKE_HEADER_SIZE..count]
        .chunks_exact(JBD_REVOKE_RECORD_SIZE)
        .map(BigEndian::read_u32)
        .collect())
}
