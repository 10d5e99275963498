//! JBD 日志块磁盘格式定义
//!
//! 这个模块定义日志区中所有块的磁盘格式以及编解码。
//!
//! # 重要说明
//!
//! - **所有字段都是大端序（big-endian）**，统一经 `byteorder::BigEndian` 读写
//! - 结构体只在内存中使用，编码时按固定偏移写入块缓冲区
//!
//! # 块布局
//!
//! ```text
//! 块头 (12 字节)      : magic | blocktype | sequence
//! descriptor tag (8) : blocknr | flags            (+16 字节 UUID，仅每块第一个 tag)
//! revoke 块          : 块头 | count | blocknr...   (count 为已用字节数，含 16 字节头)
//! commit 块          : 块头 | chksum_type | chksum_size | pad[2] | chksum[0]
//! 超级块 (48 字节)    : 块头 | blocksize | maxlen | first | sequence | start | errno
//!                      | feature_compat | feature_incompat | feature_ro_compat
//! ```

use crate::block::BlockNr;
use crate::crc;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use super::Tid;

/// UUID 大小（128位）
pub const UUID_SIZE: usize = 16;

/// JBD magic number
pub const JBD_MAGIC_NUMBER: u32 = 0xC03B3998;

/// 块头大小
pub const JBD_HEADER_SIZE: usize = 12;

/// descriptor tag 大小
pub const JBD_TAG_SIZE: usize = 8;

/// revoke 块头大小（块头 + count）
pub const JBD_REVOKE_HEADER_SIZE: usize = 16;

/// revoke 记录大小
pub const JBD_REVOKE_RECORD_SIZE: usize = 4;

/// 块尾校验和大小
pub const JBD_TAIL_SIZE: usize = 4;

/// commit 块中已用字节数
pub const JBD_COMMIT_HEADER_SIZE: usize = 20;

/// 超级块已用字节数
pub const JBD_SUPERBLOCK_SIZE: usize = 48;

/// 最小块大小（须能容纳超级块）
pub const JBD_MIN_BLOCK_SIZE: u32 = JBD_SUPERBLOCK_SIZE as u32;

/// CRC32 校验和类型
pub const JBD_CRC32_CHKSUM: u8 = 1;

/// CRC32 校验和大小（字节）
pub const JBD_CRC32_CHKSUM_SIZE: u8 = 4;

/// compat 特性：commit 块携带事务 CRC32
pub const JBD_FEATURE_COMPAT_CHECKSUM: u32 = 0x0000_0001;

/// incompat 特性：日志中存在 revoke 块
pub const JBD_FEATURE_INCOMPAT_REVOKE: u32 = 0x0000_0001;

// =============================================================================
// Block Header and Types
// =============================================================================

/// 日志块类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    /// descriptor 块
    Descriptor = 1,
    /// commit 块
    Commit = 2,
    /// 超级块 v1
    SuperblockV1 = 3,
    /// 超级块 v2
    SuperblockV2 = 4,
    /// revoke 块
    Revoke = 5,
}

impl BlockType {
    /// 从磁盘值解析
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Descriptor),
            2 => Some(Self::Commit),
            3 => Some(Self::SuperblockV1),
            4 => Some(Self::SuperblockV2),
            5 => Some(Self::Revoke),
            _ => None,
        }
    }
}

/// 日志块头（所有日志元数据块的标准头部）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Magic number (0xC03B3998)
    pub magic: u32,
    /// Block type (descriptor, commit, revoke, superblock)
    pub blocktype: u32,
    /// Transaction sequence number
    pub sequence: u32,
}

impl BlockHeader {
    /// 创建块头
    pub fn new(blocktype: BlockType, sequence: Tid) -> Self {
        Self {
            magic: JBD_MAGIC_NUMBER,
            blocktype: blocktype as u32,
            sequence,
        }
    }

    /// 写入缓冲区前 12 字节
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.blocktype);
        BigEndian::write_u32(&mut buf[8..12], self.sequence);
    }

    /// 从缓冲区前 12 字节解析
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            magic: BigEndian::read_u32(&buf[0..4]),
            blocktype: BigEndian::read_u32(&buf[4..8]),
            sequence: BigEndian::read_u32(&buf[8..12]),
        }
    }

    /// 验证 magic number
    pub fn verify_magic(&self) -> bool {
        self.magic == JBD_MAGIC_NUMBER
    }

    /// 块类型
    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_raw(self.blocktype)
    }
}

// =============================================================================
// Block Tags (Descriptor Block)
// =============================================================================

bitflags! {
    /// descriptor tag 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u32 {
        /// 块内容前 4 字节恰为 magic，日志中已被清零
        const ESCAPE    = 0x1;
        /// 与前一个 tag 使用相同 UUID（tag 后不跟 UUID）
        const SAME_UUID = 0x2;
        /// 块已被删除（保留，未使用）
        const DELETED   = 0x4;
        /// descriptor 中的最后一个 tag
        const LAST_TAG  = 0x8;
    }
}

/// descriptor 中的块映射 tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    /// 块在设备上的最终位置
    pub blocknr: BlockNr,
    /// 标志
    pub flags: TagFlags,
}

impl BlockTag {
    /// 写入 8 字节
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.blocknr);
        BigEndian::write_u32(&mut buf[4..8], self.flags.bits());
    }

    /// 解析 8 字节
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            blocknr: BigEndian::read_u32(&buf[0..4]),
            flags: TagFlags::from_bits_retain(BigEndian::read_u32(&buf[4..8])),
        }
    }
}

// =============================================================================
// Escaping
// =============================================================================

/// 块内容是否需要转义（前 4 字节与 magic 相同）
pub fn needs_escape(data: &[u8]) -> bool {
    data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JBD_MAGIC_NUMBER
}

/// 转义：清零前 4 字节
pub fn escape_block(data: &mut [u8]) {
    data[0..4].fill(0);
}

/// 反转义：恢复前 4 字节的 magic
pub fn unescape_block(data: &mut [u8]) {
    BigEndian::write_u32(&mut data[0..4], JBD_MAGIC_NUMBER);
}

// =============================================================================
// Block Tail Checksum
// =============================================================================

/// 在块末尾写入覆盖其余部分的 CRC32
pub fn set_tail_checksum(block: &mut [u8]) {
    let tail = block.len() - JBD_TAIL_SIZE;
    let csum = crc::crc32(&block[..tail]);
    BigEndian::write_u32(&mut block[tail..], csum);
}

/// 校验块末尾的 CRC32
pub fn verify_tail_checksum(block: &[u8]) -> bool {
    let tail = block.len() - JBD_TAIL_SIZE;
    BigEndian::read_u32(&block[tail..]) == crc::crc32(&block[..tail])
}

// =============================================================================
// Log Block
// =============================================================================

/// 一个已组装好、等待写入日志区的块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    /// 日志区中的块号
    pub blocknr: BlockNr,
    /// 块内容
    pub data: Vec<u8>,
}

// =============================================================================
// Superblock
// =============================================================================

/// 日志超级块
///
/// `start == 0` 表示日志为空，恢复时无需重放。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSuperblock {
    /// 块大小
    pub blocksize: u32,
    /// 日志区总块数（含超级块）
    pub maxlen: u32,
    /// 第一个日志块（设备绝对块号）
    pub first: BlockNr,
    /// 日志尾部事务的序号
    pub sequence: Tid,
    /// 日志尾部块号（0 表示日志为空）
    pub start: BlockNr,
    /// 中止时记录的错误码
    pub errno: i32,
    /// compat 特性
    pub feature_compat: u32,
    /// incompat 特性
    pub feature_incompat: u32,
    /// ro_compat 特性
    pub feature_ro_compat: u32,
}

impl JournalSuperblock {
    /// 编码到块缓冲区（其余字节保持不变）
    pub fn encode(&self, buf: &mut [u8]) {
        BlockHeader::new(BlockType::SuperblockV2, 0).encode(buf);
        BigEndian::write_u32(&mut buf[12..16], self.blocksize);
        BigEndian::write_u32(&mut buf[16..20], self.maxlen);
        BigEndian::write_u32(&mut buf[20..24], self.first);
        BigEndian::write_u32(&mut buf[24..28], self.sequence);
        BigEndian::write_u32(&mut buf[28..32], self.start);
        BigEndian::write_i32(&mut buf[32..36], self.errno);
        BigEndian::write_u32(&mut buf[36..40], self.feature_compat);
        BigEndian::write_u32(&mut buf[40..44], self.feature_incompat);
        BigEndian::write_u32(&mut buf[44..48], self.feature_ro_compat);
    }

    /// 从块缓冲区解析，magic 或类型不符时返回 `None`
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < JBD_SUPERBLOCK_SIZE {
            return None;
        }
        let header = BlockHeader::decode(buf);
        if !header.verify_magic() {
            return None;
        }
        match header.block_type() {
            Some(BlockType::SuperblockV1) | Some(BlockType::SuperblockV2) => {}
            _ => return None,
        }
        Some(Self {
            blocksize: BigEndian::read_u32(&buf[12..16]),
            maxlen: BigEndian::read_u32(&buf[16..20]),
            first: BigEndian::read_u32(&buf[20..24]),
            sequence: BigEndian::read_u32(&buf[24..28]),
            start: BigEndian::read_u32(&buf[28..32]),
            errno: BigEndian::read_i32(&buf[32..36]),
            feature_compat: BigEndian::read_u32(&buf[36..40]),
            feature_incompat: BigEndian::read_u32(&buf[40..44]),
            feature_ro_compat: BigEndian::read_u32(&buf[44..48]),
        })
    }

    /// 是否启用事务校验和
    pub fn has_checksum(&self) -> bool {
        self.feature_compat & JBD_FEATURE_COMPAT_CHECKSUM != 0
    }

    /// 最后一个日志块之后的块号（不含）
    pub fn last(&self) -> BlockNr {
        self.first - 1 + self.maxlen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_endian() {
        let mut buf = [0u8; 12];
        BlockHeader::new(BlockType::Descriptor, 0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[0..4], &[0xC0, 0x3B, 0x39, 0x98]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);

        let header = BlockHeader::decode(&buf);
        assert!(header.verify_magic());
        assert_eq!(header.block_type(), Some(BlockType::Descriptor));
        assert_eq!(header.sequence, 0x0102_0304);
    }

    #[test]
    fn test_tag_flags_layout() {
        let mut buf = [0u8; 8];
        BlockTag { blocknr: 77, flags: TagFlags::ESCAPE | TagFlags::LAST_TAG }.encode(&mut buf);
        assert_eq!(&buf[4..8], &[0, 0, 0, 9]);
        assert_eq!(BlockTag::decode(&buf).flags, TagFlags::ESCAPE | TagFlags::LAST_TAG);
    }

    #[test]
    fn test_escape() {
        let mut data = vec![0u8; 64];
        assert!(!needs_escape(&data));
        unescape_block(&mut data);
        assert!(needs_escape(&data));
        escape_block(&mut data);
        assert_eq!(&data[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_superblock_fits_min_block() {
        let sb = JournalSuperblock {
            blocksize: JBD_MIN_BLOCK_SIZE,
            maxlen: 32,
            first: 2,
            sequence: 9,
            start: 5,
            errno: -5,
            feature_compat: JBD_FEATURE_COMPAT_CHECKSUM,
            feature_incompat: JBD_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
        };
        let mut buf = vec![0u8; JBD_MIN_BLOCK_SIZE as usize];
        sb.encode(&mut buf);
        assert_eq!(JournalSuperblock::decode(&buf), Some(sb));
        assert!(sb.has_checksum());
        assert_eq!(sb.last(), 33);

        buf[0] = 0;
        assert_eq!(JournalSuperblock::decode(&buf), None);
    }

    #[test]
    fn test_tail_checksum() {
        let mut block = vec![0x5Au8; 48];
        set_tail_checksum(&mut block);
        assert!(verify_tail_checksum(&block));
        block[3] ^= 1;
        assert!(!verify_tail_checksum(&block));
    }
}
