//! Descriptor 块（DescriptorWriter）
//!
//! descriptor 块告诉恢复过程：紧随其后的日志块依次是哪些设备块的副本。
//!
//! ```text
//! ┌────────┬──────────┬──────┬─────┬─────┬───┬──────┐
//! │ header │ tag #0   │ UUID │ tag │ tag │...│ tail │
//! │ 12 B   │ 8 B      │ 16 B │ 8 B │ 8 B │   │ 4 B  │ (tail 仅在启用校验和时存在)
//! └────────┴──────────┴──────┴─────┴─────┴───┴──────┘
//! ```
//!
//! 块写满时以容量为界；未写满就结束的 descriptor 在最后一个 tag 上置 `LAST_TAG`。

use super::jbd_trans::Tid;
use super::types::*;
use crate::block::BlockNr;
use crate::error::Result;
use super::JournalError;

/// 正在组装的 descriptor 块
#[derive(Debug)]
pub struct Descriptor {
    blocknr: BlockNr,
    data: Vec<u8>,
    offset: usize,
    last_tag: Option<usize>,
}

impl Descriptor {
    /// 日志区中的块号
    pub fn blocknr(&self) -> BlockNr {
        self.blocknr
    }

    /// 已写入的 tag 数
    pub fn tag_count(&self) -> usize {
        if self.last_tag.is_none() {
            return 0;
        }
        let used = self.offset - JBD_HEADER_SIZE - UUID_SIZE;
        used / JBD_TAG_SIZE
    }
}

/// descriptor 组装器
#[derive(Debug, Clone)]
pub struct DescriptorWriter {
    block_size: usize,
    uuid: [u8; UUID_SIZE],
    checksum: bool,
}

impl DescriptorWriter {
    /// 创建组装器
    pub fn new(block_size: u32, uuid: [u8; UUID_SIZE], checksum: bool) -> Self {
        Self { block_size: block_size as usize, uuid, checksum }
    }

    fn limit(&self) -> usize {
        if self.checksum {
            self.block_size - JBD_TAIL_SIZE
        } else {
            self.block_size
        }
    }

    /// 为事务开始一个新的 descriptor 块
    pub fn begin(&self, tid: Tid, blocknr: BlockNr) -> Descriptor {
        let mut data = vec![0u8; self.block_size];
        BlockHeader::new(BlockType::Descriptor, tid).encode(&mut data);
        Descriptor { blocknr, data, offset: JBD_HEADER_SIZE, last_tag: None }
    }

    fn tag_bytes(desc: &Descriptor) -> usize {
        if desc.last_tag.is_none() {
            JBD_TAG_SIZE + UUID_SIZE
        } else {
            JBD_TAG_SIZE
        }
    }

    /// 是否还能放下一个 tag
    pub fn has_room(&self, desc: &Descriptor) -> bool {
        desc.offset + Self::tag_bytes(desc) <= self.limit()
    }

    /// 追加一个 tag，放不下时返回 `false`
    pub fn add_tag(&self, desc: &mut Descriptor, blocknr: BlockNr, flags: TagFlags) -> bool {
        if !self.has_room(desc) {
            return false;
        }
        let first = desc.last_tag.is_none();
        let mut flags = flags - TagFlags::LAST_TAG;
        if !first {
            flags |= TagFlags::SAME_UUID;
        }

        let off = desc.offset;
        BlockTag { blocknr, flags }.encode(&mut desc.data[off..off + JBD_TAG_SIZE]);
        desc.last_tag = Some(off);
        desc.offset += JBD_TAG_SIZE;
        if first {
            desc.data[desc.offset..desc.offset + UUID_SIZE].copy_from_slice(&self.uuid);
            desc.offset += UUID_SIZE;
        }
        true
    }

    /// 结束 descriptor，返回待写入的日志块
    ///
    /// 块未写满时在最后一个 tag 上置 `LAST_TAG`。
    pub fn finalize(&self, desc: Descriptor) -> LogBlock {
        let mut data = desc.data;
        if let Some(off) = desc.last_tag {
            let fits_more = desc.offset + JBD_TAG_SIZE <= self.limit();
            if fits_more {
                let mut tag = BlockTag::decode(&data[off..off + JBD_TAG_SIZE]);
                tag.flags |= TagFlags::LAST_TAG;
                tag.encode(&mut data[off..off + JBD_TAG_SIZE]);
            }
        }
        if self.checksum {
            set_tail_checksum(&mut data);
        }
        LogBlock { blocknr: desc.blocknr, data }
    }

    /// 一个 descriptor 最多容纳的 tag 数
    pub fn capacity(&self) -> usize {
        let space = self.limit().saturating_sub(JBD_HEADER_SIZE);
        if space < JBD_TAG_SIZE + UUID_SIZE {
            return 0;
        }
        1 + (space - JBD_TAG_SIZE - UUID_SIZE) / JBD_TAG_SIZE
    }
}

/// 解析 descriptor 块中的 tag
///
/// 在 `LAST_TAG` 或块容量处结束。校验和不符或没有任何 tag 时报告损坏。
pub fn parse_tags(block: &[u8], checksum: bool) -> Result<Vec<BlockTag>> {
    let header = BlockHeader::decode(block);
    if !header.verify_magic() || header.block_type() != Some(BlockType::Descriptor) {
        return Err(JournalError::CorruptDescriptor.into());
    }
    if checksum && !verify_tail_checksum(block) {
        return Err(JournalError::CorruptDescriptor.into());
    }
    let limit = if checksum { block.len() - JBD_TAIL_SIZE } else { block.len() };

    let mut tags = Vec::new();
    let mut offset = JBD_HEADER_SIZE;
    while offset + JBD_TAG_SIZE <= limit {
        let tag = BlockTag::decode(&block[offset..offset + JBD_TAG_SIZE]);
        offset += JBD_TAG_SIZE;
        if !tag.flags.contains(TagFlags::SAME_UUID) {
            offset += UUID_SIZE;
            if offset > limit {
                return Err(JournalError::CorruptDescriptor.into());
            }
        }
        let last = tag.flags.contains(TagFlags::LAST_TAG);
        tags.push(tag);
        if last {
            break;
        }
    }

    if tags.is_empty() {
        return Err(JournalError::CorruptDescriptor.into());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: [u8; 16] = [7u8; 16];

    #[test]
    fn test_capacity() {
        assert_eq!(DescriptorWriter::new(48, UUID, false).capacity(), 2);
        assert_eq!(DescriptorWriter::new(48, UUID, true).capacity(), 2);
        assert_eq!(DescriptorWriter::new(1024, UUID, false).capacity(), 124);
        assert_eq!(DescriptorWriter::new(1024, UUID, true).capacity(), 124);
    }

    #[test]
    fn test_full_descriptor_has_no_last_tag() {
        let writer = DescriptorWriter::new(48, UUID, false);
        let mut desc = writer.begin(3, 100);
        assert!(writer.add_tag(&mut desc, 10, TagFlags::empty()));
        assert!(writer.add_tag(&mut desc, 11, TagFlags::ESCAPE));
        assert!(!writer.has_room(&desc));
        assert!(!writer.add_tag(&mut desc, 12, TagFlags::empty()));
        assert_eq!(desc.tag_count(), 2);

        let block = writer.finalize(desc);
        assert_eq!(block.blocknr, 100);
        assert_eq!(&block.data[20..36], &UUID);

        let tags = parse_tags(&block.data, false).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].blocknr, 10);
        assert_eq!(tags[0].flags, TagFlags::empty());
        assert_eq!(tags[1].blocknr, 11);
        assert_eq!(tags[1].flags, TagFlags::ESCAPE | TagFlags::SAME_UUID);
    }

    #[test]
    fn test_partial_descriptor_marks_last_tag() {
        let writer = DescriptorWriter::new(1024, UUID, true);
        let mut desc = writer.begin(3, 100);
        writer.add_tag(&mut desc, 10, TagFlags::empty());
        writer.add_tag(&mut desc, 11, TagFlags::empty());
        writer.add_tag(&mut desc, 12, TagFlags::empty());

        let block = writer.finalize(desc);
        let tags = parse_tags(&block.data, true).unwrap();
        assert_eq!(tags.iter().map(|t| t.blocknr).collect::<Vec<_>>(), vec![10, 11, 12]);
        assert!(tags[2].flags.contains(TagFlags::LAST_TAG));
        assert!(!tags[1].flags.contains(TagFlags::LAST_TAG));
    }

    #[test]
    fn test_corrupt_descriptor() {
        let writer = DescriptorWriter::new(1024, UUID, true);
        let mut desc = writer.begin(3, 100);
        writer.add_tag(&mut desc, 10, TagFlags::empty());
        let mut block = writer.finalize(desc);
        block.data[13] ^= 0xFF;
        assert!(parse_tags(&block.data, true).is_err());
        assert!(parse_tags(&vec![0u8; 1024], false).is_err());
    }
}
