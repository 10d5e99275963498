//! CRC32 校验和计算
//!
//! 为日志块（descriptor/revoke 尾部、commit 记录）提供 CRC32 计算

use crc32fast::Hasher;

/// 事务校验和的初始值
pub const JBD_CRC32_INIT: u32 = 0;

/// 计算 CRC32 校验和（一次性计算）
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 计算 CRC32 校验和（追加模式）
///
/// 以 `crc` 为前一段数据的结果继续计算，
/// `crc32_append(crc32(a), b) == crc32(a ++ b)`。
#[inline]
pub fn crc32_append(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}
