//! Journal head 缓存（使用 lru crate）
//!
//! 保证同一块号同一时刻只有一个 [`JournalHead`]。淘汰只发生在空闲的 head 上：
//! 不属于任何事务、不在检查点上、没有待写内容、缓存之外没有其他引用。

use crate::block::BlockNr;
use crate::journal::JournalHead;
use core::num::NonZeroUsize;
use lru::LruCache;
use std::sync::Arc;

/// 默认缓存块数量
pub const DEFAULT_HEAD_CACHE_SIZE: usize = 256;

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// 总访问次数
    pub total_accesses: u64,
    /// 缓存命中次数
    pub hits: u64,
    /// 缓存未命中次数
    pub misses: u64,
    /// 淘汰次数
    pub evictions: u64,
    /// 因无可淘汰 head 而扩容的次数
    pub grown: u64,
}

impl CacheStats {
    /// 计算命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_accesses as f64
        }
    }
}

/// Journal head 缓存
pub struct HeadCache {
    /// LRU缓存核心：块号 → head
    cache: LruCache<BlockNr, Arc<JournalHead>>,
    /// 统计信息
    stats: CacheStats,
}

impl HeadCache {
    /// 创建缓存，容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { cache: LruCache::new(capacity), stats: CacheStats::default() }
    }

    /// 查找 head，命中时移到最近使用端
    pub fn get(&mut self, blocknr: BlockNr) -> Option<Arc<JournalHead>> {
        self.stats.total_accesses += 1;
        match self.cache.get(&blocknr) {
            Some(head) => {
                self.stats.hits += 1;
                log::trace!("[CACHE] head block={} HIT", blocknr);
                Some(head.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// 插入新 head
    ///
    /// 满时淘汰最久未用的空闲 head；全部忙碌时扩容。
    pub fn insert(&mut self, head: Arc<JournalHead>) {
        if self.cache.len() >= self.cache.cap().get() && !self.evict_idle() {
            let grown = self.cache.cap().get() * 2;
            log::warn!(
                "[CACHE] all {} heads busy, growing head cache to {}",
                self.cache.len(),
                grown
            );
            if let Some(cap) = NonZeroUsize::new(grown) {
                self.cache.resize(cap);
            }
            self.stats.grown += 1;
        }
        log::debug!("[CACHE] head block={} inserted, cache={}/{}", head.blocknr(), self.cache.len() + 1, self.cache.cap());
        self.cache.put(head.blocknr(), head);
    }

    /// 淘汰一个空闲 head，没有可淘汰的返回 `false`
    fn evict_idle(&mut self) -> bool {
        // iter() 按 MRU 到 LRU 顺序遍历
        let victim = self
            .cache
            .iter()
            .rev()
            .find(|(_, head)| Arc::strong_count(head) == 1 && head.is_idle())
            .map(|(blocknr, _)| *blocknr);

        match victim {
            Some(blocknr) => {
                self.cache.pop(&blocknr);
                self.stats.evictions += 1;
                log::debug!("[CACHE] evicted idle head block={}", blocknr);
                true
            }
            None => false,
        }
    }

    /// 是否缓存了该块
    pub fn contains(&self, blocknr: BlockNr) -> bool {
        self.cache.contains(&blocknr)
    }

    /// 当前 head 数
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// 当前容量
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// 统计信息
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
