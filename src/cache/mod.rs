//! Journal head 缓存模块
//!
//! # 主要组件
//!
//! - [`HeadCache`] - 块号到 [`JournalHead`](crate::journal::JournalHead) 的 LRU 缓存
//! - [`CacheStats`] - 缓存统计信息
//!
//! # 设计原理
//!
//! 使用 `lru::LruCache` 管理访问顺序；head 的生命周期由 `Arc` 管理，
//! 事务队列和检查点队列持有引用期间 head 不会被淘汰。

mod head_cache;

pub use head_cache::{CacheStats, HeadCache, DEFAULT_HEAD_CACHE_SIZE};
