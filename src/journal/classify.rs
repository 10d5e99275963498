//! 块分类（BufferClassifier）
//!
//! 把 journal head 放入、移出、转交事务队列。
//!
//! 所有函数都要求调用者已持有块锁，并把 guard 内的状态传入；
//! 函数内部只会短暂获取一个事务的队列锁。
//!
//! | 操作            | 结果                                                  |
//! |-----------------|-------------------------------------------------------|
//! | [`file`]        | 放入事务队列，同一队列重复放入无副作用                  |
//! | [`unfile`]      | 移出队列并解除所属事务，`JBD_DIRTY` 转为 `DIRTY`        |
//! | [`refile`]      | 有下一个事务时转交给它，否则等同 `unfile`               |

use super::jbd_buf::{BufferFlags, BufferList, HeadState, JournalHead, TxRef};
use super::jbd_trans::{Tid, Transaction};
use std::sync::Arc;

/// 把块放入事务的指定队列
///
/// 已在同一事务同一队列时直接返回。
pub(crate) fn file_buffer(head: &Arc<JournalHead>, st: &mut HeadState, tx: &Arc<Transaction>, list: BufferList) {
    if st.is_on(tx, list) {
        return;
    }

    let was_dirty = matches!(
        list,
        BufferList::Metadata | BufferList::Reserved | BufferList::Shadow | BufferList::Forget
    ) && st.flags.intersects(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY);
    if was_dirty {
        st.flags.remove(BufferFlags::DIRTY | BufferFlags::JBD_DIRTY);
    }

    if st.transaction.is_some() {
        temp_unlink_buffer(head, st);
    }

    st.transaction = Some(TxRef::new(tx));
    tx.lists().insert(list, head.clone());
    st.jlist = list;

    if was_dirty {
        st.flags.insert(BufferFlags::JBD_DIRTY);
    }
    log::trace!("[JBD] file block={} tid={} list={:?}", head.blocknr(), tx.tid(), list);
}

/// 从当前队列摘下，保留所属事务
pub(crate) fn temp_unlink_buffer(head: &JournalHead, st: &mut HeadState) {
    if let Some(tx) = st.transaction.as_ref().and_then(TxRef::upgrade) {
        tx.lists().remove(st.jlist, head);
    }
    st.jlist = BufferList::None;
    if st.flags.contains(BufferFlags::JBD_DIRTY) {
        st.flags.remove(BufferFlags::JBD_DIRTY);
        st.flags.insert(BufferFlags::DIRTY);
    }
}

/// 移出队列并解除所属事务
pub(crate) fn unfile_buffer(head: &JournalHead, st: &mut HeadState) {
    temp_unlink_buffer(head, st);
    st.transaction = None;
    log::trace!("[JBD] unfile block={}", head.blocknr());
}

/// 块到下一个事务的转交
///
/// 由 [`refile_buffer`] 产生，调用者在同一块锁下 [`apply`](Handoff::apply)。
#[must_use = "a hand-off must be applied or the block is left unowned"]
#[derive(Debug)]
pub(crate) struct Handoff {
    head: Arc<JournalHead>,
    to: Arc<Transaction>,
    list: BufferList,
    was_dirty: bool,
}

impl Handoff {
    /// 放入接手事务的队列
    pub(crate) fn apply(self, st: &mut HeadState) {
        file_buffer(&self.head, st, &self.to, self.list);
        if self.was_dirty {
            st.flags.insert(BufferFlags::JBD_DIRTY);
        }
    }

    pub(crate) fn target(&self) -> Tid {
        self.to.tid()
    }
}

/// 当前事务处理完该块后调用
///
/// 有下一个事务时返回转交，否则解除所属事务并返回 `None`。
/// 数据块转交后进入 `SyncData`；元数据块在下一个事务已修改时进入 `Metadata`，
/// 否则进入 `Reserved`。
pub(crate) fn refile_buffer(head: &Arc<JournalHead>, st: &mut HeadState) -> Option<Handoff> {
    let next = st.next_transaction.take().and_then(|t| t.upgrade());
    let next = match next {
        Some(next) => next,
        None => {
            unfile_buffer(head, st);
            return None;
        }
    };

    let was_data = matches!(st.jlist, BufferList::SyncData | BufferList::Locked);
    let was_dirty = st.flags.contains(BufferFlags::JBD_DIRTY);
    st.flags.remove(BufferFlags::JBD_DIRTY);
    temp_unlink_buffer(head, st);
    st.transaction = None;

    let list = if was_data {
        BufferList::SyncData
    } else if st.flags.contains(BufferFlags::MODIFIED) {
        BufferList::Metadata
    } else {
        BufferList::Reserved
    };
    Some(Handoff { head: head.clone(), to: next, list, was_dirty })
}

/// 把块放入事务队列（对外接口）
///
/// 在同一事务同一队列上重复调用只保留一个条目。
pub fn file(head: &Arc<JournalHead>, tx: &Arc<Transaction>, list: BufferList) {
    let mut st = head.lock();
    if list == BufferList::None {
        unfile_buffer(head, &mut st);
    } else {
        file_buffer(head, &mut st, tx, list);
    }
}

/// 移出事务队列（对外接口）
pub fn unfile(head: &Arc<JournalHead>) {
    let mut st = head.lock();
    unfile_buffer(head, &mut st);
}

/// 当前事务处理完成后转交或释放（对外接口）
///
/// 返回接手事务号。
pub fn refile(head: &Arc<JournalHead>) -> Option<Tid> {
    let mut st = head.lock();
    let handoff = refile_buffer(head, &mut st)?;
    let tid = handoff.target();
    handoff.apply(&mut st);
    Some(tid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<JournalHead>, Arc<Transaction>) {
        (Arc::new(JournalHead::new(42, vec![0u8; 64])), Arc::new(Transaction::new(1)))
    }

    #[test]
    fn test_file_is_idempotent() {
        let (head, tx) = setup();
        file(&head, &tx, BufferList::Metadata);
        file(&head, &tx, BufferList::Metadata);
        assert_eq!(tx.queue_len(BufferList::Metadata), 1);
        assert_eq!(head.list(), BufferList::Metadata);
        assert_eq!(head.transaction_id(), Some(1));
    }

    #[test]
    fn test_move_between_lists() {
        let (head, tx) = setup();
        file(&head, &tx, BufferList::Reserved);
        file(&head, &tx, BufferList::Metadata);
        assert_eq!(tx.queue_len(BufferList::Reserved), 0);
        assert_eq!(tx.queue_len(BufferList::Metadata), 1);
    }

    #[test]
    fn test_dirty_carried_as_jbd_dirty() {
        let (head, tx) = setup();
        head.lock().flags.insert(BufferFlags::DIRTY);
        file(&head, &tx, BufferList::Metadata);
        assert_eq!(head.flags(), BufferFlags::JBD_DIRTY);

        unfile(&head);
        assert_eq!(head.flags(), BufferFlags::DIRTY);
        assert_eq!(head.transaction_id(), None);
        assert_eq!(tx.queue_len(BufferList::Metadata), 0);
    }

    #[test]
    fn test_refile_without_next_unfiles() {
        let (head, tx) = setup();
        file(&head, &tx, BufferList::Forget);
        assert_eq!(refile(&head), None);
        assert_eq!(head.list(), BufferList::None);
        assert_eq!(tx.queue_len(BufferList::Forget), 0);
    }

    #[test]
    fn test_refile_hands_off_to_next() {
        let (head, tx) = setup();
        let next = Arc::new(Transaction::new(2));
        file(&head, &tx, BufferList::Forget);
        {
            let mut st = head.lock();
            st.flags.insert(BufferFlags::JBD_DIRTY | BufferFlags::MODIFIED);
            st.next_transaction = Some(TxRef::new(&next));
        }

        assert_eq!(refile(&head), Some(2));
        assert_eq!(head.transaction_id(), Some(2));
        assert_eq!(head.next_transaction_id(), None);
        assert_eq!(head.list(), BufferList::Metadata);
        assert!(head.flags().contains(BufferFlags::JBD_DIRTY));
        assert_eq!(tx.queue_len(BufferList::Forget), 0);
        assert_eq!(next.queue_len(BufferList::Metadata), 1);
    }

    #[test]
    fn test_refile_data_goes_to_sync_data() {
        let (head, tx) = setup();
        let next = Arc::new(Transaction::new(2));
        file(&head, &tx, BufferList::Locked);
        head.lock().next_transaction = Some(TxRef::new(&next));

        assert_eq!(refile(&head), Some(2));
        assert_eq!(head.list(), BufferList::SyncData);
        assert_eq!(next.queue_len(BufferList::SyncData), 1);
    }
}
