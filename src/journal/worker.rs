//! 提交线程
//!
//! [`CommitWorker`] 在独立线程上执行提交：收到提交请求，或运行中的事务
//! 超过 `commit_interval` 时提交它。文件系统线程只需 `request_commit` /
//! `wait_for_commit`。

use super::jbd_journal::{Journal, JournalStatus};
use crate::error::{Error, ErrorKind, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 提交线程名
const COMMIT_THREAD_NAME: &str = "jbd-commit";

/// 提交线程
///
/// 丢弃时停止线程并等待其退出。
#[derive(Debug)]
pub struct CommitWorker {
    journal: Arc<Journal>,
    thread: Option<JoinHandle<()>>,
}

impl CommitWorker {
    /// 启动提交线程
    ///
    /// 一个 journal 同时只能有一个提交线程。
    pub fn spawn(journal: Arc<Journal>) -> Result<Self> {
        {
            let mut st = journal.lock_state();
            if st.status.contains(JournalStatus::WORKER) {
                return Err(Error::new(ErrorKind::InvalidState, "commit worker already running"));
            }
            if st.status.contains(JournalStatus::UNMOUNT) {
                return Err(Error::new(ErrorKind::InvalidState, "journal is shutting down"));
            }
            st.status.insert(JournalStatus::WORKER);
        }

        let worker_journal = journal.clone();
        let thread = thread::Builder::new()
            .name(COMMIT_THREAD_NAME.into())
            .spawn(move || run(&worker_journal))
            .map_err(|_| {
                journal.lock_state().status.remove(JournalStatus::WORKER);
                Error::new(ErrorKind::Io, "failed to spawn commit thread")
            })?;

        log::debug!("[JBD] commit worker started");
        Ok(Self { journal, thread: Some(thread) })
    }

    /// 是否仍在运行
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// 停止线程并等待退出
    ///
    /// 运行中的事务不会被提交，由调用者决定是否 `commit_transaction`。
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else { return };
        self.journal.lock_state().status.remove(JournalStatus::WORKER);
        self.journal.state_cond.notify_all();
        if thread.join().is_err() {
            log::error!("[JBD] commit worker panicked");
        }
        log::debug!("[JBD] commit worker stopped");
    }
}

impl Drop for CommitWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(journal: &Journal) {
    let interval = journal.config().commit_interval;
    while journal.wait_commit_request(interval) {
        match journal.commit_transaction() {
            Ok(Some(tid)) => log::trace!("[JBD] worker committed {}", tid),
            Ok(None) => {}
            Err(e) => {
                log::error!("[JBD] worker commit failed: {}", e);
                if journal.is_aborted() {
                    // 中止后只能卸载，不再有可提交的事务
                    wait_for_stop(journal);
                    return;
                }
            }
        }
    }
}

fn wait_for_stop(journal: &Journal) {
    let mut st = journal.lock_state();
    while st.status.contains(JournalStatus::WORKER) {
        st = crate::sync::wait(&journal.state_cond, st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::journal::JournalConfig;
    use std::time::Duration;

    fn journal(interval: Duration) -> Arc<Journal> {
        let dev = Arc::new(MemDevice::new(256, 512));
        let config = JournalConfig { journal_len: 64, commit_interval: interval, ..JournalConfig::default() };
        Journal::create(dev, config).unwrap()
    }

    #[test]
    fn test_worker_commits_on_request() {
        let journal = journal(Duration::from_secs(60));
        let mut worker = CommitWorker::spawn(journal.clone()).unwrap();
        assert!(CommitWorker::spawn(journal.clone()).is_err());

        let head = journal.get_block(100).unwrap();
        let mut handle = journal.start(1).unwrap();
        handle.modify_metadata(&head, |d| d[0] = 1).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();

        journal.wait_for_commit(tid).unwrap();
        assert_eq!(journal.commit_sequence(), tid);
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_commits_expired_transaction() {
        let journal = journal(Duration::from_millis(20));
        let _worker = CommitWorker::spawn(journal.clone()).unwrap();

        let handle = journal.start(1).unwrap();
        let tid = handle.tid();
        handle.stop().unwrap();

        let mut waited = Duration::ZERO;
        while journal.commit_sequence() != tid && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(journal.commit_sequence(), tid);
    }

    #[test]
    fn test_sync_handle_with_worker() {
        let journal = journal(Duration::from_secs(60));
        let _worker = CommitWorker::spawn(journal.clone()).unwrap();

        let mut handle = journal.start(1).unwrap();
        handle.set_sync(true);
        let tid = handle.tid();
        handle.stop().unwrap();
        assert_eq!(journal.commit_sequence(), tid);
    }
}
