//! 错误类型定义
//!
//! 提供日志提交引擎的错误类型。

use core::fmt;

/// 日志操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 日志空间耗尽
    LogFull,
    /// 日志已中止（不可恢复，只能卸载）
    Aborted,
    /// 日志内容损坏
    Corrupted,
    /// 无效参数
    InvalidInput,
    /// 无效状态
    InvalidState,
    /// credit 或空间不足
    NoSpace,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否为日志中止错误
    pub const fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

// Journal error conversion
impl From<crate::journal::JournalError> for Error {
    fn from(err: crate::journal::JournalError) -> Self {
        use crate::journal::JournalError;
        match err {
            JournalError::IoError => Error::new(ErrorKind::Io, "Journal I/O error"),
            JournalError::LogFull => Error::new(ErrorKind::LogFull, "Journal log is full"),
            JournalError::JournalAborted => Error::new(ErrorKind::Aborted, "Journal has been aborted"),
            JournalError::CorruptDescriptor => {
                Error::new(ErrorKind::Corrupted, "Corrupt journal descriptor block")
            }
            JournalError::InvalidSuperblock => Error::new(ErrorKind::Corrupted, "Invalid journal superblock"),
            JournalError::TooManyCredits => {
                Error::new(ErrorKind::NoSpace, "Handle requests more credits than a transaction may hold")
            }
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
