//! 块 I/O 抽象
//!
//! - [`BlockIo`]：日志引擎使用的异步块 I/O 接口
//! - [`MemDevice`]：内存设备，支持写入挂起、故障注入与 I/O 事件记录，
//!   用于测试以及在不接真实设备时验证提交顺序

mod device;
mod mem;

pub use device::{BlockIo, BlockNr, IoMode, PendingIo};
pub use mem::{IoEvent, IoEventKind, MemDevice};
