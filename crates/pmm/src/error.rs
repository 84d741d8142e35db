//! PMM 错误类型
//!
//! 可通过 [`PmmError::to_status()`] 转换为内核状态码（负数，与 `ZX_ERR_*` 取值一致）。

use core::fmt;
use sync::WaitError;

/// PMM 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// 空闲链表耗尽，且调用者不允许等待
    NoMemory,
    /// 调用者应当挂起并稍后重试
    ShouldWait,
    /// 出借页池耗尽（不属于 OOM）
    NoResources,
    /// 连续/指定范围分配无法满足
    NotFound,
    /// 索引越界
    OutOfRange,
    /// 输出缓冲区过小
    BufferTooSmall,
    /// 对象已存在
    AlreadyExists,
    /// 操作不支持
    NotSupported,
    /// 等待超时
    TimedOut,
    /// 无效参数
    InvalidArgs,
}

/// PMM 操作的结果类型
pub type PmmResult<T> = Result<T, PmmError>;

impl PmmError {
    /// 转换为内核状态码（负数）
    pub fn to_status(&self) -> i32 {
        match self {
            PmmError::NotSupported => -2,
            PmmError::NoResources => -3,
            PmmError::NoMemory => -4,
            PmmError::InvalidArgs => -10,
            PmmError::OutOfRange => -14,
            PmmError::BufferTooSmall => -15,
            PmmError::TimedOut => -21,
            PmmError::ShouldWait => -22,
            PmmError::NotFound => -25,
            PmmError::AlreadyExists => -26,
        }
    }

    /// 错误的简短描述
    pub fn as_str(&self) -> &'static str {
        match self {
            PmmError::NoMemory => "out of memory",
            PmmError::ShouldWait => "allocation should wait",
            PmmError::NoResources => "no loaned pages available",
            PmmError::NotFound => "no suitable pages found",
            PmmError::OutOfRange => "index out of range",
            PmmError::BufferTooSmall => "buffer too small",
            PmmError::AlreadyExists => "already exists",
            PmmError::NotSupported => "not supported",
            PmmError::TimedOut => "timed out",
            PmmError::InvalidArgs => "invalid arguments",
        }
    }
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WaitError> for PmmError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut => PmmError::TimedOut,
        }
    }
}
