//! 延迟分配与低内存信号
//!
//! 空闲锁下维护一个三态状态机：
//!
//! ```text
//!   OnceLevelTripped --(空闲页低于水位 / delay_pages == MAX)--> UntilReset
//!   UntilReset --(重新设置内存信号)--> OnceLevelTripped
//!   任意状态 --(stop_returning_should_wait)--> Never
//! ```
//!
//! `UntilReset` 期间所有可等待的分配都返回 `ShouldWait`，
//! 并且 `free_pages_event` 处于复位状态。

use super::PmmNode;
use super::locks::FreeState;
use crate::delay::AllocDelayPolicy;
use crate::PmmResult;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;
use sync::{Deadline, Event};

/// 延迟分配状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShouldWaitState {
    /// 永不延迟
    Never,
    /// 等待空闲页跌破水位
    OnceLevelTripped,
    /// 已跌破水位，直到重新设置内存信号前一直延迟
    UntilReset,
}

/// 分配失败的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocFailureKind {
    /// 没有发生过失败
    #[default]
    None,
    /// 物理页分配器
    Pmm,
    /// 内核堆
    Heap,
    /// 句柄表
    Handle,
    /// 其它
    Other,
}

impl AllocFailureKind {
    /// 名称
    pub fn as_str(self) -> &'static str {
        match self {
            AllocFailureKind::None => "None",
            AllocFailureKind::Pmm => "PMM",
            AllocFailureKind::Heap => "Heap",
            AllocFailureKind::Handle => "Handle",
            AllocFailureKind::Other => "Other",
        }
    }
}

/// 第一次分配失败的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFailure {
    /// 来源
    pub kind: AllocFailureKind,
    /// 请求的大小（页数或字节，取决于来源）
    pub size: u64,
    /// 失败时的空闲页数，由记录方填写
    pub free_count: u64,
}

impl AllocFailure {
    /// 空记录
    pub const NONE: AllocFailure = AllocFailure {
        kind: AllocFailureKind::None,
        size: 0,
        free_count: 0,
    };

    /// 创建一条失败记录
    pub const fn new(kind: AllocFailureKind, size: u64) -> Self {
        AllocFailure {
            kind,
            size,
            free_count: 0,
        }
    }
}

impl fmt::Display for AllocFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocation of size {} failed with {} free pages",
            self.kind.as_str(),
            self.size,
            self.free_count
        )
    }
}

impl PmmNode {
    // ========================================================================
    // 空闲计数（空闲锁内调用）
    // ========================================================================

    pub(super) fn increment_free_count_locked(&self, free: &mut FreeState, amount: u64) {
        let count = self.free_count.fetch_add(amount, Ordering::Relaxed) + amount;
        if free.mem_signal.is_some() && count > free.mem_signal_upper_bound {
            Self::signal_free_memory_change_locked(free);
        }
    }

    pub(super) fn decrement_free_count_locked(&self, free: &mut FreeState, amount: u64) {
        let prev = self.free_count.fetch_sub(amount, Ordering::Relaxed);
        assert!(prev >= amount, "free count underflow: {} - {}", prev, amount);
        let count = prev - amount;
        if free.should_wait == ShouldWaitState::OnceLevelTripped
            && count < free.should_wait_free_pages_level
        {
            self.trip_free_pages_level_locked(free);
        }
        if free.mem_signal.is_some() && count < free.mem_signal_lower_bound {
            Self::signal_free_memory_change_locked(free);
        }
    }

    fn signal_free_memory_change_locked(free: &mut FreeState) {
        if let Some(event) = free.mem_signal.take() {
            event.signal();
        }
    }

    fn trip_free_pages_level_locked(&self, free: &mut FreeState) {
        if free.should_wait == ShouldWaitState::OnceLevelTripped {
            free.should_wait = ShouldWaitState::UntilReset;
            self.free_pages_event.unsignal();
        }
    }

    pub(super) fn should_delay_allocation_locked(free: &mut FreeState) -> bool {
        match free.should_wait {
            ShouldWaitState::UntilReset => true,
            ShouldWaitState::Never => false,
            ShouldWaitState::OnceLevelTripped => free.delay_policy.should_delay(),
        }
    }

    // ========================================================================
    // 低内存信号
    // ========================================================================

    /// 设置一次性内存信号。
    ///
    /// 当空闲页数离开 `[lower, upper]` 时 `event` 被触发，随后信号被清除，
    /// 需要重新设置。空闲页数低于 `delay_pages` 后可等待的分配开始返回 `ShouldWait`；
    /// `delay_pages == u64::MAX` 表示立即开始延迟。
    ///
    /// 当前空闲页数已经不在区间内时返回 `false`，不做任何修改。
    pub fn set_free_memory_signal(&self, lower: u64, upper: u64, delay_pages: u64, event: Arc<Event>) -> bool {
        let mut free = self.locks.free();
        debug_assert!(delay_pages <= lower || delay_pages == u64::MAX);
        let free_count = self.count_free_pages();
        if free_count < lower || free_count > upper {
            return false;
        }
        if delay_pages == u64::MAX {
            self.trip_free_pages_level_locked(&mut free);
        } else if free.should_wait == ShouldWaitState::UntilReset {
            self.free_pages_event.signal();
            free.should_wait = ShouldWaitState::OnceLevelTripped;
        }
        free.should_wait_free_pages_level = delay_pages;
        free.mem_signal_lower_bound = lower;
        free.mem_signal_upper_bound = upper;
        free.mem_signal = Some(event);
        true
    }

    /// 等待直到可以重试单页分配，或到达截止时间
    pub fn wait_till_should_retry_single_alloc(&self, deadline: Deadline) -> PmmResult<()> {
        if self.free_pages_event.is_signaled() {
            return Ok(());
        }
        log::debug!("PMM: waiting for free pages, free count {}", self.count_free_pages());
        self.free_pages_event.wait(deadline)?;
        Ok(())
    }

    /// 此后不再返回 `ShouldWait`，并唤醒所有等待者
    pub fn stop_returning_should_wait(&self) {
        let mut free = self.locks.free();
        free.should_wait = ShouldWaitState::Never;
        self.free_pages_event.signal();
    }

    /// 替换延迟分配策略
    pub fn set_alloc_delay_policy(&self, policy: Box<dyn AllocDelayPolicy>) {
        self.locks.free().delay_policy = policy;
    }

    /// 重新设置当前延迟策略的随机种子。
    ///
    /// 策略本身保持不变；[`NeverDelay`](crate::NeverDelay) 忽略种子。
    pub fn seed_random_should_wait(&self, seed: u64) {
        self.locks.free().delay_policy.reseed(seed);
    }

    // ========================================================================
    // OOM 记录
    // ========================================================================

    pub(super) fn report_alloc_failure_locked(&self, free: &mut FreeState, failure: AllocFailure) {
        self.alloc_failed_count.fetch_add(1, Ordering::Relaxed);
        // 只在第一次失败时记录并通知
        let first_time = !self.alloc_failed_no_mem.swap(true, Ordering::Relaxed);
        if first_time {
            free.first_alloc_failure = AllocFailure {
                free_count: self.count_free_pages(),
                ..failure
            };
            log::warn!("PMM: first allocation failure: {}", free.first_alloc_failure);
            Self::signal_free_memory_change_locked(free);
        }
    }

    /// 记录一次来自其它分配器的失败
    pub fn report_alloc_failure(&self, failure: AllocFailure) {
        let mut free = self.locks.free();
        self.report_alloc_failure_locked(&mut free, failure);
    }

    /// 第一次分配失败的记录
    pub fn first_alloc_failure(&self) -> AllocFailure {
        self.locks.free().first_alloc_failure
    }

    /// 是否发生过 `NoMemory`
    pub fn has_alloc_failed_no_mem(&self) -> bool {
        self.alloc_failed_no_mem.load(Ordering::Relaxed)
    }

    /// 复位 OOM 锁存，下一次失败会重新记录并通知
    pub fn reset_alloc_failed_no_mem(&self) {
        let mut free = self.locks.free();
        self.alloc_failed_no_mem.store(false, Ordering::Relaxed);
        free.first_alloc_failure = AllocFailure::NONE;
    }
}
