//! 事件
//!
//! 可等待的二值信号，等待者通过 [`SchedOps`](crate::SchedOps) 阻塞。
//!
//! - 手动模式：`signal` 后保持有信号，直到显式 `unsignal`
//! - 自动模式：每次成功的 `wait` 都会消耗信号

use crate::{SpinLock, sched_ops};
use alloc::collections::VecDeque;
use core::fmt;

/// 等待截止时间（单调时钟，纳秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// 永不超时
    Infinite,
    /// 绝对时间点
    At(u64),
}

impl Deadline {
    /// 从当前时间起 `ns` 纳秒后
    pub fn after(ns: u64) -> Self {
        Deadline::At(sched_ops().now_ns().saturating_add(ns))
    }

    /// 立即超时
    pub fn now() -> Self {
        Deadline::At(sched_ops().now_ns())
    }

    fn as_ns(self) -> Option<u64> {
        match self {
            Deadline::Infinite => None,
            Deadline::At(ns) => Some(ns),
        }
    }

    fn expired(self) -> bool {
        match self {
            Deadline::Infinite => false,
            Deadline::At(ns) => sched_ops().now_ns() >= ns,
        }
    }
}

/// 等待错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// 截止时间已到仍未等到信号
    TimedOut,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "wait timed out"),
        }
    }
}

struct EventInner {
    signaled: bool,
    waiters: VecDeque<usize>,
}

/// 事件
pub struct Event {
    inner: SpinLock<EventInner>,
    auto_unsignal: bool,
}

impl Event {
    /// 创建手动复位的事件
    pub fn new(signaled: bool) -> Self {
        Self::with_mode(signaled, false)
    }

    /// 创建自动复位的事件：每次 `wait` 成功消耗一次信号
    pub fn new_auto(signaled: bool) -> Self {
        Self::with_mode(signaled, true)
    }

    fn with_mode(signaled: bool, auto_unsignal: bool) -> Self {
        Event {
            inner: SpinLock::new(EventInner {
                signaled,
                waiters: VecDeque::new(),
            }),
            auto_unsignal,
        }
    }

    /// 置位并唤醒所有等待者
    pub fn signal(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.signaled = true;
            core::mem::take(&mut inner.waiters)
        };
        for thread in waiters {
            sched_ops().wake(thread);
        }
    }

    /// 复位
    pub fn unsignal(&self) {
        self.inner.lock().signaled = false;
    }

    /// 当前是否有信号
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().signaled
    }

    /// 不阻塞地尝试获取信号
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.signaled {
            if self.auto_unsignal {
                inner.signaled = false;
            }
            true
        } else {
            false
        }
    }

    /// 等待信号，直到截止时间
    pub fn wait(&self, deadline: Deadline) -> Result<(), WaitError> {
        let me = sched_ops().current_thread();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.signaled {
                    if self.auto_unsignal {
                        inner.signaled = false;
                    }
                    inner.waiters.retain(|&t| t != me);
                    return Ok(());
                }
                if deadline.expired() {
                    inner.waiters.retain(|&t| t != me);
                    return Err(WaitError::TimedOut);
                }
                if !inner.waiters.contains(&me) {
                    inner.waiters.push_back(me);
                }
            }
            sched_ops().block_current(deadline.as_ns());
        }
    }

    /// 无限期等待信号
    pub fn wait_forever(&self) {
        // Infinite 不会超时
        while self.wait(Deadline::Infinite).is_err() {}
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &self.is_signaled())
            .field("auto_unsignal", &self.auto_unsignal)
            .finish()
    }
}
