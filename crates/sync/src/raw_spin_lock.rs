//! 原始自旋锁实现
//!
//! 基于原子操作实现自旋锁机制，并实现 [`lock_api::RawMutex`]，
//! 由 `lock_api` 负责生成带数据的锁类型与 RAII 保护器。
//!
//! - [`RawSpinLock`]：持锁期间禁用抢占
//! - [`RawIrqSpinLock`]：持锁期间同时禁用本地中断

use crate::intr_guard::IntrGuard;
use crate::preempt::{preempt_disable, preempt_enable};
use core::{
    hint,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// 自旋锁，持锁期间禁用抢占。
///
/// 不可重入 (即不能嵌套调用 `lock()`)。
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_acquire(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// 检查锁是否被占用 (仅用于调试/测试)
    pub fn is_held(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: 锁标志通过 Acquire/Release 原子操作维护，保证互斥
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    // 持锁期间禁用了抢占，保护器不能跨线程移动
    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        preempt_disable();
        self.acquire();
    }

    fn try_lock(&self) -> bool {
        preempt_disable();
        if self.try_acquire() {
            true
        } else {
            preempt_enable();
            false
        }
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
        preempt_enable();
    }

    fn is_locked(&self) -> bool {
        self.is_held()
    }
}

/// 自旋锁，持锁期间同时禁用本地中断。
///
/// 进入临界区前的中断状态保存在锁内部，只有持锁者会读写该字段。
#[derive(Debug)]
pub struct RawIrqSpinLock {
    inner: RawSpinLock,
    saved_flags: AtomicUsize,
}

impl RawIrqSpinLock {
    /// 创建一个新的 RawIrqSpinLock 实例。
    pub const fn new() -> Self {
        RawIrqSpinLock {
            inner: RawSpinLock::new(),
            saved_flags: AtomicUsize::new(0),
        }
    }
}

impl Default for RawIrqSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: 互斥由内部 RawSpinLock 保证；saved_flags 仅由持锁者访问
unsafe impl lock_api::RawMutex for RawIrqSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawIrqSpinLock::new();

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        let guard = IntrGuard::new();
        lock_api::RawMutex::lock(&self.inner);
        self.saved_flags
            .store(guard.into_flags(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let guard = IntrGuard::new();
        if lock_api::RawMutex::try_lock(&self.inner) {
            self.saved_flags
                .store(guard.into_flags(), Ordering::Relaxed);
            true
        } else {
            // guard 在此处 drop，恢复中断状态
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_flags.load(Ordering::Relaxed);
        // SAFETY: 调用者持有锁
        unsafe {
            lock_api::RawMutex::unlock(&self.inner);
            IntrGuard::restore(flags);
        }
    }

    fn is_locked(&self) -> bool {
        self.inner.is_held()
    }
}
