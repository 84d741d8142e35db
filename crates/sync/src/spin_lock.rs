//! 自旋锁封装
//!
//! 提供对数据的互斥访问的自旋锁类型，由 `lock_api` 在原始锁之上生成。
//!
//! # 示例
//! ```ignore
//! let lock = SpinLock::new(0);
//! {
//!     let mut guard = lock.lock(); // 获取锁
//!     *guard += 1; // 访问和修改数据
//! } // 离开作用域，自动释放锁
//! ```
//!
//! # 注意
//! 自旋锁不可重入。当持有锁时，尝试再次获取锁将导致死锁。
//! 持锁期间禁用抢占（[`IrqSpinLock`] 还会禁用中断），
//! 因此在持有锁时不能睡眠，也应避免长时间运行的操作。

use crate::raw_spin_lock::{RawIrqSpinLock, RawSpinLock};

/// 禁用抢占的自旋锁
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// [`SpinLock`] 的 RAII 保护器
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// 禁用中断的自旋锁
pub type IrqSpinLock<T> = lock_api::Mutex<RawIrqSpinLock, T>;

/// [`IrqSpinLock`] 的 RAII 保护器
pub type IrqSpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawIrqSpinLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_support::mock::arch::MOCK_ARCH_OPS;

    #[test]
    fn test_spin_lock_basic() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spin_lock_disables_preemption() {
        let lock = SpinLock::new(());
        let base = MOCK_ARCH_OPS.preempt_count();
        {
            let _guard = lock.lock();
            assert_eq!(MOCK_ARCH_OPS.preempt_count(), base + 1);
        }
        assert_eq!(MOCK_ARCH_OPS.preempt_count(), base);
    }

    #[test]
    fn test_irq_spin_lock_restores_interrupts() {
        let lock = IrqSpinLock::new(5);
        assert!(MOCK_ARCH_OPS.interrupts_enabled());
        {
            let guard = lock.lock();
            assert_eq!(*guard, 5);
            assert!(!MOCK_ARCH_OPS.interrupts_enabled());
        }
        assert!(MOCK_ARCH_OPS.interrupts_enabled());
    }

    #[test]
    fn test_spin_lock_contended_counter() {
        let lock = Arc::new(SpinLock::new(0usize));
        let handles: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
