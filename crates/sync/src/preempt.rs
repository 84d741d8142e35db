//! 抢占保护
//!
//! 自旋锁临界区和 PMM 的短操作需要在禁用抢占的情况下执行，
//! 以免持锁线程被调度出去而让其它 CPU 长时间自旋。

use crate::arch_ops;

/// 禁用当前 CPU 的抢占（可嵌套）
#[inline]
pub fn preempt_disable() {
    arch_ops().preempt_disable();
}

/// 恢复当前 CPU 的抢占
#[inline]
pub fn preempt_enable() {
    arch_ops().preempt_enable();
}

/// 抢占保护器：创建时禁用抢占，销毁时恢复。
///
/// # 示例
/// ```ignore
/// {
///     let _preempt = PreemptGuard::new();
///     // 不会被抢占的代码
/// }
/// ```
pub struct PreemptGuard {
    _private: (),
}

impl PreemptGuard {
    /// 禁用抢占并返回保护器
    pub fn new() -> Self {
        preempt_disable();
        PreemptGuard { _private: () }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}
