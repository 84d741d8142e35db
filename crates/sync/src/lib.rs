//! 同步原语
//!
//! 向其它内核模块提供基本的锁和同步原语，
//! 包括自旋锁、中断保护、抢占保护、事件、有界通道以及内核线程。
//!
//! # 架构依赖
//!
//! 此 crate 通过两个 trait 抽象架构/调度相关操作：
//!
//! - [`ArchOps`]：中断控制、抢占控制、CPU 信息
//! - [`SchedOps`]：线程阻塞/唤醒、单调时钟、内核线程创建与回收
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_sched_ops`] 注册实现。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod channel;
mod event;
mod intr_guard;
mod preempt;
mod raw_spin_lock;
mod spin_lock;
mod thread;

pub use channel::{Channel, SendError};
pub use event::{Deadline, Event, WaitError};
pub use intr_guard::*;
pub use preempt::{PreemptGuard, preempt_disable, preempt_enable};
pub use raw_spin_lock::*;
pub use spin_lock::*;
pub use thread::{KernelThread, current_thread_id, spawn};

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作的 trait
///
/// 由 os crate 实现并注册，提供中断控制、抢占控制和 CPU 信息
pub trait ArchOps: Send + Sync {
    /// 读取并禁用中断，返回之前的状态
    ///
    /// # Safety
    /// 调用者必须确保在适当的上下文中调用
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 获取中断使能位（用于判断 flags 中中断是否开启）
    fn interrupt_enable_bit(&self) -> usize;

    /// 禁用当前 CPU 上的抢占（可嵌套）
    fn preempt_disable(&self);

    /// 恢复当前 CPU 上的抢占（与 preempt_disable 配对）
    fn preempt_enable(&self);

    /// 获取当前 CPU ID
    fn cpu_id(&self) -> usize;
}

/// 调度相关操作的 trait
///
/// 由 os crate 实现并注册。阻塞语义与 park/unpark 一致：
/// 若 `wake` 先于 `block_current` 到达，则下一次 `block_current` 立即返回。
pub trait SchedOps: Send + Sync {
    /// 当前线程的唯一 ID（非 0）
    fn current_thread(&self) -> usize;

    /// 阻塞当前线程，直到被 [`SchedOps::wake`] 唤醒或到达截止时间（纳秒，单调时钟）。
    ///
    /// 允许虚假唤醒，调用者需要自行重新检查条件。
    fn block_current(&self, deadline_ns: Option<u64>);

    /// 唤醒指定线程
    fn wake(&self, thread: usize);

    /// 单调时钟（纳秒）
    fn now_ns(&self) -> u64;

    /// 创建并启动一个内核线程，返回线程 ID
    fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send + 'static>) -> usize;

    /// 等待指定内核线程退出
    fn join(&self, thread: usize);
}

/// 全局架构操作实例（存储 fat pointer 的两个部分）
static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 全局调度操作实例（存储 fat pointer 的两个部分）
static SCHED_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static SCHED_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: transmute 在这里是安全的，因为 fat pointer 的布局是 (data, vtable)
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 注册调度操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_sched_ops(ops: &'static dyn SchedOps) {
    let ptr = ops as *const dyn SchedOps;
    // SAFETY: 同 register_arch_ops
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn SchedOps, (usize, usize)>(ptr) };
    SCHED_OPS_VTABLE.store(vtable, Ordering::Release);
    SCHED_OPS_DATA.store(data, Ordering::Release);
}

/// 获取架构操作实例
#[inline]
pub(crate) fn arch_ops() -> &'static dyn ArchOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        #[cfg(test)]
        {
            return &test_support::mock::arch::MOCK_ARCH_OPS;
        }
        #[cfg(not(test))]
        panic!("sync: ArchOps not registered, call register_arch_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) }
}

/// 获取调度操作实例
#[inline]
pub(crate) fn sched_ops() -> &'static dyn SchedOps {
    let data = SCHED_OPS_DATA.load(Ordering::Acquire);
    let vtable = SCHED_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        #[cfg(test)]
        {
            return &test_support::mock::sched::MOCK_SCHED_OPS;
        }
        #[cfg(not(test))]
        panic!("sync: SchedOps not registered, call register_sched_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_sched_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn SchedOps>((data, vtable)) }
}

#[cfg(test)]
mod test_mock {
    use super::{ArchOps, SchedOps};
    use alloc::boxed::Box;
    use test_support::mock::arch::MockArchOps;
    use test_support::mock::sched::MockSchedOps;

    impl ArchOps for MockArchOps {
        unsafe fn read_and_disable_interrupts(&self) -> usize {
            unsafe { MockArchOps::read_and_disable_interrupts(self) }
        }

        unsafe fn restore_interrupts(&self, flags: usize) {
            unsafe { MockArchOps::restore_interrupts(self, flags) }
        }

        fn interrupt_enable_bit(&self) -> usize {
            MockArchOps::interrupt_enable_bit(self)
        }

        fn preempt_disable(&self) {
            MockArchOps::preempt_disable(self)
        }

        fn preempt_enable(&self) {
            MockArchOps::preempt_enable(self)
        }

        fn cpu_id(&self) -> usize {
            MockArchOps::cpu_id(self)
        }
    }

    impl SchedOps for MockSchedOps {
        fn current_thread(&self) -> usize {
            MockSchedOps::current_thread(self)
        }

        fn block_current(&self, deadline_ns: Option<u64>) {
            MockSchedOps::block_current(self, deadline_ns)
        }

        fn wake(&self, thread: usize) {
            MockSchedOps::wake(self, thread)
        }

        fn now_ns(&self) -> u64 {
            MockSchedOps::now_ns(self)
        }

        fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send + 'static>) -> usize {
            MockSchedOps::spawn(self, name, entry)
        }

        fn join(&self, thread: usize) {
            MockSchedOps::join(self, thread)
        }
    }
}
