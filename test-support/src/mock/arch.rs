//! 架构相关操作的 Mock 实现
//!
//! 中断开关和抢占计数按宿主线程维护，每个测试线程都像一个独立的 CPU。

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 模拟的中断使能位（与 RISC-V sstatus.SIE 相同）
const INTERRUPT_ENABLE_BIT: usize = 0x2;

thread_local! {
    static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
    static PREEMPT_COUNT: Cell<usize> = const { Cell::new(0) };
}

/// Mock 架构操作
pub struct MockArchOps {
    pub cpu_id: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            cpu_id: AtomicUsize::new(0),
        }
    }

    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        if INTR_ENABLED.with(|e| e.replace(false)) {
            INTERRUPT_ENABLE_BIT
        } else {
            0
        }
    }

    /// # Safety
    /// 仅用于测试环境。
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        INTR_ENABLED.with(|e| e.set(flags & INTERRUPT_ENABLE_BIT != 0));
    }

    pub fn interrupt_enable_bit(&self) -> usize {
        INTERRUPT_ENABLE_BIT
    }

    pub fn preempt_disable(&self) {
        PREEMPT_COUNT.with(|c| c.set(c.get() + 1));
    }

    pub fn preempt_enable(&self) {
        PREEMPT_COUNT.with(|c| {
            let count = c.get();
            assert!(count > 0, "preempt_enable without matching preempt_disable");
            c.set(count - 1);
        });
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// 当前线程的抢占禁用深度
    pub fn preempt_count(&self) -> usize {
        PREEMPT_COUNT.with(|c| c.get())
    }

    /// 当前线程的中断是否开启
    pub fn interrupts_enabled(&self) -> bool {
        INTR_ENABLED.with(|e| e.get())
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
