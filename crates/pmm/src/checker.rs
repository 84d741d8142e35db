//! 空闲页填充校验器
//!
//! 释放页面时向页首 `fill_size` 字节写入固定图案，分配时校验图案是否完好，
//! 用于发现释放后写（use-after-free）等内存破坏。
//!
//! 校验器必须先 [`arm`](PmmChecker::arm) 才会真正校验：
//! 启用填充之后，只有等所有空闲页都填充过一次，校验才有意义。

use crate::arch_ops;
use crate::page::Page;
use crate::PAGE_SIZE;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// 填充图案字节
pub const FILL_PATTERN: u8 = 0x42;

/// 校验失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckFailAction {
    /// 记录日志并计数，继续运行
    Oops = 0,
    /// 直接 panic
    Panic = 1,
}

impl CheckFailAction {
    /// 名称
    pub fn as_str(self) -> &'static str {
        match self {
            CheckFailAction::Oops => "oops",
            CheckFailAction::Panic => "panic",
        }
    }
}

/// 空闲页填充校验器
pub struct PmmChecker {
    armed: AtomicBool,
    fill_size: AtomicUsize,
    action: AtomicU8,
    failures: AtomicU64,
}

impl PmmChecker {
    pub(crate) const fn new() -> Self {
        PmmChecker {
            armed: AtomicBool::new(false),
            fill_size: AtomicUsize::new(PAGE_SIZE),
            action: AtomicU8::new(CheckFailAction::Oops as u8),
            failures: AtomicU64::new(0),
        }
    }

    /// 填充大小是否合法：8 的倍数且位于 `[8, PAGE_SIZE]`
    pub fn is_valid_fill_size(fill_size: usize) -> bool {
        fill_size >= 8 && fill_size <= PAGE_SIZE && fill_size % 8 == 0
    }

    pub(crate) fn set_fill_size(&self, fill_size: usize) {
        assert!(!self.is_armed(), "cannot change fill size while armed");
        assert!(Self::is_valid_fill_size(fill_size), "invalid fill size {}", fill_size);
        self.fill_size.store(fill_size, Ordering::Relaxed);
    }

    pub(crate) fn set_action(&self, action: CheckFailAction) {
        self.action.store(action as u8, Ordering::Relaxed);
    }

    /// 当前填充大小
    pub fn fill_size(&self) -> usize {
        self.fill_size.load(Ordering::Relaxed)
    }

    /// 当前失败处理方式
    pub fn action(&self) -> CheckFailAction {
        if self.action.load(Ordering::Relaxed) == CheckFailAction::Panic as u8 {
            CheckFailAction::Panic
        } else {
            CheckFailAction::Oops
        }
    }

    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// 是否已经开始校验
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// 累计的校验失败次数
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn page_bytes(&self, page: &Page) -> *mut u8 {
        arch_ops().paddr_to_vaddr(page.paddr()) as *mut u8
    }

    /// 向页写入填充图案
    pub(crate) fn fill_pattern(&self, page: &Page) {
        let ptr = self.page_bytes(page);
        // SAFETY: 页面处于释放过程中，只有 PMM 会访问其内容；
        // physmap 映射覆盖整个页
        unsafe { core::ptr::write_bytes(ptr, FILL_PATTERN, self.fill_size()) };
    }

    /// 校验图案，返回第一个不匹配的字节偏移
    fn first_mismatch(&self, page: &Page) -> Option<usize> {
        let ptr = self.page_bytes(page) as *const u8;
        // SAFETY: 同 fill_pattern
        let bytes = unsafe { core::slice::from_raw_parts(ptr, self.fill_size()) };
        bytes.iter().position(|&b| b != FILL_PATTERN)
    }

    /// 校验页面图案是否完好（未 arm 时总是通过）
    pub fn validate_pattern(&self, page: &Page) -> bool {
        !self.is_armed() || self.first_mismatch(page).is_none()
    }

    /// 校验页面图案，失败时按配置的方式处理
    pub(crate) fn assert_pattern(&self, page: &Page) {
        if !self.is_armed() {
            return;
        }
        let Some(offset) = self.first_mismatch(page) else {
            return;
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        match self.action() {
            CheckFailAction::Oops => log::warn!(
                "pmm checker found unexpected pattern in page at {:#x}, offset {:#x}",
                page.paddr(),
                offset
            ),
            CheckFailAction::Panic => {
                log::error!("pmm checker: corrupted free page {:?}", page);
                panic!(
                    "pmm checker found unexpected pattern in page at {:#x}, offset {:#x}",
                    page.paddr(),
                    offset
                );
            }
        }
    }

    /// 输出校验器状态
    pub fn print_status(&self) {
        log::info!(
            "pmm checker {}, fill size is {}, action is {}",
            if self.is_armed() { "enabled" } else { "disabled" },
            self.fill_size(),
            self.action().as_str()
        );
    }
}
