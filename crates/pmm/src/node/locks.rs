//! 节点的两把锁
//!
//! - 出借锁：出借空闲链表、延迟释放持有者
//! - 空闲锁：空闲链表、延迟分配状态、内存信号、保留页链表
//!
//! 需要同时持有两把锁时只能通过 [`NodeLocks::lock_both`]，
//! 它固定先取出借锁再取空闲锁。

use super::signal::ShouldWaitState;
use super::{AllocFailure, HolderRecord};
use crate::delay::AllocDelayPolicy;
use crate::page_list::{ListTag, PageList};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use sync::{Event, SpinLock, SpinLockGuard};

/// 空闲锁保护的状态
pub(crate) struct FreeState {
    pub(crate) free_list: PageList,
    pub(crate) should_wait: ShouldWaitState,
    /// 空闲页数低于该值时开始延迟分配
    pub(crate) should_wait_free_pages_level: u64,
    pub(crate) delay_policy: Box<dyn AllocDelayPolicy>,
    /// 一次性内存信号：空闲页数离开 `[lower, upper]` 时触发并清除
    pub(crate) mem_signal: Option<Arc<Event>>,
    pub(crate) mem_signal_lower_bound: u64,
    pub(crate) mem_signal_upper_bound: u64,
    pub(crate) first_alloc_failure: AllocFailure,
    pub(crate) temporary_handoff: PageList,
    pub(crate) permanently_reserved: PageList,
}

/// 出借锁保护的状态
pub(crate) struct LoanedState {
    pub(crate) free_loaned_list: PageList,
    pub(crate) holders: BTreeMap<u64, HolderRecord>,
}

/// 同时持有两把锁
///
/// 字段按声明顺序释放，与加锁顺序无关。
pub(crate) struct BothLocked<'a> {
    pub(crate) loaned: SpinLockGuard<'a, LoanedState>,
    pub(crate) free: SpinLockGuard<'a, FreeState>,
}

pub(crate) struct NodeLocks {
    loaned: SpinLock<LoanedState>,
    free: SpinLock<FreeState>,
}

impl NodeLocks {
    pub(crate) fn new(delay_policy: Box<dyn AllocDelayPolicy>) -> Self {
        NodeLocks {
            loaned: SpinLock::new(LoanedState {
                free_loaned_list: PageList::new(ListTag::FreeLoaned),
                holders: BTreeMap::new(),
            }),
            free: SpinLock::new(FreeState {
                free_list: PageList::new(ListTag::Free),
                should_wait: ShouldWaitState::OnceLevelTripped,
                should_wait_free_pages_level: 0,
                delay_policy,
                mem_signal: None,
                mem_signal_lower_bound: 0,
                mem_signal_upper_bound: 0,
                first_alloc_failure: AllocFailure::NONE,
                temporary_handoff: PageList::new(ListTag::Reserved),
                permanently_reserved: PageList::new(ListTag::Reserved),
            }),
        }
    }

    /// 只取空闲锁
    pub(crate) fn free(&self) -> SpinLockGuard<'_, FreeState> {
        self.free.lock()
    }

    /// 只取出借锁
    pub(crate) fn loaned(&self) -> SpinLockGuard<'_, LoanedState> {
        self.loaned.lock()
    }

    /// 按固定顺序（出借锁 -> 空闲锁）取两把锁
    pub(crate) fn lock_both(&self) -> BothLocked<'_> {
        let loaned = self.loaned.lock();
        let free = self.free.lock();
        BothLocked { loaned, free }
    }
}
