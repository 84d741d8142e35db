//! 页面回收
//!
//! [`Evictor`] 在内存压力下从页面所属的子系统回收页面：
//! 按从旧到新的顺序遍历可回收队列，让页面的所属对象驱逐、丢弃或压缩页面内容。
//!
//! 两类回收请求：
//!
//! - 一次性请求：同步执行（[`Evictor::evict_one_shot_synchronous`]），
//!   或者与尚未处理的请求合并后交给回收线程（[`Evictor::evict_one_shot_asynchronous`]）
//! - 连续请求：回收线程按固定间隔推进，`min_pages_to_free` 随实际进展递减
//!
//! 回收总是尽力而为：一轮回收没有释放任何页时立即停止，即使目标尚未达成。

mod reclaim;
mod thread;

pub use reclaim::{
    Compressor, EvictionHintAction, NUM_ACTIVE_QUEUES, NUM_OLDEST_QUEUES, NUM_RECLAIM_QUEUES,
    PageCompression, PageQueues, ReclaimableObject, VmoBacklink,
};

use crate::config::pmm_config;
use crate::node::PmmNode;
use crate::page::PageId;
use crate::{MB, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use sync::{Channel, Event, IrqSpinLock, KernelThread};
use thread::EvictionRequest;

/// 回收激进程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EvictionLevel {
    /// 只回收最旧的队列
    #[default]
    OnlyOldest,
    /// 包括最新的队列，并忽略回收提示，只用于最后手段
    IncludeNewest,
}

/// 是否输出回收统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// 输出 `[EVICT]:` 日志
    Print,
    /// 不输出
    NoPrint,
}

/// 回收的触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// 内存耗尽
    Oom,
    /// 其它
    Other,
}

bitflags! {
    /// 允许回收的页面种类
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvictionTypes: u8 {
        /// 有外部来源的页，可以直接驱逐
        const PAGER_BACKED = 1 << 0;
        /// 可丢弃对象的页
        const DISCARDABLE = 1 << 1;
        /// 匿名页，只能压缩
        const ANONYMOUS = 1 << 2;
    }
}

/// 回收目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionTarget {
    /// 是否有待处理的请求
    pub pending: bool,
    /// 回收后希望达到的空闲页数
    pub free_pages_target: u64,
    /// 至少回收的页数
    pub min_pages_to_free: u64,
    /// 回收激进程度
    pub level: EvictionLevel,
    /// 是否输出统计
    pub print_counts: bool,
    /// 是否由 OOM 触发
    pub oom_trigger: bool,
}

impl EvictionTarget {
    /// 合并另一个一次性目标：标志取或，程度与空闲目标取大，最少页数相加
    pub fn combine(&mut self, other: &EvictionTarget) {
        self.pending |= other.pending;
        self.level = self.level.max(other.level);
        self.min_pages_to_free = checked_add(self.min_pages_to_free, other.min_pages_to_free);
        self.free_pages_target = self.free_pages_target.max(other.free_pages_target);
        self.print_counts |= other.print_counts;
        self.oom_trigger |= other.oom_trigger;
    }
}

fn checked_add(a: u64, b: u64) -> u64 {
    match a.checked_add(b) {
        Some(sum) => sum,
        None => panic!("eviction target overflow: {} + {}", a, b),
    }
}

/// 一轮回收释放的页数，各类互不重叠
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictedPageCounts {
    /// 被驱逐的非出借页
    pub pager_backed: u64,
    /// 被驱逐的出借页
    pub pager_backed_loaned: u64,
    /// 被丢弃的页
    pub discardable: u64,
    /// 被压缩的页
    pub compressed: u64,
}

impl EvictedPageCounts {
    fn add(&mut self, other: &EvictedPageCounts) {
        self.pager_backed += other.pager_backed;
        self.pager_backed_loaned += other.pager_backed_loaned;
        self.discardable += other.discardable;
        self.compressed += other.compressed;
    }

    /// 释放的非出借页总数
    pub fn non_loaned(&self) -> u64 {
        self.pager_backed + self.compressed + self.discardable
    }
}

/// 累计回收统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictorStats {
    /// OOM 触发的驱逐页数
    pub pager_backed_oom: u64,
    /// 其它原因的驱逐页数
    pub pager_backed_other: u64,
    /// OOM 触发的压缩页数
    pub compression_oom: u64,
    /// 其它原因的压缩页数
    pub compression_other: u64,
    /// OOM 触发的丢弃页数
    pub discarded_oom: u64,
    /// 其它原因的丢弃页数
    pub discarded_other: u64,
}

#[derive(Default)]
struct Counters {
    pager_backed: AtomicU64,
    pager_backed_oom: AtomicU64,
    compression: AtomicU64,
    compression_oom: AtomicU64,
    discarded: AtomicU64,
    discarded_oom: AtomicU64,
}

struct EvictorState {
    one_shot_target: EvictionTarget,
    continuous_target: EvictionTarget,
    /// 连续回收开启时使用的唤醒间隔
    default_interval_ns: u64,
    /// 回收线程下一次等待的时长，`None` 表示无限等待
    next_interval_ns: Option<u64>,
    eviction_enabled: bool,
    use_compression: bool,
    thread: Option<KernelThread>,
    thread_exiting: bool,
}

/// 页面回收引擎
pub struct Evictor {
    pmm_node: Arc<PmmNode>,
    page_queues: Arc<dyn PageQueues>,
    eviction_types: EvictionTypes,
    state: IrqSpinLock<EvictorState>,
    /// 没有正在进行的回收时有信号；自动复位，保证同一时刻只有一个回收循环
    no_ongoing_eviction: Event,
    requests: Arc<Channel<EvictionRequest>>,
    counters: Counters,
}

// 没有进行中的回收时重新置位
struct OngoingEviction<'a>(&'a Event);

impl Drop for OngoingEviction<'_> {
    fn drop(&mut self) {
        self.0.signal();
    }
}

impl Evictor {
    /// 创建回收所有种类页面的回收引擎
    pub fn new(pmm_node: Arc<PmmNode>, page_queues: Arc<dyn PageQueues>) -> Self {
        Self::with_types(pmm_node, page_queues, EvictionTypes::all())
    }

    /// 创建只回收指定种类页面的回收引擎
    pub fn with_types(
        pmm_node: Arc<PmmNode>,
        page_queues: Arc<dyn PageQueues>,
        eviction_types: EvictionTypes,
    ) -> Self {
        Evictor {
            pmm_node,
            page_queues,
            eviction_types,
            state: IrqSpinLock::new(EvictorState {
                one_shot_target: EvictionTarget::default(),
                continuous_target: EvictionTarget::default(),
                default_interval_ns: pmm_config().eviction_interval_ns(),
                next_interval_ns: None,
                eviction_enabled: false,
                use_compression: false,
                thread: None,
                thread_exiting: false,
            }),
            no_ongoing_eviction: Event::new_auto(true),
            requests: Arc::new(Channel::new(thread::REQUEST_QUEUE_DEPTH)),
            counters: Counters::default(),
        }
    }

    /// 所属的页面分配器
    pub fn pmm_node(&self) -> &Arc<PmmNode> {
        &self.pmm_node
    }

    /// 是否已启用回收
    pub fn is_eviction_enabled(&self) -> bool {
        self.state.lock().eviction_enabled
    }

    /// 是否允许压缩回收
    pub fn is_compression_enabled(&self) -> bool {
        self.state.lock().use_compression
    }

    /// 设置连续回收的唤醒间隔，下一次开启连续回收时生效
    pub fn set_continuous_eviction_interval(&self, interval_ns: u64) {
        self.state.lock().default_interval_ns = interval_ns;
    }

    /// 当前的一次性目标
    pub fn debug_get_one_shot_eviction_target(&self) -> EvictionTarget {
        self.state.lock().one_shot_target
    }

    /// 当前的连续目标
    pub fn debug_get_continuous_eviction_target(&self) -> EvictionTarget {
        self.state.lock().continuous_target
    }

    /// 覆盖一次性目标
    pub fn set_one_shot_eviction_target(&self, target: EvictionTarget) {
        self.state.lock().one_shot_target = target;
    }

    /// 把目标合并进尚未处理的一次性目标
    pub fn combine_one_shot_eviction_target(&self, target: EvictionTarget) {
        self.state.lock().one_shot_target.combine(&target);
    }

    /// 累计统计
    pub fn stats(&self) -> EvictorStats {
        let c = &self.counters;
        let pager_backed_oom = c.pager_backed_oom.load(Ordering::Relaxed);
        let compression_oom = c.compression_oom.load(Ordering::Relaxed);
        let discarded_oom = c.discarded_oom.load(Ordering::Relaxed);
        EvictorStats {
            pager_backed_oom,
            pager_backed_other: c.pager_backed.load(Ordering::Relaxed).saturating_sub(pager_backed_oom),
            compression_oom,
            compression_other: c.compression.load(Ordering::Relaxed).saturating_sub(compression_oom),
            discarded_oom,
            discarded_other: c.discarded.load(Ordering::Relaxed).saturating_sub(discarded_oom),
        }
    }

    /// 只打开回收开关，不启动回收线程
    #[cfg(test)]
    pub(crate) fn enable_without_thread(&self, use_compression: bool) {
        let mut state = self.state.lock();
        state.eviction_enabled = true;
        state.use_compression = use_compression;
    }

    // ========================================================================
    // 一次性回收
    // ========================================================================

    /// 取出并清空一次性目标，执行到目标达成或无法继续
    pub fn evict_one_shot_from_preloaded_target(&self) -> EvictedPageCounts {
        let target = core::mem::take(&mut self.state.lock().one_shot_target);
        if !target.pending {
            return EvictedPageCounts::default();
        }

        let free_pages_before = self.pmm_node.count_free_pages();
        let counts = self.evict_until_targets_met(
            target.min_pages_to_free,
            target.free_pages_target,
            target.level,
        );

        if target.print_counts {
            self.print_counts(free_pages_before, &counts, true);
        }
        if target.oom_trigger {
            self.counters.pager_backed_oom.fetch_add(counts.pager_backed, Ordering::Relaxed);
            self.counters.compression_oom.fetch_add(counts.compressed, Ordering::Relaxed);
            self.counters.discarded_oom.fetch_add(counts.discardable, Ordering::Relaxed);
        }
        counts
    }

    /// 同步回收至少 `min_mem_to_free` 字节，返回回收的非出借页数
    pub fn evict_one_shot_synchronous(
        &self,
        min_mem_to_free: u64,
        level: EvictionLevel,
        output: Output,
        reason: TriggerReason,
    ) -> u64 {
        if !self.is_eviction_enabled() {
            return 0;
        }
        self.set_one_shot_eviction_target(EvictionTarget {
            pending: true,
            // 只按最少页数回收
            free_pages_target: 0,
            min_pages_to_free: min_mem_to_free / PAGE_SIZE as u64,
            level,
            print_counts: output == Output::Print,
            oom_trigger: reason == TriggerReason::Oom,
        });
        let counts = self.evict_one_shot_from_preloaded_target();
        counts.pager_backed + counts.discardable + counts.compressed
    }

    /// 合并一次性请求并唤醒回收线程
    pub fn evict_one_shot_asynchronous(
        &self,
        min_mem_to_free: u64,
        free_mem_target: u64,
        level: EvictionLevel,
        output: Output,
    ) {
        if !self.is_eviction_enabled() {
            return;
        }
        self.combine_one_shot_eviction_target(EvictionTarget {
            pending: true,
            free_pages_target: free_mem_target / PAGE_SIZE as u64,
            min_pages_to_free: min_mem_to_free / PAGE_SIZE as u64,
            level,
            print_counts: output == Output::Print,
            oom_trigger: false,
        });
        self.wake_thread();
    }

    // ========================================================================
    // 连续回收
    // ========================================================================

    /// 开启连续回收，`min_mem_to_free` 累加到尚未完成的最少页数上
    pub fn enable_continuous_eviction(
        &self,
        min_mem_to_free: u64,
        free_mem_target: u64,
        level: EvictionLevel,
        output: Output,
    ) {
        {
            let mut state = self.state.lock();
            let target = &mut state.continuous_target;
            target.min_pages_to_free =
                checked_add(target.min_pages_to_free, min_mem_to_free / PAGE_SIZE as u64);
            target.free_pages_target = free_mem_target / PAGE_SIZE as u64;
            target.level = level;
            target.print_counts = output == Output::Print;
            state.next_interval_ns = Some(state.default_interval_ns);
        }
        self.wake_thread();
    }

    /// 关闭连续回收，回收线程此后无限等待
    pub fn disable_continuous_eviction(&self) {
        let mut state = self.state.lock();
        state.continuous_target = EvictionTarget::default();
        state.next_interval_ns = None;
    }

    // ========================================================================
    // 回收循环
    // ========================================================================

    /// 回收直到回收了至少 `min_pages_to_evict` 个非出借页且空闲页达到 `free_pages_target`。
    ///
    /// 一轮回收没有释放任何非出借页时停止。
    pub fn evict_until_targets_met(
        &self,
        min_pages_to_evict: u64,
        free_pages_target: u64,
        level: EvictionLevel,
    ) -> EvictedPageCounts {
        let mut total = EvictedPageCounts::default();
        if !self.is_eviction_enabled() {
            return total;
        }

        // 等待其它回收完成，避免越过空闲页目标
        self.no_ongoing_eviction.wait_forever();
        let _ongoing = OngoingEviction(&self.no_ongoing_eviction);

        let mut total_non_loaned = 0;
        loop {
            let free_pages = self.pmm_node.count_free_pages();
            let pages_to_free = if total_non_loaned < min_pages_to_evict {
                min_pages_to_evict - total_non_loaned
            } else if free_pages < free_pages_target {
                free_pages_target - free_pages
            } else {
                break;
            };

            let freed = self.evict_page_queues(pages_to_free, level);
            total.add(&freed);
            total_non_loaned += freed.non_loaned();
            if freed.non_loaned() == 0 {
                break;
            }
        }
        total
    }

    /// 一轮回收：从可回收队列中回收，直到驱逐与压缩的页数达到 `target_pages` 或队列耗尽
    pub fn evict_page_queues(&self, target_pages: u64, level: EvictionLevel) -> EvictedPageCounts {
        let mut counts = EvictedPageCounts::default();
        if !self.is_eviction_enabled() {
            return counts;
        }

        // 默认不回收最新的队列，避免抖动
        let (lowest_queue, hint) = match level {
            EvictionLevel::IncludeNewest => (NUM_ACTIVE_QUEUES, EvictionHintAction::Ignore),
            EvictionLevel::OnlyOldest => {
                (NUM_RECLAIM_QUEUES - NUM_OLDEST_QUEUES, EvictionHintAction::Follow)
            }
        };

        let compressor: Option<Box<dyn Compressor>> = if self.is_compression_enabled() {
            self.pmm_node.page_compression().map(|c| c.acquire_compressor())
        } else {
            None
        };

        let mut freed: Vec<PageId> = Vec::new();
        while counts.pager_backed + counts.compressed < target_pages {
            let Some(backlink) = self.page_queues.peek_reclaim(lowest_queue) else {
                break;
            };
            let Some(object) = backlink.object else {
                continue;
            };

            if self.eviction_types != EvictionTypes::all() {
                let required = if object.is_discardable() {
                    EvictionTypes::DISCARDABLE
                } else if object.can_evict() {
                    EvictionTypes::PAGER_BACKED
                } else {
                    EvictionTypes::ANONYMOUS
                };
                if !self.eviction_types.intersects(required) {
                    self.page_queues.mark_accessed(backlink.page);
                    continue;
                }
            }

            if let Some(compressor) = compressor.as_deref() {
                if compressor.arm().is_err() {
                    break;
                }
            }

            let start = freed.len();
            let count = object.reclaim_page(
                backlink.page,
                backlink.offset,
                hint,
                &mut freed,
                compressor.as_deref(),
            );
            if count > 0 {
                if object.can_evict() {
                    for &id in &freed[start..] {
                        if self.pmm_node.page(id).is_loaned() {
                            counts.pager_backed_loaned += 1;
                        } else {
                            counts.pager_backed += 1;
                        }
                    }
                } else if object.is_discardable() {
                    counts.discardable += count;
                } else {
                    // 不可驱逐的对象只能是压缩回收成功
                    counts.compressed += count;
                }
            }
        }

        self.pmm_node.free_list(&freed);

        self.counters
            .pager_backed
            .fetch_add(counts.pager_backed + counts.pager_backed_loaned, Ordering::Relaxed);
        self.counters.compression.fetch_add(counts.compressed, Ordering::Relaxed);
        self.counters.discarded.fetch_add(counts.discardable, Ordering::Relaxed);
        counts
    }

    fn print_counts(&self, free_pages_before: u64, counts: &EvictedPageCounts, with_compressed: bool) {
        log::info!(
            "[EVICT]: Free memory before eviction was {}MB and after eviction is {}MB",
            free_pages_before * PAGE_SIZE as u64 / MB,
            self.pmm_node.count_free_pages() * PAGE_SIZE as u64 / MB
        );
        if counts.pager_backed > 0 {
            log::info!("[EVICT]: Evicted {} user pager backed pages", counts.pager_backed);
        }
        if counts.discardable > 0 {
            log::info!("[EVICT]: Evicted {} pages from discardable vmos", counts.discardable);
        }
        if with_compressed && counts.compressed > 0 {
            log::info!("[EVICT]: Evicted {} pages by compression", counts.compressed);
        }
    }
}

impl Drop for Evictor {
    fn drop(&mut self) {
        self.disable_eviction();
    }
}
