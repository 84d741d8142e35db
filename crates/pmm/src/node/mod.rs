//! 页面分配器
//!
//! [`PmmNode`] 拥有所有 arena、全局空闲链表和出借空闲链表，是物理页的唯一分配者。
//!
//! # 锁
//!
//! 两把相互独立的短临界区自旋锁（见 `locks` 模块）：
//!
//! - 空闲锁：空闲链表、延迟分配策略、内存信号
//! - 出借锁：出借空闲链表、出借/取消计数、延迟释放持有者
//!
//! 同时需要两把锁的操作（取消/结束出借、全量填充校验、统计出借但未空闲的页）
//! 一律先取出借锁再取空闲锁。持锁期间不会睡眠。
//!
//! # 计数
//!
//! 空闲页数等计数器在对应锁内更新，同时以原子变量镜像，
//! 供外部在锁外做近似读取（例如低内存水位轮询）。
//!
//! # 模块组成
//!
//! - `alloc`：单页/批量/连续/指定范围分配
//! - `free`：释放路径
//! - `loan`：出借协议与出借页的延迟释放
//! - `signal`：延迟分配状态机、内存信号、OOM 记录

mod allocate;
mod free;
mod loan;
mod locks;
mod signal;

pub use loan::FreeLoanedPagesHolder;
pub use signal::{AllocFailure, AllocFailureKind};

pub(crate) use loan::HolderRecord;

use crate::arena::{ArenaInfo, PageStateCounts, PmmArena, page_ref};
use crate::checker::{CheckFailAction, PmmChecker};
use crate::config::pmm_config;
use crate::delay::{AllocDelayPolicy, NeverDelay, RandomDelay};
use crate::evictor::PageCompression;
use crate::page::{Page, PageId, PageState};
use crate::page_list::ListTag;
use crate::{MAX_ARENAS, MB, PAGE_SIZE, PAGE_SIZE_SHIFT, PmmError, PmmResult};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use locks::NodeLocks;
use sync::{Event, SpinLock};

bitflags! {
    /// 分配标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// 调用者可以等待：内存紧张时可能返回 `ShouldWait` 而不是 `NoMemory`
        const CAN_WAIT = 1 << 0;
        /// 连续分配只使用标记为 `LO_MEM` 的 arena
        const LO_MEM = 1 << 1;
    }
}

/// 启动时保留区域的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedKind {
    /// 物理内存中的空洞
    Hole,
    /// 内核镜像等永久占用
    Kernel,
    /// 启动交接期间的临时数据，在 [`PmmNode::end_handoff`] 时释放
    TemporaryHandoff,
}

impl ReservedKind {
    fn as_str(self) -> &'static str {
        match self {
            ReservedKind::Hole => "hole in RAM",
            ReservedKind::Kernel => "kernel",
            ReservedKind::TemporaryHandoff => "temporary handoff",
        }
    }
}

/// 启动时需要保留的物理区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRange {
    /// 起始物理地址（页对齐）
    pub base: u64,
    /// 大小（字节，页对齐）
    pub size: u64,
    /// 种类
    pub kind: ReservedKind,
}

/// 页面分配器
pub struct PmmNode {
    arenas: Vec<PmmArena>,
    arena_cumulative_size: u64,
    locks: NodeLocks,

    free_count: AtomicU64,
    free_loaned_count: AtomicU64,
    loaned_count: AtomicU64,
    loan_cancelled_count: AtomicU64,

    alloc_failed_count: AtomicU64,
    alloc_delayed_count: AtomicU64,
    /// 是否发生过 `NoMemory` 分配失败，只锁存一次，直到显式复位
    alloc_failed_no_mem: AtomicBool,

    /// 空闲页填充是否已启用（只能从关到开）
    free_fill_enabled: AtomicBool,
    /// 所有空闲页是否都已填充图案；只在同时持有两把锁时写入
    all_free_pages_filled: AtomicBool,
    checker: PmmChecker,

    /// 允许分配时有信号；处于 UntilReset 状态时复位
    free_pages_event: Event,

    page_compression: SpinLock<Option<Arc<dyn PageCompression>>>,
}

impl PmmNode {
    /// 用启动时的内存布局创建节点。
    ///
    /// `arenas` 中的每一段成为一个 arena，所有页初始为 FREE 并进入空闲链表；
    /// 随后 `reserved` 中落在 arena 内的区域被分配出来并标记为 WIRED。
    pub fn new(arenas: &[ArenaInfo], reserved: &[ReservedRange]) -> PmmResult<Self> {
        if arenas.len() > MAX_ARENAS {
            return Err(PmmError::NotSupported);
        }
        let mut infos: Vec<ArenaInfo> = arenas.to_vec();
        infos.sort_by_key(|a| a.base);
        if infos.windows(2).any(|w| w[0].end() > w[1].base) {
            return Err(PmmError::InvalidArgs);
        }

        let mut built = Vec::with_capacity(infos.len());
        let mut cumulative = 0;
        for (ix, info) in infos.into_iter().enumerate() {
            let arena = PmmArena::new(info, ix)?;
            log::info!(
                "PMM: adding arena '{}' base {:#x} size {:#x}",
                arena.name(),
                arena.base(),
                arena.size()
            );
            cumulative += arena.size();
            built.push(arena);
        }

        let config = pmm_config();
        let delay_policy: Box<dyn AllocDelayPolicy> = if config.alloc_random_should_wait() {
            Box::new(RandomDelay::new(0))
        } else {
            Box::new(NeverDelay)
        };

        let node = PmmNode {
            arenas: built,
            arena_cumulative_size: cumulative,
            locks: NodeLocks::new(delay_policy),
            free_count: AtomicU64::new(0),
            free_loaned_count: AtomicU64::new(0),
            loaned_count: AtomicU64::new(0),
            loan_cancelled_count: AtomicU64::new(0),
            alloc_failed_count: AtomicU64::new(0),
            alloc_delayed_count: AtomicU64::new(0),
            alloc_failed_no_mem: AtomicBool::new(false),
            free_fill_enabled: AtomicBool::new(false),
            all_free_pages_filled: AtomicBool::new(false),
            checker: PmmChecker::new(),
            free_pages_event: Event::new(false),
            page_compression: SpinLock::new(None),
        };
        node.add_free_pages();
        for range in reserved {
            node.init_reserved_range(range);
        }

        if let Some(fill_size) = config.free_fill_size() {
            node.enable_free_page_filling(fill_size, config.checker_action())?;
            node.fill_free_pages_and_arm();
        }
        Ok(node)
    }

    // 启动时把所有 arena 的页放入空闲链表
    fn add_free_pages(&self) {
        let mut free = self.locks.free();
        let mut count = 0;
        for arena in &self.arenas {
            for page in arena.pages() {
                debug_assert!(page.is_free() && !page.is_loaned());
                free.free_list.push_tail(&self.arenas, page);
                count += 1;
            }
        }
        self.free_count.fetch_add(count, Ordering::Relaxed);
        self.free_pages_event.signal();
        log::debug!("PMM: free count now {}", count);
    }

    fn init_reserved_range(&self, range: &ReservedRange) {
        let page_mask = (PAGE_SIZE - 1) as u64;
        debug_assert!(range.base & page_mask == 0 && range.size & page_mask == 0);
        if !self.arenas.iter().any(|a| a.address_in_arena(range.base)) {
            return;
        }

        let count = (range.size >> PAGE_SIZE_SHIFT) as usize;
        let pages = match self.alloc_range(range.base, count) {
            Ok(pages) => pages,
            Err(err) => {
                log::info!(
                    "PMM: unable to reserve [{:#x}, {:#x}): {}: {}",
                    range.base,
                    range.base + range.size,
                    range.kind.as_str(),
                    err
                );
                return;
            }
        };
        log::info!(
            "PMM: reserved [{:#x}, {:#x}): {}",
            range.base,
            range.base + range.size,
            range.kind.as_str()
        );

        let mut free = self.locks.free();
        for id in pages {
            let page = self.page(id);
            page.set_state(PageState::Wired);
            match range.kind {
                ReservedKind::TemporaryHandoff => free.temporary_handoff.push_tail(&self.arenas, page),
                ReservedKind::Hole | ReservedKind::Kernel => {
                    free.permanently_reserved.push_tail(&self.arenas, page)
                }
            }
        }
    }

    /// 启动交接结束：释放临时交接区域
    pub fn end_handoff(&self) {
        let pages: Vec<PageId> = {
            let mut free = self.locks.free();
            free.temporary_handoff
                .drain(&self.arenas)
                .into_iter()
                .map(|page| {
                    page.set_state(PageState::Alloc);
                    page.id()
                })
                .collect()
        };
        log::info!("PMM: releasing {} pages of temporary handoff memory", pages.len());
        self.free_list(&pages);
    }

    /// 将 WIRED 页转为 ALLOC，交给调用者
    pub fn unwire_page(&self, id: PageId) {
        let page = self.page(id);
        let mut free = self.locks.free();
        assert_eq!(page.state(), PageState::Wired, "page {:#x} is not wired", page.paddr());
        if page.list_tag() == ListTag::Reserved {
            if free.temporary_handoff.iter(&self.arenas).any(|p| p.id() == id) {
                free.temporary_handoff.remove(&self.arenas, page);
            } else {
                free.permanently_reserved.remove(&self.arenas, page);
            }
        }
        page.set_state(PageState::Alloc);
    }

    /// 永久保留的页数
    pub fn count_reserved_pages(&self) -> u64 {
        let free = self.locks.free();
        (free.permanently_reserved.len() + free.temporary_handoff.len()) as u64
    }

    // ========================================================================
    // 页查找
    // ========================================================================

    /// 按页索引取页记录
    pub fn page(&self, id: PageId) -> &Page {
        page_ref(&self.arenas, id.raw())
    }

    /// 按物理地址查找页记录
    pub fn paddr_to_page(&self, paddr: u64) -> Option<&Page> {
        self.arenas.iter().find_map(|a| a.find_specific(paddr))
    }

    /// 页记录对应的压缩索引
    pub fn page_to_index(&self, page: &Page) -> u32 {
        page.id().raw()
    }

    /// 压缩索引对应的页记录
    pub fn index_to_page(&self, index: u32) -> Option<&Page> {
        let id = PageId::from_raw(index)?;
        let arena = self.arenas.get(id.arena_index())?;
        (id.page_index() < arena.page_count()).then(|| self.page(id))
    }

    /// 压缩索引对应的物理地址（不访问页记录）
    pub fn index_to_paddr(&self, index: u32) -> Option<u64> {
        let id = PageId::from_raw(index)?;
        let arena = self.arenas.get(id.arena_index())?;
        Some(arena.base() + (id.page_index() << PAGE_SIZE_SHIFT) as u64)
    }

    // ========================================================================
    // 计数
    // ========================================================================

    /// 空闲页数（近似值）
    pub fn count_free_pages(&self) -> u64 {
        self.free_count.load(Ordering::Relaxed)
    }

    /// 出借空闲页数（近似值）
    pub fn count_loaned_free_pages(&self) -> u64 {
        self.free_loaned_count.load(Ordering::Relaxed)
    }

    /// 已取消出借的页数
    pub fn count_loan_cancelled_pages(&self) -> u64 {
        self.loan_cancelled_count.load(Ordering::Relaxed)
    }

    /// 出借中但不空闲的页数
    pub fn count_loaned_not_free_pages(&self) -> u64 {
        // 需要两把锁才能同时读取两个计数
        let _both = self.locks.lock_both();
        self.loaned_count.load(Ordering::Relaxed) - self.free_loaned_count.load(Ordering::Relaxed)
    }

    /// 出借页总数
    pub fn count_loaned_pages(&self) -> u64 {
        self.loaned_count.load(Ordering::Relaxed)
    }

    /// 所有 arena 的总字节数
    pub fn count_total_bytes(&self) -> u64 {
        self.arena_cumulative_size
    }

    /// 累计分配失败次数
    pub fn alloc_failed_count(&self) -> u64 {
        self.alloc_failed_count.load(Ordering::Relaxed)
    }

    /// 累计被延迟（返回 `ShouldWait`）的分配次数
    pub fn alloc_delayed_count(&self) -> u64 {
        self.alloc_delayed_count.load(Ordering::Relaxed)
    }

    // ========================================================================
    // arena 信息与诊断
    // ========================================================================

    /// arena 数量
    pub fn num_arenas(&self) -> usize {
        self.arenas.len()
    }

    /// 所有 arena
    pub fn arenas(&self) -> &[PmmArena] {
        &self.arenas
    }

    /// 从第 `i` 个 arena 开始，把 `count` 个 arena 的信息写入 `buffer`
    pub fn get_arena_info(&self, count: usize, i: usize, buffer: &mut [ArenaInfo]) -> PmmResult<()> {
        let _free = self.locks.free();
        let n = self.arenas.len();
        if count == 0 || i >= n || count > n - i {
            return Err(PmmError::OutOfRange);
        }
        if buffer.len() < count {
            return Err(PmmError::BufferTooSmall);
        }
        for (slot, arena) in buffer.iter_mut().zip(&self.arenas[i..i + count]) {
            *slot = arena.info();
        }
        Ok(())
    }

    /// 输出空闲内存大小
    pub fn dump_free(&self) {
        log::info!(" {} free MBs", self.count_free_pages() * PAGE_SIZE as u64 / MB);
    }

    /// 输出节点状态与各 arena 的页状态统计。
    ///
    /// `is_panic` 为真时不取锁，直接读取。
    pub fn dump(&self, is_panic: bool) -> PageStateCounts {
        let dump = || {
            let free_count = self.count_free_pages();
            let free_loaned_count = self.count_loaned_free_pages();
            log::info!(
                "pmm node: free_count {} ({} bytes), free_loaned_count: {} ({} bytes), total size {}",
                free_count,
                free_count * PAGE_SIZE as u64,
                free_loaned_count,
                free_loaned_count * PAGE_SIZE as u64,
                self.arena_cumulative_size
            );
            let mut sum = PageStateCounts::default();
            for arena in &self.arenas {
                arena.dump(&mut sum);
            }
            log::info!("Totals");
            sum.log();
            sum
        };
        if is_panic {
            dump()
        } else {
            let _free = self.locks.free();
            dump()
        }
    }

    // ========================================================================
    // 空闲页填充校验
    // ========================================================================

    /// 校验器
    pub fn checker(&self) -> &PmmChecker {
        &self.checker
    }

    /// 启用空闲页填充。只能启用一次，之后不能关闭。
    ///
    /// 启用后新释放的页会被填充，但校验要等
    /// [`fill_free_pages_and_arm`](Self::fill_free_pages_and_arm) 之后才开始。
    pub fn enable_free_page_filling(&self, fill_size: usize, action: CheckFailAction) -> PmmResult<()> {
        if !PmmChecker::is_valid_fill_size(fill_size) {
            return Err(PmmError::InvalidArgs);
        }
        let _both = self.locks.lock_both();
        if self.free_fill_enabled.load(Ordering::Relaxed) {
            return Err(PmmError::AlreadyExists);
        }
        self.checker.set_fill_size(fill_size);
        self.checker.set_action(action);
        // 锁外读取方用 Acquire 与此配对，保证看到校验器的配置
        self.free_fill_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// 填充当前所有空闲页，然后开始校验
    pub fn fill_free_pages_and_arm(&self) {
        let both = self.locks.lock_both();
        if !self.free_fill_enabled.load(Ordering::Relaxed) {
            return;
        }
        for page in both.free.free_list.iter(&self.arenas) {
            self.checker.fill_pattern(page);
        }
        for page in both.loaned.free_loaned_list.iter(&self.arenas) {
            self.checker.fill_pattern(page);
        }
        self.checker.arm();
        self.all_free_pages_filled.store(true, Ordering::Relaxed);
        self.checker.print_status();
    }

    /// 校验所有空闲页的图案，并核对链表长度与计数器
    pub fn check_all_free_pages(&self) {
        let both = self.locks.lock_both();
        if !self.checker.is_armed() {
            return;
        }
        let mut free_pages = 0u64;
        for page in both.free.free_list.iter(&self.arenas) {
            self.checker.assert_pattern(page);
            free_pages += 1;
        }
        let mut free_loaned_pages = 0u64;
        for page in both.loaned.free_loaned_list.iter(&self.arenas) {
            self.checker.assert_pattern(page);
            free_loaned_pages += 1;
        }
        assert_eq!(free_pages, self.free_count.load(Ordering::Relaxed));
        assert_eq!(free_loaned_pages, self.free_loaned_count.load(Ordering::Relaxed));
    }

    /// 锁外读取填充是否启用，与 `enable_free_page_filling` 的 Release 配对
    pub(crate) fn is_free_fill_enabled_racy(&self) -> bool {
        self.free_fill_enabled.load(Ordering::Acquire)
    }

    /// 空闲链表中的页是否都带有图案；调用者至少持有一把锁
    fn free_pages_filled(&self) -> bool {
        self.all_free_pages_filled.load(Ordering::Relaxed)
    }

    // ========================================================================
    // 页面压缩
    // ========================================================================

    /// 注册页面压缩实现，只能注册一次
    pub fn set_page_compression(&self, compression: Arc<dyn PageCompression>) -> PmmResult<()> {
        let mut slot = self.page_compression.lock();
        if slot.is_some() {
            return Err(PmmError::AlreadyExists);
        }
        *slot = Some(compression);
        Ok(())
    }

    /// 已注册的页面压缩实现
    pub fn page_compression(&self) -> Option<Arc<dyn PageCompression>> {
        self.page_compression.lock().clone()
    }
}
