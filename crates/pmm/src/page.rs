//! 物理页记录
//!
//! 每个物理页在其所属 arena 的 slab 中有一条 [`Page`] 记录，启动时创建，之后永不销毁。
//! 记录的可变字段都是原子类型：状态和链表链接只在持有对应的锁时修改，
//! 但允许在锁外做近似读取（例如诊断输出）。

use crate::page_list::ListTag;
use bitflags::bitflags;
use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// 压缩页索引低位保留的零位数，调用者可以在其中存放元数据
pub const INDEX_ZERO_BITS: u32 = 3;

/// 压缩页索引中 arena 编号占用的位数
pub const ARENA_INDEX_BITS: u32 = 4;

const ARENA_INDEX_MASK: u32 = (1 << ARENA_INDEX_BITS) - 1;

/// 单个 arena 最多容纳的页数（页号加一后需要放进剩余的位）
pub const MAX_PAGES_PER_ARENA: usize = (1 << (32 - ARENA_INDEX_BITS - INDEX_ZERO_BITS)) - 1;

/// 压缩后的页索引
///
/// 编码为 `((page_ix + 1) << ARENA_INDEX_BITS | arena_ix) << INDEX_ZERO_BITS`，
/// 因此低 [`INDEX_ZERO_BITS`] 位恒为 0，且值 0 永远不会出现（表示“无页面”）。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(NonZeroU32);

impl PageId {
    pub(crate) fn new(arena_ix: usize, page_ix: usize) -> Self {
        debug_assert!(arena_ix <= ARENA_INDEX_MASK as usize);
        debug_assert!(page_ix < MAX_PAGES_PER_ARENA);
        let raw = ((((page_ix + 1) as u32) << ARENA_INDEX_BITS) | arena_ix as u32) << INDEX_ZERO_BITS;
        match NonZeroU32::new(raw) {
            Some(raw) => PageId(raw),
            None => unreachable!("page index encoding is never zero"),
        }
    }

    /// 从压缩值恢复；0 返回 `None`
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw & !((1 << INDEX_ZERO_BITS) - 1)).map(PageId)
    }

    /// 压缩值
    pub fn raw(self) -> u32 {
        self.0.get()
    }

    /// 所属 arena 的编号
    pub fn arena_index(self) -> usize {
        ((self.0.get() >> INDEX_ZERO_BITS) & ARENA_INDEX_MASK) as usize
    }

    /// 在 arena 内的页号
    pub fn page_index(self) -> usize {
        ((self.0.get() >> INDEX_ZERO_BITS) >> ARENA_INDEX_BITS) as usize - 1
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({}:{})", self.arena_index(), self.page_index())
    }
}

/// 页状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// 在全局空闲链表中
    Free = 0,
    /// 出借页，在出借空闲链表中（或已被取消出借，不在任何链表中）
    FreeLoaned = 1,
    /// 已分配给调用者
    Alloc = 2,
    /// 属于某个内存对象，带有反向链接
    Object = 3,
    /// 被内核固定使用
    Wired = 4,
}

impl PageState {
    /// 状态总数
    pub const COUNT: usize = 5;

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::Free,
            1 => PageState::FreeLoaned,
            2 => PageState::Alloc,
            3 => PageState::Object,
            _ => PageState::Wired,
        }
    }

    /// 状态名
    pub fn as_str(self) -> &'static str {
        match self {
            PageState::Free => "free",
            PageState::FreeLoaned => "free_loaned",
            PageState::Alloc => "alloc",
            PageState::Object => "object",
            PageState::Wired => "wired",
        }
    }
}

bitflags! {
    /// 页的出借标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// 页已出借给通用分配器
        const LOANED = 1 << 0;
        /// 出借已被取消，不允许再被分配
        const LOAN_CANCELLED = 1 << 1;
    }
}

/// 链表链接（页索引的压缩值，0 表示无）
pub(crate) struct PageLink {
    list: AtomicU8,
    prev: AtomicU32,
    next: AtomicU32,
}

/// 物理页记录
pub struct Page {
    id: PageId,
    paddr: u64,
    state: AtomicU8,
    flags: AtomicU8,
    /// 延迟释放期间所在的持有者 ID（仅 ALLOC 状态有意义）
    owner: AtomicU64,
    /// 所属内存对象的反向链接（仅 OBJECT 状态有意义）
    object: AtomicU64,
    pub(crate) link: PageLink,
}

impl Page {
    pub(crate) fn new(id: PageId, paddr: u64) -> Self {
        Page {
            id,
            paddr,
            state: AtomicU8::new(PageState::Free as u8),
            flags: AtomicU8::new(0),
            owner: AtomicU64::new(0),
            object: AtomicU64::new(0),
            link: PageLink {
                list: AtomicU8::new(ListTag::None as u8),
                prev: AtomicU32::new(0),
                next: AtomicU32::new(0),
            },
        }
    }

    /// 压缩页索引
    pub fn id(&self) -> PageId {
        self.id
    }

    /// 物理地址
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    /// 当前状态
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: PageState) {
        log::trace!(
            "pmm: page {:#x} {} -> {}",
            self.paddr,
            self.state().as_str(),
            state.as_str()
        );
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// 是否在空闲链表中（FREE 状态）
    pub fn is_free(&self) -> bool {
        self.state() == PageState::Free
    }

    /// 是否处于 FREE_LOANED 状态
    pub fn is_free_loaned(&self) -> bool {
        self.state() == PageState::FreeLoaned
    }

    /// 出借标志
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// 是否为出借页
    pub fn is_loaned(&self) -> bool {
        self.flags().contains(PageFlags::LOANED)
    }

    /// 出借是否已被取消
    pub fn is_loan_cancelled(&self) -> bool {
        self.flags().contains(PageFlags::LOAN_CANCELLED)
    }

    pub(crate) fn insert_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn remove_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub(crate) fn set_owner(&self, owner: u64) {
        self.owner.store(owner, Ordering::Relaxed);
    }

    /// 所属内存对象的反向链接，0 表示无
    pub fn object(&self) -> u64 {
        self.object.load(Ordering::Relaxed)
    }

    /// 由页的持有者调用：ALLOC -> OBJECT，并记录反向链接
    pub fn set_object(&self, backlink: u64) {
        assert_eq!(self.state(), PageState::Alloc, "page {:#x} not allocated", self.paddr);
        assert_ne!(backlink, 0);
        self.object.store(backlink, Ordering::Relaxed);
        self.set_state(PageState::Object);
    }

    /// 由页的持有者调用：清除反向链接，OBJECT -> ALLOC
    pub fn clear_object(&self) {
        assert_eq!(self.state(), PageState::Object, "page {:#x} not owned by an object", self.paddr);
        self.object.store(0, Ordering::Relaxed);
        self.set_state(PageState::Alloc);
    }

    pub(crate) fn list_tag(&self) -> ListTag {
        ListTag::from_u8(self.link.list.load(Ordering::Relaxed))
    }

    /// 是否挂在 PMM 管理的某个链表上
    pub fn in_list(&self) -> bool {
        self.list_tag() != ListTag::None
    }

    pub(crate) fn set_list_tag(&self, tag: ListTag) {
        self.link.list.store(tag as u8, Ordering::Relaxed);
    }

    pub(crate) fn prev(&self) -> u32 {
        self.link.prev.load(Ordering::Relaxed)
    }

    pub(crate) fn next(&self) -> u32 {
        self.link.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prev(&self, raw: u32) {
        self.link.prev.store(raw, Ordering::Relaxed);
    }

    pub(crate) fn set_next(&self, raw: u32) {
        self.link.next.store(raw, Ordering::Relaxed);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}
