//! 物理内存 arena
//!
//! arena 是启动时确定的一段连续物理页，之后不再变化。
//! 它拥有这段内存中每个页的 [`Page`] 记录（slab），但不持有任何分配状态：
//! 页属于哪个链表由 [`PmmNode`](crate::PmmNode) 在锁内维护。

use crate::page::{MAX_PAGES_PER_ARENA, Page, PageId, PageState};
use crate::{PAGE_SIZE, PAGE_SIZE_SHIFT, PmmError, PmmResult};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// arena 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArenaFlags: u32 {
        /// 低端内存，可满足 `AllocFlags::LO_MEM` 的连续分配
        const LO_MEM = 1 << 0;
    }
}

/// arena 描述信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaInfo {
    /// 名称
    pub name: &'static str,
    /// 标志
    pub flags: ArenaFlags,
    /// 起始物理地址（页对齐）
    pub base: u64,
    /// 大小（字节，页对齐）
    pub size: u64,
}

impl ArenaInfo {
    /// 创建 arena 描述
    pub const fn new(name: &'static str, flags: ArenaFlags, base: u64, size: u64) -> Self {
        ArenaInfo {
            name,
            flags,
            base,
            size,
        }
    }

    /// 结束地址（不包含）
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// 各页状态的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStateCounts {
    counts: [u64; PageState::COUNT],
}

impl PageStateCounts {
    /// 处于 `state` 的页数
    pub fn get(&self, state: PageState) -> u64 {
        self.counts[state as usize]
    }

    /// 所有页数之和
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn add(&mut self, state: PageState) {
        self.counts[state as usize] += 1;
    }

    /// 累加另一组计数
    pub fn merge(&mut self, other: &PageStateCounts) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
    }

    pub(crate) fn log(&self) {
        log::info!(
            "  free {} free_loaned {} alloc {} object {} wired {}",
            self.get(PageState::Free),
            self.get(PageState::FreeLoaned),
            self.get(PageState::Alloc),
            self.get(PageState::Object),
            self.get(PageState::Wired),
        );
    }
}

/// 物理内存 arena
pub struct PmmArena {
    info: ArenaInfo,
    index: usize,
    pages: Vec<Page>,
}

impl PmmArena {
    /// 按描述创建 arena，并为每个页建立 FREE 状态的记录。
    ///
    /// `index` 是 arena 在节点中的编号，会编码进页索引。
    pub(crate) fn new(info: ArenaInfo, index: usize) -> PmmResult<Self> {
        let page_mask = (PAGE_SIZE - 1) as u64;
        if info.size == 0 || info.base & page_mask != 0 || info.size & page_mask != 0 {
            return Err(PmmError::InvalidArgs);
        }
        let page_count = (info.size >> PAGE_SIZE_SHIFT) as usize;
        if page_count > MAX_PAGES_PER_ARENA {
            return Err(PmmError::NotSupported);
        }
        let pages = (0..page_count)
            .map(|ix| Page::new(PageId::new(index, ix), info.base + (ix << PAGE_SIZE_SHIFT) as u64))
            .collect();
        Ok(PmmArena { info, index, pages })
    }

    /// arena 描述
    pub fn info(&self) -> ArenaInfo {
        self.info
    }

    /// 名称
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    /// 标志
    pub fn flags(&self) -> ArenaFlags {
        self.info.flags
    }

    /// 起始物理地址
    pub fn base(&self) -> u64 {
        self.info.base
    }

    /// 大小（字节）
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// 结束地址（不包含）
    pub fn end(&self) -> u64 {
        self.info.end()
    }

    /// 页数
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// arena 编号
    pub fn index(&self) -> usize {
        self.index
    }

    /// 地址是否落在本 arena 内
    pub fn address_in_arena(&self, paddr: u64) -> bool {
        paddr >= self.base() && paddr < self.end()
    }

    /// 按物理地址查找页记录
    pub fn find_specific(&self, paddr: u64) -> Option<&Page> {
        if !self.address_in_arena(paddr) {
            return None;
        }
        let ix = ((paddr - self.base()) >> PAGE_SIZE_SHIFT) as usize;
        self.pages.get(ix)
    }

    pub(crate) fn page_at(&self, ix: usize) -> &Page {
        &self.pages[ix]
    }

    pub(crate) fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// 查找 `count` 个连续的、FREE 且非出借的页，起始地址按 `1 << alignment_log2` 对齐。
    ///
    /// 返回起始页在 arena 内的页号。调用者必须持有空闲链表锁，
    /// 否则 FREE 状态随时可能变化。
    pub(crate) fn find_free_contiguous(&self, count: usize, alignment_log2: u32) -> Option<usize> {
        let total = self.pages.len();
        if count == 0 || count > total {
            return None;
        }
        // 对齐超出地址宽度时不可能满足
        let mask = 1u64.checked_shl(alignment_log2)?.wrapping_sub(1);

        // 从对齐边界开始查找
        let mut ix = 0;
        while ix < total {
            let paddr = self.base() + (ix << PAGE_SIZE_SHIFT) as u64;
            let aligned = paddr.checked_add(mask)? & !mask;
            let aligned_ix = (aligned - self.base()) >> PAGE_SIZE_SHIFT;
            if aligned_ix > (total - count) as u64 {
                break;
            }
            let aligned_ix = aligned_ix as usize;

            // 检查从 aligned_ix 开始的 count 个页是否都可用
            match (0..count).find(|&i| {
                let page = &self.pages[aligned_ix + i];
                !page.is_free() || page.is_loaned()
            }) {
                Some(busy) => ix = aligned_ix + busy + 1,
                None => return Some(aligned_ix),
            }
        }

        None
    }

    /// 统计本 arena 中各状态的页数
    pub fn count_states(&self) -> PageStateCounts {
        let mut counts = PageStateCounts::default();
        for page in &self.pages {
            counts.add(page.state());
        }
        counts
    }

    pub(crate) fn dump(&self, sum: &mut PageStateCounts) {
        let counts = self.count_states();
        log::info!(
            "arena {} '{}': base {:#x} size {:#x} ({} pages) flags {:?}",
            self.index,
            self.name(),
            self.base(),
            self.size(),
            self.page_count(),
            self.flags(),
        );
        counts.log();
        sum.merge(&counts);
    }
}

/// 按压缩页索引查找页记录
///
/// # Panics
/// 索引不属于任何 arena 时 panic
pub(crate) fn page_ref(arenas: &[PmmArena], raw: u32) -> &Page {
    let id = match PageId::from_raw(raw) {
        Some(id) => id,
        None => panic!("pmm: null page index"),
    };
    arenas[id.arena_index()].page_at(id.page_index())
}
