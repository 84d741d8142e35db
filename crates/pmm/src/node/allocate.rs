//! 分配路径

use super::locks::FreeState;
use super::signal::ShouldWaitState;
use super::{AllocFailure, AllocFailureKind, AllocFlags, PmmNode};
use crate::arena::ArenaFlags;
use crate::page::{Page, PageId, PageState};
use crate::{PAGE_SIZE, PAGE_SIZE_SHIFT, PmmError, PmmResult};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

impl PmmNode {
    // FREE -> ALLOC，必须与摘链在同一次持锁内完成
    fn alloc_page_helper_locked(page: &Page) {
        debug_assert!(page.is_free() && !page.is_loaned());
        page.set_state(PageState::Alloc);
        page.set_owner(0);
    }

    fn report_pmm_failure_locked(&self, free: &mut FreeState, count: usize) {
        self.report_alloc_failure_locked(free, AllocFailure::new(AllocFailureKind::Pmm, count as u64));
    }

    /// 分配一个页。
    ///
    /// 带 `CAN_WAIT` 且当前处于延迟状态时返回 `ShouldWait`，不消耗页；
    /// 空闲链表为空时记录 OOM 并返回 `NoMemory`。
    pub fn alloc_page(&self, flags: AllocFlags) -> PmmResult<PageId> {
        let (page, had_fill_pattern) = {
            let mut free = self.locks.free();
            let had_fill_pattern = self.free_pages_filled();

            if flags.contains(AllocFlags::CAN_WAIT) && Self::should_delay_allocation_locked(&mut free) {
                self.alloc_delayed_count.fetch_add(1, Ordering::Relaxed);
                return Err(PmmError::ShouldWait);
            }

            let Some(page) = free.free_list.pop_head(&self.arenas) else {
                self.report_pmm_failure_locked(&mut free, 1);
                return Err(PmmError::NoMemory);
            };
            Self::alloc_page_helper_locked(page);
            self.decrement_free_count_locked(&mut free, 1);
            (page, had_fill_pattern)
        };

        // 锁外校验，缩短持锁时间
        if had_fill_pattern {
            self.checker.assert_pattern(page);
        }
        Ok(page.id())
    }

    /// 一次持锁分配 `count` 个页
    pub fn alloc_pages(&self, count: usize, flags: AllocFlags) -> PmmResult<Vec<PageId>> {
        match count {
            0 => return Ok(Vec::new()),
            1 => return self.alloc_page(flags).map(|id| alloc::vec![id]),
            _ => {}
        }

        let (pages, had_fill_pattern) = {
            let mut free = self.locks.free();
            let had_fill_pattern = self.free_pages_filled();
            let can_wait = flags.contains(AllocFlags::CAN_WAIT);

            if count as u64 > self.count_free_pages() {
                if can_wait && free.should_wait != ShouldWaitState::Never {
                    self.alloc_delayed_count.fetch_add(1, Ordering::Relaxed);
                    return Err(PmmError::ShouldWait);
                }
                self.report_pmm_failure_locked(&mut free, count);
                return Err(PmmError::NoMemory);
            }

            self.decrement_free_count_locked(&mut free, count as u64);

            // 扣减计数可能跌破水位，此时撤销扣减
            if can_wait && Self::should_delay_allocation_locked(&mut free) {
                self.increment_free_count_locked(&mut free, count as u64);
                self.alloc_delayed_count.fetch_add(1, Ordering::Relaxed);
                return Err(PmmError::ShouldWait);
            }

            let mut pages = Vec::with_capacity(count);
            for _ in 0..count {
                let page = match free.free_list.pop_head(&self.arenas) {
                    Some(page) => page,
                    None => panic!("free list shorter than free count"),
                };
                Self::alloc_page_helper_locked(page);
                pages.push(page);
            }
            (pages, had_fill_pattern)
        };

        if had_fill_pattern {
            for page in &pages {
                self.checker.assert_pattern(page);
            }
        }
        Ok(pages.into_iter().map(Page::id).collect())
    }

    /// 分配从 `paddr`（向下取整到页）开始的 `count` 个物理连续页。
    ///
    /// 任一页不空闲或是出借页都返回 `NotFound`，已经摘下的页会被放回。
    pub fn alloc_range(&self, paddr: u64, count: usize) -> PmmResult<Vec<PageId>> {
        log::trace!("PMM: alloc_range address {:#x}, count {}", paddr, count);
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut address = paddr & !(PAGE_SIZE as u64 - 1);

        let (pages, had_fill_pattern) = {
            let mut free = self.locks.free();
            let had_fill_pattern = self.free_pages_filled();
            let mut pages: Vec<&Page> = Vec::with_capacity(count);

            for arena in &self.arenas {
                while pages.len() < count && arena.address_in_arena(address) {
                    let Some(page) = arena.find_specific(address) else {
                        break;
                    };
                    // 出借页永远不会交给指定范围的分配
                    if !page.is_free() || page.is_loaned() {
                        break;
                    }
                    free.free_list.remove(&self.arenas, page);
                    Self::alloc_page_helper_locked(page);
                    pages.push(page);
                    self.decrement_free_count_locked(&mut free, 1);
                    address += PAGE_SIZE as u64;
                }
                if pages.len() == count {
                    break;
                }
            }

            if pages.len() != count {
                let filled = self.free_pages_filled();
                self.free_list_locked(&mut free, &pages, filled);
                return Err(PmmError::NotFound);
            }
            (pages, had_fill_pattern)
        };

        if had_fill_pattern {
            for page in &pages {
                self.checker.assert_pattern(page);
            }
        }
        Ok(pages.into_iter().map(Page::id).collect())
    }

    /// 分配 `count` 个物理连续、起始地址按 `1 << alignment_log2` 对齐的页。
    ///
    /// 不会使用出借页，也不会等待。返回起始物理地址和页列表。
    pub fn alloc_contiguous(
        &self,
        count: usize,
        flags: AllocFlags,
        alignment_log2: u32,
    ) -> PmmResult<(u64, Vec<PageId>)> {
        log::trace!("PMM: alloc_contiguous count {}, align {}", count, alignment_log2);
        if count == 0 {
            return Ok((0, Vec::new()));
        }
        let alignment_log2 = alignment_log2.max(PAGE_SIZE_SHIFT as u32);
        debug_assert!(!flags.contains(AllocFlags::CAN_WAIT));

        let mut free = self.locks.free();
        for arena in &self.arenas {
            if flags.contains(AllocFlags::LO_MEM) && !arena.flags().contains(ArenaFlags::LO_MEM) {
                continue;
            }
            let Some(start) = arena.find_free_contiguous(count, alignment_log2) else {
                continue;
            };

            let mut pages = Vec::with_capacity(count);
            for ix in start..start + count {
                let page = arena.page_at(ix);
                debug_assert!(page.is_free() && !page.is_loaned());
                free.free_list.remove(&self.arenas, page);
                page.set_state(PageState::Alloc);
                page.set_owner(0);
                self.decrement_free_count_locked(&mut free, 1);
                self.checker.assert_pattern(page);
                pages.push(page.id());
            }
            return Ok((arena.page_at(start).paddr(), pages));
        }

        log::trace!("PMM: couldn't find run");
        Err(PmmError::NotFound)
    }

    /// 从出借空闲链表分配一个页。
    ///
    /// `allocated` 在出借锁内执行，返回前必须把页转为 OBJECT 并设置反向链接。
    /// 出借池耗尽不算 OOM，返回 `NoResources`。
    pub fn alloc_loaned_page<F>(&self, allocated: F) -> PmmResult<PageId>
    where
        F: FnOnce(&Page),
    {
        let (page, had_fill_pattern) = {
            let mut loaned = self.locks.loaned();
            let had_fill_pattern = self.free_pages_filled();

            let Some(page) = loaned.free_loaned_list.pop_head(&self.arenas) else {
                return Err(PmmError::NoResources);
            };
            debug_assert!(page.is_free_loaned() && page.is_loaned());
            page.set_state(PageState::Alloc);
            page.set_owner(0);
            self.free_loaned_count.fetch_sub(1, Ordering::Relaxed);

            allocated(page);
            assert!(
                page.state() == PageState::Object && page.object() != 0,
                "loaned page {:#x} must have a backlink",
                page.paddr()
            );
            (page, had_fill_pattern)
        };

        if had_fill_pattern {
            self.checker.assert_pattern(page);
        }
        Ok(page.id())
    }
}
