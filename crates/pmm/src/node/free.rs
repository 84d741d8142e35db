//! 释放路径
//!
//! 普通页回到空闲链表（空闲锁），出借页回到出借空闲链表（出借锁）。
//! 填充图案尽量在锁外完成；若与启用填充发生竞争，则在锁内补填。

use super::PmmNode;
use super::locks::{FreeState, LoanedState};
use crate::page::{Page, PageId, PageState};
use crate::page_list::resolve;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

impl PmmNode {
    fn free_page_helper_locked(&self, page: &Page, already_filled: bool) {
        assert!(
            !page.is_free() && !page.is_free_loaned(),
            "double free of page {:#x}",
            page.paddr()
        );
        debug_assert!(page.state() != PageState::Object || page.object() == 0);
        page.set_state(PageState::Free);
        assert!(!page.is_loaned(), "loaned page {:#x} freed as a regular page", page.paddr());
        // 填充只能从关到开，锁内的宽松读取足够
        if self.free_fill_enabled.load(Ordering::Relaxed) && !already_filled {
            self.checker.fill_pattern(page);
        }
    }

    fn free_loaned_page_helper_locked(&self, page: &Page, already_filled: bool) {
        assert!(
            !page.is_free() && !page.is_free_loaned(),
            "double free of loaned page {:#x}",
            page.paddr()
        );
        debug_assert!(page.state() != PageState::Object || page.object() == 0);
        debug_assert!(page.state() != PageState::Alloc || page.owner() == 0);
        page.set_state(PageState::FreeLoaned);
        if !already_filled && self.free_fill_enabled.load(Ordering::Relaxed) {
            self.checker.fill_pattern(page);
        }
    }

    pub(super) fn return_to_free_list_locked(&self, free: &mut FreeState, page: &Page) {
        // 放在尾部以拉长复用间隔，便于发现悬空引用
        if cfg!(feature = "reuse-distance") {
            free.free_list.push_tail(&self.arenas, page);
        } else {
            free.free_list.push_head(&self.arenas, page);
        }
    }

    pub(super) fn free_list_locked(&self, free: &mut FreeState, pages: &[&Page], already_filled: bool) {
        for page in pages {
            debug_assert!(!page.is_loaned());
            self.free_page_helper_locked(page, already_filled);
            self.return_to_free_list_locked(free, page);
        }
        self.increment_free_count_locked(free, pages.len() as u64);
    }

    /// 把出借页放回出借空闲链表。
    ///
    /// 已取消出借的页转为 FREE_LOANED 但不进入任何链表，也不计数，
    /// 等待 `end_loan` 收回。
    pub(super) fn free_loaned_list_locked<F>(
        &self,
        loaned: &mut LoanedState,
        pages: &[&Page],
        already_filled: bool,
        mut validator: F,
    ) where
        F: FnMut(&Page),
    {
        let mut count = 0;
        for page in pages {
            validator(page);
            assert!(page.is_loaned(), "page {:#x} is not loaned", page.paddr());
            self.free_loaned_page_helper_locked(page, already_filled);
            if !page.is_loan_cancelled() {
                loaned.free_loaned_list.push_head(&self.arenas, page);
                count += 1;
            }
        }
        self.free_loaned_count.fetch_add(count, Ordering::Relaxed);
    }

    /// 释放一个普通页
    pub fn free_page(&self, id: PageId) {
        let page = self.page(id);
        assert!(!page.is_loaned(), "loaned page {:#x} freed as a regular page", page.paddr());
        let fill = self.is_free_fill_enabled_racy();
        if fill {
            self.checker.fill_pattern(page);
        }
        let mut free = self.locks.free();
        self.free_page_helper_locked(page, fill);
        self.increment_free_count_locked(&mut free, 1);
        self.return_to_free_list_locked(&mut free, page);
    }

    /// 释放一组页，出借页自动走出借释放路径
    pub fn free_list(&self, ids: &[PageId]) {
        if ids.is_empty() {
            return;
        }
        let (loaned, regular): (Vec<&Page>, Vec<&Page>) =
            resolve(&self.arenas, ids).into_iter().partition(|p| p.is_loaned());

        let fill = self.is_free_fill_enabled_racy();
        if fill {
            for page in loaned.iter().chain(regular.iter()) {
                self.checker.fill_pattern(page);
            }
        }

        if !regular.is_empty() {
            let mut free = self.locks.free();
            self.free_list_locked(&mut free, &regular, fill);
        }
        if !loaned.is_empty() {
            let mut state = self.locks.loaned();
            self.free_loaned_list_locked(&mut state, &loaned, fill, |page| {
                debug_assert!(page.owner() == 0, "loaned page {:#x} is held for deferred free", page.paddr());
            });
        }
    }
}
