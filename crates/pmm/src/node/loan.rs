//! 出借协议
//!
//! 页的所有者可以把自己的页“借”给全局分配器（[`PmmNode::begin_loan`]），
//! 之后分两步收回：
//!
//! 1. [`PmmNode::cancel_loan`]：禁止新的分配；若页正在出借空闲链表中，立即摘除
//! 2. [`PmmNode::end_loan`]：页确认已空闲后，转为普通空闲页
//!
//! # 延迟释放
//!
//! 释放仍带有反向链接的出借页时，页先进入调用者持有的
//! [`FreeLoanedPagesHolder`]，由 [`PmmNode::finish_free_loaned_pages`]
//! 在锁外完成填充后再并入出借空闲链表。在此期间，
//! [`PmmNode::with_loaned_page`] 会等待持有者完成，而不是在自旋锁里空转。

use super::PmmNode;
use crate::page::{Page, PageFlags, PageId, PageState};
use crate::page_list::{ListTag, PageList, resolve};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use sync::Event;

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

/// 出借锁下记录的持有者状态
pub(crate) struct HolderRecord {
    pages: PageList,
    /// 页并入出借空闲链表后置位；等待者各自持有一份引用
    freed: Arc<Event>,
    waiters: usize,
}

/// 出借页延迟释放的持有者。
///
/// 由调用者创建，依次调用 `begin_free_loaned_page` /
/// `begin_free_loaned_array` 放入页，最后必须调用
/// `finish_free_loaned_pages`，之后不能再使用。
#[derive(Debug)]
pub struct FreeLoanedPagesHolder {
    id: u64,
    used: bool,
    has_pages: bool,
}

impl FreeLoanedPagesHolder {
    /// 创建空的持有者
    pub fn new() -> Self {
        FreeLoanedPagesHolder {
            id: NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed),
            used: false,
            has_pages: false,
        }
    }

    /// 是否已经完成释放
    pub fn is_used(&self) -> bool {
        self.used
    }
}

impl Default for FreeLoanedPagesHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FreeLoanedPagesHolder {
    fn drop(&mut self) {
        debug_assert!(
            self.used || !self.has_pages,
            "holder dropped with pages still pending"
        );
    }
}

impl PmmNode {
    /// 把一组当前持有的页出借给全局分配器，并立即放入出借空闲链表
    pub fn begin_loan(&self, ids: &[PageId]) {
        let pages = resolve(&self.arenas, ids);
        let fill = self.is_free_fill_enabled_racy();
        if fill {
            for page in &pages {
                self.checker.fill_pattern(page);
            }
        }

        let mut loaned = self.locks.loaned();
        for page in &pages {
            debug_assert!(!page.is_loaned());
            debug_assert!(!page.is_free());
            page.insert_flags(PageFlags::LOANED);
            debug_assert!(!page.is_loan_cancelled());
        }
        self.loaned_count.fetch_add(pages.len() as u64, Ordering::Relaxed);
        self.free_loaned_list_locked(&mut loaned, &pages, fill, |_| {});
    }

    /// 取消出借，阻止该页被再次分配。重复取消是内核错误。
    pub fn cancel_loan(&self, id: PageId) {
        let page = self.page(id);
        let mut both = self.locks.lock_both();
        assert!(page.is_loaned(), "page {:#x} is not loaned", page.paddr());
        assert!(!page.is_free(), "loaned page {:#x} is in the free state", page.paddr());
        assert!(
            !page.is_loan_cancelled(),
            "loan of page {:#x} cancelled twice",
            page.paddr()
        );
        page.insert_flags(PageFlags::LOAN_CANCELLED);
        self.loan_cancelled_count.fetch_add(1, Ordering::Relaxed);
        if page.is_free_loaned() {
            both.loaned.free_loaned_list.remove(&self.arenas, page);
            self.free_loaned_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// 结束出借：已取消且已空闲的页转为普通空闲页
    pub fn end_loan(&self, id: PageId) {
        let page = self.page(id);
        let mut both = self.locks.lock_both();
        assert!(page.is_loaned(), "page {:#x} is not loaned", page.paddr());
        assert!(
            page.is_loan_cancelled(),
            "loan of page {:#x} ended without being cancelled",
            page.paddr()
        );
        assert!(
            page.is_free_loaned(),
            "loan of page {:#x} ended while the page is in use",
            page.paddr()
        );
        debug_assert!(!page.in_list());

        page.remove_flags(PageFlags::LOANED | PageFlags::LOAN_CANCELLED);
        // 变成出借空闲页时已经完成了填充，这里只改状态
        page.set_state(PageState::Free);
        page.set_owner(0);
        self.return_to_free_list_locked(&mut both.free, page);
        self.increment_free_count_locked(&mut both.free, 1);

        self.loan_cancelled_count.fetch_sub(1, Ordering::Relaxed);
        self.loaned_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// 开始释放一个仍带有反向链接的出借页。
    ///
    /// `release_page` 在出借锁内执行，必须清除页的反向链接（OBJECT -> ALLOC）。
    /// 随后页进入 `holder`，直到 [`finish_free_loaned_pages`](Self::finish_free_loaned_pages)。
    pub fn begin_free_loaned_page<F>(&self, id: PageId, release_page: F, holder: &mut FreeLoanedPagesHolder)
    where
        F: FnOnce(&Page),
    {
        let page = self.page(id);
        debug_assert!(page.is_loaned());
        debug_assert!(page.state() == PageState::Object && page.object() != 0);

        let mut loaned = self.locks.loaned();
        release_page(page);
        debug_assert!(!page.in_list());
        debug_assert!(!holder.used);

        page.set_state(PageState::Alloc);
        page.set_owner(holder.id);
        Self::holder_record(&mut loaned.holders, holder.id)
            .pages
            .push_head(&self.arenas, page);
        holder.has_pages = true;
    }

    /// 批量版本的 [`begin_free_loaned_page`](Self::begin_free_loaned_page)。
    ///
    /// `release_list` 在出借锁内执行，必须按原顺序返回全部页。
    pub fn begin_free_loaned_array<F>(&self, ids: &[PageId], release_list: F, holder: &mut FreeLoanedPagesHolder)
    where
        F: FnOnce(&[PageId]) -> Vec<PageId>,
    {
        debug_assert!(ids.iter().all(|&id| {
            let page = self.page(id);
            page.state() == PageState::Object && page.object() != 0
        }));

        let mut loaned = self.locks.loaned();
        debug_assert!(!holder.used);
        let released = release_list(ids);
        assert_eq!(released.as_slice(), ids, "release callback reordered pages");

        if released.is_empty() {
            return;
        }
        let pages = resolve(&self.arenas, &released);
        for page in &pages {
            page.set_state(PageState::Alloc);
            page.set_owner(holder.id);
        }
        let record = Self::holder_record(&mut loaned.holders, holder.id);
        record.pages.splice_tail(&self.arenas, &pages);
        holder.has_pages |= !record.pages.is_empty();
    }

    fn holder_record(holders: &mut BTreeMap<u64, HolderRecord>, id: u64) -> &mut HolderRecord {
        holders.entry(id).or_insert_with(|| HolderRecord {
            pages: PageList::new(ListTag::Holder),
            freed: Arc::new(Event::new(false)),
            waiters: 0,
        })
    }

    /// 把持有者中的页并入出借空闲链表，并唤醒等待这些页的线程
    pub fn finish_free_loaned_pages(&self, holder: &mut FreeLoanedPagesHolder) {
        if !holder.has_pages {
            return;
        }

        // 锁外填充：此时页仍归持有者所有，不会被其它路径访问
        let fill = self.is_free_fill_enabled_racy();
        if fill {
            let loaned = self.locks.loaned();
            let pages: Vec<&Page> = match loaned.holders.get(&holder.id) {
                Some(record) => record.pages.iter(&self.arenas).collect(),
                None => Vec::new(),
            };
            drop(loaned);
            for page in pages {
                self.checker.fill_pattern(page);
            }
        }

        let mut loaned = self.locks.loaned();
        debug_assert!(!holder.used);
        holder.used = true;
        let Some(mut record) = loaned.holders.remove(&holder.id) else {
            return;
        };
        let pages = record.pages.drain(&self.arenas);
        let holder_id = holder.id;
        self.free_loaned_list_locked(&mut loaned, &pages, fill, |page| {
            debug_assert_eq!(page.state(), PageState::Alloc);
            debug_assert_eq!(page.owner(), holder_id);
            page.set_owner(0);
        });
        // 持锁时已摘除全部页，此刻的等待者就是全部等待者
        if record.waiters > 0 {
            record.freed.signal();
        }
    }

    /// 在页处于稳定状态时执行 `with_page`。
    ///
    /// 如果页正在某个持有者中等待释放，则阻塞直到释放完成。
    pub fn with_loaned_page<F>(&self, id: PageId, with_page: F)
    where
        F: FnOnce(&Page),
    {
        let page = self.page(id);
        let mut with_page = Some(with_page);
        let mut iterations = 0;
        loop {
            let freed = {
                let mut loaned = self.locks.loaned();
                debug_assert!(page.is_loaned());
                let owner = page.owner();
                if page.state() != PageState::Alloc || owner == 0 {
                    if let Some(f) = with_page.take() {
                        f(page);
                    }
                    return;
                }
                match loaned.holders.get_mut(&owner) {
                    Some(record) => {
                        record.waiters += 1;
                        record.freed.clone()
                    }
                    None => panic!("loaned page {:#x} held by unknown holder {}", page.paddr(), owner),
                }
            };
            if iterations > 0 {
                log::warn!(
                    "PMM: required multiple attempts ({}) to track down loaned page {:#x}",
                    iterations,
                    page.paddr()
                );
            }
            // 持有者在持锁摘页后才置位，等待不会丢失唤醒
            freed.wait_forever();
            iterations += 1;
        }
    }
}
