//! 以页索引链接的页链表
//!
//! 链接字段存放在 [`Page`] 记录中（压缩页索引，0 表示无），链表本身只记录头、尾和长度。
//! 每个页同一时刻至多挂在一个链表上，由 [`ListTag`] 标明；
//! 所有修改都必须在持有该链表所属的锁时进行。

use crate::arena::{PmmArena, page_ref};
use crate::page::{Page, PageId};

/// 页所在链表的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ListTag {
    /// 不在任何链表中
    None = 0,
    /// 全局空闲链表
    Free = 1,
    /// 出借空闲链表
    FreeLoaned = 2,
    /// 延迟释放持有者的链表
    Holder = 3,
    /// 启动时保留的页
    Reserved = 4,
}

impl ListTag {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ListTag::Free,
            2 => ListTag::FreeLoaned,
            3 => ListTag::Holder,
            4 => ListTag::Reserved,
            _ => ListTag::None,
        }
    }
}

/// 双向页链表
pub(crate) struct PageList {
    tag: ListTag,
    head: u32,
    tail: u32,
    len: usize,
}

impl PageList {
    pub(crate) const fn new(tag: ListTag) -> Self {
        PageList {
            tag,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn link(&self, page: &Page) {
        assert_eq!(
            page.list_tag(),
            ListTag::None,
            "page {:#x} is already on a list",
            page.paddr()
        );
        page.set_list_tag(self.tag);
    }

    pub(crate) fn push_head(&mut self, arenas: &[PmmArena], page: &Page) {
        self.link(page);
        let raw = page.id().raw();
        page.set_prev(0);
        page.set_next(self.head);
        if self.head != 0 {
            page_ref(arenas, self.head).set_prev(raw);
        } else {
            self.tail = raw;
        }
        self.head = raw;
        self.len += 1;
    }

    pub(crate) fn push_tail(&mut self, arenas: &[PmmArena], page: &Page) {
        self.link(page);
        let raw = page.id().raw();
        page.set_next(0);
        page.set_prev(self.tail);
        if self.tail != 0 {
            page_ref(arenas, self.tail).set_next(raw);
        } else {
            self.head = raw;
        }
        self.tail = raw;
        self.len += 1;
    }

    /// 从链表中摘除指定页
    pub(crate) fn remove(&mut self, arenas: &[PmmArena], page: &Page) {
        assert_eq!(
            page.list_tag(),
            self.tag,
            "page {:#x} is not on this list",
            page.paddr()
        );
        let (prev, next) = (page.prev(), page.next());
        if prev != 0 {
            page_ref(arenas, prev).set_next(next);
        } else {
            self.head = next;
        }
        if next != 0 {
            page_ref(arenas, next).set_prev(prev);
        } else {
            self.tail = prev;
        }
        page.set_prev(0);
        page.set_next(0);
        page.set_list_tag(ListTag::None);
        self.len -= 1;
    }

    pub(crate) fn peek_head<'a>(&self, arenas: &'a [PmmArena]) -> Option<&'a Page> {
        (self.head != 0).then(|| page_ref(arenas, self.head))
    }

    pub(crate) fn pop_head<'a>(&mut self, arenas: &'a [PmmArena]) -> Option<&'a Page> {
        let page = self.peek_head(arenas)?;
        self.remove(arenas, page);
        Some(page)
    }

    /// 把一组页按原顺序接到链表尾部
    pub(crate) fn splice_tail(&mut self, arenas: &[PmmArena], pages: &[&Page]) {
        for page in pages {
            self.push_tail(arenas, page);
        }
    }

    /// 摘除链表中的全部页，按顺序返回
    pub(crate) fn drain<'a>(&mut self, arenas: &'a [PmmArena]) -> alloc::vec::Vec<&'a Page> {
        let mut pages = alloc::vec::Vec::with_capacity(self.len);
        while let Some(page) = self.pop_head(arenas) {
            pages.push(page);
        }
        pages
    }

    pub(crate) fn iter<'a>(&self, arenas: &'a [PmmArena]) -> Iter<'a> {
        Iter {
            arenas,
            next: self.head,
        }
    }
}

/// 链表迭代器
pub(crate) struct Iter<'a> {
    arenas: &'a [PmmArena],
    next: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Page;

    fn next(&mut self) -> Option<&'a Page> {
        if self.next == 0 {
            return None;
        }
        let page = page_ref(self.arenas, self.next);
        self.next = page.next();
        Some(page)
    }
}

/// 把一组页 ID 解析为页记录
pub(crate) fn resolve<'a>(arenas: &'a [PmmArena], ids: &[PageId]) -> alloc::vec::Vec<&'a Page> {
    ids.iter().map(|id| page_ref(arenas, id.raw())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaFlags, ArenaInfo};
    use alloc::vec::Vec;

    fn arena(pages: usize) -> Vec<PmmArena> {
        let info = ArenaInfo::new("list", ArenaFlags::empty(), 0x10_0000, (pages * crate::PAGE_SIZE) as u64);
        alloc::vec![PmmArena::new(info, 0).unwrap()]
    }

    fn paddrs(list: &PageList, arenas: &[PmmArena]) -> Vec<u64> {
        list.iter(arenas).map(|p| p.paddr()).collect()
    }

    #[test]
    fn test_push_pop_order() {
        let arenas = arena(4);
        let mut list = PageList::new(ListTag::Free);
        list.push_tail(&arenas, arenas[0].page_at(1));
        list.push_head(&arenas, arenas[0].page_at(0));
        list.push_tail(&arenas, arenas[0].page_at(2));
        assert_eq!(list.len(), 3);
        assert_eq!(paddrs(&list, &arenas), [0x10_0000, 0x10_1000, 0x10_2000]);

        let head = list.pop_head(&arenas).unwrap();
        assert_eq!(head.paddr(), 0x10_0000);
        assert!(!head.in_list());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let arenas = arena(4);
        let mut list = PageList::new(ListTag::Free);
        for i in 0..4 {
            list.push_tail(&arenas, arenas[0].page_at(i));
        }
        list.remove(&arenas, arenas[0].page_at(1));
        list.remove(&arenas, arenas[0].page_at(3));
        assert_eq!(paddrs(&list, &arenas), [0x10_0000, 0x10_2000]);
        list.remove(&arenas, arenas[0].page_at(0));
        list.remove(&arenas, arenas[0].page_at(2));
        assert!(list.is_empty());
        assert!(list.peek_head(&arenas).is_none());
    }

    #[test]
    fn test_splice_keeps_order() {
        let arenas = arena(5);
        let mut list = PageList::new(ListTag::Free);
        list.push_tail(&arenas, arenas[0].page_at(4));
        let batch = [arenas[0].page_at(0), arenas[0].page_at(1)];
        list.splice_tail(&arenas, &batch);
        list.push_head(&arenas, arenas[0].page_at(2));
        assert_eq!(paddrs(&list, &arenas), [0x10_2000, 0x10_4000, 0x10_0000, 0x10_1000]);
        assert_eq!(list.drain(&arenas).len(), 4);
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "already on a list")]
    fn test_double_link_panics() {
        let arenas = arena(1);
        let mut free = PageList::new(ListTag::Free);
        let mut loaned = PageList::new(ListTag::FreeLoaned);
        free.push_head(&arenas, arenas[0].page_at(0));
        loaned.push_head(&arenas, arenas[0].page_at(0));
    }
}
