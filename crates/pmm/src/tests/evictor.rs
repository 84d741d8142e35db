use super::*;
use crate::evictor::{
    Compressor, EvictionHintAction, EvictionLevel, EvictionTarget, EvictionTypes, Evictor,
    EvictorStats, Output, PageCompression, PageQueues, ReclaimableObject, TriggerReason,
    VmoBacklink,
};
use crate::node::AllocFlags;
use crate::page::PageId;
use crate::{PmmError, PmmResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeQueues {
    queue: Mutex<VecDeque<VmoBacklink>>,
    accessed: Mutex<Vec<PageId>>,
    peeks: Mutex<Vec<usize>>,
}

impl FakeQueues {
    fn push(&self, object: Arc<FakeObject>, page: PageId) {
        self.queue.lock().unwrap().push_back(VmoBacklink {
            object: Some(object),
            page,
            offset: 0,
        });
    }

    fn push_orphan(&self, page: PageId) {
        self.queue.lock().unwrap().push_back(VmoBacklink {
            object: None,
            page,
            offset: 0,
        });
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn peek_count(&self) -> usize {
        self.peeks.lock().unwrap().len()
    }

    fn last_lowest_queue(&self) -> Option<usize> {
        self.peeks.lock().unwrap().last().copied()
    }
}

impl PageQueues for FakeQueues {
    fn peek_reclaim(&self, lowest_queue: usize) -> Option<VmoBacklink> {
        self.peeks.lock().unwrap().push(lowest_queue);
        self.queue.lock().unwrap().pop_front()
    }

    fn mark_accessed(&self, page: PageId) {
        self.accessed.lock().unwrap().push(page);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    PagerBacked,
    Discardable,
    Anonymous,
}

struct FakeObject {
    node: Arc<PmmNode>,
    kind: Kind,
    /// 页上带有“始终需要”提示
    always_need: bool,
    last_hint: Mutex<Option<EvictionHintAction>>,
}

impl FakeObject {
    fn new(node: &Arc<PmmNode>, kind: Kind) -> Arc<Self> {
        Arc::new(FakeObject {
            node: node.clone(),
            kind,
            always_need: false,
            last_hint: Mutex::new(None),
        })
    }
}

impl ReclaimableObject for FakeObject {
    fn is_discardable(&self) -> bool {
        self.kind == Kind::Discardable
    }

    fn can_evict(&self) -> bool {
        self.kind == Kind::PagerBacked
    }

    fn reclaim_page(
        &self,
        page: PageId,
        _offset: u64,
        hint: EvictionHintAction,
        freed: &mut Vec<PageId>,
        compressor: Option<&dyn Compressor>,
    ) -> u64 {
        *self.last_hint.lock().unwrap() = Some(hint);
        if self.always_need && hint == EvictionHintAction::Follow {
            return 0;
        }
        if self.kind == Kind::Anonymous && compressor.is_none() {
            return 0;
        }
        self.node.page(page).clear_object();
        freed.push(page);
        1
    }
}

struct FakeCompressor {
    fail: bool,
}

impl Compressor for FakeCompressor {
    fn arm(&self) -> PmmResult<()> {
        if self.fail { Err(PmmError::NoMemory) } else { Ok(()) }
    }
}

struct FakeCompression {
    fail: bool,
}

impl PageCompression for FakeCompression {
    fn acquire_compressor(&self) -> Box<dyn Compressor> {
        Box::new(FakeCompressor { fail: self.fail })
    }
}

struct Fixture {
    node: Arc<PmmNode>,
    queues: Arc<FakeQueues>,
    evictor: Evictor,
}

impl Fixture {
    fn new(pages: usize) -> Self {
        Self::with_types(pages, EvictionTypes::all())
    }

    fn with_types(pages: usize, types: EvictionTypes) -> Self {
        let node = Arc::new(new_node(pages));
        let queues = Arc::new(FakeQueues::default());
        let evictor = Evictor::with_types(node.clone(), queues.clone(), types);
        Fixture { node, queues, evictor }
    }

    /// 分配 `count` 个页交给同一个对象，并放入可回收队列
    fn populate(&self, count: usize, kind: Kind) -> Vec<PageId> {
        let object = FakeObject::new(&self.node, kind);
        let pages = self.node.alloc_pages(count, AllocFlags::empty()).unwrap();
        for &id in &pages {
            self.node.page(id).set_object(0x1000);
            self.queues.push(object.clone(), id);
        }
        pages
    }
}

const PAGE: u64 = PAGE_SIZE as u64;

#[test]
fn test_disabled_evictor_does_nothing() {
    let f = Fixture::new(32);
    f.populate(8, Kind::PagerBacked);
    assert!(!f.evictor.is_eviction_enabled());
    let evicted =
        f.evictor.evict_one_shot_synchronous(8 * PAGE, EvictionLevel::OnlyOldest, Output::NoPrint, TriggerReason::Other);
    assert_eq!(evicted, 0);
    assert_eq!(f.queues.peek_count(), 0);
    assert_eq!(f.node.count_free_pages(), 24);
}

#[test]
fn test_evicts_only_what_is_reclaimable() {
    let f = Fixture::new(100);
    f.populate(50, Kind::PagerBacked);
    f.evictor.enable_without_thread(false);

    let evicted = f.evictor.evict_one_shot_synchronous(
        100 * PAGE,
        EvictionLevel::OnlyOldest,
        Output::Print,
        TriggerReason::Other,
    );
    assert_eq!(evicted, 50);
    assert_eq!(f.node.count_free_pages(), 100);
    assert_eq!(f.evictor.debug_get_one_shot_eviction_target(), EvictionTarget::default());
    assert_page_accounting(&f.node);
}

#[test]
fn test_empty_queue_stops_after_one_peek() {
    let f = Fixture::new(16);
    f.evictor.enable_without_thread(false);
    let counts = f.evictor.evict_until_targets_met(10, 0, EvictionLevel::OnlyOldest);
    assert_eq!(counts.non_loaned(), 0);
    assert_eq!(f.queues.peek_count(), 1);
}

#[test]
fn test_dead_objects_are_skipped() {
    let f = Fixture::new(16);
    f.evictor.enable_without_thread(false);
    let held = f.node.alloc_page(AllocFlags::empty()).unwrap();
    f.queues.push_orphan(held);
    f.populate(2, Kind::PagerBacked);
    let counts = f.evictor.evict_page_queues(2, EvictionLevel::OnlyOldest);
    assert_eq!(counts.pager_backed, 2);
    assert_eq!(f.queues.peek_count(), 3);
}

#[test]
fn test_free_pages_target() {
    let f = Fixture::new(100);
    f.populate(60, Kind::PagerBacked);
    f.evictor.enable_without_thread(false);

    let counts = f.evictor.evict_until_targets_met(0, 70, EvictionLevel::OnlyOldest);
    assert_eq!(counts.pager_backed, 30);
    assert_eq!(f.node.count_free_pages(), 70);
    assert_eq!(f.queues.len(), 30);

    // 目标已满足时不再回收
    let counts = f.evictor.evict_until_targets_met(0, 70, EvictionLevel::OnlyOldest);
    assert_eq!(counts.non_loaned(), 0);
    assert_eq!(f.queues.len(), 30);
}

#[test]
fn test_level_selects_queues_and_hint() {
    let f = Fixture::new(16);
    f.evictor.enable_without_thread(false);
    let object = Arc::new(FakeObject {
        node: f.node.clone(),
        kind: Kind::PagerBacked,
        always_need: true,
        last_hint: Mutex::new(None),
    });
    let page = f.node.alloc_page(AllocFlags::empty()).unwrap();
    f.node.page(page).set_object(0x1000);

    f.queues.push(object.clone(), page);
    let counts = f.evictor.evict_page_queues(1, EvictionLevel::OnlyOldest);
    assert_eq!(counts.pager_backed, 0);
    assert_eq!(f.queues.last_lowest_queue(), Some(6));
    assert_eq!(*object.last_hint.lock().unwrap(), Some(EvictionHintAction::Follow));

    f.queues.push(object.clone(), page);
    let counts = f.evictor.evict_page_queues(1, EvictionLevel::IncludeNewest);
    assert_eq!(counts.pager_backed, 1);
    assert_eq!(f.queues.last_lowest_queue(), Some(2));
    assert_eq!(*object.last_hint.lock().unwrap(), Some(EvictionHintAction::Ignore));
}

#[test]
fn test_loaned_pages_counted_separately() {
    let f = Fixture::new(32);
    f.evictor.enable_without_thread(false);
    let lent = f.node.alloc_pages(4, AllocFlags::empty()).unwrap();
    f.node.begin_loan(&lent);

    let object = FakeObject::new(&f.node, Kind::PagerBacked);
    for i in 0..4 {
        let id = f.node.alloc_loaned_page(|p| p.set_object(0x2000 + i)).unwrap();
        f.queues.push(object.clone(), id);
    }
    f.populate(2, Kind::PagerBacked);

    let counts = f.evictor.evict_page_queues(10, EvictionLevel::OnlyOldest);
    assert_eq!(counts.pager_backed_loaned, 4);
    assert_eq!(counts.pager_backed, 2);
    assert_eq!(counts.non_loaned(), 2);
    // 出借页回到出借空闲链表
    assert_eq!(f.node.count_loaned_free_pages(), 4);
    assert_eq!(f.node.count_free_pages(), 28);
    assert_page_accounting(&f.node);
}

#[test]
fn test_eviction_types_filter() {
    let f = Fixture::with_types(16, EvictionTypes::PAGER_BACKED);
    f.evictor.enable_without_thread(false);
    let skipped = f.populate(1, Kind::Discardable);
    f.populate(1, Kind::PagerBacked);

    let counts = f.evictor.evict_page_queues(1, EvictionLevel::OnlyOldest);
    assert_eq!(counts.pager_backed, 1);
    assert_eq!(counts.discardable, 0);
    assert_eq!(*f.queues.accessed.lock().unwrap(), skipped);
}

#[test]
fn test_discardable_pages() {
    let f = Fixture::new(16);
    f.evictor.enable_without_thread(false);
    f.populate(3, Kind::Discardable);
    let counts = f.evictor.evict_until_targets_met(3, 0, EvictionLevel::OnlyOldest);
    assert_eq!(counts.discardable, 3);
    assert_eq!(f.node.count_free_pages(), 16);
}

#[test]
fn test_anonymous_pages_need_compression() {
    let f = Fixture::new(16);
    f.node.set_page_compression(Arc::new(FakeCompression { fail: false })).unwrap();
    assert_eq!(
        f.node.set_page_compression(Arc::new(FakeCompression { fail: false })).err(),
        Some(PmmError::AlreadyExists)
    );

    f.evictor.enable_without_thread(false);
    f.populate(4, Kind::Anonymous);
    let counts = f.evictor.evict_page_queues(4, EvictionLevel::OnlyOldest);
    assert_eq!(counts.compressed, 0);

    f.evictor.enable_without_thread(true);
    assert!(f.evictor.is_compression_enabled());
    f.populate(4, Kind::Anonymous);
    let counts = f.evictor.evict_page_queues(4, EvictionLevel::OnlyOldest);
    assert_eq!(counts.compressed, 4);
    assert_eq!(f.evictor.stats().compression_other, 4);
}

#[test]
fn test_compressor_arm_failure_ends_pass() {
    let f = Fixture::new(16);
    f.node.set_page_compression(Arc::new(FakeCompression { fail: true })).unwrap();
    f.evictor.enable_without_thread(true);
    f.populate(4, Kind::PagerBacked);

    let counts = f.evictor.evict_page_queues(4, EvictionLevel::OnlyOldest);
    assert_eq!(counts.non_loaned(), 0);
    assert_eq!(f.queues.peek_count(), 1);
}

#[test]
fn test_stats_split_by_trigger() {
    let f = Fixture::new(64);
    f.evictor.enable_without_thread(false);

    f.populate(5, Kind::PagerBacked);
    f.populate(2, Kind::Discardable);
    f.evictor.evict_one_shot_synchronous(7 * PAGE, EvictionLevel::OnlyOldest, Output::NoPrint, TriggerReason::Oom);
    f.populate(3, Kind::PagerBacked);
    f.evictor.evict_one_shot_synchronous(3 * PAGE, EvictionLevel::OnlyOldest, Output::NoPrint, TriggerReason::Other);

    assert_eq!(
        f.evictor.stats(),
        EvictorStats {
            pager_backed_oom: 5,
            pager_backed_other: 3,
            compression_oom: 0,
            compression_other: 0,
            discarded_oom: 2,
            discarded_other: 0,
        }
    );
}

#[test]
fn test_continuous_eviction_makes_progress() {
    let f = Fixture::new(1024);
    f.evictor.enable_without_thread(false);
    f.evictor.enable_continuous_eviction(1000 * PAGE, 0, EvictionLevel::OnlyOldest, Output::NoPrint);
    assert_eq!(f.evictor.debug_get_continuous_eviction_target().min_pages_to_free, 1000);

    for remaining in [700, 400, 100] {
        f.populate(300, Kind::PagerBacked);
        f.evictor.eviction_thread_iteration();
        assert_eq!(f.evictor.debug_get_continuous_eviction_target().min_pages_to_free, remaining);
    }

    f.evictor.disable_continuous_eviction();
    assert_eq!(f.evictor.debug_get_continuous_eviction_target(), EvictionTarget::default());
}

#[test]
fn test_one_shot_preempts_continuous() {
    let f = Fixture::new(64);
    f.evictor.enable_without_thread(false);
    f.evictor.enable_continuous_eviction(40 * PAGE, 0, EvictionLevel::OnlyOldest, Output::NoPrint);
    f.evictor.set_one_shot_eviction_target(EvictionTarget {
        pending: true,
        min_pages_to_free: 10,
        ..EvictionTarget::default()
    });
    f.populate(30, Kind::PagerBacked);

    f.evictor.eviction_thread_iteration();
    assert_eq!(f.queues.len(), 20);
    assert_eq!(f.evictor.debug_get_continuous_eviction_target().min_pages_to_free, 40);
}

#[test]
fn test_target_combine() {
    let a = EvictionTarget {
        pending: true,
        free_pages_target: 10,
        min_pages_to_free: 3,
        level: EvictionLevel::OnlyOldest,
        print_counts: false,
        oom_trigger: true,
    };
    let b = EvictionTarget {
        pending: false,
        free_pages_target: 20,
        min_pages_to_free: 5,
        level: EvictionLevel::IncludeNewest,
        print_counts: true,
        oom_trigger: false,
    };
    let c = EvictionTarget {
        free_pages_target: 15,
        min_pages_to_free: 7,
        ..EvictionTarget::default()
    };

    let mut ab = a;
    ab.combine(&b);
    let mut ba = b;
    ba.combine(&a);
    assert_eq!(ab, ba);
    assert_eq!(
        ab,
        EvictionTarget {
            pending: true,
            free_pages_target: 20,
            min_pages_to_free: 8,
            level: EvictionLevel::IncludeNewest,
            print_counts: true,
            oom_trigger: true,
        }
    );

    let mut ab_c = ab;
    ab_c.combine(&c);
    let mut bc = b;
    bc.combine(&c);
    let mut a_bc = a;
    a_bc.combine(&bc);
    assert_eq!(ab_c, a_bc);
}

#[test]
fn test_async_request_without_thread_is_combined() {
    let f = Fixture::new(16);
    f.evictor.enable_without_thread(false);
    f.evictor.evict_one_shot_asynchronous(2 * PAGE, 8 * PAGE, EvictionLevel::OnlyOldest, Output::NoPrint);
    f.evictor.evict_one_shot_asynchronous(3 * PAGE, 4 * PAGE, EvictionLevel::IncludeNewest, Output::NoPrint);
    let target = f.evictor.debug_get_one_shot_eviction_target();
    assert!(target.pending);
    assert_eq!(target.min_pages_to_free, 5);
    assert_eq!(target.free_pages_target, 8);
    assert_eq!(target.level, EvictionLevel::IncludeNewest);
}
