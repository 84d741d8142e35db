//! 集成测试的公共初始化：注册转发到 Mock 的实现，并提供独立的物理区域。

#![allow(dead_code)]

use std::sync::Once;

use pmm::{ArchPmmOps, ArenaFlags, ArenaInfo, CheckFailAction, PAGE_SIZE, PmmConfig};
use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::physmem::MOCK_PHYS_MEM;
use test_support::mock::sched::MOCK_SCHED_OPS;

static INIT: Once = Once::new();

struct TestArchOps;

impl sync::ArchOps for TestArchOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn interrupt_enable_bit(&self) -> usize {
        MOCK_ARCH_OPS.interrupt_enable_bit()
    }

    fn preempt_disable(&self) {
        MOCK_ARCH_OPS.preempt_disable()
    }

    fn preempt_enable(&self) {
        MOCK_ARCH_OPS.preempt_enable()
    }

    fn cpu_id(&self) -> usize {
        MOCK_ARCH_OPS.cpu_id()
    }
}

struct TestSchedOps;

impl sync::SchedOps for TestSchedOps {
    fn current_thread(&self) -> usize {
        MOCK_SCHED_OPS.current_thread()
    }

    fn block_current(&self, deadline_ns: Option<u64>) {
        MOCK_SCHED_OPS.block_current(deadline_ns)
    }

    fn wake(&self, thread: usize) {
        MOCK_SCHED_OPS.wake(thread)
    }

    fn now_ns(&self) -> u64 {
        MOCK_SCHED_OPS.now_ns()
    }

    fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send + 'static>) -> usize {
        MOCK_SCHED_OPS.spawn(name, entry)
    }

    fn join(&self, thread: usize) {
        MOCK_SCHED_OPS.join(thread)
    }
}

struct TestPhysmap;

impl ArchPmmOps for TestPhysmap {
    fn paddr_to_vaddr(&self, paddr: u64) -> usize {
        MOCK_PHYS_MEM.paddr_to_vaddr(paddr)
    }
}

struct TestConfig;

impl PmmConfig for TestConfig {
    fn eviction_interval_ns(&self) -> u64 {
        // 10ms，让连续回收在测试里很快推进
        10_000_000
    }

    fn alloc_random_should_wait(&self) -> bool {
        false
    }

    fn free_fill_size(&self) -> Option<usize> {
        None
    }

    fn checker_action(&self) -> CheckFailAction {
        CheckFailAction::Oops
    }
}

static TEST_ARCH_OPS: TestArchOps = TestArchOps;
static TEST_SCHED_OPS: TestSchedOps = TestSchedOps;
static TEST_PHYSMAP: TestPhysmap = TestPhysmap;
static TEST_CONFIG: TestConfig = TestConfig;

pub fn init_once() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&TEST_ARCH_OPS);
        sync::register_sched_ops(&TEST_SCHED_OPS);
        pmm::register_arch_ops(&TEST_PHYSMAP);
        pmm::register_config(&TEST_CONFIG);
    });
}

/// 分配一段 1MB 对齐的模拟物理内存作为 arena
pub fn arena(name: &'static str, flags: ArenaFlags, pages: usize) -> ArenaInfo {
    let size = (pages * PAGE_SIZE) as u64;
    let base = MOCK_PHYS_MEM.alloc_region(size, 1 << 20);
    ArenaInfo::new(name, flags, base, size)
}

/// 直接写物理页的内容
pub fn scribble(paddr: u64, value: u8) {
    let vaddr = MOCK_PHYS_MEM.paddr_to_vaddr(paddr);
    unsafe { core::ptr::write_volatile(vaddr as *mut u8, value) };
}

// ============================================================================
// 回收协作方
// ============================================================================

use pmm::{
    AllocFlags, Compressor, EvictionHintAction, PageId, PageQueues, PmmNode, ReclaimableObject,
    VmoBacklink,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 单一 FIFO 的可回收队列
#[derive(Default)]
pub struct FifoQueues {
    queue: Mutex<VecDeque<VmoBacklink>>,
}

impl FifoQueues {
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn push(&self, backlink: VmoBacklink) {
        self.queue.lock().unwrap().push_back(backlink);
    }
}

impl PageQueues for FifoQueues {
    fn peek_reclaim(&self, _lowest_queue: usize) -> Option<VmoBacklink> {
        self.queue.lock().unwrap().pop_front()
    }

    fn mark_accessed(&self, _page: PageId) {}
}

/// 内容可以随时重新读回的对象
pub struct PagerObject {
    node: Arc<PmmNode>,
}

impl ReclaimableObject for PagerObject {
    fn is_discardable(&self) -> bool {
        false
    }

    fn can_evict(&self) -> bool {
        true
    }

    fn reclaim_page(
        &self,
        page: PageId,
        _offset: u64,
        _hint: EvictionHintAction,
        freed: &mut Vec<PageId>,
        _compressor: Option<&dyn Compressor>,
    ) -> u64 {
        self.node.page(page).clear_object();
        freed.push(page);
        1
    }
}

/// 分配 `count` 个页交给一个对象，并放入队列
pub fn populate(node: &Arc<PmmNode>, queues: &FifoQueues, count: usize) -> Vec<PageId> {
    let object: Arc<dyn ReclaimableObject> = Arc::new(PagerObject { node: node.clone() });
    let pages = node.alloc_pages(count, AllocFlags::empty()).unwrap();
    let mut queue = queues.queue.lock().unwrap();
    for (i, &id) in pages.iter().enumerate() {
        node.page(id).set_object(0x1000);
        queue.push_back(VmoBacklink {
            object: Some(object.clone()),
            page: id,
            offset: (i * PAGE_SIZE) as u64,
        });
    }
    pages
}

/// 轮询直到条件成立，超时返回 false
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
