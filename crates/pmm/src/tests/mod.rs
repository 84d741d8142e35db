// PMM 单元测试
//
// `sync` 作为普通依赖编译，不会回落到 Mock，这里先注册一次转发到 Mock 的实现。
// 每个测试使用 `MOCK_PHYS_MEM` 分配的独立物理区域，可以并行运行。

use crate::PAGE_SIZE;
use crate::arena::{ArenaFlags, ArenaInfo};
use crate::node::PmmNode;
use crate::page::PageState;
use std::sync::Once;
use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::physmem::MOCK_PHYS_MEM;
use test_support::mock::sched::MOCK_SCHED_OPS;

mod evictor;

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

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&TestArchOps);
        sync::register_sched_ops(&TestSchedOps);
    });
}

/// 分配一段 1MB 对齐的模拟物理内存作为 arena
fn test_arena(name: &'static str, flags: ArenaFlags, pages: usize) -> ArenaInfo {
    let size = (pages * PAGE_SIZE) as u64;
    let base = MOCK_PHYS_MEM.alloc_region(size, 1 << 20);
    ArenaInfo::new(name, flags, base, size)
}

fn new_node(pages: usize) -> PmmNode {
    setup();
    PmmNode::new(&[test_arena("test", ArenaFlags::empty(), pages)], &[]).unwrap()
}

fn base_of(node: &PmmNode) -> u64 {
    node.arenas()[0].base()
}

/// 空闲页 + 出借空闲页 + 已分配的页 == 总页数，且计数与页状态一致
fn assert_page_accounting(node: &PmmNode) {
    let counts = node.dump(false);
    let total: u64 = node.arenas().iter().map(|a| a.page_count() as u64).sum();
    assert_eq!(counts.total(), total);
    assert_eq!(counts.get(PageState::Free), node.count_free_pages());
    assert_eq!(counts.get(PageState::FreeLoaned), node.count_loaned_free_pages());
    let in_use = counts.get(PageState::Alloc) + counts.get(PageState::Object) + counts.get(PageState::Wired);
    assert_eq!(
        node.count_free_pages() + node.count_loaned_free_pages() + in_use,
        total
    );
}
