//! 全局页面分配器的生命周期与便捷函数

mod common;

use pmm::*;

#[test]
fn test_global_pmm_lifecycle() {
    common::init_once();
    assert!(!is_pmm_initialized());

    let low = common::arena("low", ArenaFlags::LO_MEM, 64);
    let high = common::arena("high", ArenaFlags::empty(), 64);
    let handoff = ReservedRange {
        base: low.base + 4 * PAGE_SIZE as u64,
        size: 2 * PAGE_SIZE as u64,
        kind: ReservedKind::TemporaryHandoff,
    };
    // 与任何 arena 都不相交的保留区域被忽略
    let outside = ReservedRange {
        base: 0x1000,
        size: PAGE_SIZE as u64,
        kind: ReservedKind::Hole,
    };
    let node = init_pmm(&[high, low], &[handoff, outside]).unwrap();
    assert!(is_pmm_initialized());
    assert_eq!(init_pmm(&[low], &[]).err(), Some(PmmError::AlreadyExists));

    assert_eq!(pmm_num_arenas(), 2);
    assert_eq!(pmm_count_total_bytes(), 128 * PAGE_SIZE as u64);
    assert_eq!(pmm_count_free_pages(), 126);

    let mut infos = [ArenaInfo::default(); 2];
    pmm_get_arena_info(2, 0, &mut infos).unwrap();
    assert_eq!(infos[0].name, "low");
    assert_eq!(infos[1].name, "high");
    assert_eq!(pmm_get_arena_info(2, 1, &mut infos), Err(PmmError::OutOfRange));
    assert_eq!(pmm_get_arena_info(2, 0, &mut infos[..1]), Err(PmmError::BufferTooSmall));

    let pages = pmm_alloc_pages(10, AllocFlags::empty()).unwrap();
    assert_eq!(pmm_count_free_pages(), 116);
    pmm_free(&pages);

    let (paddr, run) = pmm_alloc_contiguous(4, AllocFlags::LO_MEM, 14).unwrap();
    assert_eq!(paddr % (1 << 14), 0);
    assert!(paddr >= low.base && paddr < low.base + low.size);
    pmm_free(&run);

    // 交接区域里的页不能再分配
    assert_eq!(pmm_alloc_range(handoff.base, 1).err(), Some(PmmError::NotFound));
    pmm_end_handoff();
    assert_eq!(pmm_count_free_pages(), 128);
    let range = pmm_alloc_range(handoff.base, 2).unwrap();
    pmm_free(&range);

    let page = pmm_alloc_page(AllocFlags::empty()).unwrap();
    pmm_begin_loan(&[page]);
    assert_eq!(pmm_count_loaned_free_pages(), 1);
    pmm_cancel_loan(page);
    assert_eq!(pmm_count_loaned_free_pages(), 0);
    pmm_end_loan(page);
    assert_eq!(pmm_count_free_pages(), 128);

    assert!(!pmm_has_alloc_failed_no_mem());
    assert_eq!(pmm_alloc_pages(200, AllocFlags::empty()).err(), Some(PmmError::NoMemory));
    assert!(pmm_has_alloc_failed_no_mem());
    assert_eq!(node.first_alloc_failure().kind, AllocFailureKind::Pmm);
    assert_eq!(node.first_alloc_failure().size, 200);

    let single = pmm_alloc_page(AllocFlags::empty()).unwrap();
    pmm_free_page(single);

    let last = teardown_pmm().unwrap();
    assert!(std::sync::Arc::ptr_eq(&last, &node));
    assert!(!is_pmm_initialized());
}
