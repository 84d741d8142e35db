//! 全局页面分配器
//!
//! 启动时用 [`init_pmm`] 建立唯一的 [`PmmNode`]，之后通过 `pmm_*` 函数访问。

use crate::arena::ArenaInfo;
use crate::node::{AllocFlags, PmmNode, ReservedRange};
use crate::page::PageId;
use crate::{PmmError, PmmResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use sync::SpinLock;

// ============================================================================
// 全局节点
// ============================================================================

lazy_static! {
    /// 全局页面分配器，由自旋锁保护。
    static ref PMM_NODE: SpinLock<Option<Arc<PmmNode>>> = SpinLock::new(None);
}

/// 初始化全局页面分配器。
///
/// # 参数
///
/// * `arenas` - 启动时发现的物理内存段
/// * `reserved` - 需要保留的区域
///
/// # 返回
///
/// 已初始化时返回 `AlreadyExists`；arena 布局非法时返回对应错误。
pub fn init_pmm(arenas: &[ArenaInfo], reserved: &[ReservedRange]) -> PmmResult<Arc<PmmNode>> {
    let mut slot = PMM_NODE.lock();
    if slot.is_some() {
        return Err(PmmError::AlreadyExists);
    }
    let node = Arc::new(PmmNode::new(arenas, reserved)?);
    log::info!(
        "PMM: initialized {} arenas, {} free pages",
        node.num_arenas(),
        node.count_free_pages()
    );
    *slot = Some(node.clone());
    Ok(node)
}

/// 取下全局页面分配器，返回其最后的引用（如果已初始化）
pub fn teardown_pmm() -> Option<Arc<PmmNode>> {
    PMM_NODE.lock().take()
}

/// 全局页面分配器是否已初始化
pub fn is_pmm_initialized() -> bool {
    PMM_NODE.lock().is_some()
}

/// 获取全局页面分配器。未初始化时 panic。
pub fn pmm_node() -> Arc<PmmNode> {
    match PMM_NODE.lock().as_ref() {
        Some(node) => node.clone(),
        None => panic!("pmm: not initialized, call init_pmm first"),
    }
}

// ============================================================================
// 便捷函数
// ============================================================================

/// 分配一个页。
///
/// # 返回
///
/// 成功时返回页索引；内存耗尽时返回 `NoMemory`。
pub fn pmm_alloc_page(flags: AllocFlags) -> PmmResult<PageId> {
    pmm_node().alloc_page(flags)
}

/// 分配多个页（不保证连续）。
pub fn pmm_alloc_pages(count: usize, flags: AllocFlags) -> PmmResult<Vec<PageId>> {
    pmm_node().alloc_pages(count, flags)
}

/// 分配指定物理地址开始的一段页
pub fn pmm_alloc_range(paddr: u64, count: usize) -> PmmResult<Vec<PageId>> {
    pmm_node().alloc_range(paddr, count)
}

/// 分配物理连续、按 `1 << alignment_log2` 对齐的页。
///
/// # 返回
///
/// 起始物理地址和页列表；找不到时返回 `NotFound`。
pub fn pmm_alloc_contiguous(count: usize, flags: AllocFlags, alignment_log2: u32) -> PmmResult<(u64, Vec<PageId>)> {
    pmm_node().alloc_contiguous(count, flags, alignment_log2)
}

/// 释放一个页
pub fn pmm_free_page(page: PageId) {
    pmm_node().free_page(page)
}

/// 释放一组页
pub fn pmm_free(pages: &[PageId]) {
    pmm_node().free_list(pages)
}

/// 出借一组页
pub fn pmm_begin_loan(pages: &[PageId]) {
    pmm_node().begin_loan(pages)
}

/// 取消出借
pub fn pmm_cancel_loan(page: PageId) {
    pmm_node().cancel_loan(page)
}

/// 结束出借
pub fn pmm_end_loan(page: PageId) {
    pmm_node().end_loan(page)
}

/// 空闲页数
pub fn pmm_count_free_pages() -> u64 {
    pmm_node().count_free_pages()
}

/// 出借空闲页数
pub fn pmm_count_loaned_free_pages() -> u64 {
    pmm_node().count_loaned_free_pages()
}

/// 物理内存总字节数
pub fn pmm_count_total_bytes() -> u64 {
    pmm_node().count_total_bytes()
}

/// 是否发生过内存耗尽
pub fn pmm_has_alloc_failed_no_mem() -> bool {
    pmm_node().has_alloc_failed_no_mem()
}

/// arena 数量
pub fn pmm_num_arenas() -> usize {
    pmm_node().num_arenas()
}

/// 读取 arena 信息
pub fn pmm_get_arena_info(count: usize, i: usize, buffer: &mut [ArenaInfo]) -> PmmResult<()> {
    pmm_node().get_arena_info(count, i, buffer)
}

/// 启动交接结束
pub fn pmm_end_handoff() {
    pmm_node().end_handoff()
}
