//! 回收协作方接口
//!
//! 页面队列和页面的所属对象都在本 crate 之外实现，回收引擎只通过这里的 trait 访问它们。

use crate::PmmResult;
use crate::page::PageId;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// 可回收队列的数量，按从新到旧编号
pub const NUM_RECLAIM_QUEUES: usize = 8;

/// 最旧的几个可回收队列
pub const NUM_OLDEST_QUEUES: usize = 2;

/// 最新的几个（活跃）队列
pub const NUM_ACTIVE_QUEUES: usize = 2;

/// 回收时如何对待页上的“始终需要”提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionHintAction {
    /// 遵守提示，跳过被标记的页
    Follow,
    /// 忽略提示
    Ignore,
}

/// 队列中的一个候选页及其所属对象
#[derive(Clone)]
pub struct VmoBacklink {
    /// 所属对象；对象正在销毁时可能为空
    pub object: Option<Arc<dyn ReclaimableObject>>,
    /// 候选页
    pub page: PageId,
    /// 页在对象中的偏移
    pub offset: u64,
}

/// 按从旧到新排列的可回收页队列
pub trait PageQueues: Send + Sync {
    /// 查看编号不低于 `lowest_queue` 的队列中最旧的页。
    ///
    /// 同一个页不应被连续返回，否则回收循环无法前进。
    fn peek_reclaim(&self, lowest_queue: usize) -> Option<VmoBacklink>;

    /// 把页标记为最近访问过，移到最新的队列
    fn mark_accessed(&self, page: PageId);
}

/// 可以交出页面的内存对象
pub trait ReclaimableObject: Send + Sync {
    /// 是否为可整体丢弃的对象
    fn is_discardable(&self) -> bool;

    /// 页面内容是否可以从外部来源重新取得
    fn can_evict(&self) -> bool;

    /// 尝试回收 `page`。
    ///
    /// 被释放的页放入 `freed`（ALLOC 状态、无反向链接），返回回收的页数。
    /// 不可驱逐的对象只能借助 `compressor` 压缩回收。
    fn reclaim_page(
        &self,
        page: PageId,
        offset: u64,
        hint: EvictionHintAction,
        freed: &mut Vec<PageId>,
        compressor: Option<&dyn Compressor>,
    ) -> u64;
}

/// 一次回收过程中使用的压缩器实例
pub trait Compressor {
    /// 为下一次压缩做准备，失败时本轮回收立即结束
    fn arm(&self) -> PmmResult<()>;
}

/// 页面压缩服务
pub trait PageCompression: Send + Sync {
    /// 取得一个压缩器实例，在本轮回收结束时释放
    fn acquire_compressor(&self) -> Box<dyn Compressor>;
}
