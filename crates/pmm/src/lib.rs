//! 物理内存管理与页面回收
//!
//! 管理机器上的每一个物理页：启动时建立 arena，之后负责页面的分配、释放、
//! 出借（loan）与收回，并在内存压力下通过 [`Evictor`] 从其它子系统回收页面。
//!
//! # 组成
//!
//! - [`PmmArena`]：启动时固定的一段连续物理页
//! - [`Page`]：每个物理页的状态记录
//! - [`PmmChecker`]：空闲页填充校验器
//! - [`PmmNode`]：页面分配器本体（空闲链表、出借链表、两把锁）
//! - [`Evictor`]：回收策略引擎及其后台线程
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与架构特定组件解耦：
//! - [`ArchPmmOps`]: physmap 地址转换
//! - [`PmmConfig`]: 启动配置
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_config`] 注册实现，
//! 同时 `sync` crate 的 `ArchOps` / `SchedOps` 也需要注册。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch_ops;
mod config;
mod error;
mod global;
mod page_list;

pub mod arena;
pub mod checker;
pub mod delay;
pub mod evictor;
pub mod node;
pub mod page;

#[cfg(test)]
mod tests;

pub use arch_ops::{ArchPmmOps, arch_ops, register_arch_ops};
pub use config::{PmmConfig, pmm_config, register_config};
pub use error::{PmmError, PmmResult};

pub use arena::{ArenaFlags, ArenaInfo, PageStateCounts, PmmArena};
pub use checker::{CheckFailAction, PmmChecker};
pub use delay::{AllocDelayPolicy, NeverDelay, RandomDelay};
pub use evictor::{
    Compressor, EvictedPageCounts, EvictionHintAction, EvictionLevel, EvictionTarget,
    EvictionTypes, Evictor, EvictorStats, Output, PageCompression, PageQueues, ReclaimableObject,
    TriggerReason, VmoBacklink,
};
pub use global::*;
pub use node::{
    AllocFailure, AllocFailureKind, AllocFlags, FreeLoanedPagesHolder, PmmNode, ReservedKind,
    ReservedRange,
};
pub use page::{Page, PageFlags, PageId, PageState};

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页大小的位移
pub const PAGE_SIZE_SHIFT: usize = 12;

/// 最多支持的 arena 数量
pub const MAX_ARENAS: usize = 16;

pub(crate) const MB: u64 = 1024 * 1024;
