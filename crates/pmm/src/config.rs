//! PMM 配置 trait 定义和注册

use crate::checker::CheckFailAction;
use core::sync::atomic::{AtomicUsize, Ordering};

/// PMM 启动配置
///
/// 此 trait 提供 PMM 与回收线程所需的启动参数。
/// os crate 需要实现此 trait 并注册。
pub trait PmmConfig: Send + Sync {
    /// 连续回收的默认唤醒间隔（纳秒）
    fn eviction_interval_ns(&self) -> u64;

    /// 是否随机让约 1/10 的可等待分配返回 `ShouldWait`（仅用于调试）
    fn alloc_random_should_wait(&self) -> bool;

    /// 启动时启用空闲页填充校验的填充大小，`None` 表示不启用
    fn free_fill_size(&self) -> Option<usize>;

    /// 填充校验失败时的处理方式
    fn checker_action(&self) -> CheckFailAction;
}

static CONFIG_DATA: AtomicUsize = AtomicUsize::new(0);
static CONFIG_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册配置实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_config(config: &'static dyn PmmConfig) {
    let ptr = config as *const dyn PmmConfig;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn PmmConfig, (usize, usize)>(ptr) };
    CONFIG_VTABLE.store(vtable, Ordering::Release);
    CONFIG_DATA.store(data, Ordering::Release);
}

/// 获取已注册的配置实现
///
/// # Panics
/// 如果尚未调用 [`register_config`] 注册实现，则 panic
#[inline]
pub fn pmm_config() -> &'static dyn PmmConfig {
    let data = CONFIG_DATA.load(Ordering::Acquire);
    let vtable = CONFIG_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        #[cfg(test)]
        {
            return &test_support::mock::pmm::MOCK_PMM_CONFIG;
        }
        #[cfg(not(test))]
        panic!("pmm: PmmConfig not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn PmmConfig>((data, vtable)) }
}
