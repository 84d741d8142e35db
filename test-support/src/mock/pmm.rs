//! PMM 配置的 Mock 实现
//!
//! 这里不直接依赖 `pmm` crate（避免循环依赖）。
//! `pmm` crate 在 `cfg(test)` 下为这些类型实现其 trait（`PmmConfig` / `ArchPmmOps`）。

/// Mock 的 PMM 配置
pub struct MockPmmConfig;

impl MockPmmConfig {
    pub const fn new() -> Self {
        Self
    }

    /// 连续回收的唤醒间隔（测试默认：10 秒）
    pub fn eviction_interval_ns(&self) -> u64 {
        10_000_000_000
    }

    /// 是否随机返回 SHOULD_WAIT（测试默认：否）
    pub fn alloc_random_should_wait(&self) -> bool {
        false
    }

    /// 启动时的空闲页填充大小（测试默认：不启用）
    pub fn free_fill_size(&self) -> Option<usize> {
        None
    }

    /// 校验失败时是否 panic（测试默认：只记录）
    pub fn checker_panics(&self) -> bool {
        false
    }
}

impl Default for MockPmmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_PMM_CONFIG: MockPmmConfig = MockPmmConfig::new();
