//! Mock 实现模块
//!
//! 提供架构、调度和内存子系统的 Mock 实现，用于测试。
//!
//! 这里不依赖任何内核 crate（避免循环依赖），
//! 各 crate 在 `cfg(test)` 下为这些类型实现自己的 trait。

pub mod arch;
pub mod physmem;
pub mod pmm;
pub mod sched;
