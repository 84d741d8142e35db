//! 测试支持 crate
//!
//! 为内核 crate 的主机端测试提供 Mock 实现：
//! 基于 std 线程的调度器、按线程维护的中断/抢占状态、模拟物理内存以及默认配置。

pub mod mock;

