//! 内核线程句柄

use crate::sched_ops;
use alloc::boxed::Box;

/// 内核线程句柄
///
/// 丢弃句柄不会停止线程；需要回收时调用 [`KernelThread::join`]。
#[derive(Debug)]
pub struct KernelThread {
    id: usize,
    name: &'static str,
}

impl KernelThread {
    /// 线程 ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// 线程名
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 等待线程退出
    pub fn join(self) {
        sched_ops().join(self.id);
    }
}

/// 当前线程的 ID
pub fn current_thread_id() -> usize {
    sched_ops().current_thread()
}

/// 创建并启动内核线程
pub fn spawn<F>(name: &'static str, f: F) -> KernelThread
where
    F: FnOnce() + Send + 'static,
{
    let id = sched_ops().spawn(name, Box::new(f));
    KernelThread { id, name }
}
