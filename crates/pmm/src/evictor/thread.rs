//! 回收线程
//!
//! 线程只持有 [`Evictor`] 的弱引用，在两次唤醒之间从请求通道等待
//! `Wake` / `Exit`，超时即按连续回收的间隔推进一次。

use super::{EvictedPageCounts, Evictor};
use alloc::sync::{Arc, Weak};
use sync::{Channel, Deadline, current_thread_id};

/// 请求通道深度；通道满时唤醒请求可以丢弃，线程总会看到最新状态
pub(super) const REQUEST_QUEUE_DEPTH: usize = 4;

/// 发给回收线程的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionRequest {
    /// 有新的目标
    Wake,
    /// 退出
    Exit,
}

impl Evictor {
    /// 启用回收，必要时启动回收线程
    pub fn enable_eviction(self: &Arc<Self>, use_compression: bool) {
        {
            let mut state = self.state.lock();
            // 回收线程退出期间不能重新启用
            assert!(!state.thread_exiting, "enable_eviction while the eviction thread is exiting");
            state.eviction_enabled = true;
            state.use_compression = use_compression;
            if state.thread.is_some() {
                return;
            }
        }

        let evictor = Arc::downgrade(self);
        let requests = self.requests.clone();
        let thread = sync::spawn("eviction-thread", move || eviction_thread_loop(evictor, requests));
        log::debug!("evictor: started eviction thread {}", thread.id());
        self.state.lock().thread = Some(thread);
    }

    /// 停止回收线程并关闭回收。并发调用是错误。
    pub fn disable_eviction(&self) {
        let thread = {
            let mut state = self.state.lock();
            // 先检查退出标志：前一次调用可能已经取走句柄，正在等待线程结束
            assert!(!state.thread_exiting, "concurrent disable_eviction");
            let Some(thread) = state.thread.take() else {
                return;
            };
            state.thread_exiting = true;
            thread
        };
        // 通道满时线程仍会被唤醒并看到退出标志
        let _ = self.requests.send(EvictionRequest::Exit);

        // 最后一个引用可能在回收线程自己手里被释放，此时不能等待自己
        if thread.id() != current_thread_id() {
            thread.join();
            // 丢弃残留的请求，避免下一个回收线程一启动就退出
            while self.requests.try_recv().is_some() {}
        }

        let mut state = self.state.lock();
        state.eviction_enabled = false;
        state.thread_exiting = false;
    }

    pub(super) fn wake_thread(&self) {
        // 通道已满说明线程已有未处理的唤醒
        let _ = self.requests.send(EvictionRequest::Wake);
    }

    /// 回收线程是否正在退出（`disable_eviction` 尚未返回）
    pub fn is_eviction_thread_exiting(&self) -> bool {
        self.state.lock().thread_exiting
    }

    fn next_wait_deadline(&self) -> Deadline {
        match self.state.lock().next_interval_ns {
            Some(ns) => Deadline::after(ns),
            None => Deadline::Infinite,
        }
    }

    /// 回收线程的一次迭代：先处理一次性目标，没有进展时再推进连续目标
    pub(crate) fn eviction_thread_iteration(&self) {
        let evicted = self.evict_one_shot_from_preloaded_target();
        // 两种模式一般不会同时使用；一次性回收有进展就回去等待
        if evicted.discardable + evicted.pager_backed > 0 {
            return;
        }

        let target = self.state.lock().continuous_target;
        let free_pages_before = self.pmm_node.count_free_pages();
        let evicted: EvictedPageCounts = self.evict_until_targets_met(
            target.min_pages_to_free,
            target.free_pages_target,
            target.level,
        );
        if target.print_counts {
            self.print_counts(free_pages_before, &evicted, false);
        }

        let total = evicted.discardable + evicted.pager_backed;
        if total == 0 {
            return;
        }
        let mut state = self.state.lock();
        let min = &mut state.continuous_target.min_pages_to_free;
        *min = min.saturating_sub(total);
    }
}

fn eviction_thread_loop(evictor: Weak<Evictor>, requests: Arc<Channel<EvictionRequest>>) {
    loop {
        let deadline = match evictor.upgrade() {
            Some(evictor) if !evictor.is_eviction_thread_exiting() => evictor.next_wait_deadline(),
            _ => break,
        };
        // 等待期间不持有强引用
        if let Ok(EvictionRequest::Exit) = requests.recv(deadline) {
            break;
        }
        let Some(evictor) = evictor.upgrade() else {
            break;
        };
        if evictor.is_eviction_thread_exiting() {
            break;
        }
        evictor.eviction_thread_iteration();
    }
    log::debug!("evictor: eviction thread exiting");
}
