//! 调度相关操作的 Mock 实现
//!
//! 内核线程映射为 std 线程，阻塞/唤醒映射为 park/unpark。

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
static THREADS: Mutex<BTreeMap<usize, Thread>> = Mutex::new(BTreeMap::new());
static HANDLES: Mutex<BTreeMap<usize, JoinHandle<()>>> = Mutex::new(BTreeMap::new());
static EPOCH: OnceLock<Instant> = OnceLock::new();

thread_local! {
    static CURRENT_ID: Cell<usize> = const { Cell::new(0) };
}

/// Mock 调度操作
pub struct MockSchedOps;

impl MockSchedOps {
    pub const fn new() -> Self {
        Self
    }

    /// 当前线程 ID，首次调用时为宿主线程分配
    pub fn current_thread(&self) -> usize {
        CURRENT_ID.with(|c| {
            if c.get() == 0 {
                let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
                THREADS.lock().unwrap().insert(id, thread::current());
                c.set(id);
            }
            c.get()
        })
    }

    pub fn block_current(&self, deadline_ns: Option<u64>) {
        match deadline_ns {
            None => thread::park(),
            Some(deadline) => {
                let now = self.now_ns();
                if deadline > now {
                    thread::park_timeout(Duration::from_nanos(deadline - now));
                }
            }
        }
    }

    pub fn wake(&self, thread: usize) {
        if let Some(t) = THREADS.lock().unwrap().get(&thread) {
            t.unpark();
        }
    }

    pub fn now_ns(&self) -> u64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    pub fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send + 'static>) -> usize {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT_ID.with(|c| c.set(id));
                // 先登记再运行，避免早到的 wake 丢失
                THREADS.lock().unwrap().insert(id, thread::current());
                entry();
            })
            .expect("failed to spawn mock kernel thread");
        HANDLES.lock().unwrap().insert(id, handle);
        id
    }

    pub fn join(&self, thread: usize) {
        let handle = HANDLES.lock().unwrap().remove(&thread);
        if let Some(handle) = handle {
            let result = handle.join();
            THREADS.lock().unwrap().remove(&thread);
            if let Err(panic) = result {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Default for MockSchedOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_SCHED_OPS: MockSchedOps = MockSchedOps::new();
