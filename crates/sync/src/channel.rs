//! 有界通道
//!
//! 多生产者、单消费者。发送不阻塞，队列满时把消息交还给调用者；
//! 接收可以带截止时间阻塞。

use crate::{Deadline, Event, SpinLock, WaitError};
use alloc::collections::VecDeque;
use core::fmt;

/// 发送失败（队列已满），携带未送出的消息
#[derive(PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel is full")
    }
}

/// 有界通道
pub struct Channel<T> {
    queue: SpinLock<VecDeque<T>>,
    capacity: usize,
    /// 队列非空时有信号；只在持有 queue 锁时改变
    ready: Event,
}

impl<T> Channel<T> {
    /// 创建容量为 `capacity` 的通道
    pub fn new(capacity: usize) -> Self {
        Channel {
            queue: SpinLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Event::new(false),
        }
    }

    /// 发送消息；队列已满时返回 `SendError(msg)`
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(SendError(msg));
        }
        queue.push_back(msg);
        self.ready.signal();
        Ok(())
    }

    /// 不阻塞地取出一条消息
    pub fn try_recv(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        let msg = queue.pop_front();
        if queue.is_empty() {
            self.ready.unsignal();
        }
        msg
    }

    /// 接收消息，队列为空时阻塞到截止时间
    pub fn recv(&self, deadline: Deadline) -> Result<T, WaitError> {
        loop {
            if let Some(msg) = self.try_recv() {
                return Ok(msg);
            }
            self.ready.wait(deadline)?;
        }
    }

    /// 当前排队的消息数
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// 队列是否为空
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 通道容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
