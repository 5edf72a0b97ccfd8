//! 延迟队列
//!
//! 重试条目在到期后才会被取出。所有等待都基于 `tokio::time`，可被取消，
//! 也可以在暂停时钟的测试中快进。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// 反序比较，使最大堆的堆顶为最早到期的条目
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, item: T, delay: Duration) {
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            item,
        };
        self.heap.lock().push(entry);
        self.notify.notify_one();
    }

    /// 取消满足条件的条目，返回取消数量
    pub fn cancel_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|entry| !pred(&entry.item));
        before - heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// 等待并取出所有已到期的条目
    ///
    /// 可以安全地在 `select!` 中被取消，未返回的条目不会丢失。
    pub async fn next_ready(&self) -> Vec<T> {
        loop {
            let next_deadline = {
                let mut heap = self.heap.lock();
                let now = Instant::now();
                let mut ready = Vec::new();
                while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                    if let Some(entry) = heap.pop() {
                        ready.push(entry.item);
                    }
                }
                if !ready.is_empty() {
                    return ready;
                }
                heap.peek().map(|entry| entry.deadline)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}
